use log::{error, info, warn};
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::sync::mpsc;
use tokio::time::Duration;

use vantage_etl::config::StationConfig;
use vantage_etl::database::PostgresSummaryStore;
use vantage_etl::error::VantageError;
use vantage_etl::rollup::{aggregate_records, LogSummarySink, RollupEngine, SummarySink};
use vantage_etl::utils::format_datetime;
use vantage_etl::vantage::{archive_records, collect_forever, DeviceLink, DumpMode, TcpConnector};

/// Download the archive written during the last `window` and log what it covers.
async fn backfill_archive(address: &str, window: Duration) -> Result<(), VantageError> {
    // The console stamps archive records in its own local time.
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let since = now - window;
    let since = PrimitiveDateTime::new(since.date(), since.time());

    info!("Fetching archive records after {}", since);
    let mut link = DeviceLink::connect_tcp(address).await?;
    let records = archive_records(&mut link, DumpMode::After(since)).await?;

    match (records.first(), records.last()) {
        (Some(first), Some(last)) => {
            let gust = records.iter().map(|r| r.wind_max).max().unwrap_or(0);
            info!(
                "Archive holds {} records from {} to {}, highest gust {} mph",
                records.len(),
                first.timestamp,
                last.timestamp,
                gust
            );
        }
        _ => info!("No archive records since {}", since),
    }
    Ok(())
}

async fn open_sink(config: &StationConfig) -> Box<dyn SummarySink> {
    let Some(database_url) = &config.database_url else {
        return Box::new(LogSummarySink);
    };
    match PostgresSummaryStore::open(database_url).await {
        Ok(store) => Box::new(store),
        Err(e) => {
            error!("Database unavailable, logging summaries instead: {}", e);
            Box::new(LogSummarySink)
        }
    }
}

async fn main_loop(config: StationConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting Vantage data collection service at {}",
        format_datetime(&OffsetDateTime::now_utc())
    );

    if let Some(window) = config.archive_backfill {
        if let Err(e) = backfill_archive(&config.vantage_address, window).await {
            warn!("Archive backfill failed: {}", e);
        }
    }

    // Bounded queue between the console reader and the aggregator
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let engine = RollupEngine::new(config.rollup_intervals.clone());
    let mut sink = open_sink(&config).await;
    let aggregator = tokio::spawn(async move { aggregate_records(rx, engine, sink.as_mut()).await });

    let mut connector = TcpConnector::new(config.vantage_address.clone());
    let mut handler = tx;
    collect_forever(&mut connector, &mut handler, &config.supervisor).await;

    drop(handler);
    let produced = aggregator.await?;
    info!("Aggregator stopped after {} summaries", produced);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match StationConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    // Run main loop or wait for shutdown signal
    tokio::select! {
        result = main_loop(config) => {
            match result {
                Ok(_) => info!("Program completed successfully"),
                Err(e) => error!("Fatal error: {}", e),
            }
        }
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    Ok(())
}
