/// Long-running collection loop: dial, LOOP bursts, reconnect on failure
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::error::VantageError;
use crate::models::LoopRecord;
use crate::vantage::link::{Connector, DeviceLink};

const DEFAULT_BURST_SIZE: usize = 60;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 60;

/// Receives every decoded LOOP record, in the order read from the wire.
#[async_trait]
pub trait LoopHandler: Send {
    async fn handle(&mut self, record: LoopRecord);

    /// Non-fatal failures: decode errors, timeouts, refused connections.
    async fn handle_error(&mut self, error: &VantageError) {
        warn!("Collection error: {}", error);
    }
}

/// Forwarding into a bounded queue. A full queue blocks the reader
/// (backpressure); records are never dropped.
#[async_trait]
impl LoopHandler for mpsc::Sender<LoopRecord> {
    async fn handle(&mut self, record: LoopRecord) {
        if self.send(record).await.is_err() {
            error!("Record queue closed, record discarded");
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Records requested per LOOP command.
    pub burst_size: usize,
    /// Fixed wait between failed connection attempts.
    pub reconnect_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            burst_size: DEFAULT_BURST_SIZE,
            reconnect_delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS),
        }
    }
}

/// Collect LOOP records forever.
///
/// Connection failures are retried every `reconnect_delay` without limit. A
/// failed burst drops the connection and redials straight away. Records
/// delivered before a failure are never retracted; gaps across a reconnect
/// only show up in the log.
pub async fn collect_forever<C, H>(connector: &mut C, handler: &mut H, settings: &SupervisorSettings)
where
    C: Connector,
    H: LoopHandler,
{
    let burst_size = settings.burst_size.max(1);
    if burst_size != settings.burst_size {
        warn!("LOOP burst size 0 is invalid, requesting 1 record per burst");
    }

    loop {
        info!("Connecting to {}...", connector.address());
        let mut link = match DeviceLink::connect(connector).await {
            Ok(link) => link,
            Err(e) => {
                error!("Error connecting to {}: {}", connector.address(), e);
                handler.handle_error(&e).await;
                info!(
                    "Connect retry in {} seconds",
                    settings.reconnect_delay.as_secs()
                );
                sleep(settings.reconnect_delay).await;
                continue;
            }
        };
        info!("Connected to {}", connector.address());

        let mut delivered: u64 = 0;
        loop {
            match run_burst(&mut link, burst_size, handler).await {
                Ok(count) => delivered += count as u64,
                Err((count, e)) => {
                    delivered += count as u64;
                    if e.is_transport() {
                        warn!(
                            "Connection lost after {} record(s), redialing: {}",
                            delivered, e
                        );
                    } else {
                        warn!(
                            "LOOP burst failed after {} record(s) on this connection: {}",
                            delivered, e
                        );
                    }
                    handler.handle_error(&e).await;
                    break;
                }
            }
        }
        // Dropping the link closes the socket before redialing.
    }
}

/// One LOOP request. Returns the number of records handed to `handler`, also
/// on failure.
async fn run_burst<S, H>(
    link: &mut DeviceLink<S>,
    burst_size: usize,
    handler: &mut H,
) -> Result<usize, (usize, VantageError)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: LoopHandler,
{
    let mut burst = link.start_loop(burst_size).await.map_err(|e| (0, e))?;
    let mut count = 0;
    while let Some(result) = burst.next().await {
        let record = result.map_err(|e| (count, e))?;
        debug!(
            "LOOP record: wind {} mph @ {}°, barometer {:.3}",
            record.wind,
            record.wind_direction,
            record.barometer()
        );
        handler.handle(record).await;
        count += 1;
    }
    Ok(count)
}
