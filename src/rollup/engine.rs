/// Multi-interval streaming aggregation of LOOP records
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::StorageError;
use crate::models::{LoopRecord, Summary};
use crate::rollup::window::Rollup;
use crate::utils::{format_datetime, truncate_to_interval};

/// 1, 5 and 10 minute summaries.
pub const DEFAULT_INTERVALS: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(10 * 60),
];

/// Downstream consumer of finished summaries.
#[async_trait]
pub trait SummarySink: Send {
    async fn save(&mut self, summary: &Summary) -> Result<(), StorageError>;
}

/// Writes summaries to the log; used when no database is configured.
#[derive(Debug, Default)]
pub struct LogSummarySink;

#[async_trait]
impl SummarySink for LogSummarySink {
    async fn save(&mut self, summary: &Summary) -> Result<(), StorageError> {
        info!(
            "Summary {}s ending {} ({} samples):",
            summary.summary_seconds,
            format_datetime(&summary.end_time),
            summary.measurements
        );
        info!(
            "  Wind: avg {:.1} mph, gust {:.0}, lull {:.0}, stddev {:.2}",
            summary.wind_avg, summary.wind_gust, summary.wind_lull, summary.wind_stddev
        );
        info!(
            "  Direction: {}° ({}), range {}°-{}°",
            summary.wind_direction_avg,
            summary.wind_dir_avg_name(),
            summary.wind_direction_min,
            summary.wind_direction_max
        );
        info!(
            "  Barometer: {:.3} inHg ({}), outside {:.1}°F, humidity {:.0}%",
            summary.barometer_avg,
            summary.bar_trend().unwrap_or("n/a"),
            summary.outside_temp_avg,
            summary.outside_humidity_avg
        );
        Ok(())
    }
}

/// Keeps one open rollup per configured interval.
#[derive(Debug, Clone)]
pub struct RollupEngine {
    intervals: Vec<Duration>,
    rollups: Vec<Option<Rollup>>,
}

impl Default for RollupEngine {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVALS.to_vec())
    }
}

impl RollupEngine {
    pub fn new(intervals: Vec<Duration>) -> Self {
        let rollups = vec![None; intervals.len()];
        Self { intervals, rollups }
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }

    /// The rollup currently accumulating for the interval at `index`.
    pub fn open_rollup(&self, index: usize) -> Option<&Rollup> {
        self.rollups.get(index).and_then(Option::as_ref)
    }

    /// Fold `record` into every interval. Returns the summaries of windows the
    /// record has moved past, in interval order.
    pub fn update(&mut self, record: &LoopRecord) -> Vec<Summary> {
        let mut finished = Vec::new();

        for (interval, slot) in self.intervals.iter().zip(self.rollups.iter_mut()) {
            let period = truncate_to_interval(record.recorded, *interval);

            // the record is past the open window: close it and start a new one
            if let Some(open) = slot.as_ref() {
                if open.period != period {
                    if let Some(summary) = open.summary() {
                        finished.push(summary);
                    }
                    *slot = None;
                }
            }

            slot.get_or_insert_with(|| Rollup::new(period, *interval))
                .update(record);
        }

        finished
    }
}

/// Drain `queue` into `engine`, handing each finished summary to `sink`.
///
/// Returns the number of summaries produced once the queue is closed. Sink
/// failures are logged; the summary is not retried.
pub async fn aggregate_records<S>(
    mut queue: mpsc::Receiver<LoopRecord>,
    mut engine: RollupEngine,
    sink: &mut S,
) -> u64
where
    S: SummarySink + ?Sized,
{
    let mut produced = 0;

    while let Some(record) = queue.recv().await {
        for summary in engine.update(&record) {
            produced += 1;
            if !summary.valid() {
                warn!(
                    "Implausible wind in {}s summary ending {}: avg {:.1}, gust {:.0}",
                    summary.summary_seconds,
                    format_datetime(&summary.end_time),
                    summary.wind_avg,
                    summary.wind_gust
                );
            }
            match sink.save(&summary).await {
                Ok(()) => debug!(
                    "Saved {}s summary starting {}",
                    summary.summary_seconds,
                    format_datetime(&summary.start_time)
                ),
                Err(e) => error!("Failed to save summary: {}", e),
            }
        }
    }

    info!("Record queue closed after {} summaries", produced);
    produced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::window::tests::sample;
    use time::macros::datetime;

    #[derive(Default)]
    struct Collected(Vec<Summary>);

    #[async_trait]
    impl SummarySink for Collected {
        async fn save(&mut self, summary: &Summary) -> Result<(), StorageError> {
            self.0.push(summary.clone());
            Ok(())
        }
    }

    #[test]
    fn window_transition_closes_exactly_one_rollup() {
        let mut engine = RollupEngine::new(vec![Duration::from_secs(60)]);

        assert!(engine
            .update(&sample(datetime!(2024-06-01 12:00:00 UTC), 4, 90, 30000))
            .is_empty());
        assert!(engine
            .update(&sample(datetime!(2024-06-01 12:00:59 UTC), 6, 90, 30000))
            .is_empty());
        let finished = engine.update(&sample(datetime!(2024-06-01 12:01:01 UTC), 8, 90, 30000));

        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].measurements, 2);
        assert_eq!(finished[0].start_time, datetime!(2024-06-01 12:00:00 UTC));
        assert_eq!(finished[0].end_time, datetime!(2024-06-01 12:01:00 UTC));
        assert_eq!(finished[0].wind_avg, 5.0);

        let open = engine.open_rollup(0).unwrap();
        assert_eq!(open.count, 1);
        assert_eq!(open.period, datetime!(2024-06-01 12:01:00 UTC));
    }

    #[test]
    fn longer_intervals_stay_open() {
        let mut engine = RollupEngine::default();
        engine.update(&sample(datetime!(2024-06-01 12:04:30 UTC), 4, 90, 30000));
        let finished = engine.update(&sample(datetime!(2024-06-01 12:05:10 UTC), 4, 90, 30000));

        let seconds: Vec<_> = finished.iter().map(|s| s.summary_seconds).collect();
        assert_eq!(seconds, vec![60, 300]);
        assert_eq!(engine.open_rollup(2).unwrap().count, 2);
        assert_eq!(
            engine.open_rollup(2).unwrap().period,
            datetime!(2024-06-01 12:00:00 UTC)
        );
    }

    #[test]
    fn gap_across_several_windows_emits_once() {
        let mut engine = RollupEngine::new(vec![Duration::from_secs(60)]);
        engine.update(&sample(datetime!(2024-06-01 12:00:10 UTC), 4, 90, 30000));
        let finished = engine.update(&sample(datetime!(2024-06-01 12:07:10 UTC), 4, 90, 30000));

        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].start_time, datetime!(2024-06-01 12:00:00 UTC));
    }

    #[tokio::test]
    async fn aggregator_delivers_summaries_until_queue_closes() {
        let (tx, rx) = mpsc::channel(8);
        for second in [0u8, 30, 61, 125] {
            let recorded = datetime!(2024-06-01 12:00:00 UTC)
                + time::Duration::seconds(i64::from(second));
            tx.send(sample(recorded, 10, 180, 29950)).await.unwrap();
        }
        drop(tx);

        let mut sink = Collected::default();
        let produced = aggregate_records(
            rx,
            RollupEngine::new(vec![Duration::from_secs(60)]),
            &mut sink,
        )
        .await;

        assert_eq!(produced, 2);
        assert_eq!(sink.0[0].measurements, 2);
        assert_eq!(sink.0[1].measurements, 1);
        assert_eq!(sink.0[1].wind_direction_avg, 180);
    }

    #[tokio::test]
    async fn log_sink_accepts_everything() {
        let mut engine = RollupEngine::new(vec![Duration::from_secs(60)]);
        engine.update(&sample(datetime!(2024-06-01 12:00:00 UTC), 3, 45, 30000));
        let summary = engine
            .update(&sample(datetime!(2024-06-01 12:01:00 UTC), 3, 45, 30000))
            .remove(0);
        assert!(LogSummarySink.save(&summary).await.is_ok());
    }
}
