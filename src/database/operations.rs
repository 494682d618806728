/// Database operations for the rollup summaries table
use async_trait::async_trait;
use log::{info, warn};
use std::time::Duration;
use time::OffsetDateTime;
use tokio_postgres::Row;

use crate::database::connection::execute_with_retry;
use crate::error::StorageError;
use crate::models::Summary;
use crate::rollup::SummarySink;

const SUMMARIES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS summaries (
    id                   BIGSERIAL PRIMARY KEY,
    start_time           TIMESTAMPTZ NOT NULL,
    end_time             TIMESTAMPTZ NOT NULL,
    measurements         INTEGER NOT NULL,
    summary_seconds      INTEGER NOT NULL,
    wind_avg             DOUBLE PRECISION NOT NULL,
    wind_gust            DOUBLE PRECISION NOT NULL,
    wind_lull            DOUBLE PRECISION NOT NULL,
    wind_stddev          DOUBLE PRECISION NOT NULL,
    wind_direction_avg   INTEGER NOT NULL,
    wind_direction_min   INTEGER NOT NULL,
    wind_direction_max   INTEGER NOT NULL,
    barometer_avg        DOUBLE PRECISION NOT NULL,
    barometer_start      DOUBLE PRECISION NOT NULL,
    outside_temp_avg     DOUBLE PRECISION NOT NULL,
    outside_humidity_avg DOUBLE PRECISION NOT NULL,
    bar_trend            SMALLINT NOT NULL
);
CREATE INDEX IF NOT EXISTS summaries_end_time_idx ON summaries (end_time);
CREATE INDEX IF NOT EXISTS summaries_seconds_idx ON summaries (summary_seconds);
";

const SELECT_RECENT: &str = "
SELECT start_time, end_time, measurements, summary_seconds,
       wind_avg, wind_gust, wind_lull, wind_stddev,
       wind_direction_avg, wind_direction_min, wind_direction_max,
       barometer_avg, barometer_start, outside_temp_avg, outside_humidity_avg, bar_trend
  FROM summaries
 WHERE end_time > $1 AND summary_seconds = $2
 ORDER BY end_time
 LIMIT $3";

/// Create the summaries table and its indexes if they are missing.
pub async fn ensure_schema(database_url: &str) -> Result<(), StorageError> {
    execute_with_retry(database_url, |client| async move {
        client.batch_execute(SUMMARIES_TABLE).await
    })
    .await
}

/// Store one finished rollup in the summaries table
///
/// # Arguments
/// * `summary` - Summary to insert
/// * `database_url` - PostgreSQL connection string
///
/// # Returns
/// Number of inserted rows
pub async fn store_summary(summary: &Summary, database_url: &str) -> Result<u64, StorageError> {
    // Clone data for move into async closure
    let summary = summary.clone();

    execute_with_retry(database_url, move |client| {
        let s = summary.clone();
        async move {
            client.execute(
                "INSERT INTO summaries(start_time, end_time, measurements, summary_seconds,
                    wind_avg, wind_gust, wind_lull, wind_stddev,
                    wind_direction_avg, wind_direction_min, wind_direction_max,
                    barometer_avg, barometer_start, outside_temp_avg, outside_humidity_avg, bar_trend)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
                &[
                    &s.start_time,
                    &s.end_time,
                    &s.measurements,
                    &s.summary_seconds,
                    &s.wind_avg,
                    &s.wind_gust,
                    &s.wind_lull,
                    &s.wind_stddev,
                    &s.wind_direction_avg,
                    &s.wind_direction_min,
                    &s.wind_direction_max,
                    &s.barometer_avg,
                    &s.barometer_start,
                    &s.outside_temp_avg,
                    &s.outside_humidity_avg,
                    &i16::from(s.bar_trend_byte),
                ],
            ).await
        }
    }).await
}

/// Number of `interval_seconds` summaries that fit into `window`.
pub fn expected_rows(window: Duration, interval_seconds: i32) -> i64 {
    if interval_seconds <= 0 {
        return 0;
    }
    window.as_secs() as i64 / i64::from(interval_seconds)
}

/// Fetch the summaries of one interval ending after `start`, oldest first
///
/// At most `window / interval_seconds` rows are returned. A warning is logged
/// when fewer than half of them exist.
pub async fn get_summaries(
    database_url: &str,
    start: OffsetDateTime,
    window: Duration,
    interval_seconds: i32,
) -> Result<Vec<Summary>, StorageError> {
    let limit = expected_rows(window, interval_seconds);

    let rows = execute_with_retry(database_url, move |client| async move {
        client
            .query(SELECT_RECENT, &[&start, &interval_seconds, &limit])
            .await
    })
    .await?;

    let summaries = rows
        .iter()
        .map(summary_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    if (summaries.len() as i64) < limit / 2 {
        warn!(
            "Not enough summary records for report: {}/{}",
            summaries.len(),
            limit
        );
    }
    Ok(summaries)
}

fn summary_from_row(row: &Row) -> Result<Summary, tokio_postgres::Error> {
    let bar_trend: i16 = row.try_get("bar_trend")?;
    Ok(Summary {
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        measurements: row.try_get("measurements")?,
        summary_seconds: row.try_get("summary_seconds")?,
        wind_avg: row.try_get("wind_avg")?,
        wind_gust: row.try_get("wind_gust")?,
        wind_lull: row.try_get("wind_lull")?,
        wind_stddev: row.try_get("wind_stddev")?,
        wind_direction_avg: row.try_get("wind_direction_avg")?,
        wind_direction_min: row.try_get("wind_direction_min")?,
        wind_direction_max: row.try_get("wind_direction_max")?,
        barometer_avg: row.try_get("barometer_avg")?,
        barometer_start: row.try_get("barometer_start")?,
        outside_temp_avg: row.try_get("outside_temp_avg")?,
        outside_humidity_avg: row.try_get("outside_humidity_avg")?,
        bar_trend_byte: bar_trend as u8,
    })
}

/// Summary sink backed by the summaries table.
#[derive(Debug, Clone)]
pub struct PostgresSummaryStore {
    database_url: String,
}

impl PostgresSummaryStore {
    /// Prepare the schema and return a store writing to `database_url`.
    pub async fn open(database_url: &str) -> Result<Self, StorageError> {
        ensure_schema(database_url).await?;
        info!("Summaries table ready");
        Ok(Self {
            database_url: database_url.to_string(),
        })
    }

    pub async fn recent(
        &self,
        start: OffsetDateTime,
        window: Duration,
        interval_seconds: i32,
    ) -> Result<Vec<Summary>, StorageError> {
        get_summaries(&self.database_url, start, window, interval_seconds).await
    }
}

#[async_trait]
impl SummarySink for PostgresSummaryStore {
    async fn save(&mut self, summary: &Summary) -> Result<(), StorageError> {
        store_summary(summary, &self.database_url).await?;
        Ok(())
    }
}
