use log::info;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::rollup::DEFAULT_INTERVALS;
use crate::vantage::SupervisorSettings;

const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct StationConfig {
    /// host:port of the console's TCP bridge.
    pub vantage_address: String,
    /// Summaries are only logged when unset.
    pub database_url: Option<String>,
    pub supervisor: SupervisorSettings,
    pub rollup_intervals: Vec<Duration>,
    pub queue_capacity: usize,
    /// Replay this much archive history before live collection starts.
    pub archive_backfill: Option<Duration>,
}

impl StationConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let vantage_address = get("VANTAGE_ADDRESS").ok_or(ConfigError::Missing("VANTAGE_ADDRESS"))?;
        let database_url = get("DATABASE_URL");

        let defaults = SupervisorSettings::default();
        let burst_size = match get("LOOP_BURST_SIZE") {
            Some(value) => parse_positive::<usize>("LOOP_BURST_SIZE", &value)?,
            None => defaults.burst_size,
        };
        let reconnect_delay = match get("RECONNECT_DELAY_SECS") {
            Some(value) => Duration::from_secs(parse_number("RECONNECT_DELAY_SECS", &value)?),
            None => defaults.reconnect_delay,
        };

        let rollup_intervals = match get("ROLLUP_INTERVALS") {
            Some(value) => parse_intervals(&value)?,
            None => DEFAULT_INTERVALS.to_vec(),
        };

        let queue_capacity = match get("RECORD_QUEUE_CAPACITY") {
            Some(value) => parse_positive::<usize>("RECORD_QUEUE_CAPACITY", &value)?,
            None => DEFAULT_QUEUE_CAPACITY,
        };

        let archive_backfill = get("ARCHIVE_BACKFILL_HOURS")
            .map(|value| parse_positive::<u64>("ARCHIVE_BACKFILL_HOURS", &value))
            .transpose()?
            .map(|hours| Duration::from_secs(hours * 3600));

        info!(
            "Console at {}, {} record bursts, intervals {:?}",
            vantage_address,
            burst_size,
            rollup_intervals.iter().map(Duration::as_secs).collect::<Vec<_>>()
        );
        if database_url.is_none() {
            info!("DATABASE_URL not set, summaries will only be logged");
        }

        Ok(StationConfig {
            vantage_address,
            database_url,
            supervisor: SupervisorSettings {
                burst_size,
                reconnect_delay,
            },
            rollup_intervals,
            queue_capacity,
            archive_backfill,
        })
    }
}

fn parse_number<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

fn parse_positive<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
{
    let parsed: T = parse_number(name, value)?;
    if parsed == T::default() {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

/// Comma separated seconds, e.g. `60,300,600`.
fn parse_intervals(value: &str) -> Result<Vec<Duration>, ConfigError> {
    let mut intervals = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let seconds = parse_positive::<u64>("ROLLUP_INTERVALS", part)?;
        intervals.push(Duration::from_secs(seconds));
    }
    if intervals.is_empty() {
        return Err(ConfigError::Invalid {
            name: "ROLLUP_INTERVALS",
            value: value.to_string(),
        });
    }
    Ok(intervals)
}
