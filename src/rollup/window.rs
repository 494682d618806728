/// One open aggregation window
use std::time::Duration;
use time::OffsetDateTime;

use crate::models::{LoopRecord, Summary};

/// Direction vectors shorter than this (per sample) are treated as calm/undefined.
const MIN_DIRECTION_VECTOR: f64 = 1e-9;

/// Running sums for one interval, updated once per LOOP record.
///
/// Wind direction is accumulated as unit vectors so that 350° and 10°
/// average to north, not south.
#[derive(Debug, Clone, PartialEq)]
pub struct Rollup {
    pub period: OffsetDateTime,
    pub interval: Duration,
    pub count: u32,
    pub wind_sum: u64,
    pub wind_sum_squares: u64,
    pub wind_max: u8,
    pub wind_min: u8,
    pub wind_dir_x_sum: f64,
    pub wind_dir_y_sum: f64,
    pub wind_dir_max: u16,
    pub wind_dir_min: u16,
    pub barometer_sum: f64,
    pub barometer_start: f64,
    pub outside_temp_sum: f64,
    pub outside_humidity_sum: u64,
    pub bar_trend_byte: u8,
}

impl Rollup {
    pub fn new(period: OffsetDateTime, interval: Duration) -> Self {
        Self {
            period,
            interval,
            count: 0,
            wind_sum: 0,
            wind_sum_squares: 0,
            wind_max: 0,
            wind_min: u8::MAX,
            wind_dir_x_sum: 0.0,
            wind_dir_y_sum: 0.0,
            wind_dir_max: 0,
            wind_dir_min: u16::MAX,
            barometer_sum: 0.0,
            barometer_start: 0.0,
            outside_temp_sum: 0.0,
            outside_humidity_sum: 0,
            bar_trend_byte: 0,
        }
    }

    pub fn update(&mut self, record: &LoopRecord) {
        self.count += 1;

        // wind speed
        let wind = u64::from(record.wind);
        self.wind_sum += wind;
        self.wind_sum_squares += wind * wind;
        self.wind_max = self.wind_max.max(record.wind);
        self.wind_min = self.wind_min.min(record.wind);

        // wind direction
        let radians = f64::from(record.wind_direction).to_radians();
        self.wind_dir_x_sum += radians.cos();
        self.wind_dir_y_sum += radians.sin();
        self.wind_dir_max = self.wind_dir_max.max(record.wind_direction);
        self.wind_dir_min = self.wind_dir_min.min(record.wind_direction);

        let barometer = record.barometer();
        if self.count == 1 {
            self.barometer_start = barometer;
        }
        self.barometer_sum += barometer;
        self.outside_temp_sum += record.outside_temp();
        self.outside_humidity_sum += u64::from(record.outside_humidity);
        // last write wins, the trend is not averaged
        self.bar_trend_byte = record.bar_trend_byte;
    }

    pub fn end(&self) -> OffsetDateTime {
        self.period + self.interval
    }

    fn mean(&self, sum: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(sum / f64::from(self.count))
    }

    pub fn wind_average(&self) -> Option<f64> {
        self.mean(self.wind_sum as f64)
    }

    /// Population standard deviation of wind speed.
    pub fn wind_stddev(&self) -> Option<f64> {
        let n = f64::from(self.count);
        let sum = self.wind_sum as f64;
        let variance = self.mean(self.wind_sum_squares as f64 - sum * sum / n)?;
        Some(variance.max(0.0).sqrt())
    }

    /// Circular mean of the wind direction in degrees, `[0, 360)`.
    ///
    /// Opposing directions that cancel out completely have no meaningful
    /// mean; they report 0°.
    pub fn wind_direction_average(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let (x, y) = (self.wind_dir_x_sum, self.wind_dir_y_sum);
        if x.hypot(y) < MIN_DIRECTION_VECTOR * f64::from(self.count) {
            return Some(0.0);
        }
        let mut degrees = y.atan2(x).to_degrees();
        if degrees < 0.0 {
            degrees += 360.0;
        }
        if degrees >= 360.0 {
            degrees -= 360.0;
        }
        Some(degrees)
    }

    pub fn barometer_average(&self) -> Option<f64> {
        self.mean(self.barometer_sum)
    }

    pub fn outside_temp_average(&self) -> Option<f64> {
        self.mean(self.outside_temp_sum)
    }

    pub fn outside_humidity_average(&self) -> Option<f64> {
        self.mean(self.outside_humidity_sum as f64)
    }

    /// Freeze into a summary. Empty rollups have nothing to report.
    pub fn summary(&self) -> Option<Summary> {
        let direction = self.wind_direction_average()?.round() as i32 % 360;
        Some(Summary {
            start_time: self.period,
            end_time: self.end(),
            measurements: self.count as i32,
            summary_seconds: self.interval.as_secs() as i32,
            wind_avg: self.wind_average()?,
            wind_gust: f64::from(self.wind_max),
            wind_lull: f64::from(self.wind_min),
            wind_stddev: self.wind_stddev()?,
            wind_direction_avg: direction,
            wind_direction_min: i32::from(self.wind_dir_min),
            wind_direction_max: i32::from(self.wind_dir_max),
            barometer_avg: self.barometer_average()?,
            barometer_start: self.barometer_start,
            outside_temp_avg: self.outside_temp_average()?,
            outside_humidity_avg: self.outside_humidity_average()?,
            bar_trend_byte: self.bar_trend_byte,
        })
    }
}
