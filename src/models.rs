use time::{Date, OffsetDateTime, PrimitiveDateTime};

use crate::vantage::codec::{bar_trend_description, CARDINAL_NAMES};

/// One decoded LOOP packet.
///
/// Values are kept in the console's scaled integer units; the accessor
/// methods convert them for display and aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopRecord {
    pub recorded: OffsetDateTime,
    pub wind: u8,              // mph
    pub wind_avg: u8,          // mph, 10 minute average
    pub wind_direction: u16,   // degrees
    pub barometer_raw: u16,    // inHg/1000
    pub bar_trend_byte: u8,
    pub inside_temp_raw: i16,  // 1/10 F
    pub outside_temp_raw: i16, // 1/10 F
    pub inside_humidity: u8,   // %
    pub outside_humidity: u8,  // %
    pub rain_rate_raw: u16,    // clicks/hr, click == 0.01in
    pub storm_rain_raw: u16,
    pub storm_start: Option<Date>,
    pub day_rain_raw: u16,
    pub month_rain_raw: u16,
    pub year_rain_raw: u16,
}

impl LoopRecord {
    pub fn barometer(&self) -> f64 {
        f64::from(self.barometer_raw) / 1000.0
    }

    pub fn inside_temp(&self) -> f64 {
        f64::from(self.inside_temp_raw) / 10.0
    }

    pub fn outside_temp(&self) -> f64 {
        f64::from(self.outside_temp_raw) / 10.0
    }

    pub fn rain_rate(&self) -> f64 {
        f64::from(self.rain_rate_raw) / 100.0
    }

    pub fn storm_rain(&self) -> f64 {
        f64::from(self.storm_rain_raw) / 100.0
    }

    pub fn day_rain(&self) -> f64 {
        f64::from(self.day_rain_raw) / 100.0
    }

    pub fn bar_trend(&self) -> Option<&'static str> {
        bar_trend_description(self.bar_trend_byte)
    }
}

/// One Rev B archive record taken from a DMP/DMPAFT page.
///
/// `timestamp` is console local time; the console has no notion of a zone.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRecord {
    pub page: u16,
    pub index: u8,
    pub timestamp: PrimitiveDateTime,
    pub outside_temp_raw: i16,
    pub high_outside_temp_raw: i16,
    pub low_outside_temp_raw: i16,
    pub rainfall_clicks: u16,
    pub high_rain_rate_raw: u16,
    pub barometer_raw: u16,
    pub solar_radiation: u16,
    pub wind_samples: u16,
    pub inside_temp_raw: i16,
    pub inside_humidity: u8,
    pub outside_humidity: u8,
    pub wind_avg: u8,
    pub wind_max: u8,
    pub wind_max_direction: Option<u16>,
    pub wind_direction: Option<u16>,
    pub uv_index_avg_raw: u8,
    pub et_raw: u8,
    pub high_solar_radiation: u16,
    pub uv_index_max: u8,
    pub forecast_rule: u8,
    pub leaf_temps: [u8; 2],
    pub leaf_wetness: [u8; 2],
    pub soil_temps: [u8; 4],
    pub record_type: u8,
    pub extra_humidities: [u8; 2],
    pub extra_temps: [u8; 3],
    pub soil_moistures: [u8; 4],
}

impl ArchiveRecord {
    pub fn outside_temp(&self) -> f64 {
        f64::from(self.outside_temp_raw) / 10.0
    }

    pub fn high_outside_temp(&self) -> f64 {
        f64::from(self.high_outside_temp_raw) / 10.0
    }

    pub fn low_outside_temp(&self) -> f64 {
        f64::from(self.low_outside_temp_raw) / 10.0
    }

    pub fn inside_temp(&self) -> f64 {
        f64::from(self.inside_temp_raw) / 10.0
    }

    pub fn barometer(&self) -> f64 {
        f64::from(self.barometer_raw) / 1000.0
    }

    pub fn uv_index_avg(&self) -> f64 {
        f64::from(self.uv_index_avg_raw) / 10.0
    }

    pub fn et(&self) -> f64 {
        f64::from(self.et_raw) / 1000.0
    }
}

/// Finished statistics for one rollup window.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub start_time: OffsetDateTime,
    pub end_time: OffsetDateTime,
    pub measurements: i32,
    pub summary_seconds: i32,
    pub wind_avg: f64,
    pub wind_gust: f64,
    pub wind_lull: f64,
    pub wind_stddev: f64,
    pub wind_direction_avg: i32,
    pub wind_direction_min: i32,
    pub wind_direction_max: i32,
    pub barometer_avg: f64,
    pub barometer_start: f64,
    pub outside_temp_avg: f64,
    pub outside_humidity_avg: f64,
    pub bar_trend_byte: u8,
}

impl Summary {
    /// Wind readings above 100 mph are sensor glitches, not weather.
    pub fn valid(&self) -> bool {
        self.wind_avg < 100.0 && self.wind_gust < 100.0
    }

    /// Average direction snapped to the nearest of the 16 compass points.
    pub fn wind_dir_avg_cardinal(&self) -> i32 {
        let snapped = ((f64::from(self.wind_direction_avg) / 22.5 + 0.5).floor() * 22.5) as i32;
        if snapped == 360 {
            0
        } else {
            snapped
        }
    }

    pub fn wind_dir_avg_name(&self) -> &'static str {
        let point = ((f64::from(self.wind_direction_avg) / 22.5 + 0.5).floor() as usize) % 16;
        CARDINAL_NAMES[point]
    }

    pub fn outside_temp_avg_celsius(&self) -> f64 {
        (self.outside_temp_avg - 32.0) * 5.0 / 9.0
    }

    pub fn bar_trend(&self) -> Option<&'static str> {
        bar_trend_description(self.bar_trend_byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn summary(direction: i32, wind_avg: f64, wind_gust: f64) -> Summary {
        Summary {
            start_time: datetime!(2024-06-01 12:00 UTC),
            end_time: datetime!(2024-06-01 12:05 UTC),
            measurements: 120,
            summary_seconds: 300,
            wind_avg,
            wind_gust,
            wind_lull: 0.0,
            wind_stddev: 1.0,
            wind_direction_avg: direction,
            wind_direction_min: 0,
            wind_direction_max: 359,
            barometer_avg: 29.95,
            barometer_start: 29.94,
            outside_temp_avg: 68.0,
            outside_humidity_avg: 55.0,
            bar_trend_byte: 20,
        }
    }

    #[test]
    fn validity_rejects_glitched_wind() {
        assert!(summary(0, 12.0, 25.0).valid());
        assert!(!summary(0, 150.0, 25.0).valid());
        assert!(!summary(0, 12.0, 100.0).valid());
    }

    #[test]
    fn cardinal_rounding_wraps_north() {
        assert_eq!(summary(350, 1.0, 1.0).wind_dir_avg_cardinal(), 0);
        assert_eq!(summary(350, 1.0, 1.0).wind_dir_avg_name(), "N");
        assert_eq!(summary(100, 1.0, 1.0).wind_dir_avg_cardinal(), 90);
        assert_eq!(summary(250, 1.0, 1.0).wind_dir_avg_name(), "WSW");
    }

    #[test]
    fn converts_temperature_and_trend() {
        let s = summary(0, 1.0, 1.0);
        assert!((s.outside_temp_avg_celsius() - 20.0).abs() < 1e-9);
        assert_eq!(s.bar_trend(), Some("Rising Slowly"));
    }
}
