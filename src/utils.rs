/// Time helpers shared by the collector, the rollups and the log output
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format.
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description!("[day].[month].[year] - [hour]:[minute]:[second]");
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Round `ts` down to the start of its `interval`-long window.
///
/// Windows are aligned to the unix epoch, so a 5 minute interval always starts
/// at :00, :05, :10 and so on. The UTC offset of `ts` is preserved.
///
/// # Arguments
/// * `ts` - Timestamp to truncate
/// * `interval` - Window length; anything under one second leaves `ts` untouched
///
/// # Returns
/// The start of the window containing `ts`
pub fn truncate_to_interval(ts: OffsetDateTime, interval: Duration) -> OffsetDateTime {
    let seconds = interval.as_secs() as i64;
    if seconds == 0 {
        return ts;
    }
    let into_window = ts.unix_timestamp().rem_euclid(seconds);
    ts.replace_nanosecond(0).unwrap_or(ts) - time::Duration::seconds(into_window)
}
