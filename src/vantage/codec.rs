/// Davis Vantage binary packet decoding
///
/// Everything here is pure: byte slices in, records out. Multi-byte values
/// on the wire are little-endian, except the trailing CRC which is sent
/// most-significant byte first.
use log::debug;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::error::FormatError;
use crate::models::{ArchiveRecord, LoopRecord};

pub const LOOP_PACKET_SIZE: usize = 99;
pub const ARCHIVE_PAGE_SIZE: usize = 267;
pub const ARCHIVE_RECORD_SIZE: usize = 52;
pub const RECORDS_PER_PAGE: usize = 5;

const LOOP_SIGNATURE: &[u8; 3] = b"LOO";
const NO_DIRECTION: u8 = 255;

/// CRC-16/CCITT lookup table (poly 0x1021), built at compile time.
static CRC_TABLE: [u16; 256] = build_crc_table();

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Bar trend code -> description. Rev A consoles send 'P' (80) here.
static BAR_TRENDS: [(u8, &str); 6] = [
    (196, "Falling Rapidly"),
    (236, "Falling Slowly"),
    (0, "Steady"),
    (20, "Rising Slowly"),
    (60, "Rising Rapidly"),
    (80, "Unknown"),
];

/// Archive direction code (0..=15) -> degrees.
static ARCHIVE_DIRECTIONS: [u16; 16] = [
    0, 22, 45, 67, 90, 112, 135, 157, 180, 202, 225, 247, 270, 292, 315, 337,
];

pub static CARDINAL_NAMES: [&str; 16] = [
    "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW", "NW",
    "NNW",
];

/// CRC-16 as used by the console: poly 0x1021, seed 0, no final XOR.
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |crc, &byte| {
        CRC_TABLE[usize::from((crc >> 8) as u8 ^ byte)] ^ (crc << 8)
    })
}

/// Append the big-endian CRC of `payload`, producing a frame the console accepts.
pub fn with_crc(payload: &[u8]) -> Vec<u8> {
    let mut frame = payload.to_vec();
    frame.extend_from_slice(&crc16(payload).to_be_bytes());
    frame
}

/// Check the trailing two CRC bytes of `frame` against the preceding payload.
pub fn verify_crc(frame: &[u8]) -> Result<(), FormatError> {
    if frame.len() < 2 {
        return Err(FormatError::Length {
            expected: 2,
            actual: frame.len(),
        });
    }
    let (payload, tail) = frame.split_at(frame.len() - 2);
    let sent = u16::from_be_bytes([tail[0], tail[1]]);
    let computed = crc16(payload);
    if sent != computed {
        return Err(FormatError::Checksum { sent, computed });
    }
    Ok(())
}

fn le_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn le_i16(bytes: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Decode a 99-byte LOOP packet captured at `recorded`.
///
/// Fails if the packet has the wrong length, does not start with "LOO",
/// or its CRC does not match.
pub fn decode_loop(pkt: &[u8], recorded: OffsetDateTime) -> Result<LoopRecord, FormatError> {
    if pkt.len() != LOOP_PACKET_SIZE {
        return Err(FormatError::Length {
            expected: LOOP_PACKET_SIZE,
            actual: pkt.len(),
        });
    }
    if &pkt[0..3] != LOOP_SIGNATURE {
        return Err(FormatError::Signature([pkt[0], pkt[1], pkt[2]]));
    }
    verify_crc(pkt)?;

    Ok(LoopRecord {
        recorded,
        wind: pkt[14],
        wind_avg: pkt[15],
        wind_direction: le_u16(pkt, 16),
        barometer_raw: le_u16(pkt, 7),
        bar_trend_byte: pkt[3],
        inside_temp_raw: le_i16(pkt, 9),
        outside_temp_raw: le_i16(pkt, 12),
        inside_humidity: pkt[11],
        outside_humidity: pkt[33],
        rain_rate_raw: le_u16(pkt, 41),
        storm_rain_raw: le_u16(pkt, 46),
        storm_start: decode_storm_date(le_u16(pkt, 48)),
        day_rain_raw: le_u16(pkt, 50),
        month_rain_raw: le_u16(pkt, 52),
        year_rain_raw: le_u16(pkt, 54),
    })
}

/// Decode one 267-byte archive page into its populated records.
///
/// Page layout: sequence byte, five 52-byte records, four unused bytes and
/// the CRC. Slots that were never written carry an empty date and are skipped.
pub fn decode_archive_page(page: &[u8], page_index: u16) -> Result<Vec<ArchiveRecord>, FormatError> {
    if page.len() != ARCHIVE_PAGE_SIZE {
        return Err(FormatError::Length {
            expected: ARCHIVE_PAGE_SIZE,
            actual: page.len(),
        });
    }
    verify_crc(page)?;

    let records = (0..RECORDS_PER_PAGE)
        .filter_map(|i| {
            let start = 1 + i * ARCHIVE_RECORD_SIZE;
            decode_archive_record(&page[start..start + ARCHIVE_RECORD_SIZE], page_index, i as u8)
        })
        .collect();
    Ok(records)
}

fn decode_archive_record(dr: &[u8], page: u16, index: u8) -> Option<ArchiveRecord> {
    let (date, time) = (le_u16(dr, 0), le_u16(dr, 2));
    let Some(timestamp) = decode_archive_timestamp(date, time) else {
        if date != 0 && date != 0xFFFF {
            debug!(
                "Dropping archive record {}/{} with invalid stamp: date {:#06x}, time {}",
                page, index, date, time
            );
        }
        return None;
    };

    Some(ArchiveRecord {
        page,
        index,
        timestamp,
        outside_temp_raw: le_i16(dr, 4),
        high_outside_temp_raw: le_i16(dr, 6),
        low_outside_temp_raw: le_i16(dr, 8),
        rainfall_clicks: le_u16(dr, 10),
        high_rain_rate_raw: le_u16(dr, 12),
        barometer_raw: le_u16(dr, 14),
        solar_radiation: le_u16(dr, 16),
        wind_samples: le_u16(dr, 18),
        inside_temp_raw: le_i16(dr, 20),
        inside_humidity: dr[22],
        outside_humidity: dr[23],
        wind_avg: dr[24],
        wind_max: dr[25],
        wind_max_direction: archive_direction(dr[26]),
        wind_direction: archive_direction(dr[27]),
        uv_index_avg_raw: dr[28],
        et_raw: dr[29],
        high_solar_radiation: le_u16(dr, 30),
        uv_index_max: dr[32],
        forecast_rule: dr[33],
        leaf_temps: [dr[34], dr[35]],
        leaf_wetness: [dr[36], dr[37]],
        soil_temps: [dr[38], dr[39], dr[40], dr[41]],
        record_type: dr[42],
        extra_humidities: [dr[43], dr[44]],
        extra_temps: [dr[45], dr[46], dr[47]],
        soil_moistures: [dr[48], dr[49], dr[50], dr[51]],
    })
}

/// Archive direction code to degrees; 255 means no wind was recorded.
pub fn archive_direction(code: u8) -> Option<u16> {
    if code == NO_DIRECTION {
        return None;
    }
    ARCHIVE_DIRECTIONS.get(usize::from(code)).copied()
}

pub fn bar_trend_description(code: u8) -> Option<&'static str> {
    BAR_TRENDS
        .iter()
        .find(|(trend, _)| *trend == code)
        .map(|(_, description)| *description)
}

/// Packed archive date: day in bits 0-4, month in bits 5-8, year-2000 above.
pub fn decode_archive_date(packed: u16) -> Option<Date> {
    if packed == 0xFFFF {
        return None;
    }
    let day = (packed & 0x1F) as u8;
    if day == 0 {
        return None;
    }
    let month = Month::try_from(((packed >> 5) & 0x0F) as u8).ok()?;
    let year = i32::from(packed >> 9) + 2000;
    Date::from_calendar_date(year, month, day).ok()
}

/// Archive timestamp from packed date and `hour * 100 + minute`.
pub fn decode_archive_timestamp(date: u16, time: u16) -> Option<PrimitiveDateTime> {
    let date = decode_archive_date(date)?;
    let clock = Time::from_hms((time / 100) as u8, (time % 100) as u8, 0).ok()?;
    Some(PrimitiveDateTime::new(date, clock))
}

/// Inverse of [`decode_archive_timestamp`], laid out as DMPAFT expects.
pub fn encode_archive_timestamp(timestamp: PrimitiveDateTime) -> [u8; 4] {
    let year = (timestamp.year() - 2000).clamp(0, 127) as u16;
    let date = u16::from(timestamp.day()) | (u16::from(u8::from(timestamp.month())) << 5) | (year << 9);
    let time = u16::from(timestamp.hour()) * 100 + u16::from(timestamp.minute());

    let mut bytes = [0u8; 4];
    bytes[0..2].copy_from_slice(&date.to_le_bytes());
    bytes[2..4].copy_from_slice(&time.to_le_bytes());
    bytes
}

/// Storm start date from a LOOP packet: month in bits 12-15, day in bits
/// 7-11, year-2000 in bits 0-6. 0xFFFF means no storm is in progress.
pub fn decode_storm_date(packed: u16) -> Option<Date> {
    if packed == 0xFFFF {
        return None;
    }
    let day = ((packed >> 7) & 0x1F) as u8;
    if day == 0 {
        return None;
    }
    let month = Month::try_from((packed >> 12) as u8).ok()?;
    let year = i32::from(packed & 0x7F) + 2000;
    Date::from_calendar_date(year, month, day).ok()
}
