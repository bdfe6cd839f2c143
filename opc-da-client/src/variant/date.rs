//! Timestamp conversions.
//!
//! `VT_DATE` counts days since 1899-12-30: the integer part is the day and
//! the fraction is the time of day. Negative values keep that split, so
//! `-1.25` is 1899-12-29 06:00 rather than 1899-12-28 18:00.
//! `FILETIME` counts 100 ns intervals since 1601-01-01.

use chrono::{DateTime, Utc};

use super::CodecError;

/// Days from 1899-12-30 to 1970-01-01.
const UNIX_EPOCH_DAYS: i64 = 25_569;
const MS_PER_DAY: i64 = 86_400_000;
/// 100 ns intervals from 1601-01-01 to 1970-01-01.
const FILETIME_UNIX_OFFSET: i128 = 116_444_736_000_000_000;
const TICKS_PER_SECOND: i128 = 10_000_000;

/// Converts an OLE automation date, rounded to the millisecond.
///
/// # Examples
/// ```
/// use opc_da_client::variant::ole_date_to_datetime;
///
/// let dt = ole_date_to_datetime(25569.5).unwrap();
/// assert_eq!(dt.to_rfc3339(), "1970-01-01T12:00:00+00:00");
/// ```
pub fn ole_date_to_datetime(date: f64) -> Result<DateTime<Utc>, CodecError> {
    let out_of_range = || CodecError::DateOutOfRange(date.to_string());
    if !date.is_finite() {
        return Err(out_of_range());
    }
    let days = date.trunc();
    let time_ms = ((date - days).abs() * MS_PER_DAY as f64).round();
    let ole_ms = days.mul_add(MS_PER_DAY as f64, time_ms);
    if ole_ms.abs() >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    let unix_ms = (ole_ms as i64)
        .checked_sub(UNIX_EPOCH_DAYS * MS_PER_DAY)
        .ok_or_else(out_of_range)?;
    DateTime::from_timestamp_millis(unix_ms).ok_or_else(out_of_range)
}

/// Converts to an OLE automation date. Sub-millisecond precision is dropped.
pub fn datetime_to_ole_date(dt: &DateTime<Utc>) -> f64 {
    let ole_ms = dt.timestamp_millis() + UNIX_EPOCH_DAYS * MS_PER_DAY;
    let days = ole_ms.div_euclid(MS_PER_DAY);
    let fraction = ole_ms.rem_euclid(MS_PER_DAY) as f64 / MS_PER_DAY as f64;
    if days < 0 {
        days as f64 - fraction
    } else {
        days as f64 + fraction
    }
}

/// Layout-compatible `FILETIME`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FileTime {
    pub low: u32,
    pub high: u32,
}

impl FileTime {
    pub const fn from_u64(ticks: u64) -> Self {
        Self {
            low: ticks as u32,
            high: (ticks >> 32) as u32,
        }
    }

    pub const fn as_u64(self) -> u64 {
        ((self.high as u64) << 32) | self.low as u64
    }

    pub const fn is_zero(self) -> bool {
        self.low == 0 && self.high == 0
    }
}

/// Converts a `FILETIME`. The all-zero value means "no timestamp".
pub fn filetime_to_datetime(ft: FileTime) -> Option<DateTime<Utc>> {
    if ft.is_zero() {
        return None;
    }
    let since_unix = i128::from(ft.as_u64()) - FILETIME_UNIX_OFFSET;
    let secs = i64::try_from(since_unix.div_euclid(TICKS_PER_SECOND)).ok()?;
    let nanos = u32::try_from(since_unix.rem_euclid(TICKS_PER_SECOND) * 100).ok()?;
    DateTime::from_timestamp(secs, nanos)
}

/// Converts to a `FILETIME`, saturating outside its range.
pub fn datetime_to_filetime(dt: &DateTime<Utc>) -> FileTime {
    let ticks = i128::from(dt.timestamp()) * TICKS_PER_SECOND
        + i128::from(dt.timestamp_subsec_nanos() / 100)
        + FILETIME_UNIX_OFFSET;
    let clamped = ticks.clamp(0, i128::from(u64::MAX));
    FileTime::from_u64(u64::try_from(clamped).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_known_ole_dates() {
        assert_eq!(
            ole_date_to_datetime(0.0).unwrap(),
            Utc.with_ymd_and_hms(1899, 12, 30, 0, 0, 0).unwrap()
        );
        assert_eq!(
            ole_date_to_datetime(-1.25).unwrap(),
            Utc.with_ymd_and_hms(1899, 12, 29, 6, 0, 0).unwrap()
        );
        assert_eq!(
            datetime_to_ole_date(&Utc.with_ymd_and_hms(1899, 12, 29, 6, 0, 0).unwrap()),
            -1.25
        );
        assert_eq!(
            datetime_to_ole_date(&Utc.with_ymd_and_hms(1970, 1, 1, 12, 0, 0).unwrap()),
            25569.5
        );
    }

    #[test]
    fn test_ole_roundtrip_millisecond_precision() {
        let samples = [
            Utc.with_ymd_and_hms(2025, 6, 1, 13, 45, 7).unwrap() + chrono::Duration::milliseconds(123),
            Utc.with_ymd_and_hms(1800, 3, 4, 23, 59, 59).unwrap() + chrono::Duration::milliseconds(999),
            Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(1),
        ];
        for dt in samples {
            assert_eq!(ole_date_to_datetime(datetime_to_ole_date(&dt)).unwrap(), dt);
        }
    }

    #[test]
    fn test_ole_rejects_non_finite() {
        assert!(ole_date_to_datetime(f64::NAN).is_err());
        assert!(ole_date_to_datetime(f64::INFINITY).is_err());
        assert!(ole_date_to_datetime(1e300).is_err());
    }

    #[test]
    fn test_filetime_zero_is_none() {
        assert_eq!(filetime_to_datetime(FileTime::default()), None);
    }

    #[test]
    fn test_filetime_roundtrip() {
        let dt = Utc.with_ymd_and_hms(2026, 3, 15, 8, 30, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        let ft = datetime_to_filetime(&dt);
        assert_eq!(filetime_to_datetime(ft), Some(dt));
        let epoch = datetime_to_filetime(&DateTime::UNIX_EPOCH);
        assert_eq!(epoch.as_u64(), 116_444_736_000_000_000);
    }

    #[test]
    fn test_filetime_split() {
        let ft = FileTime::from_u64(0x0123_4567_89AB_CDEF);
        assert_eq!(ft.high, 0x0123_4567);
        assert_eq!(ft.low, 0x89AB_CDEF);
        assert_eq!(ft.as_u64(), 0x0123_4567_89AB_CDEF);
    }
}
