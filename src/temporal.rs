// ⏰ Temporal Model - Timestamps, validity intervals, open-ended sentinels
//
// Every comparison in the classifier and the chronological gate runs on a
// single basis: naive UTC. Timezone-aware inputs are converted to UTC and
// dropped to naive; naive inputs are taken as already UTC; date-only values
// are midnight.

use crate::error::SyncError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

// ============================================================================
// OPEN-ENDED SENTINELS
// ============================================================================

/// Far-future dates the ERP and payroll use in place of "no end date"
pub const OPEN_ENDED_SENTINELS: [(i32, u32, u32); 2] = [(2154, 12, 31), (9999, 12, 31)];

/// True when the date is one of the recognised open-ended placeholders
pub fn is_open_ended(date: NaiveDate) -> bool {
    OPEN_ENDED_SENTINELS
        .iter()
        .filter_map(|(y, m, d)| NaiveDate::from_ymd_opt(*y, *m, *d))
        .any(|sentinel| sentinel == date)
}

/// Parse an end date, mapping blanks and open-ended placeholders to None
pub fn effective_end_date(raw: Option<&str>) -> Option<NaiveDateTime> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = parse_timestamp(raw).ok()?;
    if is_open_ended(parsed.date()) {
        None
    } else {
        Some(parsed)
    }
}

// ============================================================================
// PARSING
// ============================================================================

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y", "%Y%m%d"];

/// Parse any accepted timestamp or date string into naive UTC
///
/// Accepted:
/// - RFC 3339 with `Z` or an offset (converted to UTC)
/// - `YYYY-MM-DDTHH:MM:SS[.f]` and `YYYY-MM-DD HH:MM:SS[.f]` (taken as UTC)
/// - `YYYY-MM-DD`, `YYYY/MM/DD`, `DD/MM/YYYY`, `DD-MM-YYYY`, `YYYYMMDD` (midnight)
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, SyncError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(date_error(raw, "empty value"));
    }

    if let Ok(aware) = DateTime::parse_from_rfc3339(value) {
        return Ok(aware.naive_utc());
    }

    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive);
        }
    }

    // Date-only, or the date part of something longer we could not parse
    let date_part = value.split(['T', ' ']).next().unwrap_or(value);
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(date_part, format) {
            return Ok(date.and_time(NaiveTime::MIN));
        }
    }

    Err(date_error(raw, "unrecognised date format"))
}

/// Lenient variant for optional payload fields
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    parse_timestamp(raw).ok().map(|ts| ts.date())
}

/// Normalise any accepted date string to `YYYY-MM-DD`
pub fn to_iso_date(raw: &str) -> Option<String> {
    parse_date(raw).map(|d| d.format("%Y-%m-%d").to_string())
}

fn date_error(value: &str, reason: &str) -> SyncError {
    SyncError::DateParseFailure {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// VALIDITY INTERVAL
// ============================================================================

/// Closed-open interval `[start, end)`; no end means unbounded above
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityInterval {
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
}

impl ValidityInterval {
    pub fn new(start: NaiveDateTime, end: Option<NaiveDateTime>) -> Self {
        ValidityInterval { start, end }
    }

    /// Build from raw start/end strings; sentinel end dates count as open
    pub fn from_raw(start: &str, end: Option<&str>) -> Result<Self, SyncError> {
        Ok(ValidityInterval {
            start: parse_timestamp(start)?,
            end: effective_end_date(end),
        })
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    pub fn contains(&self, instant: NaiveDateTime) -> bool {
        instant >= self.start && self.end.map_or(true, |end| instant < end)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_aware_timestamps_to_utc() {
        assert_eq!(
            parse_timestamp("2024-06-01T10:30:00Z").unwrap(),
            ts(2024, 6, 1, 10, 30)
        );
        assert_eq!(
            parse_timestamp("2024-06-01T12:30:00+02:00").unwrap(),
            ts(2024, 6, 1, 10, 30)
        );
        assert_eq!(
            parse_timestamp("2024-06-01T10:30:00.1234567Z").unwrap().date(),
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
        );
    }

    #[test]
    fn test_parse_naive_and_date_only() {
        assert_eq!(
            parse_timestamp("2024-06-01 10:30:00").unwrap(),
            ts(2024, 6, 1, 10, 30)
        );
        assert_eq!(
            parse_timestamp("2024-06-01T10:30:00").unwrap(),
            ts(2024, 6, 1, 10, 30)
        );
        assert_eq!(parse_timestamp("2024-06-01").unwrap(), ts(2024, 6, 1, 0, 0));
        assert_eq!(parse_timestamp("2024/06/01").unwrap(), ts(2024, 6, 1, 0, 0));
        assert_eq!(parse_timestamp("01/06/2024").unwrap(), ts(2024, 6, 1, 0, 0));
        assert_eq!(parse_timestamp("01-06-2024").unwrap(), ts(2024, 6, 1, 0, 0));
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(
            parse_timestamp(""),
            Err(SyncError::DateParseFailure { .. })
        ));
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_date("32/13/2024").is_none());
    }

    #[test]
    fn test_iso_date_extraction() {
        assert_eq!(to_iso_date("2024-06-01T10:30:00Z").as_deref(), Some("2024-06-01"));
        assert_eq!(to_iso_date("15/03/1990").as_deref(), Some("1990-03-15"));
        assert_eq!(to_iso_date("n/a"), None);
    }

    #[test]
    fn test_open_ended_sentinels() {
        assert!(is_open_ended(NaiveDate::from_ymd_opt(2154, 12, 31).unwrap()));
        assert!(is_open_ended(NaiveDate::from_ymd_opt(9999, 12, 31).unwrap()));
        assert!(!is_open_ended(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()));

        assert_eq!(effective_end_date(Some("2154-12-31T00:00:00Z")), None);
        assert_eq!(effective_end_date(Some("  ")), None);
        assert_eq!(effective_end_date(None), None);
        assert_eq!(
            effective_end_date(Some("2024-03-01")),
            Some(ts(2024, 3, 1, 0, 0))
        );
    }

    #[test]
    fn test_validity_interval_is_closed_open() {
        let interval = ValidityInterval::from_raw("2024-01-01", Some("2024-03-01")).unwrap();

        assert!(interval.contains(ts(2024, 1, 1, 0, 0)));
        assert!(interval.contains(ts(2024, 2, 29, 23, 59)));
        assert!(!interval.contains(ts(2024, 3, 1, 0, 0)));
        assert!(!interval.contains(ts(2023, 12, 31, 23, 59)));

        let open = ValidityInterval::from_raw("2024-01-01", Some("9999-12-31")).unwrap();
        assert!(open.is_open());
        assert!(open.contains(ts(2100, 1, 1, 0, 0)));
    }
}
