//! Asia/Seoul time helpers.
//!
//! Every on-disk and in-DB timestamp in docchat is naive KST. Conversions
//! from tz-aware upstream values happen here, at the parsing boundary.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Asia::Seoul;
use chrono_tz::Tz;

pub fn timezone() -> Tz {
  Seoul
}

pub fn now() -> DateTime<Tz> {
  Utc::now().with_timezone(&Seoul)
}

pub fn now_iso() -> String {
  now().to_rfc3339()
}

/// Current wall-clock time with the timezone stripped, for SQLite and the
/// JSONL shards.
pub fn now_naive() -> NaiveDateTime {
  now().naive_local()
}

pub fn today() -> NaiveDate {
  now().date_naive()
}

pub fn format_date(date: NaiveDate) -> String {
  date.format("%Y-%m-%d").to_string()
}

/// `YYYYMMDD_HHMMSS`, used for emergency dump filenames.
pub fn format_compact(dt: NaiveDateTime) -> String {
  dt.format("%Y%m%d_%H%M%S").to_string()
}

/// Parses a record's `created_at`, normalizing to naive KST.
///
/// Accepts RFC 3339 (tz-aware, converted to KST and stripped) and naive
/// `YYYY-MM-DDTHH:MM:SS[.f]` / `YYYY-MM-DD HH:MM:SS[.f]` strings, which are
/// assumed to already be KST.
pub fn parse_created_at(raw: &str) -> Option<NaiveDateTime> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
    return Some(dt.with_timezone(&Seoul).naive_local());
  }
  for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
      return Some(dt);
    }
  }
  None
}

/// Unix timestamp (seconds), used for temp-collection TTL suffixes.
pub fn unix_ts() -> i64 {
  Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Timelike;

  #[test]
  fn parse_tz_aware_converts_to_kst() {
    // 2025-03-01T00:00:00Z is 09:00 KST.
    let parsed = parse_created_at("2025-03-01T00:00:00+00:00").unwrap();
    assert_eq!(parsed.hour(), 9);
    assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
  }

  #[test]
  fn parse_naive_assumed_kst() {
    let parsed = parse_created_at("2025-03-01T13:30:00").unwrap();
    assert_eq!(parsed.hour(), 13);
    let with_space = parse_created_at("2025-03-01 13:30:00.123456").unwrap();
    assert_eq!(with_space.minute(), 30);
  }

  #[test]
  fn parse_garbage_is_none() {
    assert!(parse_created_at("not a date").is_none());
  }
}
