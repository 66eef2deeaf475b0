//! Timestamp and payment date utilities

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

/// Accepted payment date layouts, tried in order
pub const PAYMENT_DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parse a payment date in ISO (`YYYY-MM-DD`) or day-first (`DD/MM/YYYY`) form
pub fn parse_payment_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Parse("payment date is missing".to_string()));
    }

    PAYMENT_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| Error::Parse(format!("unrecognized payment date: {:?}", trimmed)))
}

/// Canonical storage form of a payment date (`YYYY-MM-DD`)
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parse a date previously written by [`format_date`]
pub fn parse_stored_date(stored: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(stored, "%Y-%m-%d")
        .map_err(|e| Error::Internal(format!("Corrupt stored date {:?}: {}", stored, e)))
}

/// Fixed-width RFC 3339 form used for timestamp columns (sorts lexically)
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp column
pub fn parse_timestamp(stored: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(stored)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Corrupt stored timestamp {:?}: {}", stored, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        // Should be a reasonable timestamp (after year 2000)
        assert!(timestamp.timestamp() > 946_684_800);
    }

    #[tokio::test]
    async fn test_now_successive_calls_advance() {
        let time1 = now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let time2 = now();
        assert!(time2 > time1);
    }

    #[test]
    fn test_parse_iso_and_day_first_dates() {
        let expected = NaiveDate::from_ymd_opt(2025, 5, 10).unwrap();
        assert_eq!(parse_payment_date("2025-05-10").unwrap(), expected);
        assert_eq!(parse_payment_date("10/05/2025").unwrap(), expected);
        assert_eq!(parse_payment_date("10-05-2025").unwrap(), expected);
        assert_eq!(parse_payment_date("2025/05/10").unwrap(), expected);
        assert_eq!(parse_payment_date(" 2025-05-10 ").unwrap(), expected);
    }

    #[test]
    fn test_parse_rejects_missing_and_invalid_dates() {
        assert!(matches!(parse_payment_date(""), Err(Error::Parse(_))));
        assert!(matches!(parse_payment_date("not-a-date"), Err(Error::Parse(_))));
        assert!(matches!(parse_payment_date("2025-13-01"), Err(Error::Parse(_))));
        assert!(matches!(parse_payment_date("31/02/2025"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_format_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(format_date(date), "2024-01-02");
        assert_eq!(parse_stored_date("2024-01-02").unwrap(), date);
    }

    #[test]
    fn test_timestamps_are_fixed_width() {
        let early = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2025-01-01T00:00:00.5Z").unwrap().with_timezone(&Utc);

        let early_text = format_timestamp(early);
        let late_text = format_timestamp(late);
        assert_eq!(early_text, "2025-01-01T00:00:00.000000Z");
        assert_eq!(early_text.len(), late_text.len());
        assert!(early_text < late_text);
        assert_eq!(parse_timestamp(&late_text).unwrap(), late);
    }
}
