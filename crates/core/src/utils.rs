use chrono::{DateTime, Months, NaiveDate};

use crate::errors::CoreError;

/// Round a currency amount to 2 decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parse a decimal number from a store field, rejecting NaN and infinities.
pub fn parse_amount(field: &str, raw: &str) -> Result<f64, CoreError> {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(CoreError::parse(field, raw)),
    }
}

/// Parse a calendar date. Accepts `2024-01-31`, `2024/01/31` and RFC 3339
/// timestamps such as `2024-01-31T00:00:00Z` (time of day is dropped).
pub fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, CoreError> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y/%m/%d"))
        .or_else(|_| DateTime::parse_from_rfc3339(trimmed).map(|dt| dt.date_naive()))
        .map_err(|_| CoreError::parse(field, raw))
}

/// `start` plus `months` calendar months, day clamped to the target month's end.
pub fn add_months(start: NaiveDate, months: u32) -> Option<NaiveDate> {
    start.checked_add_months(Months::new(months))
}

/// Every calendar day from `from` through `to`, inclusive. Empty if `from > to`.
pub fn days_inclusive(from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    from.iter_days().take_while(move |d| *d <= to)
}
