use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};

/// Parse a CLI day in `DD-MM-YYYY` or `DD/MM/YYYY` form.
pub fn parse_day(value: &str) -> Result<NaiveDate> {
    let separator = if value.contains('/') { '/' } else { '-' };
    let format = format!("%d{separator}%m{separator}%Y");
    NaiveDate::parse_from_str(value.trim(), &format)
        .with_context(|| format!("invalid date: {value} (expected DD-MM-YYYY)"))
}

/// Parse a search API timestamp (`2024-05-01T10:00:00.000`, fraction optional).
pub fn parse_api_datetime(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%dT%H:%M:%S%.f")
        .with_context(|| format!("invalid API timestamp: {value}"))
}

/// ISO range lower bound: midnight at the start of the day.
pub fn range_start_iso(day: NaiveDate) -> String {
    day.and_hms_opt(0, 0, 0)
        .unwrap_or_else(|| day.and_time(NaiveTime::MIN))
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}

/// ISO range upper bound: the last representable millisecond of the day.
pub fn range_end_iso(day: NaiveDate) -> String {
    let end = day.and_time(
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN),
    );
    end.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// Filename date suffix body, `DD-MM-YYYY`.
pub fn day_suffix(moment: NaiveDateTime) -> String {
    moment.format("%d-%m-%Y").to_string()
}

/// Publication date for the description template, `YYYY-MM-DD`.
pub fn publication_day(moment: NaiveDateTime) -> String {
    moment.format("%Y-%m-%d").to_string()
}

/// Category fragment: month name plus year for recent uploads, plain year for
/// the pre-2022 backlog categories.
pub fn category_fragment(moment: NaiveDateTime) -> String {
    if moment.year() > 2021 {
        moment.format("%B %Y").to_string()
    } else {
        moment.year().to_string()
    }
}
