use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use thiserror::Error;

static DATE_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{2})$").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateParseError {
    #[error("no '@' separator in tile label {0:?}")]
    MissingSeparator(String),
    #[error("no MM/DD/YY token in tile label {0:?}")]
    MalformedDate(String),
    #[error("tile label {0:?} names a day that does not exist")]
    InvalidDate(String),
}

/// Parse a tile label like `"Tue 11/25/25 @ 1:00 PM"` into a calendar date.
/// Two-digit years always land in the 2000s.
pub fn parse_tile_date(label: &str) -> Result<NaiveDate, DateParseError> {
    let (head, _) = label
        .split_once('@')
        .ok_or_else(|| DateParseError::MissingSeparator(label.to_string()))?;

    let token = head
        .split_whitespace()
        .last()
        .ok_or_else(|| DateParseError::MalformedDate(label.to_string()))?;
    let caps = DATE_TOKEN_RE
        .captures(token)
        .ok_or_else(|| DateParseError::MalformedDate(label.to_string()))?;

    let month: u32 = caps[1].parse().map_err(|_| DateParseError::MalformedDate(label.to_string()))?;
    let day: u32 = caps[2].parse().map_err(|_| DateParseError::MalformedDate(label.to_string()))?;
    let yy: i32 = caps[3].parse().map_err(|_| DateParseError::MalformedDate(label.to_string()))?;

    NaiveDate::from_ymd_opt(2000 + yy, month, day)
        .ok_or_else(|| DateParseError::InvalidDate(label.to_string()))
}
