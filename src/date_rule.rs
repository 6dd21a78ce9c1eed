//! Timestamp extraction from raw log lines.

use crate::error::{LogdexError, Result};
use bstr::ByteSlice;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::bytes::Regex;

/// How many bytes of an offending line are quoted in extraction errors
const QUOTE_LIMIT: usize = 120;

/// A pattern locating the timestamp in a line plus the strftime-style format it
/// is written in.
///
/// The pattern's first capture group is the timestamp text; without groups the
/// whole match is used. Formats carrying an offset (`%z`) are normalised to UTC,
/// formats without one are taken as UTC already.
#[derive(Debug, Clone)]
pub struct DateRule {
    regex: Regex,
    format: String,
}

impl DateRule {
    pub fn new(pattern: &str, format: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| LogdexError::pattern(format!("datetime_regex '{pattern}': {e}")))?;
        if format.is_empty() {
            return Err(LogdexError::pattern("datetime_format is empty"));
        }
        Ok(Self {
            regex,
            format: format.to_string(),
        })
    }

    /// Calendar date (UTC) of the timestamp in `line`
    pub fn extract(&self, line: &[u8]) -> Result<NaiveDate> {
        self.extract_datetime(line).map(|dt| dt.date())
    }

    /// Full timestamp (UTC) in `line`
    pub fn extract_datetime(&self, line: &[u8]) -> Result<NaiveDateTime> {
        let captures = self
            .regex
            .captures(line)
            .ok_or_else(|| LogdexError::extraction(format!("no timestamp in \"{}\"", quote(line))))?;
        let matched = captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_bytes())
            .unwrap_or_default();
        let text = std::str::from_utf8(matched).map_err(|_| {
            LogdexError::extraction(format!("timestamp is not UTF-8 in \"{}\"", quote(line)))
        })?;

        parse_utc(text, &self.format).ok_or_else(|| {
            LogdexError::extraction(format!(
                "\"{text}\" does not match format \"{}\"",
                self.format
            ))
        })
    }
}

fn parse_utc(text: &str, format: &str) -> Option<NaiveDateTime> {
    if let Ok(aware) = DateTime::parse_from_str(text, format) {
        return Some(aware.naive_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
        return Some(naive);
    }
    NaiveDate::parse_from_str(text, format)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn quote(line: &[u8]) -> String {
    let cut = line.len().min(QUOTE_LIMIT);
    line[..cut].to_str_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nginx() -> DateRule {
        DateRule::new(r"\[(.+?)\]", "%d/%b/%Y:%H:%M:%S %z").unwrap()
    }

    #[test]
    fn test_extract_nginx_date() {
        let line = br#"127.0.0.1 - - [20/Feb/2019:23:03:24 +0000] "GET / HTTP/1.1""#;
        assert_eq!(
            nginx().extract(line).unwrap(),
            NaiveDate::from_ymd_opt(2019, 2, 20).unwrap()
        );
    }

    #[test]
    fn test_offset_is_normalised_to_utc() {
        let line = b"[20/Feb/2019:23:03:24 -0200] late evening west of UTC";
        assert_eq!(
            nginx().extract(line).unwrap(),
            NaiveDate::from_ymd_opt(2019, 2, 21).unwrap()
        );
    }

    #[test]
    fn test_wrong_format_is_extraction_error() {
        let line = br#"127.0.0.1 - - [2019-02-20 23:03:24 +0000] "GET / HTTP/1.1""#;
        let err = nginx().extract(line).unwrap_err();
        assert!(matches!(err, LogdexError::ExtractionError { .. }));
    }

    #[test]
    fn test_empty_line_is_extraction_error() {
        let err = nginx().extract(b"").unwrap_err();
        assert!(matches!(err, LogdexError::ExtractionError { .. }));
    }

    #[test]
    fn test_naive_formats() {
        let rule = DateRule::new(r"^(\S+ \S+)", "%Y-%m-%d %H:%M:%S").unwrap();
        let dt = rule.extract_datetime(b"2024-09-02 10:11:12 INFO started").unwrap();
        assert_eq!(dt.to_string(), "2024-09-02 10:11:12");

        let rule = DateRule::new(r"^\d{4}-\d{2}-\d{2}", "%Y-%m-%d").unwrap();
        assert_eq!(
            rule.extract(b"2024-09-02 boot").unwrap(),
            NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
        );
    }

    #[test]
    fn test_bad_regex() {
        let err = DateRule::new(r"\[(.+?", "%Y").unwrap_err();
        assert!(matches!(err, LogdexError::PatternError { .. }));
    }
}
