//! Per-group table of which lines of which files carry each calendar date.
//!
//! Lines inside one file are assumed chronologically non-decreasing, so every
//! (date, file) pair is one contiguous run and only its first and last line
//! numbers are kept. Files are keyed by base name; the directory comes from the
//! index definition.
//!
//! On disk the table is a JSON object `{"YYYY-MM-DD": {"file": [first, last]}}`
//! where a run of a single line is stored as `[line]`.

use crate::error::{LogdexError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Lines of one file bearing one date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSpan {
    SingleLine(u64),
    /// Inclusive first and last line
    Range(u64, u64),
}

impl DateSpan {
    pub fn first(&self) -> u64 {
        match *self {
            DateSpan::SingleLine(line) => line,
            DateSpan::Range(first, _) => first,
        }
    }

    pub fn last(&self) -> u64 {
        match *self {
            DateSpan::SingleLine(line) => line,
            DateSpan::Range(_, last) => last,
        }
    }

    /// Grow the span so it also covers `lineno`
    pub fn extend(self, lineno: u64) -> Self {
        DateSpan::Range(self.first().min(lineno), self.last().max(lineno))
    }

    /// Decode the stored array form
    pub fn from_lines(lines: &[u64]) -> Result<Self> {
        match *lines {
            [line] => Ok(DateSpan::SingleLine(line)),
            [first, last] if first <= last => Ok(DateSpan::Range(first, last)),
            _ => Err(LogdexError::invalid_date_index(format!(
                "invalid date index entry {lines:?}"
            ))),
        }
    }
}

impl Serialize for DateSpan {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match *self {
            DateSpan::SingleLine(line) => [line].serialize(serializer),
            DateSpan::Range(first, last) => [first, last].serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for DateSpan {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let lines = Vec::<u64>::deserialize(deserializer)?;
        DateSpan::from_lines(&lines).map_err(serde::de::Error::custom)
    }
}

/// Date to file to line-span table for one index definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DateIndex {
    dates: BTreeMap<NaiveDate, BTreeMap<String, DateSpan>>,
}

impl DateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the table stored at `path`; `None` when it was never written
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LogdexError::io_at("Failed to read date index", path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| LogdexError::invalid_date_index(format!("{}: {e}", path.display())))
    }

    /// Replace the table at `path` atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .map_err(|e| LogdexError::io_at("Failed to create index directory", dir, e))?;

        let mut temp = NamedTempFile::new_in(dir)
            .map_err(|e| LogdexError::file_error("Failed to create temp file", e))?;
        serde_json::to_writer(temp.as_file_mut(), self)
            .map_err(|e| LogdexError::file_error("Failed to encode date index", e.into()))?;
        temp.as_file_mut()
            .flush()
            .map_err(|e| LogdexError::file_error("Failed to flush date index", e))?;
        temp.persist(path)
            .map_err(|e| LogdexError::io_at("Failed to write date index", path, e.error))?;
        Ok(())
    }

    /// Note that line `lineno` of `file` carries `date`
    pub fn record(&mut self, date: NaiveDate, file: &str, lineno: u64) {
        let files = self.dates.entry(date).or_default();
        match files.get_mut(file) {
            Some(span) => *span = span.extend(lineno),
            None => {
                files.insert(file.to_string(), DateSpan::SingleLine(lineno));
            }
        }
    }

    /// Fold `other` into this table, widening spans both tables hold
    pub fn merge(&mut self, other: DateIndex) {
        for (date, files) in other.dates {
            let target = self.dates.entry(date).or_default();
            for (file, span) in files {
                let merged = match target.get(&file) {
                    Some(existing) => existing.extend(span.first()).extend(span.last()),
                    None => span,
                };
                target.insert(file, merged);
            }
        }
    }

    /// Drop every entry of `file`; returns whether anything was removed
    pub fn remove_file(&mut self, file: &str) -> bool {
        let mut removed = false;
        self.dates.retain(|_, files| {
            removed |= files.remove(file).is_some();
            !files.is_empty()
        });
        removed
    }

    /// Keep only files for which `keep` returns true; returns the dropped names
    pub fn retain_files(&mut self, mut keep: impl FnMut(&str) -> bool) -> Vec<String> {
        let mut dropped = Vec::new();
        for files in self.dates.values_mut() {
            files.retain(|name, _| {
                let retained = keep(name);
                if !retained && !dropped.contains(name) {
                    dropped.push(name.clone());
                }
                retained
            });
        }
        self.dates.retain(|_, files| !files.is_empty());
        dropped
    }

    /// Whether `file` has any entry
    pub fn contains_file(&self, file: &str) -> bool {
        self.dates.values().any(|files| files.contains_key(file))
    }

    pub fn get(&self, date: NaiveDate) -> Option<&BTreeMap<String, DateSpan>> {
        self.dates.get(&date)
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.dates.keys().next().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    /// Every (date, file, span) with `from <= date <= to`, in date then file order
    pub fn query(&self, from: NaiveDate, to: NaiveDate) -> Vec<(NaiveDate, &str, DateSpan)> {
        let (Some(first), Some(last)) = (self.first_date(), self.last_date()) else {
            return Vec::new();
        };
        days(from.max(first), to.min(last))
            .filter_map(|day| self.dates.get(&day).map(|files| (day, files)))
            .flat_map(|(day, files)| {
                files
                    .iter()
                    .map(move |(file, span)| (day, file.as_str(), *span))
            })
            .collect()
    }
}

/// Parse a `YYYY-MM-DD` date
pub fn parse_iso_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").map_err(|e| {
        LogdexError::invalid_argument(format!("'{text}' is not a YYYY-MM-DD date: {e}"))
    })
}

/// Every calendar day from `from` to `to`, both inclusive
pub fn days(from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    from.iter_days().take_while(move |day| *day <= to)
}
