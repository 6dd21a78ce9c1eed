//! Error types and handling infrastructure for logdex.
//!
//! This module provides a centralized error handling system using `thiserror` for
//! library error types; the binary wraps them with `anyhow` at the top level.
//!
//! ## Error classes
//!
//! - **Usage**: the caller asked for something that cannot be done (no search predicate)
//! - **Extraction**: a line's timestamp could not be extracted; aborts that file's build
//! - **Consistency**: an on-disk index disagrees with the file or the plan built from it
//! - **I/O**: everything coming from the filesystem or a decoder

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for logdex operations.
#[derive(Error, Debug)]
pub enum LogdexError {
    /// File system related errors (file not found, permission denied, etc.)
    #[error("File operation failed: {message}")]
    FileError {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Compression format detection or decompression errors
    #[error("Compression error: {message}")]
    CompressionError { message: String },

    /// A line's timestamp does not match the configured pattern or format
    #[error("Cannot extract timestamp: {message}")]
    ExtractionError { message: String },

    /// The line offset index does not agree with the file or the search plan
    #[error("Index is inconsistent: {message}")]
    IndexConsistency { message: String },

    /// The date index holds an entry of unexpected shape or cannot be parsed
    #[error("Invalid date index: {message}")]
    InvalidDateIndex { message: String },

    /// A date-bounded search was requested for a group that was never indexed
    #[error("No date index for '{name}', run reindex first")]
    DateIndexMissing { name: String },

    /// No index definition with this name is configured
    #[error("Unknown index: {name}")]
    UnknownIndex { name: String },

    /// Search or timestamp pattern failed to compile
    #[error("Invalid pattern: {message}")]
    PatternError { message: String },

    /// Configuration related errors
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Invalid command line arguments or search request
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A worker task panicked or was cancelled
    #[error("Worker failed: {message}")]
    WorkerError { message: String },
}

/// Standard Result type for logdex operations.
pub type Result<T> = std::result::Result<T, LogdexError>;

impl LogdexError {
    /// Create a FileError from an io::Error with additional context
    pub fn file_error(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::FileError {
            message: message.into(),
            source,
        }
    }

    /// Create a CompressionError with a descriptive message
    pub fn compression(message: impl Into<String>) -> Self {
        Self::CompressionError {
            message: message.into(),
        }
    }

    /// Create an ExtractionError with a descriptive message
    pub fn extraction(message: impl Into<String>) -> Self {
        Self::ExtractionError {
            message: message.into(),
        }
    }

    /// Create an IndexConsistency error with a descriptive message
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::IndexConsistency {
            message: message.into(),
        }
    }

    /// Create an InvalidDateIndex error with a descriptive message
    pub fn invalid_date_index(message: impl Into<String>) -> Self {
        Self::InvalidDateIndex {
            message: message.into(),
        }
    }

    pub fn unknown_index(name: impl Into<String>) -> Self {
        Self::UnknownIndex { name: name.into() }
    }

    pub fn pattern(message: impl Into<String>) -> Self {
        Self::PatternError {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Self::WorkerError {
            message: message.into(),
        }
    }

    /// Attach a path to an io::Error
    pub fn io_at(action: &str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::file_error(format!("{action} {}", path.display()), source)
    }

    /// Prefix extraction and consistency messages with the place they refer to
    pub fn at(self, location: Located) -> Self {
        match self {
            Self::ExtractionError { message } => Self::ExtractionError {
                message: format!("{location}: {message}"),
            },
            Self::IndexConsistency { message } => Self::IndexConsistency {
                message: format!("{location}: {message}"),
            },
            other => other,
        }
    }

    /// True for errors the caller caused and can fix by changing the request
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }
}

// Automatic conversion from io::Error to LogdexError
impl From<std::io::Error> for LogdexError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::FileError {
                message: "File not found".to_string(),
                source: err,
            },
            std::io::ErrorKind::PermissionDenied => Self::FileError {
                message: "Permission denied".to_string(),
                source: err,
            },
            _ => Self::FileError {
                message: "IO operation failed".to_string(),
                source: err,
            },
        }
    }
}

impl From<tokio::task::JoinError> for LogdexError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            Self::worker(format!("worker panicked: {err}"))
        } else {
            Self::worker(format!("worker cancelled: {err}"))
        }
    }
}

/// Where in a source an error happened
#[derive(Debug, Clone)]
pub struct Located {
    pub path: PathBuf,
    pub line: Option<u64>,
}

impl Located {
    pub fn file(path: &std::path::Path) -> Self {
        Self {
            path: path.to_path_buf(),
            line: None,
        }
    }

    pub fn line(path: &std::path::Path, line: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            line: Some(line),
        }
    }
}

impl std::fmt::Display for Located {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.path.display(), line),
            None => write!(f, "{}", self.path.display()),
        }
    }
}
