//! # logdex - Date-Indexed Search over Rotated Logs
//!
//! Indexes large, periodically rotated log files (plain or compressed) so that
//! date-bounded substring and regex searches only read the lines of the requested
//! days instead of whole files.
//!
//! ## Architecture
//!
//! - [`offset_index`] - Per-file binary map from line number to byte offset
//! - [`source`] - Random access to plain and compressed sources
//! - [`registry`] - Index definitions, glob expansion and on-disk layout
//! - [`date_index`] - Per-group table of which lines carry each date
//! - [`builder`] - Parallel map, ordered reduce pass building both indexes
//! - [`planner`] - Splitting a search into balanced chunks
//! - [`search`] - Parallel scan executor in match or extract mode
//! - [`app`] - The reindex and search operations

pub mod config;
pub mod error;

pub mod date_index;
pub mod date_rule;
pub mod offset_index;
pub mod registry;
pub mod source;

pub mod app;
pub mod builder;
pub mod planner;
pub mod search;

pub use error::{LogdexError, Result};

pub use app::{Application, SearchRequest};
pub use builder::{DateIndexBuilder, ReindexReport};
pub use config::{Config, IndexConfig};
pub use date_index::{DateIndex, DateSpan};
pub use offset_index::LineOffsetIndex;
pub use planner::{ChunkPlanner, SearchChunk};
pub use search::{ChunkHits, ChunkOutput, LineMatcher, MatchResult, ResultOrder, ScanExecutor, ScanMode};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
