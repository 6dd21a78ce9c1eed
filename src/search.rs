pub mod executor;
pub mod matcher;

pub use executor::{
    scan_chunk, ChunkHits, ChunkOutput, MatchResult, ResultOrder, ScanExecutor, ScanMode,
};
pub use matcher::LineMatcher;
