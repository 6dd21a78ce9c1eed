//! Splitting a search into balanced units of scan work.
//!
//! Each worker should see about four chunks so uneven match costs even out, but no
//! chunk is shorter than the configured floor, which bounds per-task overhead.

use crate::config::Config;
use crate::date_index::{DateIndex, DateSpan};
use crate::error::Result;
use crate::offset_index::LineOffsetIndex;
use crate::registry::{IndexDefinition, IndexLayout};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Chunks per worker the planner aims for
const CHUNKS_PER_WORKER: u64 = 4;

/// A run of lines in one file for one worker to scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchChunk {
    pub path: PathBuf,
    pub start: u64,
    pub length: u64,
    /// Exclusive end of the file or date range this chunk was cut from
    pub end: u64,
}

impl SearchChunk {
    /// Lines this chunk covers, clamped to its range end
    pub fn lines(&self) -> Range<u64> {
        self.start..self.start.saturating_add(self.length).min(self.end)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    workers: u64,
    min_chunk_length: u64,
}

impl ChunkPlanner {
    pub fn new(workers: usize, min_chunk_length: u64) -> Self {
        Self {
            workers: workers.max(1) as u64,
            min_chunk_length: min_chunk_length.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.worker_count(), config.min_chunk_length)
    }

    /// Chunk length for a run of `lines` lines
    pub fn chunk_length(&self, lines: u64) -> u64 {
        let per_chunk = (lines as f64 / (self.workers * CHUNKS_PER_WORKER) as f64).round() as u64;
        per_chunk.max(self.min_chunk_length)
    }

    /// Chunks for one file: the whole of it, or only the lines of one date span
    pub fn plan(&self, path: &Path, total_lines: u64, span: Option<DateSpan>) -> Vec<SearchChunk> {
        let (from, end, length) = match span {
            None => (0, total_lines, self.chunk_length(total_lines)),
            Some(DateSpan::SingleLine(line)) => (line, line + 1, 1),
            Some(DateSpan::Range(first, last)) => {
                (first, last + 1, self.chunk_length(last + 1 - first))
            }
        };

        (from..end)
            .step_by(length as usize)
            .map(|start| SearchChunk {
                path: path.to_path_buf(),
                start,
                length,
                end,
            })
            .collect()
    }

    /// Chunks covering every line of every given file of a definition.
    ///
    /// Files without an offset index contribute nothing.
    pub fn plan_files(
        &self,
        def: &IndexDefinition,
        layout: &IndexLayout,
        files: &[PathBuf],
    ) -> Result<Vec<SearchChunk>> {
        let mut chunks = Vec::new();
        for path in files {
            let index_path = layout.offset_index_path(def.name(), path);
            let total = LineOffsetIndex::line_count_at(&index_path)?;
            chunks.extend(self.plan(path, total, None));
        }
        log::debug!(
            "{}: {} chunks over {} files",
            def.name(),
            chunks.len(),
            files.len()
        );
        Ok(chunks)
    }

    /// Chunks covering the lines dated `from..=to` according to `dates`.
    ///
    /// `paths` maps date index keys to the files currently matching the definition;
    /// keys it lacks are looked up directly under the base directory.
    pub fn plan_dates(
        &self,
        def: &IndexDefinition,
        dates: &DateIndex,
        paths: &HashMap<String, PathBuf>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Vec<SearchChunk> {
        let chunks: Vec<_> = dates
            .query(from, to)
            .into_iter()
            .flat_map(|(_, key, span)| {
                let path = paths.get(key).cloned().unwrap_or_else(|| def.path_for(key));
                self.plan(&path, 0, Some(span))
            })
            .collect();
        log::debug!(
            "{}: {} chunks for {from}..={to}",
            def.name(),
            chunks.len()
        );
        chunks
    }
}
