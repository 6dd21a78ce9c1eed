//! Parallel scan over planned chunks.
//!
//! Every chunk runs on the blocking pool: resolve its first line through the
//! offset index, seek there, walk lines up to the chunk end, and either collect
//! matching lines or date every line. At most `workers` chunks are in flight.
//! Results come back in completion order, or in plan order when requested; the
//! first failing chunk ends the stream with its error.

use crate::date_rule::DateRule;
use crate::error::{Located, LogdexError, Result};
use crate::offset_index::LineOffsetIndex;
use crate::planner::SearchChunk;
use crate::registry::IndexLayout;
use crate::search::LineMatcher;
use crate::source::LogSource;
use bstr::ByteSlice;
use chrono::NaiveDate;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a scan does with each line it reads
#[derive(Debug, Clone)]
pub enum ScanMode {
    /// Keep lines the matcher accepts
    Match(LineMatcher),
    /// Date every line
    Extract(DateRule),
}

/// Order in which chunk results reach the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultOrder {
    /// As workers finish; interleaves files
    #[default]
    Completion,
    /// In the order chunks were planned
    Plan,
}

/// One matching line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub lineno: u64,
    /// Line bytes with surrounding whitespace and terminator stripped
    pub line: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkHits {
    Matches(Vec<MatchResult>),
    Dates(Vec<(u64, NaiveDate)>),
}

impl ChunkHits {
    pub fn len(&self) -> usize {
        match self {
            ChunkHits::Matches(matches) => matches.len(),
            ChunkHits::Dates(dates) => dates.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of scanning one chunk
#[derive(Debug, Clone)]
pub struct ChunkOutput {
    pub path: PathBuf,
    pub start: u64,
    pub hits: ChunkHits,
}

/// Runs chunks of one index definition on a bounded worker pool
#[derive(Debug, Clone)]
pub struct ScanExecutor {
    workers: usize,
    layout: IndexLayout,
    index_name: String,
}

impl ScanExecutor {
    pub fn new(workers: usize, layout: IndexLayout, index_name: impl Into<String>) -> Self {
        Self {
            workers: workers.max(1),
            layout,
            index_name: index_name.into(),
        }
    }

    /// Start scanning `chunks`; the returned stream yields one output per chunk.
    ///
    /// Each distinct source is opened once up front (building its seek table if it
    /// is compressed) and shared read-only by the chunks that cover it.
    pub async fn scan(
        &self,
        chunks: Vec<SearchChunk>,
        mode: ScanMode,
        order: ResultOrder,
    ) -> Result<BoxStream<'static, Result<ChunkOutput>>> {
        let mut sources: HashMap<PathBuf, Arc<LogSource>> = HashMap::new();
        for chunk in &chunks {
            if !sources.contains_key(&chunk.path) {
                let spill = self.layout.seek_table_path(&self.index_name, &chunk.path);
                let source = LogSource::open(&chunk.path, &spill).await?;
                sources.insert(chunk.path.clone(), Arc::new(source));
            }
        }

        let mode = Arc::new(mode);
        let layout = self.layout.clone();
        let index_name = self.index_name.clone();

        let tasks = stream::iter(chunks).map(move |chunk| {
            let source = sources.get(&chunk.path).cloned();
            let index_path = layout.offset_index_path(&index_name, &chunk.path);
            let mode = Arc::clone(&mode);
            async move {
                let source = source.ok_or_else(|| {
                    LogdexError::consistency(format!("{} was not opened", chunk.path.display()))
                })?;
                let handle = tokio::task::spawn_blocking(move || {
                    scan_chunk(&chunk, &index_path, &source, &mode)
                });
                match handle.await {
                    Ok(result) => result,
                    Err(join) => Err(LogdexError::from(join)),
                }
            }
        });

        Ok(match order {
            ResultOrder::Completion => tasks.buffer_unordered(self.workers).boxed(),
            ResultOrder::Plan => tasks.buffered(self.workers).boxed(),
        })
    }
}

/// Scan one chunk synchronously
pub fn scan_chunk(
    chunk: &SearchChunk,
    index_path: &Path,
    source: &LogSource,
    mode: &ScanMode,
) -> Result<ChunkOutput> {
    let index = LineOffsetIndex::open_existing(index_path)?;
    let here = || Located::line(&chunk.path, chunk.start);
    let first = index
        .read(chunk.start)?
        .ok_or_else(|| LogdexError::consistency("line is past the end of its offset index").at(here()))?;
    if first.offset + first.length > source.len() {
        return Err(
            LogdexError::consistency("line lies beyond the end of the file, reindex it").at(here()),
        );
    }

    let wanted = chunk.lines();
    let numbered = wanted.clone().zip(source.lines_from(first.offset));
    let mut scanned = 0u64;
    let hits = match mode {
        ScanMode::Match(matcher) => {
            let mut matches = Vec::new();
            for (lineno, line) in numbered {
                scanned += 1;
                if matcher.is_match(line.content) {
                    matches.push(MatchResult {
                        lineno,
                        line: line.content.trim().to_vec(),
                    });
                }
            }
            ChunkHits::Matches(matches)
        }
        ScanMode::Extract(rule) => {
            let mut dates = Vec::with_capacity((wanted.end - wanted.start) as usize);
            for (lineno, line) in numbered {
                scanned += 1;
                let date = rule
                    .extract(line.content)
                    .map_err(|e| e.at(Located::line(&chunk.path, lineno)))?;
                dates.push((lineno, date));
            }
            ChunkHits::Dates(dates)
        }
    };

    // The file ran out before the offset index did
    if scanned < wanted.end - wanted.start {
        return Err(LogdexError::consistency(format!(
            "file ends before line {} of its offset index, reindex it",
            wanted.end - 1
        ))
        .at(Located::line(&chunk.path, wanted.start + scanned)));
    }

    Ok(ChunkOutput {
        path: chunk.path.clone(),
        start: chunk.start,
        hits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    const LOG: &str = "\
[2019-02-20] GET /a HTTP/1.1
[2019-02-20] GET /b HTTP/2
  [2019-02-21] POST /c HTTP/1.1
[2019-02-21] GET /d HTTP/1.1
";

    /// Write LOG and its offset index the way the builder lays them out
    fn fixture() -> (TempDir, IndexLayout, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, LOG).unwrap();

        let layout = IndexLayout::new(dir.path().join("idx"));
        let mut index = LineOffsetIndex::open(&layout.offset_index_path("app", &path)).unwrap();
        let source = LogSource::from_bytes(&path, LOG.as_bytes().to_vec());
        for (lineno, line) in source.lines_from(0).enumerate() {
            index.write(lineno as u64, line.end).unwrap();
        }
        index.mark_complete().unwrap();
        (dir, layout, path)
    }

    fn chunk(path: &Path, start: u64, length: u64, end: u64) -> SearchChunk {
        SearchChunk {
            path: path.to_path_buf(),
            start,
            length,
            end,
        }
    }

    #[test]
    fn test_scan_chunk_matches_and_trims() {
        let (_dir, layout, path) = fixture();
        let source = LogSource::from_bytes(&path, LOG.as_bytes().to_vec());
        let mode = ScanMode::Match(LineMatcher::substring("HTTP/1.1"));

        let out = scan_chunk(
            &chunk(&path, 1, 3, 4),
            &layout.offset_index_path("app", &path),
            &source,
            &mode,
        )
        .unwrap();
        assert_eq!(
            out.hits,
            ChunkHits::Matches(vec![
                MatchResult {
                    lineno: 2,
                    line: b"[2019-02-21] POST /c HTTP/1.1".to_vec()
                },
                MatchResult {
                    lineno: 3,
                    line: b"[2019-02-21] GET /d HTTP/1.1".to_vec()
                },
            ])
        );
    }

    #[test]
    fn test_scan_chunk_respects_range_end() {
        let (_dir, layout, path) = fixture();
        let source = LogSource::from_bytes(&path, LOG.as_bytes().to_vec());
        let mode = ScanMode::Match(LineMatcher::substring("GET"));

        let out = scan_chunk(
            &chunk(&path, 0, 10, 2),
            &layout.offset_index_path("app", &path),
            &source,
            &mode,
        )
        .unwrap();
        assert_eq!(out.hits.len(), 2);
    }

    #[test]
    fn test_scan_chunk_extracts_dates() {
        let (_dir, layout, path) = fixture();
        let source = LogSource::from_bytes(&path, LOG.as_bytes().to_vec());
        let mode = ScanMode::Extract(DateRule::new(r"\[(\d{4}-\d{2}-\d{2})\]", "%Y-%m-%d").unwrap());

        let out = scan_chunk(
            &chunk(&path, 0, 4, 4),
            &layout.offset_index_path("app", &path),
            &source,
            &mode,
        )
        .unwrap();
        let day = |d| NaiveDate::from_ymd_opt(2019, 2, d).unwrap();
        assert_eq!(
            out.hits,
            ChunkHits::Dates(vec![(0, day(20)), (1, day(20)), (2, day(21)), (3, day(21))])
        );
    }

    #[test]
    fn test_scan_chunk_past_index_is_consistency_error() {
        let (_dir, layout, path) = fixture();
        let source = LogSource::from_bytes(&path, LOG.as_bytes().to_vec());
        let mode = ScanMode::Match(LineMatcher::substring("GET"));

        let err = scan_chunk(
            &chunk(&path, 4, 1, 5),
            &layout.offset_index_path("app", &path),
            &source,
            &mode,
        )
        .unwrap_err();
        assert!(matches!(err, LogdexError::IndexConsistency { .. }));
    }

    #[test]
    fn test_scan_chunk_short_source_is_consistency_error() {
        let (_dir, layout, path) = fixture();
        let cut = LOG.rfind("[2019-02-21] GET /d").unwrap();
        let source = LogSource::from_bytes(&path, LOG.as_bytes()[..cut].to_vec());

        for mode in [
            ScanMode::Match(LineMatcher::substring("HTTP")),
            ScanMode::Extract(DateRule::new(r"\[(\d{4}-\d{2}-\d{2})\]", "%Y-%m-%d").unwrap()),
        ] {
            let err = scan_chunk(
                &chunk(&path, 0, 4, 4),
                &layout.offset_index_path("app", &path),
                &source,
                &mode,
            )
            .unwrap_err();
            assert!(matches!(err, LogdexError::IndexConsistency { .. }));
            assert!(err.to_string().contains("app.log:3"), "{err}");
        }
    }

    #[tokio::test]
    async fn test_scan_stream_in_plan_order() {
        let (_dir, layout, path) = fixture();
        let executor = ScanExecutor::new(3, layout, "app");
        let chunks = (0..4).map(|start| chunk(&path, start, 1, 4)).collect();

        let outputs: Vec<ChunkOutput> = executor
            .scan(chunks, ScanMode::Match(LineMatcher::substring("HTTP")), ResultOrder::Plan)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let starts: Vec<_> = outputs.iter().map(|o| o.start).collect();
        assert_eq!(starts, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_scan_stream_surfaces_errors() {
        let (dir, layout, _path) = fixture();
        let unindexed = dir.path().join("other.log");
        std::fs::write(&unindexed, "x\n").unwrap();
        let executor = ScanExecutor::new(2, layout, "app");

        let result: Result<Vec<ChunkOutput>> = executor
            .scan(
                vec![chunk(&unindexed, 0, 1, 1)],
                ScanMode::Match(LineMatcher::substring("x")),
                ResultOrder::Completion,
            )
            .await
            .unwrap()
            .try_collect()
            .await;
        assert!(matches!(
            result.unwrap_err(),
            LogdexError::IndexConsistency { .. }
        ));
    }
}
