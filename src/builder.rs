//! Building line offset indexes and the date index of one definition.
//!
//! A file is indexed in one coordinated pass. The source is cut into line-aligned
//! buffers; a bounded pool dates every line of each buffer in parallel (map), and
//! the results are consumed strictly in dispatch order (reduce) so line numbers can
//! be assigned sequentially while the offset index is written. Only after the whole
//! file succeeded is the index marked complete and its dates folded into the
//! definition's date index.

use crate::config::Config;
use crate::date_index::DateIndex;
use crate::date_rule::DateRule;
use crate::error::{Located, Result};
use crate::offset_index::LineOffsetIndex;
use crate::planner::ChunkPlanner;
use crate::registry::{file_key, IndexDefinition, IndexLayout, LogFile};
use crate::search::{ChunkHits, ResultOrder, ScanExecutor, ScanMode};
use crate::source::{BufferSpan, LogSource};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// What a reindex run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReindexReport {
    pub index: String,
    /// Files scanned this run with their line counts, in chronological order
    pub built: Vec<(String, u64)>,
    /// Files whose complete index was reused
    pub skipped: Vec<String>,
    /// Files dropped from the date index because they no longer match
    pub pruned: Vec<String>,
    pub date_index_written: bool,
}

impl ReindexReport {
    fn new(index: &str) -> Self {
        Self {
            index: index.to_string(),
            ..Self::default()
        }
    }
}

/// State of a file's offset index relative to the file itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// No offset index yet
    Missing,
    /// Started but never marked complete
    Partial,
    /// Complete, but the file's size no longer agrees with it, or the date index
    /// lost the file
    Changed,
    UpToDate,
}

/// Builds the indexes of one definition
#[derive(Debug, Clone)]
pub struct DateIndexBuilder<'a> {
    def: &'a IndexDefinition,
    layout: &'a IndexLayout,
    workers: usize,
    buffer_size: usize,
    min_chunk_length: u64,
}

impl<'a> DateIndexBuilder<'a> {
    pub fn new(def: &'a IndexDefinition, layout: &'a IndexLayout, config: &Config) -> Self {
        Self {
            def,
            layout,
            workers: config.worker_count(),
            buffer_size: config.buffer_size,
            min_chunk_length: config.min_chunk_length,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Bring every matching file's offset index and the date index up to date.
    ///
    /// Up-to-date files are skipped. The date index is saved after each rebuilt file
    /// and not touched at all when nothing changed.
    pub async fn reindex(&self) -> Result<ReindexReport> {
        let name = self.def.name();
        let mut report = ReindexReport::new(name);
        let files = self.def.resolve_files(self.layout).await?;
        let date_path = self.layout.date_index_path(name);
        let mut dates = DateIndex::load(&date_path)?.unwrap_or_default();

        let present: HashSet<&str> = files.iter().map(|file| file.key.as_str()).collect();
        report.pruned = dates.retain_files(|key| present.contains(key));
        if !report.pruned.is_empty() {
            log::info!("{name}: pruned {:?} from the date index", report.pruned);
            dates.save(&date_path)?;
            report.date_index_written = true;
        }

        for file in &files {
            let index_path = self.layout.offset_index_path(name, &file.path);
            let freshness = freshness(file, &index_path, &dates)?;
            if freshness == Freshness::UpToDate {
                log::debug!("{name}: {} is up to date", file.key);
                report.skipped.push(file.key.clone());
                continue;
            }

            log::info!("{name}: indexing {} ({freshness:?})", file.key);
            let (lines, file_dates) = self.add_file(file, &index_path).await?;
            dates.remove_file(&file.key);
            dates.merge(file_dates);
            dates.save(&date_path)?;
            report.date_index_written = true;
            report.built.push((file.key.clone(), lines));
            log::info!("{name}: {} indexed, {lines} lines", file.key);
        }

        Ok(report)
    }

    /// One coordinated pass over `file`: rebuild its offset index from line 0 and
    /// return its line count together with the dates of its lines.
    ///
    /// This is the only place a source is opened in full during a reindex. The
    /// offset index is marked complete only once every line was dated.
    pub async fn add_file(&self, file: &LogFile, index_path: &Path) -> Result<(u64, DateIndex)> {
        let spill = self.layout.seek_table_path(self.def.name(), &file.path);
        let source = Arc::new(LogSource::open(&file.path, &spill).await?);
        let mut index = LineOffsetIndex::open(index_path)?;
        index.reset()?;

        let rule = Arc::new(self.def.rule().clone());
        let spans: Vec<BufferSpan> = source.buffers(self.buffer_size).collect();
        log::debug!("{}: {} buffers", file.key, spans.len());

        // `buffered` yields in dispatch order however the workers finish
        let mut batches = stream::iter(spans)
            .map(|span| {
                let source = Arc::clone(&source);
                let rule = Arc::clone(&rule);
                async move {
                    let handle =
                        tokio::task::spawn_blocking(move || date_lines(&source, span, &rule));
                    match handle.await {
                        Ok(result) => result,
                        Err(join) => Err(join.into()),
                    }
                }
            })
            .buffered(self.workers);

        let mut dates = DateIndex::new();
        let mut lineno = 0u64;
        while let Some(batch) = batches.next().await {
            let batch = batch.map_err(|e| e.at(Located::file(&file.path)))?;
            for (date, end) in batch {
                index.write(lineno, end)?;
                dates.record(date, &file.key, lineno);
                lineno += 1;
            }
        }

        index.mark_complete()?;
        Ok((lineno, dates))
    }

    /// Recompute the date index from complete offset indexes alone.
    ///
    /// Every indexed line is scanned in parallel in extract mode; chunk results are
    /// folded in as they complete since recording only widens spans. Files without
    /// a complete offset index are left out and reported as skipped.
    pub async fn rebuild_dates(&self) -> Result<ReindexReport> {
        let name = self.def.name();
        let mut report = ReindexReport::new(name);

        let mut indexed = Vec::new();
        for path in self.def.matching_files()? {
            let index_path = self.layout.offset_index_path(name, &path);
            if is_complete(&index_path)? {
                indexed.push(path);
            } else {
                log::warn!("{name}: {} has no complete offset index", path.display());
                report.skipped.push(file_key(&path));
            }
        }

        let planner = ChunkPlanner::new(self.workers, self.min_chunk_length);
        let chunks = planner.plan_files(self.def, self.layout, &indexed)?;
        let executor = ScanExecutor::new(self.workers, self.layout.clone(), name);
        let mut outputs = executor
            .scan(
                chunks,
                ScanMode::Extract(self.def.rule().clone()),
                ResultOrder::Completion,
            )
            .await?;

        let mut dates = DateIndex::new();
        while let Some(output) = outputs.try_next().await? {
            let key = file_key(&output.path);
            if let ChunkHits::Dates(pairs) = output.hits {
                for (lineno, date) in pairs {
                    dates.record(date, &key, lineno);
                }
            }
        }

        let date_path = self.layout.date_index_path(name);
        if !dates.is_empty() || date_path.exists() {
            dates.save(&date_path)?;
            report.date_index_written = true;
        }
        for path in &indexed {
            let index_path = self.layout.offset_index_path(name, path);
            report
                .built
                .push((file_key(path), LineOffsetIndex::line_count_at(&index_path)?));
        }
        Ok(report)
    }
}

/// Map phase: date every line of one buffer, keeping its absolute end offset
fn date_lines(source: &LogSource, span: BufferSpan, rule: &DateRule) -> Result<Vec<(NaiveDate, u64)>> {
    source
        .lines_in(span)
        .map(|line| rule.extract(line.content).map(|date| (date, line.end)))
        .collect()
}

fn is_complete(index_path: &Path) -> Result<bool> {
    if !index_path.exists() {
        return Ok(false);
    }
    LineOffsetIndex::open_existing(index_path)?.is_complete()
}

/// A complete index is reused only while the file length still matches its last
/// record, either exactly or one short for an unterminated final line. Anything
/// else (growth, truncation, rewrite) rebuilds the file from line 0.
fn freshness(file: &LogFile, index_path: &Path, dates: &DateIndex) -> Result<Freshness> {
    if !index_path.exists() {
        return Ok(Freshness::Missing);
    }
    let index = LineOffsetIndex::open_existing(index_path)?;
    if !index.is_complete()? {
        return Ok(Freshness::Partial);
    }

    let len = file.len;
    let consistent = matches!(index.last_offset()?, Some(last) if last == len || last == len + 1);
    if !consistent || !dates.contains_file(&file.key) {
        return Ok(Freshness::Changed);
    }
    Ok(Freshness::UpToDate)
}
