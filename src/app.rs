//! Application core: the reindex and search operations behind the CLI.
//!
//! [`Application`] owns the loaded configuration and the registry built from it and
//! hands both explicitly to the builder, planner and executor.

use crate::builder::{DateIndexBuilder, ReindexReport};
use crate::config::Config;
use crate::date_index::{parse_iso_date, DateIndex};
use crate::error::{LogdexError, Result};
use crate::planner::{ChunkPlanner, SearchChunk};
use crate::registry::{IndexDefinition, IndexLayout, Registry};
use crate::search::{ChunkOutput, LineMatcher, ResultOrder, ScanExecutor, ScanMode};
use chrono::NaiveDate;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::PathBuf;

/// A validated search: what to look for, where, and over which dates
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub index: String,
    pub matcher: LineMatcher,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub order: ResultOrder,
}

impl SearchRequest {
    /// A regex wins over a substring when both are given. Having neither (an empty
    /// substring counts as none) is a usage error.
    pub fn new(index: &str, substring: Option<&str>, regex: Option<&str>) -> Result<Self> {
        let matcher = match (substring.filter(|s| !s.is_empty()), regex) {
            (_, Some(pattern)) => LineMatcher::regex(pattern)?,
            (Some(needle), None) => LineMatcher::substring(needle),
            (None, None) => {
                return Err(LogdexError::invalid_argument(
                    "please provide a substring or a --regex (-e) pattern",
                ))
            }
        };
        if index.is_empty() {
            return Err(LogdexError::invalid_argument("an index name is required"));
        }

        Ok(Self {
            index: index.to_string(),
            matcher,
            date_from: None,
            date_to: None,
            order: ResultOrder::Completion,
        })
    }

    /// Restrict to `from..=to` (`YYYY-MM-DD`); a missing bound is open-ended
    pub fn between(mut self, from: Option<&str>, to: Option<&str>) -> Result<Self> {
        self.date_from = from.map(parse_iso_date).transpose()?;
        self.date_to = to.map(parse_iso_date).transpose()?;
        Ok(self)
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.order = if ordered {
            ResultOrder::Plan
        } else {
            ResultOrder::Completion
        };
        self
    }

    fn is_date_bounded(&self) -> bool {
        self.date_from.is_some() || self.date_to.is_some()
    }
}

pub struct Application {
    config: Config,
    registry: Registry,
}

impl Application {
    pub fn new(config: Config) -> Result<Self> {
        let registry = Registry::from_config(&config)?;
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Reindex one definition, or all of them when `name` is `None` or empty
    pub async fn reindex(&self, name: Option<&str>) -> Result<Vec<ReindexReport>> {
        let mut reports = Vec::new();
        for def in self.selected(name)? {
            let builder = DateIndexBuilder::new(def, self.registry.layout(), &self.config);
            reports.push(builder.reindex().await?);
        }
        Ok(reports)
    }

    /// Recompute date indexes from the existing offset indexes
    pub async fn rebuild_dates(&self, name: Option<&str>) -> Result<Vec<ReindexReport>> {
        let mut reports = Vec::new();
        for def in self.selected(name)? {
            let builder = DateIndexBuilder::new(def, self.registry.layout(), &self.config);
            reports.push(builder.rebuild_dates().await?);
        }
        Ok(reports)
    }

    /// Chunks a request would scan.
    ///
    /// Without dates every line of every matching file is planned. With dates the
    /// definition's date index must exist; a missing bound becomes the earliest or
    /// latest date it holds.
    pub async fn plan(&self, request: &SearchRequest) -> Result<Vec<SearchChunk>> {
        let def = self.registry.get(&request.index)?;
        let layout = self.registry.layout();
        let planner = ChunkPlanner::from_config(&self.config);

        let chunks = if request.is_date_bounded() {
            let dates = DateIndex::load(&layout.date_index_path(def.name()))?.ok_or_else(|| {
                LogdexError::DateIndexMissing {
                    name: def.name().to_string(),
                }
            })?;
            match (dates.first_date(), dates.last_date()) {
                (Some(first), Some(last)) => {
                    let from = request.date_from.unwrap_or(first);
                    let to = request.date_to.unwrap_or(last);
                    planner.plan_dates(def, &dates, &def.files_by_key()?, from, to)
                }
                _ => Vec::new(),
            }
        } else {
            planner.plan_files(def, layout, &def.matching_files()?)?
        };

        if request.order == ResultOrder::Plan {
            return chronological(def, self.registry.layout(), chunks).await;
        }
        Ok(chunks)
    }

    /// Run a search; the stream yields the matches of one chunk at a time and ends
    /// early with the first error.
    pub async fn search(
        &self,
        request: SearchRequest,
    ) -> Result<BoxStream<'static, Result<ChunkOutput>>> {
        let chunks = self.plan(&request).await?;
        log::debug!("{}: searching {} chunks", request.index, chunks.len());

        let executor = ScanExecutor::new(
            self.config.worker_count(),
            self.registry.layout().clone(),
            request.index.as_str(),
        );
        executor
            .scan(chunks, ScanMode::Match(request.matcher), request.order)
            .await
    }

    fn selected(&self, name: Option<&str>) -> Result<Vec<&IndexDefinition>> {
        let defs = self.registry.select(name)?;
        self.registry
            .layout()
            .ensure_dirs(defs.iter().map(|def| def.name()))?;
        Ok(defs)
    }
}

/// Sort chunks oldest file first, then by line, using the files' first timestamps
async fn chronological(
    def: &IndexDefinition,
    layout: &IndexLayout,
    mut chunks: Vec<SearchChunk>,
) -> Result<Vec<SearchChunk>> {
    let rank: HashMap<PathBuf, usize> = def
        .resolve_files(layout)
        .await?
        .into_iter()
        .enumerate()
        .map(|(rank, file)| (file.path, rank))
        .collect();
    chunks.sort_by_key(|chunk| (rank.get(&chunk.path).copied().unwrap_or(usize::MAX), chunk.start));
    Ok(chunks)
}
