//! Index definitions, their on-disk layout, and source file discovery.

use crate::config::{Config, IndexConfig};
use crate::date_rule::DateRule;
use crate::error::{LogdexError, Result};
use crate::source::SourceSummary;
use chrono::NaiveDateTime;
use globset::{GlobBuilder, GlobMatcher};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File name of a group's date index inside its index directory
pub const DATE_INDEX_NAME: &str = "dates.json";

/// Where index artifacts live.
///
/// Every definition gets its own directory under the root, so several logical
/// indexes can cover the same physical files without sharing state:
///
/// ```text
/// <root>/<index>/dates.json               date index
/// <root>/<index>/<basename>.map           line offset index
/// <root>/<index>/<basename>.inflated      seek table of a compressed source
/// ```
#[derive(Debug, Clone)]
pub struct IndexLayout {
    root: PathBuf,
}

impl IndexLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn index_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn date_index_path(&self, name: &str) -> PathBuf {
        self.index_dir(name).join(DATE_INDEX_NAME)
    }

    pub fn offset_index_path(&self, name: &str, source: &Path) -> PathBuf {
        self.index_dir(name).join(format!("{}.map", file_key(source)))
    }

    pub fn seek_table_path(&self, name: &str, source: &Path) -> PathBuf {
        self.index_dir(name)
            .join(format!("{}.inflated", file_key(source)))
    }

    /// Create the directory of every configured index
    pub fn ensure_dirs<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for name in names {
            let dir = self.index_dir(name);
            std::fs::create_dir_all(&dir)
                .map_err(|e| LogdexError::io_at("Failed to create index directory", &dir, e))?;
        }
        Ok(())
    }
}

/// Key under which a source appears in the date index
pub fn file_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// A source file placed in chronological order. Only its first line and length
/// have been read.
#[derive(Debug, Clone)]
pub struct LogFile {
    pub path: PathBuf,
    pub key: String,
    /// Uncompressed length in bytes
    pub len: u64,
    pub first_timestamp: NaiveDateTime,
}

/// A named log group: where its files live and how to date their lines
#[derive(Debug, Clone)]
pub struct IndexDefinition {
    name: String,
    base_dir: PathBuf,
    matcher: GlobMatcher,
    depth: usize,
    rule: DateRule,
}

impl IndexDefinition {
    pub fn new(name: &str, config: &IndexConfig) -> Result<Self> {
        let matcher = GlobBuilder::new(&config.pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| LogdexError::config(format!("index '{name}': {e}")))?
            .compile_matcher();
        let depth = if config.pattern.contains("**") {
            usize::MAX
        } else {
            config.pattern.split('/').count()
        };
        let rule = DateRule::new(&config.datetime_regex, &config.datetime_format)?;

        Ok(Self {
            name: name.to_string(),
            base_dir: config.base_dir.clone(),
            matcher,
            depth,
            rule,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rule(&self) -> &DateRule {
        &self.rule
    }

    /// Where a file recorded under `key` lives when it sits directly in the base directory
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(key.trim_start_matches('/'))
    }

    /// Expand the glob, in path order. A missing base directory matches nothing.
    pub fn matching_files(&self) -> Result<Vec<PathBuf>> {
        if !self.base_dir.is_dir() {
            log::debug!(
                "{}: base directory {} does not exist",
                self.name,
                self.base_dir.display()
            );
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(&self.base_dir)
            .min_depth(1)
            .max_depth(self.depth)
            .follow_links(true);
        for entry in walker {
            let entry = entry.map_err(|e| {
                LogdexError::file_error(
                    format!("Failed to list {}", self.base_dir.display()),
                    e.into(),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.base_dir).unwrap_or(path);
            if self.matcher.is_match(relative) {
                files.push(path.to_path_buf());
            }
        }

        files.sort();
        let mut seen = HashSet::new();
        for path in &files {
            if !seen.insert(file_key(path)) {
                return Err(LogdexError::config(format!(
                    "index '{}': more than one file is named {}",
                    self.name,
                    file_key(path)
                )));
            }
        }
        Ok(files)
    }

    /// Matching files keyed the way the date index names them
    pub fn files_by_key(&self) -> Result<HashMap<String, PathBuf>> {
        Ok(self
            .matching_files()?
            .into_iter()
            .map(|path| (file_key(&path), path))
            .collect())
    }

    /// Order every matching file by its first timestamp.
    ///
    /// Rotated logs carry their age in their content, not their names; sorting on
    /// the first line puts the oldest rotation first and the active file last. A
    /// file whose first line cannot be dated (including an empty file) fails the
    /// whole resolution.
    pub async fn resolve_files(&self, layout: &IndexLayout) -> Result<Vec<LogFile>> {
        let mut resolved = Vec::new();
        for path in self.matching_files()? {
            let spill = layout.seek_table_path(&self.name, &path);
            let summary = SourceSummary::read(&path, &spill).await?;
            let first_line = summary.first_line.ok_or_else(|| {
                LogdexError::extraction(format!("{} is empty", path.display()))
            })?;
            let first_timestamp = self.rule.extract_datetime(&first_line).map_err(|e| {
                LogdexError::extraction(format!("{}: {e}", path.display()))
            })?;

            resolved.push(LogFile {
                key: file_key(&path),
                path,
                len: summary.len,
                first_timestamp,
            });
        }

        resolved.sort_by(|a, b| {
            a.first_timestamp
                .cmp(&b.first_timestamp)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(resolved)
    }
}

/// Every configured index definition plus the shared index layout
#[derive(Debug, Clone)]
pub struct Registry {
    definitions: BTreeMap<String, IndexDefinition>,
    layout: IndexLayout,
}

impl Registry {
    pub fn from_config(config: &Config) -> Result<Self> {
        let definitions = config
            .indexes
            .iter()
            .map(|(name, index)| IndexDefinition::new(name, index).map(|def| (name.clone(), def)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            definitions,
            layout: IndexLayout::new(&config.index_dir),
        })
    }

    pub fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    pub fn get(&self, name: &str) -> Result<&IndexDefinition> {
        self.definitions
            .get(name)
            .ok_or_else(|| LogdexError::unknown_index(name))
    }

    /// The named definition, or all of them when `name` is empty
    pub fn select(&self, name: Option<&str>) -> Result<Vec<&IndexDefinition>> {
        match name.filter(|n| !n.is_empty()) {
            Some(name) => Ok(vec![self.get(name)?]),
            None => Ok(self.definitions.values().collect()),
        }
    }
}
