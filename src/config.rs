//! Configuration loading.
//!
//! A single TOML file names every log group ("index") and the tuning knobs shared
//! by the builder, planner and executor. The loaded [`Config`] is passed explicitly
//! to every component; nothing reads it from global state.

use crate::error::{LogdexError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File looked up in the working directory when no `--config` is given
pub const LOCAL_CONFIG_NAME: &str = "logdex.toml";

/// Environment variable overriding the worker count
pub const WORKERS_ENV: &str = "LOGDEX_WORKERS";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Directory holding offset indexes, date indexes and seek tables
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,

    /// Worker pool size; `None` means one per available CPU
    #[serde(default)]
    pub workers: Option<usize>,

    /// Smallest chunk handed to a scan worker, in lines
    #[serde(default = "default_min_chunk_length")]
    pub min_chunk_length: u64,

    /// Bytes read per map-phase buffer while building indexes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub indexes: BTreeMap<String, IndexConfig>,

    /// Worker count fixed on the command line, ahead of every other source
    #[serde(skip)]
    pinned_workers: Option<usize>,
}

/// One log group as written in the configuration file
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    pub base_dir: PathBuf,
    pub pattern: String,
    pub datetime_regex: String,
    pub datetime_format: String,
}

fn default_index_dir() -> PathBuf {
    PathBuf::from(".index")
}
fn default_min_chunk_length() -> u64 {
    300_000
}
fn default_buffer_size() -> usize {
    2 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_dir: default_index_dir(),
            workers: None,
            min_chunk_length: default_min_chunk_length(),
            buffer_size: default_buffer_size(),
            indexes: BTreeMap::new(),
            pinned_workers: None,
        }
    }
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| LogdexError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`.
    ///
    /// A missing file yields an empty index set, not an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(LogdexError::io_at("Failed to read config file", path, e)),
        }
    }

    /// Resolve which configuration file to use when none was given explicitly.
    ///
    /// `./logdex.toml` wins, then `<config dir>/logdex/config.toml`.
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from(LOCAL_CONFIG_NAME);
        if local.is_file() {
            return local;
        }
        dirs::config_dir()
            .map(|dir| dir.join("logdex").join("config.toml"))
            .unwrap_or(local)
    }

    /// Effective worker count: pinned value, env override, config, then CPU count
    pub fn worker_count(&self) -> usize {
        let from_env = || {
            std::env::var(WORKERS_ENV)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
        };
        self.pinned_workers
            .or_else(from_env)
            .or(self.workers)
            .unwrap_or_else(available_workers)
            .max(1)
    }

    /// Pin the worker count, overriding the environment and the file
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pinned_workers = Some(workers.max(1));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(LogdexError::config("buffer_size must be positive"));
        }
        if self.min_chunk_length == 0 {
            return Err(LogdexError::config("min_chunk_length must be positive"));
        }
        for (name, index) in &self.indexes {
            if index.pattern.is_empty() {
                return Err(LogdexError::config(format!(
                    "index '{name}' has an empty pattern"
                )));
            }
        }
        Ok(())
    }
}

fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
