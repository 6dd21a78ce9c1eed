#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use futures::TryStreamExt;
use logdex::{Application, ChunkHits, Config, MatchResult, SearchRequest};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const INDEX: &str = "access_log";

pub struct Fixture {
    pub dir: TempDir,
    pub logs: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let logs = dir.path().join("data").join(INDEX);
        std::fs::create_dir_all(&logs).expect("create log dir");
        Self { dir, logs }
    }

    /// The three rotated files every scenario starts from
    pub fn with_rotated_logs() -> Self {
        let fixture = Self::new();
        fixture.write("access_log.2.gz", &rows(&[(20, 10), (21, 100)]));
        fixture.write("access_log.1", &rows(&[(21, 10), (22, 100)]));
        fixture.write("access_log", &rows(&[(22, 10), (23, 100)]));
        fixture
    }

    pub fn index_dir(&self) -> PathBuf {
        self.dir.path().join("index")
    }

    pub fn date_index_path(&self) -> PathBuf {
        self.index_dir().join(INDEX).join("dates.json")
    }

    pub fn config(&self) -> Config {
        let toml = format!(
            r#"
index_dir = '{}'
min_chunk_length = 7
buffer_size = 1024

[indexes.{INDEX}]
base_dir = '{}'
pattern = "{INDEX}*"
datetime_regex = '\[(.+?)\]'
datetime_format = "%d/%b/%Y:%H:%M:%S %z"
"#,
            self.index_dir().display(),
            self.logs.display()
        );
        Config::from_toml(&toml)
            .expect("parse config")
            .with_workers(4)
    }

    pub fn app(&self) -> Application {
        Application::new(self.config()).expect("build application")
    }

    /// Write a log file; names ending in `.gz` are gzip-compressed
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.logs.join(name);
        if name.ends_with(".gz") {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(contents.as_bytes()).expect("compress");
            std::fs::write(&path, encoder.finish().expect("finish gzip")).expect("write gz");
        } else {
            std::fs::write(&path, contents).expect("write log");
        }
        path
    }

    pub fn append(&self, name: &str, contents: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(self.logs.join(name))
            .expect("open for append");
        file.write_all(contents.as_bytes()).expect("append");
    }

    pub fn date_index_json(&self) -> serde_json::Value {
        let raw = std::fs::read(self.date_index_path()).expect("read date index");
        serde_json::from_slice(&raw).expect("parse date index")
    }
}

/// One access log row dated 2019-02-`day`
pub fn row(day: u32, url: usize) -> String {
    format!(
        "127.0.0.1 - - [{day:02}/Feb/2019:12:34:56 +0000] \"GET /{url} HTTP/1.1\" 404 233 \"-\" \"-\"\n"
    )
}

/// `count` rows for each `(day, count)` in order
pub fn rows(days: &[(u32, usize)]) -> String {
    days.iter()
        .flat_map(|&(day, count)| (0..count).map(move |url| row(day, url)))
        .collect()
}

pub fn expected_index() -> serde_json::Value {
    serde_json::json!({
        "2019-02-20": {"access_log.2.gz": [0, 9]},
        "2019-02-21": {"access_log.2.gz": [10, 109], "access_log.1": [0, 9]},
        "2019-02-22": {"access_log.1": [10, 109], "access_log": [0, 9]},
        "2019-02-23": {"access_log": [10, 109]}
    })
}

/// Run a search to completion
pub async fn collect(
    app: &Application,
    request: SearchRequest,
) -> logdex::Result<Vec<(PathBuf, MatchResult)>> {
    let outputs: Vec<_> = app.search(request).await?.try_collect().await?;
    Ok(outputs
        .into_iter()
        .flat_map(|output| {
            let path = output.path;
            let matches = match output.hits {
                ChunkHits::Matches(matches) => matches,
                ChunkHits::Dates(_) => Vec::new(),
            };
            matches.into_iter().map(move |hit| (path.clone(), hit))
        })
        .collect())
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .expect("file name")
        .to_string_lossy()
        .into_owned()
}
