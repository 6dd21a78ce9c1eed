//! Random access to log sources, plain or compressed.
//!
//! [`LogSource`] exposes a source as one contiguous byte slice: small plain files
//! are read into memory, larger ones are memory-mapped, and compressed files are
//! served from their inflated seek-table spill. On top of that slice it offers the
//! single line-iteration primitive ([`Lines`]) used by both index building and
//! searching, plus the line-aligned buffer splitter the builder's map phase uses.

pub mod compression;

pub use compression::{detect_compression, CompressionType};

use crate::error::{LogdexError, Result};
use memchr::memchr;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// Plain files smaller than this are read into memory instead of mapped
const MEMORY_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Internal byte storage strategy for a [`LogSource`]
#[derive(Debug)]
pub enum ByteSource {
    /// Content loaded entirely into memory
    InMemory(Vec<u8>),
    /// Content accessed via memory mapping
    MemoryMapped(Mmap),
}

impl ByteSource {
    /// Get the underlying bytes as a slice regardless of storage strategy
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ByteSource::InMemory(vec) => vec.as_slice(),
            ByteSource::MemoryMapped(mmap) => &mmap[..],
        }
    }
}

/// An opened log file with seek-then-read-line access
#[derive(Debug)]
pub struct LogSource {
    source: ByteSource,
    path: PathBuf,
    compression: CompressionType,
}

impl LogSource {
    /// Open `path`. Compressed sources go through the seek table stored at `spill`.
    pub async fn open(path: &Path, spill: &Path) -> Result<Self> {
        let compression = detect_compression(path)?;

        let source = if compression.is_compressed() {
            compression::open_compressed(path, compression, spill).await?
        } else {
            open_plain(path)?
        };

        Ok(Self {
            source,
            path: path.to_path_buf(),
            compression,
        })
    }

    /// Wrap bytes already in memory
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            source: ByteSource::InMemory(bytes),
            path: path.into(),
            compression: CompressionType::None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Uncompressed length in bytes
    pub fn len(&self) -> u64 {
        self.source.as_bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.source.as_bytes().is_empty()
    }

    /// Iterate lines starting at byte `offset`, which must be a line start
    pub fn lines_from(&self, offset: u64) -> Lines<'_> {
        let bytes = self.source.as_bytes();
        let pos = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        Lines {
            bytes,
            pos,
            limit: bytes.len(),
        }
    }

    /// Iterate the lines inside a buffer produced by [`buffers`](Self::buffers)
    pub fn lines_in(&self, span: BufferSpan) -> Lines<'_> {
        let bytes = self.source.as_bytes();
        let limit = (span.end as usize).min(bytes.len());
        Lines {
            bytes,
            pos: (span.start as usize).min(limit),
            limit,
        }
    }

    /// Split the source into buffers of roughly `size` bytes.
    ///
    /// Every buffer is extended to the next line boundary so no line straddles two
    /// buffers.
    pub fn buffers(&self, size: usize) -> Buffers<'_> {
        Buffers {
            bytes: self.source.as_bytes(),
            pos: 0,
            size: size.max(1),
        }
    }
}

/// Length and first line of a source, enough to order and check it without
/// loading its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSummary {
    /// Uncompressed length in bytes
    pub len: u64,
    /// First line, terminator excluded; `None` for an empty source
    pub first_line: Option<Vec<u8>>,
}

impl SourceSummary {
    /// Read only the first line of `path`. Compressed sources are read from their
    /// seek-table spill, which is built first if it is missing or stale.
    pub async fn read(path: &Path, spill: &Path) -> Result<Self> {
        let compression = detect_compression(path)?;
        let (content, len) = if compression.is_compressed() {
            let len = compression::ensure_seek_table(path, compression, spill).await?;
            (spill, len)
        } else {
            let len = std::fs::metadata(path)
                .map_err(|e| LogdexError::io_at("Failed to get metadata for", path, e))?
                .len();
            (path, len)
        };

        if len == 0 {
            return Ok(Self {
                len,
                first_line: None,
            });
        }
        let file =
            File::open(content).map_err(|e| LogdexError::io_at("Failed to open", content, e))?;
        let mut line = Vec::new();
        BufReader::new(file)
            .read_until(b'\n', &mut line)
            .map_err(|e| LogdexError::io_at("Failed to read", content, e))?;
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Self {
            len,
            first_line: Some(line),
        })
    }
}

fn open_plain(path: &Path) -> Result<ByteSource> {
    let mut file = File::open(path).map_err(|e| LogdexError::io_at("Failed to open", path, e))?;
    let file_size = file
        .metadata()
        .map_err(|e| LogdexError::io_at("Failed to get metadata for", path, e))?
        .len();

    if file_size < MEMORY_THRESHOLD {
        let mut content = Vec::with_capacity(file_size as usize);
        file.read_to_end(&mut content)
            .map_err(|e| LogdexError::io_at("Failed to read", path, e))?;
        Ok(ByteSource::InMemory(content))
    } else {
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| {
                LogdexError::file_error(format!("Failed to memory map {}", path.display()), e)
            })?
        };
        Ok(ByteSource::MemoryMapped(mmap))
    }
}

/// One line yielded by [`Lines`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line<'a> {
    /// Raw line bytes, terminator excluded
    pub content: &'a [u8],
    /// Offset just past the terminator. An unterminated final line ends one byte
    /// past EOF, as if the terminator were there.
    pub end: u64,
}

/// Sequential line reader over a byte range of a source
#[derive(Debug, Clone)]
pub struct Lines<'a> {
    bytes: &'a [u8],
    pos: usize,
    limit: usize,
}

impl<'a> Iterator for Lines<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.limit {
            return None;
        }
        let start = self.pos;
        match memchr(b'\n', &self.bytes[start..self.limit]) {
            Some(nl) => {
                self.pos = start + nl + 1;
                Some(Line {
                    content: &self.bytes[start..start + nl],
                    end: self.pos as u64,
                })
            }
            None => {
                self.pos = self.limit;
                let end = if self.limit == self.bytes.len() {
                    self.limit as u64 + 1
                } else {
                    self.limit as u64
                };
                Some(Line {
                    content: &self.bytes[start..self.limit],
                    end,
                })
            }
        }
    }
}

/// Byte range of one map-phase buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpan {
    pub start: u64,
    pub end: u64,
}

/// Line-aligned buffer splitter, see [`LogSource::buffers`]
#[derive(Debug, Clone)]
pub struct Buffers<'a> {
    bytes: &'a [u8],
    pos: usize,
    size: usize,
}

impl Iterator for Buffers<'_> {
    type Item = BufferSpan;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let start = self.pos;
        let tentative = start.saturating_add(self.size).min(self.bytes.len());
        // Read one extra line: extend through the newline ending the line we cut into
        let end = if tentative == self.bytes.len() || self.bytes[tentative - 1] == b'\n' {
            tentative
        } else {
            memchr(b'\n', &self.bytes[tentative..])
                .map(|nl| tentative + nl + 1)
                .unwrap_or(self.bytes.len())
        };
        self.pos = end;
        Some(BufferSpan {
            start: start as u64,
            end: end as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(bytes: &[u8]) -> LogSource {
        LogSource::from_bytes("test.log", bytes.to_vec())
    }

    #[test]
    fn test_lines_from_start() {
        let src = source(b"first\nsecond\nthird\n");
        let lines: Vec<_> = src.lines_from(0).map(|l| (l.content, l.end)).collect();
        assert_eq!(
            lines,
            vec![
                (&b"first"[..], 6),
                (&b"second"[..], 13),
                (&b"third"[..], 19)
            ]
        );
    }

    #[test]
    fn test_lines_from_offset() {
        let src = source(b"first\nsecond\nthird\n");
        let lines: Vec<_> = src.lines_from(6).map(|l| l.content).collect();
        assert_eq!(lines, vec![&b"second"[..], &b"third"[..]]);
        assert_eq!(src.lines_from(19).count(), 0);
        assert_eq!(src.lines_from(1000).count(), 0);
    }

    #[test]
    fn test_unterminated_last_line() {
        let src = source(b"a\nbc");
        let lines: Vec<_> = src.lines_from(0).map(|l| (l.content, l.end)).collect();
        assert_eq!(lines, vec![(&b"a"[..], 2), (&b"bc"[..], 5)]);
    }

    #[test]
    fn test_empty_lines() {
        let src = source(b"\n\nx\n");
        let lines: Vec<_> = src.lines_from(0).map(|l| l.content.len()).collect();
        assert_eq!(lines, vec![0, 0, 1]);
        assert_eq!(source(b"").lines_from(0).count(), 0);
    }

    #[test]
    fn test_buffers_end_on_line_boundaries() {
        let data = b"aaaa\nbbbbbbbb\ncc\ndddddd\n";
        let src = source(data);
        let spans: Vec<_> = src.buffers(6).collect();

        assert_eq!(spans.first().unwrap().start, 0);
        assert_eq!(spans.last().unwrap().end, data.len() as u64);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        for span in &spans {
            assert_eq!(data[span.end as usize - 1], b'\n');
        }
    }

    #[test]
    fn test_buffers_preserve_every_line() {
        let data = b"l1\nline two\nl3\nfour 4\nfive\n";
        let src = source(data);
        for size in 1..data.len() + 2 {
            let lines: Vec<_> = src
                .buffers(size)
                .flat_map(|span| src.lines_in(span).map(|l| l.content.to_vec()))
                .collect();
            let expected: Vec<_> = src.lines_from(0).map(|l| l.content.to_vec()).collect();
            assert_eq!(lines, expected, "buffer size {size}");
        }
    }

    #[test]
    fn test_buffer_exactly_on_newline() {
        let src = source(b"abc\ndef\n");
        let spans: Vec<_> = src.buffers(4).collect();
        assert_eq!(
            spans,
            vec![
                BufferSpan { start: 0, end: 4 },
                BufferSpan { start: 4, end: 8 }
            ]
        );
    }

    #[test]
    fn test_buffers_unterminated_tail() {
        let src = source(b"abc\nde");
        let spans: Vec<_> = src.buffers(2).collect();
        assert_eq!(
            spans,
            vec![
                BufferSpan { start: 0, end: 4 },
                BufferSpan { start: 4, end: 6 }
            ]
        );
        let tail: Vec<_> = src.lines_in(spans[1]).collect();
        assert_eq!(tail[0].end, 7);
    }

    #[tokio::test]
    async fn test_open_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access_log");
        std::fs::write(&path, b"x\ny\n").unwrap();

        let src = LogSource::open(&path, &dir.path().join("unused"))
            .await
            .unwrap();
        assert_eq!(src.len(), 4);
        assert_eq!(src.compression(), CompressionType::None);
        assert!(!dir.path().join("unused").exists());
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = LogSource::open(&dir.path().join("nope"), &dir.path().join("s"))
            .await
            .unwrap_err();
        assert!(matches!(err, LogdexError::FileError { .. }));
    }

    #[tokio::test]
    async fn test_summary_of_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access_log");
        std::fs::write(&path, b"first line\nsecond\n").unwrap();

        let summary = SourceSummary::read(&path, &dir.path().join("unused"))
            .await
            .unwrap();
        assert_eq!(summary.len, 18);
        assert_eq!(summary.first_line.as_deref(), Some(&b"first line"[..]));
        assert!(!dir.path().join("unused").exists());

        std::fs::write(&path, b"").unwrap();
        let empty = SourceSummary::read(&path, &dir.path().join("unused"))
            .await
            .unwrap();
        assert_eq!(empty.first_line, None);
    }

    #[tokio::test]
    async fn test_summary_of_compressed_file_reads_spill() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access_log.1.gz");
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"only line without newline").unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();
        let spill = dir.path().join("idx").join("access_log.1.gz.inflated");

        let summary = SourceSummary::read(&path, &spill).await.unwrap();
        assert_eq!(summary.len, 25);
        assert_eq!(
            summary.first_line.as_deref(),
            Some(&b"only line without newline"[..])
        );
        assert_eq!(std::fs::metadata(&spill).unwrap().len(), 25);
    }
}
