//! Persistent per-file line offset index.
//!
//! The index is a flat file of fixed-width little-endian records, one per line,
//! each holding the byte offset just past that line's terminator. Line `n` covers
//! `[record[n-1], record[n])` with `record[-1] == 0`, so reading any line costs
//! two record reads and one seek into the source.
//!
//! A two-byte sentinel is appended once the source has been fully scanned. Because
//! the sentinel is shorter than a record, `file_len / RECORD_SIZE` is the line count
//! whether or not it is present.

use crate::error::{LogdexError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Bytes per record
pub const RECORD_SIZE: u64 = 5;

/// Completion marker appended after a full build
pub const SENTINEL: &[u8; 2] = b"OK";

/// Largest end offset a 5-byte record can hold
pub const MAX_OFFSET: u64 = (1 << (8 * RECORD_SIZE)) - 1;

/// Pending sequential records are flushed once they reach this many bytes
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Location of one line inside its source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpan {
    pub lineno: u64,
    /// Byte position where the line starts
    pub offset: u64,
    /// Line length in bytes, terminator excluded
    pub length: u64,
}

impl LineSpan {
    /// Byte range of the line content within the source
    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// Line number to byte offset map for a single source file
#[derive(Debug)]
pub struct LineOffsetIndex {
    path: PathBuf,
    file: File,
    /// Encoded records not yet written, all sequential from `pending_start`
    pending: Vec<u8>,
    pending_start: u64,
}

impl LineOffsetIndex {
    /// Open the index at `path`, creating an empty one if it does not exist
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LogdexError::io_at("Failed to create index directory", parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LogdexError::io_at("Failed to open offset index", path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            pending: Vec::with_capacity(FLUSH_THRESHOLD),
            pending_start: 0,
        })
    }

    /// Open an existing index without the ability to modify it.
    ///
    /// A missing index file is a consistency error: the caller expected the
    /// source to have been indexed.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LogdexError::consistency(format!("offset index {} is missing", path.display()))
            } else {
                LogdexError::io_at("Failed to open offset index", path, e)
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            pending: Vec::new(),
            pending_start: 0,
        })
    }

    /// Line count of the index stored at `path`, or zero when there is none
    pub fn line_count_at(path: &Path) -> Result<u64> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.len() / RECORD_SIZE),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(LogdexError::io_at("Failed to stat offset index", path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop every record and the sentinel, ready for a rebuild from line 0
    pub fn reset(&mut self) -> Result<()> {
        self.pending.clear();
        self.pending_start = 0;
        self.file
            .set_len(0)
            .map_err(|e| LogdexError::io_at("Failed to truncate offset index", &self.path, e))
    }

    /// Store the end offset of line `lineno`.
    ///
    /// Overwrites are allowed. Sequential writes are buffered and reach the file on
    /// [`flush`](Self::flush), [`mark_complete`](Self::mark_complete), or once enough
    /// records accumulate; reads only see flushed records.
    pub fn write(&mut self, lineno: u64, offset: u64) -> Result<()> {
        if offset > MAX_OFFSET {
            return Err(LogdexError::file_error(
                format!("offset {offset} does not fit a {RECORD_SIZE}-byte record"),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "offset too large"),
            ));
        }

        let record = encode(offset);
        let next_pending = self.pending_start + self.pending.len() as u64 / RECORD_SIZE;

        if self.pending.is_empty() {
            self.pending_start = lineno;
            self.pending.extend_from_slice(&record);
        } else if lineno == next_pending {
            self.pending.extend_from_slice(&record);
        } else {
            self.flush()?;
            self.pending_start = lineno;
            self.pending.extend_from_slice(&record);
        }

        if self.pending.len() >= FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    /// Write buffered records to the index file
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file
            .seek(SeekFrom::Start(self.pending_start * RECORD_SIZE))
            .and_then(|_| self.file.write_all(&self.pending))
            .map_err(|e| LogdexError::io_at("Failed to write offset index", &self.path, e))?;
        self.pending.clear();
        Ok(())
    }

    /// Look up where line `lineno` lives in the source.
    ///
    /// Returns `None` when `lineno >= line_count()`.
    pub fn read(&self, lineno: u64) -> Result<Option<LineSpan>> {
        if lineno >= self.line_count()? {
            return Ok(None);
        }

        let (start, end) = if lineno == 0 {
            let mut buf = [0u8; RECORD_SIZE as usize];
            self.read_at(0, &mut buf)?;
            (0, decode(&buf))
        } else {
            let mut buf = [0u8; 2 * RECORD_SIZE as usize];
            self.read_at((lineno - 1) * RECORD_SIZE, &mut buf)?;
            let (prev, cur) = buf.split_at(RECORD_SIZE as usize);
            (decode(prev), decode(cur))
        };

        if end <= start {
            return Err(LogdexError::consistency(format!(
                "{}: line {lineno} ends at {end}, before it starts at {start}",
                self.path.display()
            )));
        }

        Ok(Some(LineSpan {
            lineno,
            offset: start,
            length: end - start - 1,
        }))
    }

    /// Number of lines with a flushed record
    pub fn line_count(&self) -> Result<u64> {
        Ok(self.file_len()? / RECORD_SIZE)
    }

    /// End offset of the last indexed line, if any
    pub fn last_offset(&self) -> Result<Option<u64>> {
        let count = self.line_count()?;
        if count == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; RECORD_SIZE as usize];
        self.read_at((count - 1) * RECORD_SIZE, &mut buf)?;
        Ok(Some(decode(&buf)))
    }

    /// Flush pending records and append the completion sentinel
    pub fn mark_complete(&mut self) -> Result<()> {
        self.flush()?;
        if self.is_complete()? {
            return Ok(());
        }
        self.file
            .seek(SeekFrom::End(0))
            .and_then(|_| self.file.write_all(SENTINEL))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| LogdexError::io_at("Failed to mark offset index", &self.path, e))
    }

    /// True when the completion sentinel sits at the tail of the index file
    pub fn is_complete(&self) -> Result<bool> {
        let len = self.file_len()?;
        if len % RECORD_SIZE != SENTINEL.len() as u64 {
            return Ok(false);
        }
        let mut tail = [0u8; 2];
        self.read_at(len - SENTINEL.len() as u64, &mut tail)?;
        Ok(&tail == SENTINEL)
    }

    fn file_len(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| LogdexError::io_at("Failed to stat offset index", &self.path, e))
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(pos))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| LogdexError::io_at("Failed to read offset index", &self.path, e))
    }
}

fn encode(offset: u64) -> [u8; RECORD_SIZE as usize] {
    let bytes = offset.to_le_bytes();
    let mut record = [0u8; RECORD_SIZE as usize];
    record.copy_from_slice(&bytes[..RECORD_SIZE as usize]);
    record
}

fn decode(record: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..RECORD_SIZE as usize].copy_from_slice(&record[..RECORD_SIZE as usize]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    /// Index `contents` the way the builder does: one record per line end,
    /// a virtual terminator for an unterminated final line.
    fn build(dir: &TempDir, contents: &[u8]) -> LineOffsetIndex {
        let mut index = LineOffsetIndex::open(&dir.path().join("source.map")).unwrap();
        let mut lineno = 0;
        let mut pos = 0usize;
        while pos < contents.len() {
            let end = match memchr::memchr(b'\n', &contents[pos..]) {
                Some(nl) => pos + nl + 1,
                None => contents.len() + 1,
            };
            index.write(lineno, end as u64).unwrap();
            lineno += 1;
            pos = end;
        }
        index.mark_complete().unwrap();
        index
    }

    fn span(lineno: u64, offset: u64, length: u64) -> Option<LineSpan> {
        Some(LineSpan {
            lineno,
            offset,
            length,
        })
    }

    #[test]
    fn test_read_boundaries() {
        let dir = TempDir::new().unwrap();
        let index = build(&dir, b"a\n");
        assert_eq!(index.read(0).unwrap(), span(0, 0, 1));
        assert_eq!(index.read(1).unwrap(), None);
    }

    #[test]
    fn test_read_growing_lines() {
        let dir = TempDir::new().unwrap();
        let index = build(&dir, b"a\naa\naaa\n");
        assert_eq!(index.read(0).unwrap(), span(0, 0, 1));
        assert_eq!(index.read(1).unwrap(), span(1, 2, 2));
        assert_eq!(index.read(2).unwrap(), span(2, 5, 3));
        assert_eq!(index.read(3).unwrap(), None);
    }

    #[test]
    fn test_read_empty_first_line() {
        let dir = TempDir::new().unwrap();
        let index = build(&dir, b"\na\naa\n");
        assert_eq!(index.read(0).unwrap(), span(0, 0, 0));
        assert_eq!(index.read(1).unwrap(), span(1, 1, 1));
        assert_eq!(index.read(2).unwrap(), span(2, 3, 2));
    }

    #[test]
    fn test_read_empty_source() {
        let dir = TempDir::new().unwrap();
        let index = build(&dir, b"");
        assert_eq!(index.line_count().unwrap(), 0);
        assert_eq!(index.read(0).unwrap(), None);
        assert!(index.is_complete().unwrap());
    }

    #[test]
    fn test_line_counts() {
        let cases: [(&[u8], u64); 6] = [
            (b"", 0),
            (b"\n", 1),
            (b"a\n", 1),
            (b"a\na", 2),
            (b"a\na\n", 2),
            (b"a\na\n\n", 3),
        ];
        for (contents, expected) in cases {
            let dir = TempDir::new().unwrap();
            let index = build(&dir, contents);
            assert_eq!(index.line_count().unwrap(), expected, "{contents:?}");
        }
    }

    #[test]
    fn test_unterminated_last_line_length() {
        let dir = TempDir::new().unwrap();
        let index = build(&dir, b"a\nbcd");
        assert_eq!(index.read(1).unwrap(), span(1, 2, 3));
        assert_eq!(index.last_offset().unwrap(), Some(6));
    }

    #[test]
    fn test_sentinel_does_not_change_count() {
        let dir = TempDir::new().unwrap();
        let mut index = LineOffsetIndex::open(&dir.path().join("x.map")).unwrap();
        for (lineno, offset) in [(0, 4), (1, 9), (2, 15)] {
            index.write(lineno, offset).unwrap();
        }
        index.flush().unwrap();
        assert!(!index.is_complete().unwrap());
        assert_eq!(index.line_count().unwrap(), 3);

        index.mark_complete().unwrap();
        index.mark_complete().unwrap();
        assert!(index.is_complete().unwrap());
        assert_eq!(index.line_count().unwrap(), 3);
        assert_eq!(
            std::fs::metadata(index.path()).unwrap().len(),
            3 * RECORD_SIZE + 2
        );
    }

    #[test]
    fn test_overwrite_and_reset() {
        let dir = TempDir::new().unwrap();
        let mut index = LineOffsetIndex::open(&dir.path().join("x.map")).unwrap();
        index.write(0, 3).unwrap();
        index.write(1, 7).unwrap();
        index.write(0, 2).unwrap();
        index.flush().unwrap();
        assert_eq!(index.read(0).unwrap(), span(0, 0, 1));
        assert_eq!(index.read(1).unwrap(), span(1, 2, 4));

        index.mark_complete().unwrap();
        index.reset().unwrap();
        assert_eq!(index.line_count().unwrap(), 0);
        assert!(!index.is_complete().unwrap());
    }

    #[test]
    fn test_reopen_sees_persisted_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("x.map");
        {
            let mut index = LineOffsetIndex::open(&path).unwrap();
            index.write(0, 10).unwrap();
            index.mark_complete().unwrap();
        }
        let index = LineOffsetIndex::open_existing(&path).unwrap();
        assert!(index.is_complete().unwrap());
        assert_eq!(index.read(0).unwrap(), span(0, 0, 9));
        assert_eq!(LineOffsetIndex::line_count_at(&path).unwrap(), 1);
    }

    #[test]
    fn test_missing_index_is_consistency_error() {
        let dir = TempDir::new().unwrap();
        let err = LineOffsetIndex::open_existing(&dir.path().join("absent.map")).unwrap_err();
        assert!(matches!(err, LogdexError::IndexConsistency { .. }));
        assert_eq!(
            LineOffsetIndex::line_count_at(&dir.path().join("absent.map")).unwrap(),
            0
        );
    }

    #[test]
    fn test_offset_too_large() {
        let dir = TempDir::new().unwrap();
        let mut index = LineOffsetIndex::open(&dir.path().join("x.map")).unwrap();
        assert!(index.write(0, MAX_OFFSET).is_ok());
        assert!(index.write(1, MAX_OFFSET + 1).is_err());
    }

    proptest! {
        #[test]
        fn prop_every_line_round_trips(lines in proptest::collection::vec("[a-z ]{0,40}", 0..60)) {
            let mut contents = Vec::new();
            for line in &lines {
                contents.extend_from_slice(line.as_bytes());
                contents.push(b'\n');
            }
            let dir = TempDir::new().unwrap();
            let index = build(&dir, &contents);

            prop_assert_eq!(index.line_count().unwrap(), lines.len() as u64);
            let mut rebuilt = Vec::new();
            for lineno in 0..index.line_count().unwrap() {
                let span = index.read(lineno).unwrap().unwrap();
                let range = span.byte_range();
                let line = &contents[range.start as usize..range.end as usize];
                prop_assert_eq!(line, lines[lineno as usize].as_bytes());
                rebuilt.extend_from_slice(line);
                rebuilt.push(b'\n');
            }
            prop_assert_eq!(rebuilt, contents);
        }
    }
}
