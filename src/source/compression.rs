//! Compression format detection and the persisted seek table for compressed sources.
//!
//! A compressed log is inflated once into a spill file next to its offset index.
//! The spill plus a small JSON fingerprint of the compressed source form its seek
//! table: later opens import it and get plain random access without decoding
//! anything. Both files are published with an atomic rename, so concurrent
//! exporters race harmlessly (the last complete writer wins and readers never
//! observe a partial spill).

use crate::error::{LogdexError, Result};
use crate::source::ByteSource;
use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, XzDecoder, ZstdDecoder};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader, BufWriter};

/// Supported compression formats for transparent file access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression - plain text file
    None,
    /// Gzip compression (.gz files)
    Gzip,
    /// Bzip2 compression (.bz2 files)
    Bzip2,
    /// XZ compression (.xz files)
    Xz,
    /// Zstandard compression (.zst, .zstd files)
    Zstd,
}

impl CompressionType {
    /// Get human-readable name for the compression type
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }

    /// Check if this type represents a compressed format
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Detect compression type from magic numbers, falling back to the extension.
///
/// # Magic Numbers Used
/// - Gzip: `1f 8b` (RFC 1952)
/// - Bzip2: `42 5a 68` ("BZh" with block size)
/// - XZ: `fd 37 7a 58 5a 00`
/// - Zstd: `28 b5 2f fd` (Zstandard frame format)
pub fn detect_compression(path: &Path) -> Result<CompressionType> {
    let mut file = File::open(path).map_err(|e| LogdexError::io_at("Failed to open", path, e))?;
    let mut buffer = [0u8; 8];
    let bytes_read = file.read(&mut buffer).unwrap_or(0);

    if let Some(format) = detect_by_magic(&buffer[..bytes_read]) {
        return Ok(format);
    }
    Ok(detect_by_extension(path).unwrap_or(CompressionType::None))
}

fn detect_by_magic(magic: &[u8]) -> Option<CompressionType> {
    if magic.starts_with(&[0x1f, 0x8b]) {
        Some(CompressionType::Gzip)
    } else if magic.starts_with(&[0x42, 0x5a, 0x68]) {
        Some(CompressionType::Bzip2)
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Some(CompressionType::Zstd)
    } else if magic.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
        Some(CompressionType::Xz)
    } else {
        None
    }
}

fn detect_by_extension(path: &Path) -> Option<CompressionType> {
    let ext = path.extension()?.to_str()?;
    match ext.to_lowercase().as_str() {
        "gz" => Some(CompressionType::Gzip),
        "bz2" => Some(CompressionType::Bzip2),
        "xz" => Some(CompressionType::Xz),
        "zst" | "zstd" => Some(CompressionType::Zstd),
        _ => None,
    }
}

/// Identity of the compressed file a spill was produced from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SeekTableHeader {
    source_len: u64,
    source_mtime_secs: u64,
    source_mtime_nanos: u32,
    inflated_len: u64,
}

impl SeekTableHeader {
    fn describe(path: &Path, inflated_len: u64) -> Result<Self> {
        let meta = std::fs::metadata(path)
            .map_err(|e| LogdexError::io_at("Failed to stat", path, e))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        Ok(Self {
            source_len: meta.len(),
            source_mtime_secs: mtime.as_secs(),
            source_mtime_nanos: mtime.subsec_nanos(),
            inflated_len,
        })
    }

    fn same_source(&self, other: &Self) -> bool {
        self.source_len == other.source_len
            && self.source_mtime_secs == other.source_mtime_secs
            && self.source_mtime_nanos == other.source_mtime_nanos
    }
}

fn header_path(spill: &Path) -> PathBuf {
    let mut name = spill.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// Open a compressed source through its seek table, building it on first use
pub(crate) async fn open_compressed(
    path: &Path,
    compression: CompressionType,
    spill: &Path,
) -> Result<ByteSource> {
    let inflated_len = ensure_seek_table(path, compression, spill).await?;
    map_spill(spill, inflated_len)
}

/// Make sure `spill` holds the current inflated content of `path` and return its
/// length. A matching seek table is reused without touching the spill.
pub(crate) async fn ensure_seek_table(
    path: &Path,
    compression: CompressionType,
    spill: &Path,
) -> Result<u64> {
    if let Some(inflated_len) = current_seek_table(path, spill)? {
        log::debug!("imported seek table for {}", path.display());
        return Ok(inflated_len);
    }

    let dir = spill.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .map_err(|e| LogdexError::io_at("Failed to create seek table directory", dir, e))?;

    let temp_file = inflate_to_temp_file(path, compression, dir).await?;
    let inflated_len = temp_file
        .as_file()
        .metadata()
        .map_err(|e| LogdexError::file_error("Failed to stat inflated file", e))?
        .len();
    export_seek_table(path, spill, temp_file, inflated_len)?;
    log::info!(
        "exported seek table for {} ({} bytes inflated)",
        path.display(),
        inflated_len
    );
    Ok(inflated_len)
}

/// Inflated length recorded by a seek table that still describes `path`
fn current_seek_table(path: &Path, spill: &Path) -> Result<Option<u64>> {
    let stored: SeekTableHeader = match std::fs::read(header_path(spill)) {
        Ok(raw) => match serde_json::from_slice(&raw) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("ignoring unreadable seek table for {}: {e}", path.display());
                return Ok(None);
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LogdexError::io_at("Failed to read seek table", spill, e)),
    };

    let current = SeekTableHeader::describe(path, stored.inflated_len)?;
    if !stored.same_source(&current) {
        log::debug!("seek table for {} is stale", path.display());
        return Ok(None);
    }

    match std::fs::metadata(spill) {
        Ok(meta) if meta.len() == stored.inflated_len => Ok(Some(stored.inflated_len)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LogdexError::io_at("Failed to stat seek table", spill, e)),
    }
}

fn export_seek_table(
    path: &Path,
    spill: &Path,
    inflated: NamedTempFile,
    inflated_len: u64,
) -> Result<()> {
    let dir = spill.parent().unwrap_or_else(|| Path::new("."));
    inflated
        .persist(spill)
        .map_err(|e| LogdexError::file_error("Failed to persist inflated file", e.error))?;

    let header = SeekTableHeader::describe(path, inflated_len)?;
    let mut temp = NamedTempFile::new_in(dir)
        .map_err(|e| LogdexError::file_error("Failed to create temp file", e))?;
    serde_json::to_writer(temp.as_file_mut(), &header)
        .map_err(|e| LogdexError::file_error("Failed to write seek table", e.into()))?;
    temp.persist(header_path(spill))
        .map_err(|e| LogdexError::file_error("Failed to persist seek table", e.error))?;
    Ok(())
}

fn map_spill(spill: &Path, len: u64) -> Result<ByteSource> {
    if len == 0 {
        return Ok(ByteSource::InMemory(Vec::new()));
    }
    let file = File::open(spill).map_err(|e| LogdexError::io_at("Failed to open", spill, e))?;
    let mmap = unsafe {
        Mmap::map(&file).map_err(|e| {
            LogdexError::file_error(format!("Failed to memory map {}", spill.display()), e)
        })?
    };
    Ok(ByteSource::MemoryMapped(mmap))
}

/// Decompress a file into a temporary file created in `dir`
async fn inflate_to_temp_file(
    path: &Path,
    compression: CompressionType,
    dir: &Path,
) -> Result<NamedTempFile> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| LogdexError::io_at("Failed to open compressed file", path, e))?;
    let file = BufReader::new(file);

    let temp_file = NamedTempFile::new_in(dir)
        .map_err(|e| LogdexError::file_error("Failed to create temp file", e))?;
    let handle = temp_file
        .reopen()
        .map_err(|e| LogdexError::file_error("Failed to open temp file for writing", e))?;
    let mut temp_writer = BufWriter::new(tokio::fs::File::from_std(handle));

    let mut decoder: Box<dyn AsyncRead + Unpin + Send> = match compression {
        CompressionType::Gzip => {
            let mut decoder = GzipDecoder::new(file);
            decoder.multiple_members(true);
            Box::new(decoder)
        }
        CompressionType::Bzip2 => Box::new(BzDecoder::new(file)),
        CompressionType::Xz => Box::new(XzDecoder::new(file)),
        CompressionType::Zstd => {
            let mut decoder = ZstdDecoder::new(file);
            decoder.multiple_members(true);
            Box::new(decoder)
        }
        CompressionType::None => {
            return Err(LogdexError::compression(format!(
                "{} is not compressed",
                path.display()
            )))
        }
    };

    tokio::io::copy(&mut decoder, &mut temp_writer)
        .await
        .map_err(|e| {
            LogdexError::compression(format!(
                "Failed to decompress {} as {}: {e}",
                path.display(),
                compression.name()
            ))
        })?;

    temp_writer
        .flush()
        .await
        .map_err(|e| LogdexError::file_error("Failed to flush temp file", e))?;

    Ok(temp_file)
}
