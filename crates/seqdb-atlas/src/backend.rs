//! File access backends.
//!
//! The atlas consumes three capabilities from the operating system: file
//! length, a read-only mapped view of a byte range, and a positioned read
//! of a byte range into an owned buffer. [`FileBackend`] puts them behind
//! one trait so the atlas can be driven by a backend that never maps.
//!
//! - [`OsBackend`]: memmap2 mapping plus buffered reads
//! - [`BufferedBackend`]: buffered reads only

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

/// Unified interface over the file primitives the atlas needs
pub trait FileBackend: Send + Sync {
    /// Length of the file in bytes.
    fn file_len(&self, path: &Path) -> io::Result<u64>;

    /// Map `[offset, offset + len)` of `path` read-only.
    fn map(&self, path: &Path, offset: u64, len: usize) -> io::Result<Mmap>;

    /// Read exactly `len` bytes starting at `offset` into a fresh buffer.
    fn read(&self, path: &Path, offset: u64, len: usize) -> io::Result<Box<[u8]>>;

    /// Whether `map` can succeed at all. Rounding differs when it cannot.
    fn can_map(&self) -> bool {
        true
    }

    /// Get the backend name for logging/debugging
    fn name(&self) -> &'static str;
}

fn stat_len(path: &Path) -> io::Result<u64> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a regular file: {}", path.display()),
        ));
    }
    Ok(meta.len())
}

fn read_range(path: &Path, offset: u64, len: usize) -> io::Result<Box<[u8]>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut buf = vec![0u8; len].into_boxed_slice();
    // read_exact retries short reads and fails with UnexpectedEof at end of file
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Default backend: memmap2 views with buffered reads as the fallback path
#[derive(Debug, Default)]
pub struct OsBackend;

impl OsBackend {
    pub fn new() -> Self {
        Self
    }
}

impl FileBackend for OsBackend {
    fn file_len(&self, path: &Path) -> io::Result<u64> {
        stat_len(path)
    }

    fn map(&self, path: &Path, offset: u64, len: usize) -> io::Result<Mmap> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and the atlas treats database
        // files as immutable while they are open.
        unsafe { MmapOptions::new().offset(offset).len(len).map(&file) }
    }

    fn read(&self, path: &Path, offset: u64, len: usize) -> io::Result<Box<[u8]>> {
        read_range(path, offset, len)
    }

    fn name(&self) -> &'static str {
        "mmap"
    }
}

/// Backend for platforms or paths where range mapping is unavailable
#[derive(Debug, Default)]
pub struct BufferedBackend;

impl BufferedBackend {
    pub fn new() -> Self {
        Self
    }
}

impl FileBackend for BufferedBackend {
    fn file_len(&self, path: &Path) -> io::Result<u64> {
        stat_len(path)
    }

    fn map(&self, _path: &Path, _offset: u64, _len: usize) -> io::Result<Mmap> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "mapping disabled for this backend",
        ))
    }

    fn read(&self, path: &Path, offset: u64, len: usize) -> io::Result<Box<[u8]>> {
        read_range(path, offset, len)
    }

    fn can_map(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "buffered"
    }
}

/// Create the backend matching the `use_mmap` option.
pub fn create_backend(use_mmap: bool) -> Box<dyn FileBackend> {
    if use_mmap {
        tracing::debug!("Using mmap backend");
        Box::new(OsBackend::new())
    } else {
        tracing::debug!("Using buffered-read backend");
        Box::new(BufferedBackend::new())
    }
}
