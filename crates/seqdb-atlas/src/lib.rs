//! # seqdb-atlas
//!
//! Shared memory atlas for large flat-file sequence databases.
//!
//! The atlas serves random-access reads over very large read-only files
//! without re-reading data that is already resident. Requested byte ranges
//! are rounded out to alignment units, acquired once (memory mapped, or read
//! into an owned buffer when mapping fails) and kept resident until memory
//! pressure evicts them.
//!
//! ## Layout
//!
//! ```text
//! Atlas ─ Mutex<AtlasState>
//!         ├── FileTable       path -> FileId
//!         ├── regions         RegionId -> Arc<RegionMap>
//!         ├── by_range        (FileId, begin, end) -> RegionId   (authoritative)
//!         ├── by_address      data start address -> RegionId
//!         ├── recent          small MRU ring, subset of by_range
//!         └── pool            manual zero-filled allocations
//! ```
//!
//! ## Locking
//!
//! Every operation takes a [`LockHold`]. The hold acquires the atlas lock
//! on first use and keeps it until it is unlocked or dropped, so helper
//! chains can pass the same hold down without re-locking.
//!
//! ```ignore
//! let atlas = Atlas::new(AtlasOptions::default())?;
//! let mut hold = atlas.hold();
//! let bytes = atlas.get_region("db.psq", 4096, 8192, &mut hold)?;
//! // ... use &bytes[..] ...
//! atlas.ret_region(bytes, &mut hold)?;
//! ```

mod atlas;
mod backend;
mod file_table;
mod lease;
mod lock;
mod pool;
mod region;

pub use atlas::{Atlas, AtlasStats};
pub use backend::{create_backend, BufferedBackend, FileBackend, OsBackend};
pub use file_table::{FileId, FileTable};
pub use lease::{Lease, RegionBytes};
pub use lock::LockHold;
pub use pool::PoolPtr;
pub use region::{Extent, RegionData, RegionId, RegionInfo, RegionMap, RegionOrigin};

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Errors that can occur during atlas operations
#[derive(Error, Debug)]
pub enum AtlasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Could not acquire {path} [{begin}, {end}): {source}")]
    Acquire {
        path: PathBuf,
        begin: u64,
        end: u64,
        #[source]
        source: io::Error,
    },

    #[error("Offset type does not span file length: {path} ({length} bytes)")]
    OffsetOverflow { path: PathBuf, length: u64 },

    #[error("Invalid range: [{begin}, {end})")]
    InvalidRange { begin: u64, end: u64 },

    #[error("Range end {end} is past end of {path} ({file_len} bytes)")]
    OutOfBounds {
        path: PathBuf,
        end: u64,
        file_len: u64,
    },

    #[error("Address {addr:#x} is not tracked by the atlas")]
    UnknownAddress { addr: usize },

    #[error("Region {region} released more often than acquired")]
    OverRelease { region: RegionId },

    #[error("Invalid atlas options: {0}")]
    InvalidOptions(String),
}

pub type Result<T> = std::result::Result<T, AtlasError>;

/// Tuning knobs for an [`Atlas`].
///
/// Sizes are in bytes. The defaults match a 32-bit-friendly layout: 256 MiB
/// large slices, 8 KiB small slices and a 1 GiB resident budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasOptions {
    /// Try memory mapping before falling back to buffered reads
    pub use_mmap: bool,
    /// Resident-byte budget (regions plus pool allocations)
    pub memory_bound: u64,
    /// Large alignment unit for requests inside one slice
    pub large_slice: u64,
    /// Small alignment unit for requests straddling a large slice boundary
    pub small_slice: u64,
    /// Alignment used when mapping is unavailable
    pub block_size: u64,
    /// `get_file` runs a full sweep before mapping files above this size
    pub whole_file_gc_threshold: u64,
    /// Size of the most-recently-used ring
    pub recent_slots: usize,
    /// Cap on the per-region eviction clock
    pub max_clock: u32,
}

impl Default for AtlasOptions {
    fn default() -> Self {
        Self {
            use_mmap: true,
            memory_bound: GIB,
            large_slice: 256 * MIB,
            small_slice: 8 * KIB,
            block_size: 512 * KIB,
            whole_file_gc_threshold: 256 * MIB,
            recent_slots: 8,
            max_clock: 10,
        }
    }
}

impl AtlasOptions {
    /// Check the options for values the rounding and eviction code cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.large_slice == 0 || self.small_slice == 0 || self.block_size == 0 {
            return Err(AtlasError::InvalidOptions(
                "alignment units must be non-zero".to_string(),
            ));
        }
        if self.small_slice > self.large_slice {
            return Err(AtlasError::InvalidOptions(format!(
                "small_slice ({}) exceeds large_slice ({})",
                self.small_slice, self.large_slice
            )));
        }
        if self.recent_slots == 0 {
            return Err(AtlasError::InvalidOptions(
                "recent_slots must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
