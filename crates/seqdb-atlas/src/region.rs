//! Region maps: one resident byte range of one file.
//!
//! A region is created with a rounded [`Extent`] and acquired exactly once,
//! either as a mapped view or as an owned buffer. Its data never changes
//! afterwards. The reference count pins it against eviction; the clock counts
//! eviction sweeps survived while unreferenced.
//!
//! ## Rounding
//!
//! Requests inside one large slice are rounded out to the large slice
//! (penalty 0). Requests straddling a large slice boundary are rounded to
//! the small slice (penalty 1 up to two small slices, else 2). Extents that
//! would run past end of file are clipped and get penalty 2. Without range
//! mapping, requests are rounded to the block size with penalty 2, or the
//! whole file is taken once the block-rounded range is nearly all of it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::backend::FileBackend;
use crate::file_table::FileId;
use crate::{AtlasError, AtlasOptions, Result};

/// Highest rounding penalty. Penalties run 0 (aligned) to 2 (irregular).
pub const MAX_PENALTY: u8 = 2;

/// Identity of one region for the lifetime of an atlas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(pub(crate) u64);

impl RegionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region:{}", self.0)
    }
}

/// Rounded, half-open byte range of a file plus its rounding penalty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub begin: u64,
    pub end: u64,
    pub penalty: u8,
}

fn align_down(value: u64, align: u64) -> u64 {
    (value / align) * align
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align).saturating_mul(align)
}

impl Extent {
    /// Round a request `[begin, end)` of a `file_len`-byte file.
    ///
    /// `mappable` selects between slice rounding (mapping available) and
    /// block rounding (buffered reads only). Requires `begin < end <= file_len`.
    pub fn round(begin: u64, end: u64, file_len: u64, mappable: bool, opts: &AtlasOptions) -> Self {
        debug_assert!(begin < end, "empty request [{begin}, {end})");
        debug_assert!(end <= file_len, "request end {end} past file length {file_len}");

        if !mappable {
            return Self::round_to_blocks(begin, end, file_len, opts);
        }

        if begin == 0 && end == file_len {
            return Self {
                begin,
                end,
                penalty: 0,
            };
        }

        let large = opts.large_slice;
        let small = opts.small_slice;

        let (new_begin, new_end, penalty) = if begin / large == (end - 1) / large {
            (align_down(begin, large), align_up(end, large), 0)
        } else {
            let new_begin = align_down(begin, small);
            let new_end = align_up(end, small);
            let penalty = if new_end - new_begin <= 2 * small { 1 } else { 2 };
            (new_begin, new_end, penalty)
        };

        if new_end > file_len {
            return Self {
                begin: new_begin,
                end: file_len,
                penalty: MAX_PENALTY,
            };
        }

        Self {
            begin: new_begin,
            end: new_end,
            penalty,
        }
    }

    fn round_to_blocks(begin: u64, end: u64, file_len: u64, opts: &AtlasOptions) -> Self {
        let block = opts.block_size;
        let new_begin = align_down(begin, block);
        let new_end = align_up(end, block).min(file_len);

        if new_end - new_begin > file_len.saturating_sub(block) {
            // Nearly the whole file anyway; big files should outlive small ones
            let penalty = if file_len > opts.large_slice { 0 } else { 1 };
            return Self {
                begin: 0,
                end: file_len,
                penalty,
            };
        }

        Self {
            begin: new_begin,
            end: new_end,
            penalty: MAX_PENALTY,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// Whether `[begin, end)` lies entirely inside this extent.
    pub fn contains(&self, begin: u64, end: u64) -> bool {
        self.begin <= begin && end <= self.end
    }
}

/// Where a region's bytes live
pub enum RegionData {
    Mapped(Mmap),
    Owned(Box<[u8]>),
}

impl RegionData {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            RegionData::Mapped(mmap) => &mmap[..],
            RegionData::Owned(buf) => &buf[..],
        }
    }

    pub fn origin(&self) -> RegionOrigin {
        match self {
            RegionData::Mapped(_) => RegionOrigin::Mapped,
            RegionData::Owned(_) => RegionOrigin::Owned,
        }
    }
}

impl fmt::Debug for RegionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionData")
            .field("origin", &self.origin())
            .field("len", &self.as_slice().len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionOrigin {
    Mapped,
    Owned,
}

/// Diagnostic snapshot of one live region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionInfo {
    pub id: RegionId,
    pub file: u32,
    pub path: PathBuf,
    pub begin: u64,
    pub end: u64,
    pub refs: usize,
    pub clock: u32,
    pub penalty: u8,
    pub origin: RegionOrigin,
}

/// One resident byte range of one file
#[derive(Debug)]
pub struct RegionMap {
    id: RegionId,
    file: FileId,
    path: Arc<Path>,
    extent: Extent,
    data: RegionData,
    refs: AtomicUsize,
    clock: AtomicU32,
}

impl RegionMap {
    /// Acquire the bytes of `extent`: mapped when `try_map` is set and the
    /// mapping succeeds, otherwise read into an owned buffer.
    pub(crate) fn acquire(
        id: RegionId,
        file: FileId,
        path: Arc<Path>,
        extent: Extent,
        backend: &dyn FileBackend,
        try_map: bool,
    ) -> Result<Self> {
        let len = usize::try_from(extent.len()).map_err(|_| AtlasError::OffsetOverflow {
            path: path.to_path_buf(),
            length: extent.len(),
        })?;

        let mut data = None;
        if try_map {
            match backend.map(&path, extent.begin, len) {
                Ok(mmap) => data = Some(RegionData::Mapped(mmap)),
                Err(e) => warn!(
                    path = %path.display(),
                    begin = extent.begin,
                    end = extent.end,
                    error = %e,
                    "mmap failed, falling back to buffered read"
                ),
            }
        }

        let data = match data {
            Some(data) => data,
            None => {
                let buf = backend
                    .read(&path, extent.begin, len)
                    .map_err(|source| AtlasError::Acquire {
                        path: path.to_path_buf(),
                        begin: extent.begin,
                        end: extent.end,
                        source,
                    })?;
                RegionData::Owned(buf)
            }
        };

        Ok(Self {
            id,
            file,
            path,
            extent,
            data,
            refs: AtomicUsize::new(0),
            clock: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn begin(&self) -> u64 {
        self.extent.begin
    }

    pub fn end(&self) -> u64 {
        self.extent.end
    }

    pub fn len(&self) -> u64 {
        self.extent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extent.is_empty()
    }

    pub fn penalty(&self) -> u8 {
        self.extent.penalty
    }

    pub fn origin(&self) -> RegionOrigin {
        self.data.origin()
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn in_use(&self) -> bool {
        self.refs() > 0
    }

    pub fn clock(&self) -> u32 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Whether this region holds `[begin, end)` of `file`.
    pub fn covers(&self, file: FileId, begin: u64, end: u64) -> bool {
        self.file == file && self.extent.contains(begin, end)
    }

    /// Bytes `[begin, end)` of the file, if they fall inside this region.
    pub fn data(&self, begin: u64, end: u64) -> Option<&[u8]> {
        if begin > end || !self.extent.contains(begin, end) {
            return None;
        }
        let start = (begin - self.extent.begin) as usize;
        let stop = (end - self.extent.begin) as usize;
        self.data.as_slice().get(start..stop)
    }

    /// Address of the first resident byte.
    pub fn base_addr(&self) -> usize {
        self.data.as_slice().as_ptr() as usize
    }

    /// Whether `addr` points into this region's resident bytes.
    pub fn contains_addr(&self, addr: usize) -> bool {
        let base = self.base_addr();
        addr >= base && addr - base < self.data.as_slice().len()
    }

    // Increments only happen under the atlas lock, so a region observed
    // unreferenced by the eviction sweep cannot be re-pinned behind its back.
    pub(crate) fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference. Returns false if the count was already zero.
    pub(crate) fn ret_ref(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn bump_clock(&self, cap: u32) {
        let clock = self.clock();
        if clock < cap {
            self.clock.store(clock + 1, Ordering::Relaxed);
        }
    }

    /// Eviction generation: survivors of many sweeps and well-aligned
    /// extents sit in higher generations and are reclaimed later.
    pub(crate) fn generation(&self, cap: u32) -> u32 {
        self.clock().min(cap) + u32::from(MAX_PENALTY - self.extent.penalty)
    }

    pub fn info(&self) -> RegionInfo {
        RegionInfo {
            id: self.id,
            file: self.file.get(),
            path: self.path.to_path_buf(),
            begin: self.extent.begin,
            end: self.extent.end,
            refs: self.refs(),
            clock: self.clock(),
            penalty: self.extent.penalty,
            origin: self.origin(),
        }
    }
}

impl Drop for RegionMap {
    fn drop(&mut self) {
        trace!(
            region = %self.id,
            path = %self.path.display(),
            origin = ?self.origin(),
            "releasing region data"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferedBackend, OsBackend};
    use crate::{KIB, MIB};
    use std::io;
    use tempfile::TempDir;

    fn opts(large: u64, small: u64, block: u64) -> AtlasOptions {
        AtlasOptions {
            large_slice: large,
            small_slice: small,
            block_size: block,
            ..AtlasOptions::default()
        }
    }

    #[test]
    fn test_round_inside_large_slice() {
        let o = opts(MIB, 8 * KIB, 512 * KIB);
        let e = Extent::round(100, 200, 10 * MIB, true, &o);
        assert_eq!(e, Extent { begin: 0, end: MIB, penalty: 0 });

        let e = Extent::round(3 * MIB + 5, 3 * MIB + 900, 10 * MIB, true, &o);
        assert_eq!(e, Extent { begin: 3 * MIB, end: 4 * MIB, penalty: 0 });
    }

    #[test]
    fn test_round_units_beyond_file_size_take_whole_file() {
        let o = opts(4 * 1024 * MIB, 1024 * MIB, 512 * KIB);
        let e = Extent::round(100, 200, 10 * MIB, true, &o);
        assert_eq!(e.begin, 0);
        assert_eq!(e.end, 10 * MIB);
        assert_eq!(e.penalty, MAX_PENALTY);
    }

    #[test]
    fn test_round_straddling_large_boundary() {
        let o = opts(64 * KIB, 4 * KIB, 512 * KIB);

        // Small straddle: rounds to two small slices
        let e = Extent::round(64 * KIB - 10, 64 * KIB + 10, MIB, true, &o);
        assert_eq!(e, Extent { begin: 60 * KIB, end: 68 * KIB, penalty: 1 });

        // Wide straddle: more than two small slices
        let e = Extent::round(60 * KIB + 1, 72 * KIB + 1, MIB, true, &o);
        assert_eq!(e, Extent { begin: 60 * KIB, end: 76 * KIB, penalty: 2 });
    }

    #[test]
    fn test_round_clips_at_end_of_file() {
        let o = opts(64 * KIB, 4 * KIB, 512 * KIB);
        let file_len = 100 * KIB + 7;
        let e = Extent::round(65 * KIB, 100 * KIB + 3, file_len, true, &o);
        assert_eq!(e.begin, 64 * KIB);
        assert_eq!(e.end, file_len);
        assert_eq!(e.penalty, MAX_PENALTY);
    }

    #[test]
    fn test_round_whole_file_request() {
        let o = opts(64 * KIB, 4 * KIB, 512 * KIB);
        let e = Extent::round(0, 300 * KIB, 300 * KIB, true, &o);
        assert_eq!(e, Extent { begin: 0, end: 300 * KIB, penalty: 0 });
    }

    #[test]
    fn test_round_blocks_without_mapping() {
        let o = opts(MIB, 8 * KIB, 16 * KIB);
        let e = Extent::round(20 * KIB, 21 * KIB, 10 * MIB, false, &o);
        assert_eq!(e, Extent { begin: 16 * KIB, end: 32 * KIB, penalty: 2 });

        // Block rounding would cover nearly the whole small file
        let e = Extent::round(100, 200, 20 * KIB, false, &o);
        assert_eq!(e, Extent { begin: 0, end: 20 * KIB, penalty: 1 });

        // Same for a file larger than the large slice
        let e = Extent::round(KIB, 2 * MIB, 2 * MIB + 10, false, &o);
        assert_eq!(e, Extent { begin: 0, end: 2 * MIB + 10, penalty: 0 });
    }

    #[test]
    fn test_round_always_contains_request() {
        let o = opts(64 * KIB, 4 * KIB, 16 * KIB);
        let file_len = 300 * KIB + 123;
        for mappable in [true, false] {
            for begin in (0..file_len - 1).step_by(7919) {
                for width in [1, 100, 5_000, 70_000] {
                    let end = (begin + width).min(file_len);
                    let e = Extent::round(begin, end, file_len, mappable, &o);
                    assert!(e.contains(begin, end), "{e:?} vs [{begin}, {end})");
                    assert!(e.end <= file_len);
                    assert!(e.penalty <= MAX_PENALTY);
                    assert_eq!(e, Extent::round(begin, end, file_len, mappable, &o));
                }
            }
        }
    }

    fn write_sample(temp: &TempDir, len: usize) -> Arc<Path> {
        let path = temp.path().join("vol.psq");
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, data).unwrap();
        Arc::from(path.as_path())
    }

    #[test]
    fn test_acquire_mapped_and_data() {
        let temp = TempDir::new().unwrap();
        let path = write_sample(&temp, 10_000);
        let extent = Extent { begin: 1_000, end: 9_000, penalty: 2 };

        let region = RegionMap::acquire(
            RegionId(1),
            FileId(1),
            path,
            extent,
            &OsBackend::new(),
            true,
        )
        .unwrap();

        assert_eq!(region.origin(), RegionOrigin::Mapped);
        assert_eq!(region.data(1_000, 1_004).unwrap(), &[232, 233, 234, 235]);
        assert!(region.data(999, 1_004).is_none());
        assert!(region.data(8_000, 9_001).is_none());
        assert!(region.covers(FileId(1), 2_000, 3_000));
        assert!(!region.covers(FileId(2), 2_000, 3_000));

        let base = region.base_addr();
        assert!(region.contains_addr(base));
        assert!(region.contains_addr(base + 7_999));
        assert!(!region.contains_addr(base + 8_000));
    }

    struct NoMapBackend;

    impl FileBackend for NoMapBackend {
        fn file_len(&self, path: &Path) -> io::Result<u64> {
            OsBackend::new().file_len(path)
        }

        fn map(&self, _: &Path, _: u64, _: usize) -> io::Result<Mmap> {
            Err(io::Error::other("no address space"))
        }

        fn read(&self, path: &Path, offset: u64, len: usize) -> io::Result<Box<[u8]>> {
            OsBackend::new().read(path, offset, len)
        }

        fn name(&self) -> &'static str {
            "no-map"
        }
    }

    #[test]
    fn test_acquire_falls_back_to_buffered_read() {
        let temp = TempDir::new().unwrap();
        let path = write_sample(&temp, 4_096);
        let extent = Extent { begin: 0, end: 4_096, penalty: 0 };

        let region =
            RegionMap::acquire(RegionId(7), FileId(3), path, extent, &NoMapBackend, true).unwrap();
        assert_eq!(region.origin(), RegionOrigin::Owned);
        assert_eq!(region.data(255, 257).unwrap(), &[255, 0]);
    }

    #[test]
    fn test_acquire_fails_when_both_strategies_fail() {
        let temp = TempDir::new().unwrap();
        let path = write_sample(&temp, 100);
        // Extent past end of file: the buffered read hits EOF
        let extent = Extent { begin: 0, end: 200, penalty: 0 };

        let err = RegionMap::acquire(RegionId(1), FileId(1), path, extent, &BufferedBackend, false)
            .unwrap_err();
        assert!(matches!(err, AtlasError::Acquire { begin: 0, end: 200, .. }));
    }

    #[test]
    fn test_refcount_and_clock() {
        let temp = TempDir::new().unwrap();
        let path = write_sample(&temp, 100);
        let extent = Extent { begin: 0, end: 100, penalty: 1 };
        let region =
            RegionMap::acquire(RegionId(1), FileId(1), path, extent, &BufferedBackend, false)
                .unwrap();

        assert!(!region.ret_ref());
        region.add_ref();
        region.add_ref();
        assert_eq!(region.refs(), 2);
        assert!(region.ret_ref());
        assert!(region.ret_ref());
        assert!(!region.ret_ref());
        assert_eq!(region.refs(), 0);

        assert_eq!(region.generation(10), 1);
        for _ in 0..20 {
            region.bump_clock(10);
        }
        assert_eq!(region.clock(), 10);
        assert_eq!(region.generation(10), 11);
    }
}
