//! The atlas: every live region of every file, behind one lock.
//!
//! Lookups try the recent ring first, then the per-file range index. A miss
//! rounds the request, makes room under the memory bound if needed, acquires
//! a new region and registers it in every index. Released regions stay
//! resident until an eviction sweep reclaims them.
//!
//! ## Eviction
//!
//! A bounded sweep bumps the clock of every unreferenced region, then walks
//! generations from the lowest up, evicting unreferenced regions whose
//! generation is below the current threshold until resident bytes drop
//! under the target. A region's generation is its clock plus a bonus for
//! good alignment, so fresh irregular regions go first and long-lived,
//! slice-aligned ones go last. A full sweep (`reduce_to == 0`) evicts every
//! unreferenced region.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{create_backend, FileBackend};
use crate::file_table::{FileId, FileTable};
use crate::lease::{Lease, RegionBytes};
use crate::lock::LockHold;
use crate::pool::{Pool, PoolPtr};
use crate::region::{Extent, RegionId, RegionInfo, RegionMap, RegionOrigin};
use crate::{AtlasError, AtlasOptions, Result};

/// Point-in-time counters for an atlas
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtlasStats {
    /// Live regions
    pub regions: usize,
    /// Live regions backed by a mapped view
    pub mapped_regions: usize,
    /// Live regions backed by an owned buffer
    pub owned_regions: usize,
    /// Live regions with a non-zero reference count
    pub referenced_regions: usize,
    /// Sum of live region extents
    pub region_bytes: u64,
    /// Outstanding pool allocations
    pub pool_allocations: usize,
    /// Sum of outstanding pool allocation lengths
    pub pool_bytes: u64,
    /// Resident-byte counter (regions plus pool)
    pub resident_bytes: u64,
    /// Resident-byte budget
    pub memory_bound: u64,
    /// Files seen so far
    pub files: usize,
    /// Requests served by an existing region
    pub hits: u64,
    /// Requests that created a region
    pub misses: u64,
    /// Regions reclaimed by eviction
    pub evictions: u64,
}

pub(crate) struct AtlasState {
    files: FileTable,
    regions: HashMap<RegionId, Arc<RegionMap>>,
    by_range: BTreeMap<(FileId, u64, u64), RegionId>,
    by_address: BTreeMap<usize, RegionId>,
    recent: VecDeque<RegionId>,
    recent_slots: usize,
    pool: Pool,
    resident: u64,
    next_region: u64,
    pub(crate) hits: u64,
    misses: u64,
    evictions: u64,
}

impl AtlasState {
    fn new(recent_slots: usize) -> Self {
        Self {
            files: FileTable::new(),
            regions: HashMap::new(),
            by_range: BTreeMap::new(),
            by_address: BTreeMap::new(),
            recent: VecDeque::with_capacity(recent_slots),
            recent_slots,
            pool: Pool::default(),
            resident: 0,
            next_region: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn next_region_id(&mut self) -> RegionId {
        self.next_region += 1;
        RegionId(self.next_region)
    }

    fn touch_recent(&mut self, id: RegionId) {
        if let Some(pos) = self.recent.iter().position(|r| *r == id) {
            if pos == 0 {
                return;
            }
            self.recent.remove(pos);
        }
        self.recent.push_front(id);
        self.recent.truncate(self.recent_slots);
    }

    /// Find a live region holding `[begin, end)` of `file`.
    fn find(&mut self, file: FileId, begin: u64, end: u64) -> Option<Arc<RegionMap>> {
        let recent_hit = self.recent.iter().copied().find(|id| {
            self.regions
                .get(id)
                .is_some_and(|r| r.covers(file, begin, end))
        });

        // Entries at or before (file, begin) all start at or before `begin`
        let id = match recent_hit {
            Some(id) => id,
            None => self
                .by_range
                .range((file, 0, 0)..=(file, begin, u64::MAX))
                .rev()
                .find(|((_, _, region_end), _)| *region_end >= end)
                .map(|(_, id)| *id)?,
        };

        self.touch_recent(id);
        self.regions.get(&id).cloned()
    }

    /// Find the live region whose resident bytes contain `addr`.
    fn owner_of(&self, addr: usize) -> Option<RegionId> {
        let owns = |id: &RegionId| self.regions.get(id).is_some_and(|r| r.contains_addr(addr));

        if let Some(id) = self.recent.iter().copied().find(|id| owns(id)) {
            return Some(id);
        }

        self.by_address
            .range(..=addr)
            .next_back()
            .map(|(_, id)| *id)
            .filter(owns)
    }

    fn insert(&mut self, region: Arc<RegionMap>) {
        let id = region.id();
        let previous = self
            .by_range
            .insert((region.file(), region.begin(), region.end()), id);
        debug_assert!(
            previous.is_none(),
            "duplicate extent for {} [{}, {})",
            region.file(),
            region.begin(),
            region.end()
        );

        self.by_address.insert(region.base_addr(), id);
        self.resident += region.len();
        self.regions.insert(id, region);
        self.touch_recent(id);
    }

    fn evict(&mut self, id: RegionId) -> Option<Arc<RegionMap>> {
        let region = self.regions.remove(&id)?;

        self.by_range
            .remove(&(region.file(), region.begin(), region.end()));
        self.by_address.remove(&region.base_addr());
        self.recent.retain(|r| *r != id);
        self.resident -= region.len();
        self.evictions += 1;

        debug!(
            region = %id,
            path = %region.path().display(),
            begin = region.begin(),
            end = region.end(),
            clock = region.clock(),
            penalty = region.penalty(),
            "evicted region"
        );
        Some(region)
    }

    /// Evict unreferenced regions until resident bytes drop below `reduce_to`.
    fn collect(&mut self, reduce_to: u64, max_clock: u32) -> usize {
        self.recent.clear();

        if self.resident <= reduce_to {
            return 0;
        }

        let mut idle: Vec<Option<(RegionId, u32)>> = self
            .regions
            .values()
            .filter(|r| !r.in_use())
            .map(|r| {
                if reduce_to > 0 {
                    r.bump_clock(max_clock);
                }
                Some((r.id(), r.generation(max_clock)))
            })
            .collect();
        // Oldest region first within a generation
        idle.sort_unstable();

        let thresholds = if reduce_to == 0 {
            // One pass over every generation
            u32::MAX..=u32::MAX
        } else {
            let top = idle.iter().flatten().map(|(_, g)| *g).max().unwrap_or(0);
            1..=top + 1
        };

        let mut evicted = 0;
        for threshold in thresholds {
            for slot in idle.iter_mut() {
                let Some((id, generation)) = *slot else {
                    continue;
                };
                if generation >= threshold {
                    continue;
                }
                *slot = None;

                if self.regions.get(&id).is_some_and(|r| r.in_use()) {
                    continue;
                }
                if self.evict(id).is_some() {
                    evicted += 1;
                }
                if self.resident < reduce_to {
                    return evicted;
                }
            }
        }

        evicted
    }

    fn release(&mut self, bytes: RegionBytes) -> Result<()> {
        let id = bytes.region_id();
        if self.regions.contains_key(&id) {
            self.touch_recent(id);
        }

        if bytes.release() {
            Ok(())
        } else {
            error!(region = %id, "region released more often than acquired");
            Err(AtlasError::OverRelease { region: id })
        }
    }

    fn free_block(&mut self, addr: usize) -> Option<usize> {
        let len = self.pool.free(addr)?;
        debug_assert!(self.resident >= len as u64);
        self.resident -= len as u64;
        Some(len)
    }

    fn layout(&self) -> Vec<RegionInfo> {
        self.by_range
            .values()
            .filter_map(|id| self.regions.get(id))
            .map(|r| r.info())
            .collect()
    }

    fn stats(&self, memory_bound: u64) -> AtlasStats {
        let mut stats = AtlasStats {
            regions: self.regions.len(),
            pool_allocations: self.pool.len(),
            pool_bytes: self.pool.bytes(),
            resident_bytes: self.resident,
            memory_bound,
            files: self.files.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            ..AtlasStats::default()
        };

        for region in self.regions.values() {
            stats.region_bytes += region.len();
            match region.origin() {
                RegionOrigin::Mapped => stats.mapped_regions += 1,
                RegionOrigin::Owned => stats.owned_regions += 1,
            }
            if region.in_use() {
                stats.referenced_regions += 1;
            }
        }

        stats
    }
}

/// Process-wide cache of file regions.
///
/// Construct one per process (or per test) and share it by reference or
/// `Arc`; all state sits behind a single mutex reached through [`LockHold`].
pub struct Atlas {
    opts: AtlasOptions,
    backend: Box<dyn FileBackend>,
    pub(crate) state: Mutex<AtlasState>,
}

impl Atlas {
    /// Create an atlas with the backend selected by `opts.use_mmap`.
    pub fn new(opts: AtlasOptions) -> Result<Self> {
        let backend = create_backend(opts.use_mmap);
        Self::with_backend(opts, backend)
    }

    /// Create an atlas over an explicit backend.
    pub fn with_backend(opts: AtlasOptions, backend: Box<dyn FileBackend>) -> Result<Self> {
        opts.validate()?;
        debug!(
            backend = backend.name(),
            memory_bound = opts.memory_bound,
            large_slice = opts.large_slice,
            small_slice = opts.small_slice,
            "atlas created"
        );

        Ok(Self {
            state: Mutex::new(AtlasState::new(opts.recent_slots)),
            opts,
            backend,
        })
    }

    pub fn options(&self) -> &AtlasOptions {
        &self.opts
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// A fresh, unlocked hold on this atlas.
    pub fn hold(&self) -> LockHold<'_> {
        LockHold::new(self)
    }

    /// Length of `path`, checked against the address offset range.
    pub fn file_size<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        let path = path.as_ref();
        let length = self.backend.file_len(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => AtlasError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => AtlasError::Io(e),
        })?;

        if usize::try_from(length).is_err() {
            return Err(AtlasError::OffsetOverflow {
                path: path.to_path_buf(),
                length,
            });
        }
        Ok(length)
    }

    /// Pin bytes `[begin, end)` of `path`, reusing a resident region when one
    /// covers the range.
    #[instrument(skip(self, path, hold), fields(path = %path.as_ref().display()), level = "debug")]
    pub fn get_region<P: AsRef<Path>>(
        &self,
        path: P,
        begin: u64,
        end: u64,
        hold: &mut LockHold<'_>,
    ) -> Result<RegionBytes> {
        debug_assert!(hold.belongs_to(self), "lock hold from another atlas");
        self.acquire(hold.state(), path.as_ref(), begin, end)
    }

    /// Pin the whole of `path`. Large files trigger a full sweep first so the
    /// big mapping is less likely to fail on a fragmented address space.
    #[instrument(skip(self, path, hold), fields(path = %path.as_ref().display()), level = "debug")]
    pub fn get_file<P: AsRef<Path>>(&self, path: P, hold: &mut LockHold<'_>) -> Result<RegionBytes> {
        let path = path.as_ref();
        let length = self.file_size(path)?;

        if length > self.opts.whole_file_gc_threshold {
            self.garbage_collect(hold);
        }

        self.get_region(path, 0, length, hold)
    }

    /// Point `lease` at bytes `[begin, end)` of `path`, releasing whatever it
    /// held before. A lease already covering the range is left as is.
    pub fn lease_region<P: AsRef<Path>>(
        &self,
        lease: &mut Lease,
        path: P,
        begin: u64,
        end: u64,
        hold: &mut LockHold<'_>,
    ) -> Result<()> {
        debug_assert!(hold.belongs_to(self), "lock hold from another atlas");
        let path = path.as_ref();

        let state = hold.state();
        if lease.covers(path, begin, end) {
            return Ok(());
        }
        if let Some(previous) = lease.detach() {
            state.release(previous)?;
        }

        let bytes = self.acquire(state, path, begin, end)?;
        lease.attach(bytes);
        Ok(())
    }

    /// Point `lease` at the whole of `path`, returning the file length.
    pub fn lease_file<P: AsRef<Path>>(
        &self,
        lease: &mut Lease,
        path: P,
        hold: &mut LockHold<'_>,
    ) -> Result<u64> {
        let path = path.as_ref();
        let length = self.file_size(path)?;

        if length > self.opts.whole_file_gc_threshold {
            self.garbage_collect(hold);
        }

        self.lease_region(lease, path, 0, length, hold)?;
        Ok(length)
    }

    /// Give back bytes obtained from `get_region` or `get_file`.
    pub fn ret_region(&self, bytes: RegionBytes, hold: &mut LockHold<'_>) -> Result<()> {
        hold.state().release(bytes)
    }

    /// Release a lease under the lock, leaving it empty.
    pub fn ret_lease(&self, lease: &mut Lease, hold: &mut LockHold<'_>) -> Result<()> {
        match lease.detach() {
            Some(bytes) => hold.state().release(bytes),
            None => Ok(()),
        }
    }

    /// Release by address: the region containing `addr` loses one reference,
    /// or the pool allocation starting at `addr` is freed.
    ///
    /// Region addresses must come from [`RegionBytes::into_raw`]; a handle
    /// that is still alive releases its own reference on drop.
    pub fn ret_address(&self, addr: *const u8, hold: &mut LockHold<'_>) -> Result<()> {
        let addr = addr as usize;
        let state = hold.state();

        if let Some(id) = state.owner_of(addr) {
            state.touch_recent(id);
            let released = state.regions.get(&id).is_some_and(|r| r.ret_ref());
            if released {
                return Ok(());
            }
            error!(region = %id, addr, "region released more often than acquired");
            debug_assert!(false, "region released more often than acquired");
            return Err(AtlasError::OverRelease { region: id });
        }

        if state.free_block(addr).is_some() {
            return Ok(());
        }

        error!(addr, "address leak: release of an address the atlas never handed out");
        debug_assert!(false, "release of an address the atlas never handed out");
        Err(AtlasError::UnknownAddress { addr })
    }

    /// Allocate `len` zero-filled bytes outside any file mapping.
    pub fn alloc(&self, len: usize, hold: &mut LockHold<'_>) -> PoolPtr {
        let state = hold.state();
        let ptr = state.pool.alloc(len);
        state.resident += ptr.len() as u64;
        ptr
    }

    /// Free a pool allocation by its start address.
    pub fn free(&self, addr: *const u8, hold: &mut LockHold<'_>) -> Result<()> {
        let addr = addr as usize;
        match hold.state().free_block(addr) {
            Some(_) => Ok(()),
            None => {
                error!(addr, "free of an address the pool never allocated");
                debug_assert!(false, "free of an address the pool never allocated");
                Err(AtlasError::UnknownAddress { addr })
            }
        }
    }

    pub fn pool_slice<'h>(&self, ptr: PoolPtr, hold: &'h mut LockHold<'_>) -> Result<&'h [u8]> {
        hold.state()
            .pool
            .get(ptr.addr())
            .ok_or(AtlasError::UnknownAddress { addr: ptr.addr() })
    }

    pub fn pool_slice_mut<'h>(
        &self,
        ptr: PoolPtr,
        hold: &'h mut LockHold<'_>,
    ) -> Result<&'h mut [u8]> {
        hold.state()
            .pool
            .get_mut(ptr.addr())
            .ok_or(AtlasError::UnknownAddress { addr: ptr.addr() })
    }

    /// Full sweep: evict every unreferenced region.
    pub fn garbage_collect(&self, hold: &mut LockHold<'_>) -> usize {
        self.garbage_collect_to(0, hold)
    }

    /// Evict unreferenced regions until resident bytes drop below `reduce_to`.
    pub fn garbage_collect_to(&self, reduce_to: u64, hold: &mut LockHold<'_>) -> usize {
        let evicted = hold.state().collect(reduce_to, self.opts.max_clock);
        debug!(reduce_to, evicted, "garbage collection finished");
        evicted
    }

    pub fn resident_bytes(&self, hold: &mut LockHold<'_>) -> u64 {
        hold.state().resident
    }

    /// Snapshot of every live region, ordered by file then offset.
    pub fn layout(&self, hold: &mut LockHold<'_>) -> Vec<RegionInfo> {
        hold.state().layout()
    }

    /// Log every live region.
    pub fn show_layout(&self, hold: &mut LockHold<'_>) {
        let state = hold.state();
        info!(
            regions = state.regions.len(),
            resident = state.resident,
            "atlas layout"
        );
        for region in state.layout() {
            info!(
                region = %region.id,
                path = %region.path.display(),
                begin = region.begin,
                end = region.end,
                refs = region.refs,
                clock = region.clock,
                penalty = region.penalty,
                origin = ?region.origin,
                "  region"
            );
        }
    }

    pub fn stats(&self, hold: &mut LockHold<'_>) -> AtlasStats {
        hold.state().stats(self.opts.memory_bound)
    }

    fn acquire(
        &self,
        state: &mut AtlasState,
        path: &Path,
        begin: u64,
        end: u64,
    ) -> Result<RegionBytes> {
        if begin >= end {
            return Err(AtlasError::InvalidRange { begin, end });
        }

        let file = state.files.lookup_or_insert(path);

        if let Some(region) = state.find(file, begin, end) {
            region.add_ref();
            state.hits += 1;
            return Ok(RegionBytes::new(region, begin, end));
        }

        let file_len = self.file_size(path)?;
        if end > file_len {
            return Err(AtlasError::OutOfBounds {
                path: path.to_path_buf(),
                end,
                file_len,
            });
        }

        let mappable = self.opts.use_mmap && self.backend.can_map();
        let extent = Extent::round(begin, end, file_len, mappable, &self.opts);

        if state.resident.saturating_add(extent.len()) > self.opts.memory_bound {
            let target = self.opts.memory_bound.saturating_sub(extent.len());
            let evicted = state.collect(target, self.opts.max_clock);
            debug!(target, evicted, "made room for new region");
        }

        let shared_path = match state.files.path(file) {
            Some(p) => p.clone(),
            None => Arc::from(path),
        };
        let id = state.next_region_id();
        let region = Arc::new(RegionMap::acquire(
            id,
            file,
            shared_path,
            extent,
            self.backend.as_ref(),
            mappable,
        )?);

        region.add_ref();
        state.insert(region.clone());
        state.misses += 1;

        debug!(
            region = %id,
            begin = extent.begin,
            end = extent.end,
            penalty = extent.penalty,
            origin = ?region.origin(),
            resident = state.resident,
            "new region"
        );

        Ok(RegionBytes::new(region, begin, end))
    }
}

impl Drop for Atlas {
    fn drop(&mut self) {
        let max_clock = self.opts.max_clock;
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);

        state.collect(0, max_clock);

        if !state.regions.is_empty() {
            error!(
                regions = state.regions.len(),
                resident = state.resident,
                "atlas dropped with live references"
            );
            for region in state.layout() {
                error!(
                    path = %region.path.display(),
                    begin = region.begin,
                    end = region.end,
                    refs = region.refs,
                    "  live region"
                );
            }
            if !std::thread::panicking() {
                debug_assert!(false, "atlas dropped with live references");
            }
            return;
        }

        debug_assert_eq!(state.resident, state.pool.bytes());
        if state.pool.len() > 0 {
            warn!(
                allocations = state.pool.len(),
                bytes = state.pool.bytes(),
                "atlas dropped with outstanding pool allocations"
            );
        }
    }
}
