//! Caller-side handles on pinned region bytes.
//!
//! [`RegionBytes`] is what `Atlas::get_region` hands out: the requested
//! bytes plus a shared handle on the owning region. It holds one reference,
//! given back through `Atlas::ret_region` or, failing that, on drop. A handle
//! turned into a bare pointer with [`RegionBytes::into_raw`] keeps its
//! reference until `Atlas::ret_address` releases it.
//!
//! [`Lease`] wraps the same thing in a scope guard. It can be empty,
//! re-targeted by the atlas, released explicitly, and releases itself on drop.

use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use tracing::error;

use crate::region::{RegionId, RegionMap};

/// Pinned bytes `[begin, end)` of one file, backed by a live region
pub struct RegionBytes {
    region: Arc<RegionMap>,
    begin: u64,
    end: u64,
    armed: bool,
}

impl RegionBytes {
    /// The caller must already have taken the reference this handle owns.
    pub(crate) fn new(region: Arc<RegionMap>, begin: u64, end: u64) -> Self {
        debug_assert!(region.extent().contains(begin, end));
        Self {
            region,
            begin,
            end,
            armed: true,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.region.data(self.begin, self.end).unwrap_or(&[])
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.begin) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn region_id(&self) -> RegionId {
        self.region.id()
    }

    pub fn region(&self) -> &RegionMap {
        &self.region
    }

    /// Give up the handle but keep its reference. The region stays pinned
    /// until the returned address goes back through `Atlas::ret_address`.
    #[must_use = "the region stays pinned until the address is released"]
    pub fn into_raw(mut self) -> *const u8 {
        self.armed = false;
        self.as_ptr()
    }

    /// Give the reference back. Returns false if the region was not referenced.
    pub(crate) fn release(mut self) -> bool {
        self.armed = false;
        self.region.ret_ref()
    }
}

impl Drop for RegionBytes {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        if !self.region.ret_ref() {
            error!(region = %self.region.id(), "dropped bytes of an unreferenced region");
            if !std::thread::panicking() {
                debug_assert!(false, "dropped bytes of an unreferenced region");
            }
        }
    }
}

impl Deref for RegionBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for RegionBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for RegionBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionBytes")
            .field("region", &self.region.id())
            .field("path", &self.region.path())
            .field("begin", &self.begin)
            .field("end", &self.end)
            .finish()
    }
}

/// Scope guard over pinned region bytes.
///
/// Dropping an attached lease releases its reference without taking the
/// atlas lock: reference increments happen under the lock, decrements are
/// atomic, and eviction only reclaims regions it sees unreferenced while
/// holding the lock.
#[derive(Default)]
pub struct Lease {
    bytes: Option<RegionBytes>,
}

impl Lease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_none()
    }

    /// Whether this lease already exposes `[begin, end)`.
    pub fn contains(&self, begin: u64, end: u64) -> bool {
        self.bytes
            .as_ref()
            .is_some_and(|b| b.begin <= begin && end <= b.end)
    }

    /// Whether this lease already exposes `[begin, end)` of `path`.
    pub(crate) fn covers(&self, path: &Path, begin: u64, end: u64) -> bool {
        self.contains(begin, end)
            && self
                .bytes
                .as_ref()
                .is_some_and(|b| b.region.path() == path)
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_ref().map(RegionBytes::as_slice)
    }

    /// Bytes `[begin, end)` of the file, if this lease covers them.
    pub fn slice(&self, begin: u64, end: u64) -> Option<&[u8]> {
        if !self.contains(begin, end) {
            return None;
        }
        self.bytes.as_ref()?.region.data(begin, end)
    }

    pub fn begin(&self) -> Option<u64> {
        self.bytes.as_ref().map(|b| b.begin)
    }

    pub fn end(&self) -> Option<u64> {
        self.bytes.as_ref().map(|b| b.end)
    }

    pub fn region_id(&self) -> Option<RegionId> {
        self.bytes.as_ref().map(RegionBytes::region_id)
    }

    pub(crate) fn attach(&mut self, bytes: RegionBytes) {
        self.release();
        self.bytes = Some(bytes);
    }

    pub(crate) fn detach(&mut self) -> Option<RegionBytes> {
        self.bytes.take()
    }

    /// Release the region reference, leaving the lease empty. Idempotent.
    pub fn release(&mut self) {
        if let Some(bytes) = self.bytes.take() {
            let region = bytes.region_id();
            if !bytes.release() {
                error!(%region, "lease released an unreferenced region");
                debug_assert!(false, "lease released an unreferenced region");
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bytes {
            Some(bytes) => f.debug_tuple("Lease").field(bytes).finish(),
            None => f.write_str("Lease(empty)"),
        }
    }
}
