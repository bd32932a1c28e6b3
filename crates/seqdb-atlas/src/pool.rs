//! Manual allocation pool.
//!
//! Zero-filled buffers handed out by the atlas outside any file mapping.
//! They count against the same resident budget as regions and are keyed by
//! their start address so pointer-style release can find them.

use std::collections::HashMap;

/// Opaque handle for a pool allocation: its address and length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolPtr {
    addr: usize,
    len: usize,
}

impl PoolPtr {
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.addr as *const u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Default)]
pub(crate) struct Pool {
    blocks: HashMap<usize, Box<[u8]>>,
    bytes: u64,
}

impl Pool {
    /// Allocate `len` zeroed bytes (at least one).
    pub(crate) fn alloc(&mut self, len: usize) -> PoolPtr {
        let len = len.max(1);
        let block = vec![0u8; len].into_boxed_slice();
        let addr = block.as_ptr() as usize;

        debug_assert!(!self.blocks.contains_key(&addr));
        self.blocks.insert(addr, block);
        self.bytes += len as u64;

        PoolPtr { addr, len }
    }

    /// Release the block starting at `addr`, returning its length.
    pub(crate) fn free(&mut self, addr: usize) -> Option<usize> {
        let block = self.blocks.remove(&addr)?;
        self.bytes -= block.len() as u64;
        Some(block.len())
    }

    pub(crate) fn get(&self, addr: usize) -> Option<&[u8]> {
        self.blocks.get(&addr).map(|b| &b[..])
    }

    pub(crate) fn get_mut(&mut self, addr: usize) -> Option<&mut [u8]> {
        self.blocks.get_mut(&addr).map(|b| &mut b[..])
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }
}
