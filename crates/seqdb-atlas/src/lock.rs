//! Idempotent lock token for the atlas state.
//!
//! A [`LockHold`] is created unlocked and passed by `&mut` through a call
//! chain. `lock` acquires the atlas mutex only if this hold does not already
//! own it; `unlock` releases it only if it does. Dropping the hold unlocks.
//!
//! Two holds on the same thread for the same atlas deadlock when both lock,
//! so a call chain should create exactly one and thread it down.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::atlas::{Atlas, AtlasState};

pub struct LockHold<'a> {
    atlas: &'a Atlas,
    guard: Option<MutexGuard<'a, AtlasState>>,
}

// Region data is immutable once acquired and every state mutation completes
// before the guard is released, so a poisoned lock still guards consistent data.
fn lock_state(mutex: &Mutex<AtlasState>) -> MutexGuard<'_, AtlasState> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<'a> LockHold<'a> {
    pub fn new(atlas: &'a Atlas) -> Self {
        Self { atlas, guard: None }
    }

    /// Acquire the atlas lock unless this hold already owns it.
    pub fn lock(&mut self) {
        if self.guard.is_none() {
            self.guard = Some(lock_state(&self.atlas.state));
        }
    }

    /// Release the atlas lock if this hold owns it.
    pub fn unlock(&mut self) {
        self.guard = None;
    }

    pub fn is_locked(&self) -> bool {
        self.guard.is_some()
    }

    pub(crate) fn belongs_to(&self, atlas: &Atlas) -> bool {
        std::ptr::eq(self.atlas, atlas)
    }

    /// Locked view of the atlas state, locking first if needed.
    pub(crate) fn state(&mut self) -> &mut AtlasState {
        let atlas = self.atlas;
        &mut **self.guard.get_or_insert_with(|| lock_state(&atlas.state))
    }
}

impl fmt::Debug for LockHold<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHold")
            .field("locked", &self.is_locked())
            .finish()
    }
}
