//! Path to file id table.
//!
//! Ids are handed out lazily, starting at 1, and never reused or removed.
//! Regions carry the id instead of the path so range lookups compare
//! integers.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Stable small integer naming one file for the lifetime of an atlas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub(crate) u32);

impl FileId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fid:{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct FileTable {
    ids: HashMap<Arc<Path>, FileId>,
    paths: Vec<Arc<Path>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the id for `path`, assigning the next one if the path is new.
    pub fn lookup_or_insert(&mut self, path: &Path) -> FileId {
        if let Some(id) = self.ids.get(path) {
            return *id;
        }

        let shared: Arc<Path> = Arc::from(path);
        self.paths.push(shared.clone());
        let id = FileId(self.paths.len() as u32);
        self.ids.insert(shared, id);
        id
    }

    /// Shared path for an id (the same allocation every region of the file points at).
    pub fn path(&self, id: FileId) -> Option<&Arc<Path>> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.paths.get(index)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
