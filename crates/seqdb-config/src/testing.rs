//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary data directory with generated database volumes
//! - A project directory for `.seqdb/atlas.toml`
//!
//! # Usage
//!
//! ```ignore
//! use seqdb_config::testing::{pattern_byte, TestEnvironment};
//!
//! let env = TestEnvironment::new()?;
//! let volume = env.create_volume("nr.00.psq", 4 * 1024 * 1024)?;
//! // byte at offset `i` is `pattern_byte(i)`
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Byte stored at `offset` in every generated volume
pub fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Isolated test environment with its own data and project directories
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Generated database volumes live here
    pub data_dir: PathBuf,
    /// Project root for the test (holds `.seqdb/`)
    pub project_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let data_dir = root.join(format!("data-{}", test_id));
        let project_root = root.join("project");

        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(project_root.join(".seqdb"))?;

        Ok(Self {
            _temp_dir: temp_dir,
            data_dir,
            project_root,
            test_id,
        })
    }

    /// Write a volume of `len` pattern bytes (see [`pattern_byte`])
    pub fn create_volume(&self, name: &str, len: u64) -> anyhow::Result<PathBuf> {
        let data: Vec<u8> = (0..len).map(pattern_byte).collect();
        self.create_file(name, &data)
    }

    /// Write a file with the given contents into the data directory
    pub fn create_file(&self, name: &str, contents: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.data_dir.join(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Project config path: `<project>/.seqdb/atlas.toml`
    pub fn project_config_path(&self) -> PathBuf {
        self.project_root.join(".seqdb").join("atlas.toml")
    }

    /// Write the project config file
    pub fn write_project_config(&self, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.project_config_path();
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environments_are_isolated() {
        let a = TestEnvironment::new().unwrap();
        let b = TestEnvironment::new().unwrap();
        assert_ne!(a.test_id, b.test_id);
        assert_ne!(a.data_dir, b.data_dir);
        assert!(a.project_root.join(".seqdb").is_dir());
    }

    #[test]
    fn test_create_volume() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_volume("vol.psq", 1_000).unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 1_000);
        assert_eq!(data[300], pattern_byte(300));
    }
}
