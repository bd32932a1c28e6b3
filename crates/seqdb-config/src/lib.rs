//! # seqdb-config
//!
//! Configuration management for the sequence database atlas.
//!
//! Loads configuration from:
//! 1. `~/.seqdb/atlas.toml` (global)
//! 2. `.seqdb/atlas.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use seqdb_atlas::{AtlasError, AtlasOptions, GIB, KIB, MIB};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, warn};

/// Environment override for `atlas.use_mmap`
pub const ENV_MMAP: &str = "SEQDB_ATLAS_MMAP";
/// Environment override for `atlas.memory_bound`
pub const ENV_MEMORY_BOUND: &str = "SEQDB_ATLAS_MEMORY_BOUND";

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "falling back to default atlas config");
        Config::default()
    }))
});

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(#[from] AtlasError),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub atlas: AtlasConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let project = Path::new(".seqdb/atlas.toml");
        let mut config = Self::load_from(global.as_deref(), Some(project))?;

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.atlas.validate()?;
        Ok(config)
    }

    /// Layer the given files (missing ones are skipped). Keys set in the
    /// project file replace the same keys from the global file.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        for path in [global, project].into_iter().flatten() {
            if path.exists() {
                debug!("Loading atlas config from {:?}", path);
                let contents = std::fs::read_to_string(path)?;
                let table: toml::Table = toml::from_str(&contents)?;
                merge_tables(&mut merged, table);
            }
        }

        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Global config path: ~/.seqdb/atlas.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".seqdb/atlas.toml"))
    }

    /// Apply environment variable overrides through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MMAP) {
            match parse_bool(&value) {
                Some(flag) => self.atlas.use_mmap = flag,
                None => warn!(var = ENV_MMAP, value = %value, "ignoring unparsable override"),
            }
        }
        if let Some(value) = lookup(ENV_MEMORY_BOUND) {
            match parse_size(&value) {
                Some(bytes) => self.atlas.memory_bound = bytes,
                None => warn!(var = ENV_MEMORY_BOUND, value = %value, "ignoring unparsable override"),
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(inner)) => {
                merge_tables(existing, inner);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Atlas tuning, in bytes unless noted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Try memory mapping before falling back to buffered reads
    pub use_mmap: bool,
    /// Resident-byte budget
    pub memory_bound: u64,
    /// Large alignment unit
    pub large_slice: u64,
    /// Small alignment unit
    pub small_slice: u64,
    /// Alignment when mapping is unavailable
    pub block_size: u64,
    /// Whole-file requests above this size sweep idle regions first
    pub whole_file_gc_threshold: u64,
    /// Most-recently-used ring size (entries)
    pub recent_slots: usize,
    /// Eviction clock cap (sweeps)
    pub max_clock: u32,
}

impl Default for AtlasConfig {
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

impl AtlasConfig {
    pub fn to_options(&self) -> AtlasOptions {
        AtlasOptions {
            use_mmap: self.use_mmap,
            memory_bound: self.memory_bound,
            large_slice: self.large_slice,
            small_slice: self.small_slice,
            block_size: self.block_size,
            whole_file_gc_threshold: self.whole_file_gc_threshold,
            recent_slots: self.recent_slots,
            max_clock: self.max_clock,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_options().validate()?;
        Ok(())
    }
}

impl From<&AtlasConfig> for AtlasOptions {
    fn from(config: &AtlasConfig) -> Self {
        config.to_options()
    }
}

/// Parse `0/1/true/false/yes/no/on/off` (case-insensitive).
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a byte count with an optional `K`/`M`/`G` suffix (binary units).
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => value.split_at(i),
        None => (value, ""),
    };
    let number: u64 = digits.parse().ok()?;

    let scale = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => KIB,
        "M" | "MB" | "MIB" => MIB,
        "G" | "GB" | "GIB" => GIB,
        _ => return None,
    };
    number.checked_mul(scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_matches_library() {
        let config = Config::default();
        assert_eq!(config.atlas.to_options(), AtlasOptions::default());
        assert!(config.atlas.validate().is_ok());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[atlas]"));
        assert!(toml_str.contains("use_mmap = true"));
        assert!(toml_str.contains("recent_slots = 8"));
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config: Config = toml::from_str("[atlas]\nmemory_bound = 4096\n").unwrap();
        assert_eq!(config.atlas.memory_bound, 4096);
        assert_eq!(config.atlas.small_slice, 8 * KIB);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [(ENV_MMAP, "off"), (ENV_MEMORY_BOUND, "64M")].into();
        let mut config = Config::default();
        config.apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert!(!config.atlas.use_mmap);
        assert_eq!(config.atlas.memory_bound, 64 * MIB);

        // Garbage is ignored
        let mut config = Config::default();
        config.apply_env_overrides(|k| (k == ENV_MEMORY_BOUND).then(|| "lots".to_string()));
        assert_eq!(config.atlas.memory_bound, GIB);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("8K"), Some(8 * KIB));
        assert_eq!(parse_size("256 MiB"), Some(256 * MIB));
        assert_eq!(parse_size("2g"), Some(2 * GIB));
        assert_eq!(parse_size("12X"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("FALSE"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_invalid_units_rejected() {
        let config = AtlasConfig {
            small_slice: 0,
            ..AtlasConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
