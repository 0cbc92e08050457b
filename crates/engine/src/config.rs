//! Store configuration via `flashstore.toml`
//!
//! Every field has a default, so an empty file (or no file at all) gives a
//! working store. Geometry comes from the media driver, not from here.

use flashstore_core::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name used next to a store image.
pub const CONFIG_FILE_NAME: &str = "flashstore.toml";

/// Tuning knobs for a store, loaded from `flashstore.toml`.
///
/// # Example
///
/// ```toml
/// # Spare erase blocks kept for migration (erase-block media only)
/// spare_blocks = 1
///
/// # Migrations tried before an allocation reports StoreFull
/// max_migration_attempts = 20
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Spare erase blocks kept unbound on erase-block media (at least 1).
    #[serde(default = "default_spare_blocks")]
    pub spare_blocks: u32,
    /// Wear-leveling migrations tried before `StoreFull`.
    #[serde(default = "default_max_migration_attempts")]
    pub max_migration_attempts: u32,
    /// Erases a spare may run ahead of the average before the least-worn
    /// bound block is moved onto it.
    #[serde(default = "default_wear_leveling_margin")]
    pub wear_leveling_margin: u32,
    /// Object ids tracked per transaction before falling back to a full scan.
    #[serde(default = "default_tracker_capacity")]
    pub tracker_capacity: usize,
    /// Lookup cache lines. Zero disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Fresh locations tried after a failed data write.
    #[serde(default = "default_write_retry_limit")]
    pub write_retry_limit: u32,
    /// Status polls to wait for an erase before `EraseInProgress`, and
    /// write-protect checks when no hook is installed.
    #[serde(default = "default_erase_poll_limit")]
    pub erase_poll_limit: u32,
    /// Size of the root object created by `format`.
    #[serde(default = "default_root_object_size")]
    pub root_object_size: u32,
}

fn default_spare_blocks() -> u32 {
    1
}

fn default_max_migration_attempts() -> u32 {
    20
}

fn default_wear_leveling_margin() -> u32 {
    16
}

fn default_tracker_capacity() -> usize {
    64
}

fn default_cache_capacity() -> usize {
    32
}

fn default_write_retry_limit() -> u32 {
    8
}

fn default_erase_poll_limit() -> u32 {
    1_000_000
}

fn default_root_object_size() -> u32 {
    32
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            spare_blocks: default_spare_blocks(),
            max_migration_attempts: default_max_migration_attempts(),
            wear_leveling_margin: default_wear_leveling_margin(),
            tracker_capacity: default_tracker_capacity(),
            cache_capacity: default_cache_capacity(),
            write_retry_limit: default_write_retry_limit(),
            erase_poll_limit: default_erase_poll_limit(),
            root_object_size: default_root_object_size(),
        }
    }
}

impl StoreConfig {
    /// Small limits that make fallback paths easy to hit in tests.
    pub fn for_testing() -> Self {
        Self {
            tracker_capacity: 4,
            cache_capacity: 8,
            erase_poll_limit: 1_000,
            ..Self::default()
        }
    }

    /// Set the number of spare blocks.
    pub fn with_spare_blocks(mut self, spares: u32) -> Self {
        self.spare_blocks = spares;
        self
    }

    /// Set the migration bound.
    pub fn with_max_migration_attempts(mut self, attempts: u32) -> Self {
        self.max_migration_attempts = attempts;
        self
    }

    /// Set the static wear-leveling margin.
    pub fn with_wear_leveling_margin(mut self, margin: u32) -> Self {
        self.wear_leveling_margin = margin;
        self
    }

    /// Set the transaction tracker capacity.
    pub fn with_tracker_capacity(mut self, capacity: usize) -> Self {
        self.tracker_capacity = capacity;
        self
    }

    /// Set the lookup cache capacity.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the write retry limit.
    pub fn with_write_retry_limit(mut self, limit: u32) -> Self {
        self.write_retry_limit = limit;
        self
    }

    /// Set the erase and write-protect poll limit.
    pub fn with_erase_poll_limit(mut self, limit: u32) -> Self {
        self.erase_poll_limit = limit;
        self
    }

    /// Set the root object size.
    pub fn with_root_object_size(mut self, size: u32) -> Self {
        self.root_object_size = size;
        self
    }

    /// Check the values are usable.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` naming the first bad field.
    pub fn validate(&self) -> StoreResult<()> {
        if self.spare_blocks == 0 {
            return Err(StoreError::Config(
                "spare_blocks must be at least 1".to_string(),
            ));
        }
        if self.erase_poll_limit == 0 {
            return Err(StoreError::Config(
                "erase_poll_limit must be at least 1".to_string(),
            ));
        }
        if self.root_object_size == 0 {
            return Err(StoreError::Config(
                "root_object_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# flashstore configuration
#
# Spare erase blocks kept unbound for wear-leveling migration.
# Only used on erase-block (flash) media; rewritable media keep none.
spare_blocks = 1

# Migrations tried before an allocation gives up with StoreFull.
max_migration_attempts = 20

# Erases a spare block may run ahead of the average before the least-worn
# block in use is moved onto it, freeing a fresh unit for the busy data.
wear_leveling_margin = 16

# Object ids tracked per transaction. Past this, commit and abort scan
# every object instead.
tracker_capacity = 64

# Lookup cache lines (0 disables the cache).
cache_capacity = 32

# Fresh locations tried after a data write fails verification.
write_retry_limit = 8

# Status polls to wait for an erase to finish. Also bounds the wait for
# write protection to clear when no write-protect hook is installed.
erase_poll_limit = 1000000

# Size in bytes of the root object created by format.
root_object_size = 32
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StoreConfig = toml::from_str(&content).map_err(|e| {
            StoreError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> StoreResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> StoreResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StoreError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
