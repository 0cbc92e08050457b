//! Erase block geometry
//!
//! # Block Layout
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ Log area                     │ log_slots × 32-byte records
//! ├──────────────────────────────┤ dir_offset
//! │ Directory area               │ dir_slots × 16-byte entries
//! ├──────────────────────────────┤ data_start
//! │ Object data (bump allocated) │
//! │ ...                          │
//! └──────────────────────────────┘ block_size
//! ```

use crate::error::{StoreError, StoreResult};
use crate::types::PhysicalBlock;

/// Size of one log record slot.
pub const LOG_RECORD_SIZE: u32 = 32;

/// Size of one directory entry slot.
pub const DIR_ENTRY_SIZE: u32 = 16;

/// Smallest supported erase block.
pub const MIN_BLOCK_SIZE: u32 = 4 * 1024;

/// Largest supported erase block.
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// Value of every byte after an erase.
pub const ERASED_BYTE: u8 = 0xFF;

/// Round up to the next multiple of 4.
pub fn align4(n: u32) -> u32 {
    (n + 3) & !3
}

/// Geometry of one erase block. Identical for every block in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    block_size: u32,
    log_slots: u32,
    dir_slots: u32,
}

impl BlockLayout {
    /// Derive the layout for a block size.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` unless `block_size` is a power of two
    /// between 4 KiB and 1 MiB.
    pub fn new(block_size: u32) -> StoreResult<Self> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(StoreError::Config(format!(
                "block size {} must be a power of two between {} and {}",
                block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        Ok(BlockLayout {
            block_size,
            log_slots: (block_size / 1024).clamp(16, 128),
            dir_slots: (block_size / 256).clamp(16, 1024),
        })
    }

    /// Bytes per erase block.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of log record slots at the start of the block.
    pub fn log_slots(&self) -> u32 {
        self.log_slots
    }

    /// Number of directory entry slots after the log.
    pub fn dir_slots(&self) -> u32 {
        self.dir_slots
    }

    /// Block-relative offset of a log slot.
    pub fn log_slot_offset(&self, slot: u32) -> u32 {
        slot * LOG_RECORD_SIZE
    }

    /// Block-relative offset of the directory area.
    pub fn dir_offset(&self) -> u32 {
        self.log_slots * LOG_RECORD_SIZE
    }

    /// Block-relative offset of a directory slot.
    pub fn dir_slot_offset(&self, slot: u32) -> u32 {
        self.dir_offset() + slot * DIR_ENTRY_SIZE
    }

    /// Block-relative offset where object data begins.
    pub fn data_start(&self) -> u32 {
        self.dir_offset() + self.dir_slots * DIR_ENTRY_SIZE
    }

    /// Largest object a single block can ever host.
    pub fn max_object_size(&self) -> u32 {
        self.block_size - self.data_start()
    }

    /// Absolute media address of a physical block.
    pub fn block_base(&self, physical: PhysicalBlock) -> u32 {
        physical.0 as u32 * self.block_size
    }
}
