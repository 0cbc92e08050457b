//! Flashstore - transactional object store for raw flash
//!
//! Flashstore keeps variable-sized objects in erase-block flash or
//! rewritable non-volatile memory and gives them all-or-nothing
//! transactions that survive power loss at any byte.
//!
//! # Quick Start
//!
//! ```ignore
//! use flashstore::{MediaMode, RamFlash, Store, StoreConfig};
//!
//! let media = RamFlash::new(MediaMode::EraseBlock, 64 * 1024, 4);
//! let mut store = Store::new(media, StoreConfig::default())?;
//! store.format()?;
//!
//! store.lock_store()?;
//! let id = store.new_object(5, Some(b"hello".as_slice()))?;
//! store.unlock_store()?; // commits
//!
//! assert_eq!(store.read(id, 0, 5)?, b"hello");
//! ```
//!
//! # Architecture
//!
//! - `flashstore-core`: ids, states, geometry and errors
//! - `flashstore-storage`: media drivers, block directories, lookup cache
//! - `flashstore-durability`: per-block logs, block table, mount-time replay
//! - `flashstore-engine`: the store, its transactions and allocator

pub use flashstore_core::{
    EntryFlags, LogicalBlock, MediaError, MediaMode, ObjectId, ObjectState, PhysicalBlock,
    StoreError, StoreResult,
};
pub use flashstore_engine::{
    Extent, MountState, RecoveryOutcome, SharedStore, Store, StoreConfig, WearStats,
    WriteProtectAction, WriteProtectEvent, CONFIG_FILE_NAME,
};
pub use flashstore_storage::{MediaDriver, MediaStatus, RamFlash};

/// Fault injection and crash-testing helpers.
pub mod testing {
    pub use flashstore_engine::testing::*;
    pub use flashstore_storage::testing::{FaultPolicy, FaultyMedia};
}
