//! Store engine for flashstore
//!
//! This crate ties the lower layers together:
//! - Store: mount, format, object operations and wear levelling
//! - Transactions: lock nesting, commit and abort, separate sub-transactions
//! - Recovery integration: settling interrupted transactions on mount
//! - SharedStore: a thread-safe handle around one store
//!
//! The engine is the only component that knows about:
//! - Block allocation and reclamation
//! - Cross-layer coordination (directories + block logs + recovery)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod shared;
pub mod store;
pub mod testing;

pub use config::{StoreConfig, CONFIG_FILE_NAME};
pub use shared::SharedStore;
pub use store::{
    Extent, MountState, RecoveryOutcome, Store, WearStats, WriteProtectAction, WriteProtectEvent,
};
