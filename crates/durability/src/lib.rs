//! Durability layer for flashstore
//!
//! This crate owns the metadata log that lives at the head of every erase
//! block, and the replay logic that rebuilds block state from it on mount:
//!
//! - Log records: fixed 32-byte, checksummed, self-identifying
//! - `LogStream`: append/zap/commit-point over every block's log area
//! - `BlockTable`: logical ↔ physical binding, erase counts, reservations
//! - Recovery: three-pass replay into a `RecoveryPlan`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blocks;
pub mod format;
pub mod log;
pub mod recovery;

pub use blocks::{BlockTable, LogicalInfo, PhysicalInfo};
pub use format::{LogPayload, LogRecord, LogRecordError, RecordKind, LOG_MAGIC};
pub use log::{LogSlot, LogStream, RecordRef};
pub use recovery::{
    scan_erase_history, spare_is_clean, LogReplayer, MarkerState, RecoveryCoordinator,
    RecoveryPlan, ReplayStats, Replayed,
};
