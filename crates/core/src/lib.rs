//! Core types for flashstore
//!
//! This crate defines the vocabulary shared by every other layer:
//!
//! - `ObjectId`, `LogicalBlock`, `PhysicalBlock`: addressing
//! - `ObjectState`, `EntryFlags`: the per-revision lifecycle byte
//! - `MediaMode`: rewritable vs erase-block media
//! - `BlockLayout`: how an erase block is split into log, directory and data
//! - `StoreError` / `MediaError`: the error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod layout;
pub mod types;

pub use error::{MediaError, StoreError, StoreResult};
pub use layout::{
    align4, BlockLayout, DIR_ENTRY_SIZE, ERASED_BYTE, LOG_RECORD_SIZE, MAX_BLOCK_SIZE,
    MIN_BLOCK_SIZE,
};
pub use types::{EntryFlags, LogicalBlock, MediaMode, ObjectId, ObjectState, PhysicalBlock};
