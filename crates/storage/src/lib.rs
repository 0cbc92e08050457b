//! Storage layer for flashstore
//!
//! This crate holds the pieces that sit directly on the media:
//! - `MediaDriver`: byte-level read/write/erase over erase blocks
//! - `RamFlash`: an in-memory driver for both media modes
//! - `BlockDirectory`: the per-block table of object revisions
//! - `LookupCache`: small direct-mapped cache of directory locations
//! - `testing::FaultyMedia`: power-cut and bad-range injection

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod directory;
pub mod media;
pub mod testing;

pub use cache::{CacheStats, Location, LookupCache};
pub use directory::{BlockDirectory, DirEntry, NewEntry, Slot};
pub use media::{MediaDriver, MediaStatus, RamFlash};
