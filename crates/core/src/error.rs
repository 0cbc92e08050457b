//! Error types for flashstore
//!
//! `MediaError` is what a media driver reports. `StoreError` is what the
//! store reports to its callers. We use `thiserror` for `Display` and
//! `Error` implementations.

use crate::types::ObjectId;
use std::io;
use thiserror::Error;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by a media driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// Bytes read back after programming differ from what was written.
    #[error("Write verify failed at {addr:#010x}")]
    WriteVerify {
        /// First address that failed verification
        addr: u32,
    },

    /// The media's write-protect switch is on.
    #[error("Media is write protected")]
    WriteProtected,

    /// The block containing `addr` is still erasing.
    #[error("Erase in progress at {addr:#010x}")]
    EraseInProgress {
        /// Address inside the busy block
        addr: u32,
    },

    /// Access beyond the end of the media.
    #[error("Access out of range: {len} bytes at {addr:#010x}")]
    OutOfRange {
        /// Start address
        addr: u32,
        /// Length of the access
        len: u32,
    },

    /// Power was lost; the media accepts no further operations.
    #[error("Power lost")]
    PowerLoss,
}

/// Error kinds reported by the object store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No live revision of the object exists.
    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// The id is zero, misaligned or outside the store.
    #[error("Bad object id: {0:#010x}")]
    BadObjectId(u32),

    /// `offset + len` runs past the end of the object.
    #[error("Access past end of object {id}: offset {offset} + len {len} > size {size}")]
    ObjectOverrun {
        /// Object accessed
        id: ObjectId,
        /// Requested offset
        offset: u32,
        /// Requested length
        len: u32,
        /// Current object size
        size: u32,
    },

    /// The object can never fit in a single block.
    #[error("Object of {size} bytes exceeds the maximum of {max}")]
    ObjectTooBig {
        /// Requested size
        size: u32,
        /// Largest size a block can host
        max: u32,
    },

    /// No block can be made to hold the allocation.
    #[error("Store is full")]
    StoreFull,

    /// One block has no room; retried internally against another block.
    #[error("Block is full")]
    BlockFull,

    /// The media is write protected.
    #[error("Store is write protected")]
    WriteProtected,

    /// The media is write protected while an interrupted transaction
    /// still needs to be repaired.
    #[error("Store is write protected and needs repair")]
    WriteProtectedNeedsRepair,

    /// A mutation was attempted without an open transaction.
    #[error("No transaction is open")]
    NotInTransaction,

    /// The media does not hold a usable store.
    #[error("Store needs format: {0}")]
    NeedsFormat(String),

    /// `mount` or `format` has not completed.
    #[error("Store is not mounted")]
    NotMounted,

    /// A media write failed verification; the range is burned until erased.
    #[error("Write error at {addr:#010x}")]
    WriteError {
        /// Address that failed
        addr: u32,
    },

    /// Erase did not finish within the poll limit.
    #[error("Erase in progress at {addr:#010x}")]
    EraseInProgress {
        /// Address inside the busy block
        addr: u32,
    },

    /// Any other media failure.
    #[error("Media error: {0}")]
    Media(MediaError),

    /// A logical block number outside the store or in the wrong state.
    #[error("Invalid block: {0}")]
    InvalidBlock(u16),

    /// Invalid configuration or geometry.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// In-memory and on-media state disagree.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// I/O error (config files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Errors the store recovers from by retrying elsewhere. These never
    /// reach a caller unless every alternative is exhausted.
    pub fn is_retryable_locally(&self) -> bool {
        matches!(self, StoreError::BlockFull | StoreError::WriteError { .. })
    }

    /// True if the media lost power; nothing more can be done on this mount.
    pub fn is_power_loss(&self) -> bool {
        matches!(self, StoreError::Media(MediaError::PowerLoss))
    }
}

impl From<MediaError> for StoreError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::WriteVerify { addr } => StoreError::WriteError { addr },
            MediaError::WriteProtected => StoreError::WriteProtected,
            MediaError::EraseInProgress { addr } => StoreError::EraseInProgress { addr },
            other => StoreError::Media(other),
        }
    }
}
