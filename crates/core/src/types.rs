//! Addressing and lifecycle types
//!
//! Object ids are derived from the logical byte address an object occupied
//! when it was created. They stay valid for the object's whole life even
//! though later revisions and block migrations move its bytes around.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle for a stored object.
///
/// Always non-zero and 4-byte aligned. The store hands these out; callers
/// should treat the numeric value as meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u32);

impl ObjectId {
    /// Wrap a raw id value (no validation).
    pub const fn from_raw(raw: u32) -> Self {
        ObjectId(raw)
    }

    /// The raw 32-bit value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Non-zero and 4-byte aligned.
    pub fn is_well_formed(self) -> bool {
        self.0 != 0 && self.0 % 4 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:08x}", self.0)
    }
}

/// A fixed role in the store: "block N".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalBlock(pub u16);

impl LogicalBlock {
    /// Index into per-logical tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// An actual erase unit on the media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalBlock(pub u16);

impl PhysicalBlock {
    /// Index into per-physical tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PhysicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// How the media behaves when a programmed byte is written again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaMode {
    /// SRAM-like: any byte can be overwritten at any time.
    Rewritable,
    /// NOR-like: a programmed byte only returns to `0xFF` through a block erase.
    EraseBlock,
}

impl MediaMode {
    /// Whether bytes can be overwritten without an erase cycle.
    pub fn rewrites_in_place(self) -> bool {
        matches!(self, MediaMode::Rewritable)
    }
}

/// Lifecycle state of one directory entry (one revision of an object).
///
/// Stored in the low nibble of the entry's state byte. The numeric values are
/// part of the on-media format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ObjectState {
    /// Created in the open transaction, not yet committed.
    New = 1,
    /// The single committed revision.
    Stable = 2,
    /// A formerly stable revision waiting for its replacement to commit.
    Superseded = 3,
    /// Uncommitted replacement for a stable revision.
    Pending = 4,
    /// Marked for removal at the next commit.
    Deleting = 5,
    /// Scratch copy being populated; becomes `New` once published.
    CloningNew = 6,
    /// Scratch copy being populated; becomes `Pending` once published.
    CloningPending = 7,
}

impl ObjectState {
    /// Every state, in on-media order.
    pub const ALL: [ObjectState; 7] = [
        ObjectState::New,
        ObjectState::Stable,
        ObjectState::Superseded,
        ObjectState::Pending,
        ObjectState::Deleting,
        ObjectState::CloningNew,
        ObjectState::CloningPending,
    ];

    /// On-media encoding.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Decode the low nibble of a state byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte & 0x0F {
            1 => Some(ObjectState::New),
            2 => Some(ObjectState::Stable),
            3 => Some(ObjectState::Superseded),
            4 => Some(ObjectState::Pending),
            5 => Some(ObjectState::Deleting),
            6 => Some(ObjectState::CloningNew),
            7 => Some(ObjectState::CloningPending),
            _ => None,
        }
    }

    /// Scratch states that are never visible to readers.
    pub fn is_cloning(self) -> bool {
        matches!(self, ObjectState::CloningNew | ObjectState::CloningPending)
    }

    /// States a reader can see, in the order they shadow each other.
    pub fn visible() -> [ObjectState; 3] {
        [ObjectState::Pending, ObjectState::New, ObjectState::Stable]
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectState::New => "new",
            ObjectState::Stable => "stable",
            ObjectState::Superseded => "superseded",
            ObjectState::Pending => "pending",
            ObjectState::Deleting => "deleting",
            ObjectState::CloningNew => "cloning-new",
            ObjectState::CloningPending => "cloning-pending",
        };
        f.write_str(name)
    }
}

/// Flags packed into the high nibble of an entry's state byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntryFlags(u8);

impl EntryFlags {
    /// Revision belongs to a separate sub-transaction.
    pub const SEPARATE: EntryFlags = EntryFlags(0x10);
    /// A `Deleting` revision that was created in the same transaction,
    /// so rolling back removes it instead of restoring it.
    pub const BORN_IN_TXN: EntryFlags = EntryFlags(0x20);

    const MASK: u8 = 0xF0;

    /// No flags set.
    pub const fn empty() -> Self {
        EntryFlags(0)
    }

    /// Extract flags from a raw state byte, ignoring the state nibble.
    pub fn from_state_byte(byte: u8) -> Self {
        EntryFlags(byte & Self::MASK)
    }

    /// Raw high-nibble bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// True if every bit of `other` is set.
    pub fn contains(self, other: EntryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Copy with `other` set.
    #[must_use]
    pub fn with(self, other: EntryFlags) -> Self {
        EntryFlags(self.0 | other.0)
    }

    /// Copy with `other` cleared.
    #[must_use]
    pub fn without(self, other: EntryFlags) -> Self {
        EntryFlags(self.0 & !other.0)
    }

    /// Combine with a state into the on-media state byte.
    pub fn pack(self, state: ObjectState) -> u8 {
        self.0 | state.to_byte()
    }
}
