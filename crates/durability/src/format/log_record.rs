//! Log record format.
//!
//! Each erase block begins with an array of fixed-size log slots. A record
//! binds a logical block to a physical one, records an erase, reserves a
//! logical block, or marks the single in-flight transaction.
//!
//! # Record Layout
//!
//! ```text
//! ┌────────────┬──────────┬───────────┬──────────┬──────────────┬──────────────┬───────────┐
//! │ Magic (4)  │ Kind (1) │ Flags (1) │ 0 (2)    │ Sequence (4) │ Payload (16) │ CRC32 (4) │
//! └────────────┴──────────┴───────────┴──────────┴──────────────┴──────────────┴───────────┘
//! ```
//!
//! The CRC covers every byte before it except `Flags`, so the commit-point
//! bit of a transaction marker can be programmed in place with a single byte
//! write without invalidating the record.
//!
//! Payloads:
//!
//! ```text
//! marker:    nonce u32 | created i64 | 0 (4)
//! identity:  logical u16 | physical u16 | nonce u32 | created i64
//! erase:     physical u16 | 0 (2) | erase_count u32 | erased_at i64
//! reserved:  logical u16 | 0 (14)
//! ```
//!
//! A slot reads as erased (all `0xFF`), zapped (magic cleared), corrupt, or
//! valid. Zapping is how records are retired; they are never rewritten.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use flashstore_core::{LogicalBlock, PhysicalBlock, ERASED_BYTE, LOG_RECORD_SIZE};

/// Magic bytes identifying a log record: "FLOG"
pub const LOG_MAGIC: [u8; 4] = *b"FLOG";

const SIZE: usize = LOG_RECORD_SIZE as usize;
const FLAGS_OFFSET: usize = 5;
const COMMIT_POINT_BIT: u8 = 0x01;

/// Offset of the flags byte within a record, for in-place updates.
pub const fn flags_offset() -> u32 {
    FLAGS_OFFSET as u32
}

/// Flags byte value once the commit point has been reached.
pub const fn commit_point_flags() -> u8 {
    ERASED_BYTE & !COMMIT_POINT_BIT
}

/// Record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Global transaction marker (no block payload)
    Marker = 0,
    /// Logical → physical binding
    BlockIdentity = 1,
    /// A physical block was erased
    EraseEvent = 2,
    /// A logical block is reserved and never allocated from
    ReservedBlock = 3,
}

impl RecordKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(RecordKind::Marker),
            1 => Some(RecordKind::BlockIdentity),
            2 => Some(RecordKind::EraseEvent),
            3 => Some(RecordKind::ReservedBlock),
            _ => None,
        }
    }
}

/// Type-specific record contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPayload {
    /// Start of the in-flight transaction.
    TransactionMarker {
        /// Random value distinguishing markers with equal sequence numbers
        nonce: u32,
        /// Unix seconds
        created: i64,
    },
    /// `logical` is served by `physical`.
    BlockIdentity {
        /// Logical role
        logical: LogicalBlock,
        /// Erase unit fulfilling it
        physical: PhysicalBlock,
        /// Random value identifying this binding
        nonce: u32,
        /// Unix seconds
        created: i64,
    },
    /// `physical` was erased for the `erase_count`-th time.
    EraseEvent {
        /// Block erased
        physical: PhysicalBlock,
        /// Total erases including this one
        erase_count: u32,
        /// Unix seconds
        erased_at: i64,
    },
    /// `logical` is reserved.
    ReservedBlock {
        /// Reserved logical block
        logical: LogicalBlock,
    },
}

impl LogPayload {
    /// Fresh transaction marker.
    pub fn marker() -> Self {
        LogPayload::TransactionMarker {
            nonce: rand::random(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    /// Fresh identity record.
    pub fn identity(logical: LogicalBlock, physical: PhysicalBlock) -> Self {
        LogPayload::BlockIdentity {
            logical,
            physical,
            nonce: rand::random(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    /// Erase record stamped now.
    pub fn erase(physical: PhysicalBlock, erase_count: u32) -> Self {
        LogPayload::EraseEvent {
            physical,
            erase_count,
            erased_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Record type tag.
    pub fn kind(&self) -> RecordKind {
        match self {
            LogPayload::TransactionMarker { .. } => RecordKind::Marker,
            LogPayload::BlockIdentity { .. } => RecordKind::BlockIdentity,
            LogPayload::EraseEvent { .. } => RecordKind::EraseEvent,
            LogPayload::ReservedBlock { .. } => RecordKind::ReservedBlock,
        }
    }

    fn encode_into(&self, out: &mut [u8]) {
        match *self {
            LogPayload::TransactionMarker { nonce, created } => {
                LittleEndian::write_u32(&mut out[0..4], nonce);
                LittleEndian::write_i64(&mut out[4..12], created);
            }
            LogPayload::BlockIdentity {
                logical,
                physical,
                nonce,
                created,
            } => {
                LittleEndian::write_u16(&mut out[0..2], logical.0);
                LittleEndian::write_u16(&mut out[2..4], physical.0);
                LittleEndian::write_u32(&mut out[4..8], nonce);
                LittleEndian::write_i64(&mut out[8..16], created);
            }
            LogPayload::EraseEvent {
                physical,
                erase_count,
                erased_at,
            } => {
                LittleEndian::write_u16(&mut out[0..2], physical.0);
                LittleEndian::write_u32(&mut out[4..8], erase_count);
                LittleEndian::write_i64(&mut out[8..16], erased_at);
            }
            LogPayload::ReservedBlock { logical } => {
                LittleEndian::write_u16(&mut out[0..2], logical.0);
            }
        }
    }

    fn decode(kind: RecordKind, bytes: &[u8]) -> Self {
        match kind {
            RecordKind::Marker => LogPayload::TransactionMarker {
                nonce: LittleEndian::read_u32(&bytes[0..4]),
                created: LittleEndian::read_i64(&bytes[4..12]),
            },
            RecordKind::BlockIdentity => LogPayload::BlockIdentity {
                logical: LogicalBlock(LittleEndian::read_u16(&bytes[0..2])),
                physical: PhysicalBlock(LittleEndian::read_u16(&bytes[2..4])),
                nonce: LittleEndian::read_u32(&bytes[4..8]),
                created: LittleEndian::read_i64(&bytes[8..16]),
            },
            RecordKind::EraseEvent => LogPayload::EraseEvent {
                physical: PhysicalBlock(LittleEndian::read_u16(&bytes[0..2])),
                erase_count: LittleEndian::read_u32(&bytes[4..8]),
                erased_at: LittleEndian::read_i64(&bytes[8..16]),
            },
            RecordKind::ReservedBlock => LogPayload::ReservedBlock {
                logical: LogicalBlock(LittleEndian::read_u16(&bytes[0..2])),
            },
        }
    }
}

/// A decoded log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    /// Store-wide monotonic sequence number
    pub sequence: u32,
    /// Type-specific contents
    pub payload: LogPayload,
    /// Commit point reached (meaningful for markers only)
    pub commit_point: bool,
}

impl LogRecord {
    /// Create a record; the commit point starts cleared.
    pub fn new(sequence: u32, payload: LogPayload) -> Self {
        LogRecord {
            sequence,
            payload,
            commit_point: false,
        }
    }

    /// Serialize to a 32-byte slot image.
    pub fn to_bytes(&self) -> [u8; SIZE] {
        let mut bytes = [0u8; SIZE];
        bytes[0..4].copy_from_slice(&LOG_MAGIC);
        bytes[4] = self.payload.kind() as u8;
        bytes[FLAGS_OFFSET] = if self.commit_point {
            commit_point_flags()
        } else {
            ERASED_BYTE
        };
        LittleEndian::write_u32(&mut bytes[8..12], self.sequence);
        self.payload.encode_into(&mut bytes[12..28]);
        let crc = compute_crc(&bytes);
        LittleEndian::write_u32(&mut bytes[28..32], crc);
        bytes
    }

    /// Decode a slot image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LogRecordError> {
        if bytes.len() < SIZE {
            return Err(LogRecordError::InsufficientData);
        }
        let bytes = &bytes[..SIZE];
        if bytes.iter().all(|&b| b == ERASED_BYTE) {
            return Err(LogRecordError::Erased);
        }
        if bytes[0..4] == [0, 0, 0, 0] {
            return Err(LogRecordError::Zapped);
        }
        if bytes[0..4] != LOG_MAGIC {
            return Err(LogRecordError::BadMagic);
        }
        let expected = LittleEndian::read_u32(&bytes[28..32]);
        let computed = compute_crc(bytes);
        if expected != computed {
            return Err(LogRecordError::ChecksumMismatch { expected, computed });
        }
        let kind = RecordKind::from_byte(bytes[4]).ok_or(LogRecordError::UnknownKind(bytes[4]))?;
        Ok(LogRecord {
            sequence: LittleEndian::read_u32(&bytes[8..12]),
            payload: LogPayload::decode(kind, &bytes[12..28]),
            commit_point: bytes[FLAGS_OFFSET] & COMMIT_POINT_BIT == 0,
        })
    }
}

/// CRC32 over the record minus its flags byte and the CRC itself.
fn compute_crc(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&bytes[0..FLAGS_OFFSET]);
    hasher.update(&bytes[FLAGS_OFFSET + 1..28]);
    hasher.finalize()
}

/// Log slot decoding outcomes other than a valid record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogRecordError {
    /// Slot was never written since the last erase
    #[error("Log slot is erased")]
    Erased,

    /// Record was retired
    #[error("Log record was zapped")]
    Zapped,

    /// Not a log record (or a torn zap)
    #[error("Bad log record magic")]
    BadMagic,

    /// Torn or corrupted record
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Stored checksum
        expected: u32,
        /// Computed checksum
        computed: u32,
    },

    /// Kind byte not understood
    #[error("Unknown record kind: {0}")]
    UnknownKind(u8),

    /// Fewer than 32 bytes supplied
    #[error("Insufficient data to parse record")]
    InsufficientData,
}
