//! Log record stream
//!
//! `LogStream` mirrors the log area of every physical block in memory and
//! appends, zaps and updates records through the media driver. Sequence
//! numbers are store-wide and strictly increasing; on mount the stream
//! resumes after the highest sequence found on the media.

use crate::format::log_record::{commit_point_flags, flags_offset};
use crate::format::{LogPayload, LogRecord, LogRecordError};
use flashstore_core::{
    BlockLayout, MediaError, MediaMode, PhysicalBlock, StoreError, StoreResult, ERASED_BYTE,
    LOG_RECORD_SIZE,
};
use flashstore_storage::MediaDriver;

/// In-memory state of one log slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSlot {
    /// Never written since the last erase
    Erased,
    /// Zapped, torn, or otherwise unreadable
    Invalid,
    /// A valid record
    Valid(LogRecord),
}

/// Where a record was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef {
    /// Block holding the record
    pub physical: PhysicalBlock,
    /// Slot within the block's log area
    pub slot: u32,
    /// Sequence number assigned
    pub sequence: u32,
}

/// Append-only metadata log spread over every block's log area.
#[derive(Debug, Clone)]
pub struct LogStream {
    layout: BlockLayout,
    mode: MediaMode,
    blocks: Vec<Vec<LogSlot>>,
    next_sequence: u32,
}

impl LogStream {
    /// Stream with every slot erased, for a store that has not been scanned.
    pub fn empty(layout: BlockLayout, mode: MediaMode, block_count: u32) -> Self {
        LogStream {
            layout,
            mode,
            blocks: vec![vec![LogSlot::Erased; layout.log_slots() as usize]; block_count as usize],
            next_sequence: 1,
        }
    }

    /// Read every block's log area.
    pub fn scan<M: MediaDriver>(media: &M, layout: BlockLayout) -> Result<Self, MediaError> {
        let area = (layout.log_slots() * LOG_RECORD_SIZE) as usize;
        let mut raw = vec![0u8; area];
        let mut blocks = Vec::with_capacity(media.block_count() as usize);
        let mut highest: Option<u32> = None;

        for p in 0..media.block_count() {
            media.read(layout.block_base(PhysicalBlock(p as u16)), &mut raw)?;
            let slots: Vec<LogSlot> = raw
                .chunks_exact(LOG_RECORD_SIZE as usize)
                .map(|chunk| match LogRecord::from_bytes(chunk) {
                    Ok(record) => {
                        highest = Some(highest.map_or(record.sequence, |h| h.max(record.sequence)));
                        LogSlot::Valid(record)
                    }
                    Err(LogRecordError::Erased) => LogSlot::Erased,
                    Err(_) => LogSlot::Invalid,
                })
                .collect();
            blocks.push(slots);
        }

        Ok(LogStream {
            layout,
            mode: media.mode(),
            blocks,
            next_sequence: highest.map_or(1, |h| h.saturating_add(1)),
        })
    }

    /// Sequence number the next append will use.
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// True once every sequence number has been handed out. An all-ones
    /// sequence is never written.
    pub fn is_exhausted(&self) -> bool {
        self.next_sequence == u32::MAX
    }

    /// Start numbering from one again. Only valid once no record with a
    /// higher sequence can be compared against new ones.
    pub fn restart_sequence(&mut self) {
        self.next_sequence = 1;
    }

    /// Number of physical blocks covered.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Slot states of one block.
    pub fn slots(&self, physical: PhysicalBlock) -> &[LogSlot] {
        self.blocks
            .get(physical.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Valid records of one block with their slot numbers.
    pub fn records(&self, physical: PhysicalBlock) -> impl Iterator<Item = (u32, &LogRecord)> {
        self.slots(physical)
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                LogSlot::Valid(record) => Some((i as u32, record)),
                _ => None,
            })
    }

    /// Valid records of every block.
    pub fn all_records(&self) -> impl Iterator<Item = (PhysicalBlock, u32, &LogRecord)> {
        (0..self.blocks.len()).flat_map(move |p| {
            let physical = PhysicalBlock(p as u16);
            self.records(physical)
                .map(move |(slot, record)| (physical, slot, record))
        })
    }

    /// Slots that a valid record cannot be decoded from.
    pub fn invalid_slots(&self) -> usize {
        self.blocks
            .iter()
            .flatten()
            .filter(|s| matches!(s, LogSlot::Invalid))
            .count()
    }

    fn usable(&self, slot: &LogSlot) -> bool {
        match slot {
            LogSlot::Erased => true,
            // Rewritable media can program over a retired record
            LogSlot::Invalid => self.mode.rewrites_in_place(),
            LogSlot::Valid(_) => false,
        }
    }

    /// Slots an append could still use in this block.
    pub fn free_slots(&self, physical: PhysicalBlock) -> usize {
        self.slots(physical).iter().filter(|s| self.usable(s)).count()
    }

    /// Write a record into the first usable slot of `physical`.
    ///
    /// A slot that fails verification is skipped.
    ///
    /// # Errors
    ///
    /// - `StoreError::BlockFull` if the block's log has no usable slot left
    /// - `StoreError::NeedsFormat` once sequence numbers are exhausted
    pub fn append<M: MediaDriver>(
        &mut self,
        media: &mut M,
        physical: PhysicalBlock,
        payload: LogPayload,
        commit_point: bool,
    ) -> StoreResult<RecordRef> {
        if self.is_exhausted() {
            return Err(StoreError::NeedsFormat(
                "log sequence numbers exhausted".to_string(),
            ));
        }
        let count = self.slots(physical).len();
        for slot in 0..count {
            if !self.usable(&self.blocks[physical.index()][slot]) {
                continue;
            }
            let record = LogRecord {
                sequence: self.next_sequence,
                payload,
                commit_point,
            };
            self.next_sequence += 1;
            let addr = self.slot_address(physical, slot as u32);
            match media.write(addr, &record.to_bytes()) {
                Ok(()) => {
                    self.blocks[physical.index()][slot] = LogSlot::Valid(record);
                    return Ok(RecordRef {
                        physical,
                        slot: slot as u32,
                        sequence: record.sequence,
                    });
                }
                Err(MediaError::WriteVerify { .. }) => {
                    self.blocks[physical.index()][slot] = LogSlot::Invalid;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::BlockFull)
    }

    /// Retire a record.
    pub fn zap<M: MediaDriver>(
        &mut self,
        media: &mut M,
        physical: PhysicalBlock,
        slot: u32,
    ) -> StoreResult<()> {
        let addr = self.slot_address(physical, slot);
        let state = match self.mode {
            MediaMode::EraseBlock => {
                media.write(addr, &[0u8; 4])?;
                LogSlot::Invalid
            }
            MediaMode::Rewritable => {
                media.set(addr, LOG_RECORD_SIZE, ERASED_BYTE)?;
                LogSlot::Erased
            }
        };
        self.set_slot(physical, slot, state)
    }

    /// Program the commit-point bit of a marker in place.
    pub fn set_commit_point<M: MediaDriver>(
        &mut self,
        media: &mut M,
        physical: PhysicalBlock,
        slot: u32,
    ) -> StoreResult<()> {
        let mut record = match self.slots(physical).get(slot as usize) {
            Some(LogSlot::Valid(record)) => *record,
            _ => {
                return Err(StoreError::Corruption(format!(
                    "no marker at {} slot {}",
                    physical, slot
                )))
            }
        };
        let addr = self.slot_address(physical, slot) + flags_offset();
        media.write(addr, &[commit_point_flags()])?;
        record.commit_point = true;
        self.set_slot(physical, slot, LogSlot::Valid(record))
    }

    /// Forget a block's records after it has been erased.
    pub fn reset_block(&mut self, physical: PhysicalBlock) {
        if let Some(slots) = self.blocks.get_mut(physical.index()) {
            slots.iter_mut().for_each(|s| *s = LogSlot::Erased);
        }
    }

    fn set_slot(&mut self, physical: PhysicalBlock, slot: u32, state: LogSlot) -> StoreResult<()> {
        let target = self
            .blocks
            .get_mut(physical.index())
            .and_then(|slots| slots.get_mut(slot as usize))
            .ok_or_else(|| StoreError::Corruption(format!("{} has no log slot {}", physical, slot)))?;
        *target = state;
        Ok(())
    }

    fn slot_address(&self, physical: PhysicalBlock, slot: u32) -> u32 {
        self.layout.block_base(physical) + self.layout.log_slot_offset(slot)
    }
}
