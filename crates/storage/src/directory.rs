//! Per-block object directory
//!
//! Every erase block carries a fixed array of 16-byte directory entries
//! between its log area and its data area. Each live entry describes one
//! revision of one object: its id, where its bytes live inside the block,
//! its size, and its lifecycle state.
//!
//! # Entry Layout
//!
//! ```text
//! ┌──────────┬────────────┬──────────┬───────────┬──────┬───────────┬──────────┐
//! │ Id (4)   │ Offset (4) │ Size (4) │ State (1) │ 0 (1)│ Check (1) │ Live (1) │
//! └──────────┴────────────┴──────────┴───────────┴──────┴───────────┴──────────┘
//! ```
//!
//! `Check` is the low byte of the CRC-32 of the first 12 bytes. The state
//! byte sits outside the check so that rewritable media can change a
//! revision's state with a single byte write. `Live` is `0xFF` for a live
//! entry and `0x00` once killed. A slot whose 16 bytes are all `0xFF` is free.
//!
//! On erase-block media a state change appends a copy of the entry in a free
//! slot and then kills the original, so a crash between the two steps leaves
//! two live entries with the same id and offset. `load` keeps the later slot.
//! In-place compaction on rewritable media moves a revision the same way:
//! its bytes are copied to an unused range, the moved entry is published in
//! a free slot and only then is the old slot killed. A crash in between
//! leaves two identical revisions at different offsets, and `load` again
//! keeps one of them.
//!
//! The in-memory directory is an arena indexed by slot number; callers hold
//! slot indices, never references into the media.

use crate::media::MediaDriver;
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use flashstore_core::{
    align4, BlockLayout, EntryFlags, MediaError, MediaMode, ObjectId, ObjectState,
    PhysicalBlock, StoreError, StoreResult, DIR_ENTRY_SIZE, ERASED_BYTE,
};
use tracing::debug;

const LIVE: u8 = 0xFF;
const DEAD: u8 = 0x00;
/// Slots a new entry must leave free: the next state re-append on
/// erase-block media, the next compaction move on rewritable media.
const KEPT_SLOTS: u32 = 1;

/// One revision of an object as recorded in a directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    /// Object this revision belongs to
    pub id: ObjectId,
    /// Block-relative offset of the object's bytes
    pub offset: u32,
    /// Object size in bytes
    pub size: u32,
    /// Lifecycle state
    pub state: ObjectState,
    /// Separate / born-in-transaction flags
    pub flags: EntryFlags,
}

impl DirEntry {
    /// Block-relative end of the (4-byte aligned) data extent.
    pub fn end(&self) -> u32 {
        self.offset + align4(self.size)
    }

    /// True if both entries describe the same revision: a copy left by an
    /// interrupted state change (same extent) or relocation (same state).
    ///
    /// A store never holds two revisions of one object in the same state,
    /// so either case is a leftover.
    pub fn duplicates(&self, other: &DirEntry) -> bool {
        self.id == other.id
            && (self.offset == other.offset
                || (self.state == other.state
                    && self.flags == other.flags
                    && self.size == other.size))
    }

    /// Serialize to the 16-byte on-media form.
    pub fn encode(&self) -> [u8; DIR_ENTRY_SIZE as usize] {
        let mut bytes = [0u8; DIR_ENTRY_SIZE as usize];
        LittleEndian::write_u32(&mut bytes[0..4], self.id.as_u32());
        LittleEndian::write_u32(&mut bytes[4..8], self.offset);
        LittleEndian::write_u32(&mut bytes[8..12], self.size);
        bytes[12] = self.flags.pack(self.state);
        bytes[13] = 0;
        bytes[14] = check_byte(&bytes[0..12]);
        bytes[15] = LIVE;
        bytes
    }
}

fn check_byte(bytes: &[u8]) -> u8 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    (hasher.finalize() & 0xFF) as u8
}

/// Contents of one directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Never written since the last erase (or cleared on rewritable media)
    Free,
    /// Killed, torn or unreadable; space is reclaimed by compaction
    Dead,
    /// A live revision
    Live(DirEntry),
}

/// How a raw slot decodes, including the extent of killed entries so that
/// their bytes are never handed out again before an erase.
enum Decoded {
    Free,
    Garbage,
    Killed { end: u32 },
    Live(DirEntry),
}

fn decode_slot(bytes: &[u8], layout: &BlockLayout) -> Decoded {
    if bytes.iter().all(|&b| b == ERASED_BYTE) {
        return Decoded::Free;
    }
    if bytes[14] != check_byte(&bytes[0..12]) || bytes[13] != 0 {
        return Decoded::Garbage;
    }
    let id = ObjectId::from_raw(LittleEndian::read_u32(&bytes[0..4]));
    let offset = LittleEndian::read_u32(&bytes[4..8]);
    let size = LittleEndian::read_u32(&bytes[8..12]);
    let in_block = offset >= layout.data_start()
        && offset % 4 == 0
        && size <= layout.max_object_size()
        && offset + align4(size) <= layout.block_size();
    if !in_block {
        return Decoded::Garbage;
    }
    let end = offset + align4(size);
    let state = match ObjectState::from_byte(bytes[12]) {
        Some(state) => state,
        None => return Decoded::Killed { end },
    };
    if bytes[15] != LIVE || !id.is_well_formed() {
        return Decoded::Killed { end };
    }
    Decoded::Live(DirEntry {
        id,
        offset,
        size,
        state,
        flags: EntryFlags::from_state_byte(bytes[12]),
    })
}

/// Parameters for `BlockDirectory::add_object`.
#[derive(Debug, Clone, Copy)]
pub struct NewEntry {
    /// Object id
    pub id: ObjectId,
    /// Initial lifecycle state
    pub state: ObjectState,
    /// Initial flags
    pub flags: EntryFlags,
    /// Object size in bytes
    pub size: u32,
    /// Directory slots that must stay free after this entry is added,
    /// on top of the one slot every block keeps in reserve.
    pub reserve_extra: u32,
}

/// In-memory view of one block's directory.
#[derive(Debug, Clone)]
pub struct BlockDirectory {
    layout: BlockLayout,
    mode: MediaMode,
    physical: PhysicalBlock,
    slots: Vec<Slot>,
    data_top: u32,
}

impl BlockDirectory {
    /// Directory of a freshly erased block.
    pub fn empty(layout: BlockLayout, mode: MediaMode, physical: PhysicalBlock) -> Self {
        BlockDirectory {
            layout,
            mode,
            physical,
            slots: vec![Slot::Free; layout.dir_slots() as usize],
            data_top: layout.data_start(),
        }
    }

    /// Read a block's directory from the media.
    ///
    /// Returns the directory and the slots that should be killed to repair
    /// interrupted state changes: duplicates of a later slot, plus dead slots
    /// on rewritable media.
    pub fn load<M: MediaDriver>(
        media: &M,
        layout: BlockLayout,
        physical: PhysicalBlock,
    ) -> Result<(Self, Vec<u32>), MediaError> {
        let base = layout.block_base(physical);
        let mut raw = vec![0u8; (layout.dir_slots() * DIR_ENTRY_SIZE) as usize];
        media.read(base + layout.dir_offset(), &mut raw)?;

        let mut dir = Self::empty(layout, media.mode(), physical);
        let mut top = layout.data_start();
        let mut repairs = Vec::new();
        // Rewritable media never keep dead slots; a torn kill is finished here
        let clear_dead = media.mode().rewrites_in_place();
        for (i, chunk) in raw.chunks_exact(DIR_ENTRY_SIZE as usize).enumerate() {
            dir.slots[i] = match decode_slot(chunk, &layout) {
                Decoded::Free => Slot::Free,
                Decoded::Garbage => {
                    if clear_dead {
                        repairs.push(i as u32);
                    }
                    Slot::Dead
                }
                Decoded::Killed { end } => {
                    if clear_dead {
                        repairs.push(i as u32);
                    }
                    top = top.max(end);
                    Slot::Dead
                }
                Decoded::Live(entry) => {
                    top = top.max(entry.end());
                    Slot::Live(entry)
                }
            };
        }

        // Later slot wins when an interrupted state change or relocation
        // left two copies
        for later in (0..dir.slots.len()).rev() {
            let Slot::Live(newer) = dir.slots[later] else {
                continue;
            };
            for earlier in 0..later {
                if let Slot::Live(older) = dir.slots[earlier] {
                    if older.duplicates(&newer) {
                        dir.slots[earlier] = Slot::Dead;
                        repairs.push(earlier as u32);
                    }
                }
            }
        }

        // Bytes burned by torn or failed writes sit above every entry
        let data_len = layout.block_size() - layout.data_start();
        let mut data = vec![0u8; data_len as usize];
        media.read(base + layout.data_start(), &mut data)?;
        if let Some(last) = data.iter().rposition(|&b| b != ERASED_BYTE) {
            top = top.max(align4(layout.data_start() + last as u32 + 1));
        }
        dir.data_top = top;

        if !repairs.is_empty() {
            debug!(target: "flashstore::store", physical = %physical, repairs = repairs.len(), "Directory has duplicate entries");
        }
        Ok((dir, repairs))
    }

    /// Physical block this directory lives in.
    pub fn physical(&self) -> PhysicalBlock {
        self.physical
    }

    /// Absolute media address of a block-relative offset.
    pub fn address(&self, offset: u32) -> u32 {
        self.layout.block_base(self.physical) + offset
    }

    /// Block-relative offset of the first never-allocated data byte.
    pub fn data_top(&self) -> u32 {
        self.data_top
    }

    /// The slot array.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Entry in a slot, if live.
    pub fn entry(&self, slot: u32) -> Option<&DirEntry> {
        match self.slots.get(slot as usize) {
            Some(Slot::Live(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Live entries with their slot numbers.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &DirEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Live(entry) => Some((i as u32, entry)),
            _ => None,
        })
    }

    /// Find the revision of `id` in `state`.
    pub fn lookup(&self, id: ObjectId, state: ObjectState) -> Option<u32> {
        self.entries()
            .find(|(_, e)| e.id == id && e.state == state)
            .map(|(slot, _)| slot)
    }

    /// True if any live revision of `id` is in this block.
    pub fn contains_id(&self, id: ObjectId) -> bool {
        self.entries().any(|(_, e)| e.id == id)
    }

    /// True if the block holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    /// Number of free slots.
    pub fn free_slots(&self) -> u32 {
        self.slots.iter().filter(|s| matches!(s, Slot::Free)).count() as u32
    }

    /// Number of dead slots.
    pub fn dead_slots(&self) -> u32 {
        self.slots.iter().filter(|s| matches!(s, Slot::Dead)).count() as u32
    }

    /// Sum of aligned sizes of live entries.
    pub fn live_bytes(&self) -> u32 {
        self.entries().map(|(_, e)| align4(e.size)).sum()
    }

    /// True if an entry of `size` bytes fits, leaving `reserve_extra`
    /// additional slots free.
    pub fn can_fit(&self, size: u32, reserve_extra: u32) -> bool {
        self.free_slots() > KEPT_SLOTS + reserve_extra
            && self.layout.block_size() - self.data_top >= align4(size)
    }

    /// Free data bytes, or zero when no slot is left to describe them.
    pub fn available(&self) -> u32 {
        if self.free_slots() > KEPT_SLOTS {
            self.layout.block_size() - self.data_top
        } else {
            0
        }
    }

    /// Bytes a compaction or migration would reclaim.
    pub fn yield_bytes(&self) -> u32 {
        let allocated = self.data_top - self.layout.data_start();
        allocated - self.live_bytes() + self.dead_slots() * DIR_ENTRY_SIZE
    }

    /// Preference for reclaiming this block: high yield on low wear wins.
    pub fn erase_heuristic(yield_bytes: u32, erase_count: u32, average: u32) -> u64 {
        if yield_bytes == 0 {
            return 0;
        }
        yield_bytes as u64 * 16 * (average as u64 + 1) / (erase_count as u64 + 1)
    }

    /// Allocate data space and write a new entry.
    ///
    /// The data bytes are left erased. Returns the slot number.
    ///
    /// # Errors
    ///
    /// `StoreError::BlockFull` if the block lacks data space or slots.
    pub fn add_object<M: MediaDriver>(
        &mut self,
        media: &mut M,
        request: NewEntry,
    ) -> StoreResult<u32> {
        if !self.can_fit(request.size, request.reserve_extra) {
            return Err(StoreError::BlockFull);
        }
        let slot = self.first_free().ok_or(StoreError::BlockFull)?;
        let entry = DirEntry {
            id: request.id,
            offset: self.data_top,
            size: request.size,
            state: request.state,
            flags: request.flags,
        };
        self.data_top = entry.end();
        self.write_slot(media, slot, &entry)?;
        Ok(slot)
    }

    /// Move a live entry to a new state and flags.
    ///
    /// Returns the slot now holding the entry, which differs from `slot`
    /// on erase-block media.
    pub fn set_state<M: MediaDriver>(
        &mut self,
        media: &mut M,
        slot: u32,
        state: ObjectState,
        flags: EntryFlags,
    ) -> StoreResult<u32> {
        let mut entry = *self
            .entry(slot)
            .ok_or_else(|| StoreError::Corruption(format!("slot {} is not live", slot)))?;
        entry.state = state;
        entry.flags = flags;

        if self.mode.rewrites_in_place() {
            let addr = self.address(self.layout.dir_slot_offset(slot) + 12);
            media.write(addr, &[flags.pack(state)])?;
            self.slots[slot as usize] = Slot::Live(entry);
            return Ok(slot);
        }

        loop {
            let target = self.first_free().ok_or(StoreError::BlockFull)?;
            match self.write_slot(media, target, &entry) {
                Ok(()) => {
                    self.kill(media, slot)?;
                    return Ok(target);
                }
                // Slot is burned; try the next one
                Err(StoreError::WriteError { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove an entry. Its data bytes stay allocated until compaction.
    pub fn kill<M: MediaDriver>(&mut self, media: &mut M, slot: u32) -> StoreResult<()> {
        let offset = self.layout.dir_slot_offset(slot);
        match self.mode {
            MediaMode::EraseBlock => {
                media.write(self.address(offset + 15), &[DEAD])?;
                self.slots[slot as usize] = Slot::Dead;
            }
            MediaMode::Rewritable => {
                // Dead first, so a torn clear never reads back as live
                media.write(self.address(offset + 15), &[DEAD])?;
                media.set(self.address(offset), DIR_ENTRY_SIZE, ERASED_BYTE)?;
                self.slots[slot as usize] = Slot::Free;
            }
        }
        Ok(())
    }

    /// Kill every slot listed by `load`.
    pub fn repair<M: MediaDriver>(&mut self, media: &mut M, slots: &[u32]) -> StoreResult<()> {
        for &slot in slots {
            let offset = self.layout.dir_slot_offset(slot);
            match self.mode {
                MediaMode::EraseBlock => media.write(self.address(offset + 15), &[DEAD])?,
                MediaMode::Rewritable => {
                    media.set(self.address(offset), DIR_ENTRY_SIZE, ERASED_BYTE)?;
                    self.slots[slot as usize] = Slot::Free;
                }
            }
        }
        Ok(())
    }

    /// Move live revisions down over dead space, one at a time.
    ///
    /// Rewritable media only. Each move copies the bytes to a range no live
    /// entry uses, publishes the moved entry and then kills the old slot,
    /// so every revision stays readable at any power cut. A revision whose
    /// slide would overlap itself is first parked above the allocation top;
    /// without room there it stays where it is. Returns the number of bytes
    /// reclaimed.
    pub fn compact_in_place<M: MediaDriver>(&mut self, media: &mut M) -> StoreResult<u32> {
        if !self.mode.rewrites_in_place() {
            return Err(StoreError::Corruption(
                "in-place compaction on erase-block media".to_string(),
            ));
        }
        let before = self.data_top;
        self.clear_dead(media)?;

        let mut live: Vec<(u32, DirEntry)> = self.entries().map(|(slot, e)| (slot, *e)).collect();
        live.sort_by_key(|(_, e)| e.offset);

        let mut cursor = self.layout.data_start();
        for (slot, entry) in live {
            let len = align4(entry.size);
            if entry.offset == cursor {
                cursor = entry.end();
                continue;
            }
            let room_above = self.layout.block_size() - self.data_top;
            if entry.offset - cursor >= len && self.free_slots() > 0 {
                self.relocate(media, slot, cursor)?;
            } else if room_above >= len && self.free_slots() > 0 {
                let parked_at = self.data_top;
                self.data_top += len;
                let parked = self.relocate(media, slot, parked_at)?;
                self.relocate(media, parked, cursor)?;
            } else {
                cursor = entry.end();
                continue;
            }
            cursor += len;
        }

        let top = self
            .entries()
            .map(|(_, e)| e.end())
            .max()
            .unwrap_or(self.layout.data_start());
        media.set(self.address(top), self.layout.block_size() - top, ERASED_BYTE)?;
        self.data_top = top;
        Ok(before.saturating_sub(top))
    }

    /// Copy a live revision to `offset` and switch its entry over.
    ///
    /// Returns the slot now holding the entry.
    fn relocate<M: MediaDriver>(
        &mut self,
        media: &mut M,
        slot: u32,
        offset: u32,
    ) -> StoreResult<u32> {
        let entry = *self
            .entry(slot)
            .ok_or_else(|| StoreError::Corruption(format!("slot {} is not live", slot)))?;
        let target = self.first_free().ok_or(StoreError::BlockFull)?;
        media.copy(self.address(entry.offset), self.address(offset), entry.size)?;
        let moved = DirEntry { offset, ..entry };
        self.write_slot(media, target, &moved)?;
        self.kill(media, slot)?;
        Ok(target)
    }

    /// Return torn or failed slots to the free pattern (rewritable media).
    fn clear_dead<M: MediaDriver>(&mut self, media: &mut M) -> StoreResult<()> {
        for slot in 0..self.slots.len() {
            if matches!(self.slots[slot], Slot::Dead) {
                let offset = self.layout.dir_slot_offset(slot as u32);
                media.set(self.address(offset), DIR_ENTRY_SIZE, ERASED_BYTE)?;
                self.slots[slot] = Slot::Free;
            }
        }
        Ok(())
    }

    /// Copy every live entry and its bytes into `target`, which must be a
    /// freshly erased block. Entries keep their relative slot order.
    pub fn compact_into<M: MediaDriver>(
        &self,
        media: &mut M,
        target: &mut BlockDirectory,
    ) -> StoreResult<()> {
        if !target.is_empty() || target.data_top != target.layout.data_start() {
            return Err(StoreError::Corruption(format!(
                "migration target {} is not empty",
                target.physical
            )));
        }
        for (next, (_, entry)) in self.entries().enumerate() {
            let mut moved = *entry;
            moved.offset = target.data_top;
            media.copy(
                self.address(entry.offset),
                target.address(moved.offset),
                entry.size,
            )?;
            target.data_top = moved.end();
            target.write_slot(media, next as u32, &moved)?;
        }
        Ok(())
    }

    /// Reset the directory area to the erased pattern.
    pub fn write_root_directory<M: MediaDriver>(&mut self, media: &mut M) -> StoreResult<()> {
        let len = self.layout.dir_slots() * DIR_ENTRY_SIZE;
        media.set(self.address(self.layout.dir_offset()), len, ERASED_BYTE)?;
        self.slots.iter_mut().for_each(|s| *s = Slot::Free);
        self.data_top = self.layout.data_start();
        Ok(())
    }

    fn first_free(&self) -> Option<u32> {
        self.slots
            .iter()
            .position(|s| matches!(s, Slot::Free))
            .map(|i| i as u32)
    }

    fn write_slot<M: MediaDriver>(
        &mut self,
        media: &mut M,
        slot: u32,
        entry: &DirEntry,
    ) -> StoreResult<()> {
        let addr = self.address(self.layout.dir_slot_offset(slot));
        match media.write(addr, &entry.encode()) {
            Ok(()) => {
                self.slots[slot as usize] = Slot::Live(*entry);
                Ok(())
            }
            Err(e) => {
                self.slots[slot as usize] = Slot::Dead;
                Err(e.into())
            }
        }
    }
}
