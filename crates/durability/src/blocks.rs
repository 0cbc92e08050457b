//! Logical ↔ physical block table
//!
//! Tracks which erase unit currently serves each logical block, how often
//! every unit has been erased, and which logical blocks are reserved.
//! Everything here is rebuilt from the log on mount.

use flashstore_core::{LogicalBlock, PhysicalBlock};

/// State of one erase unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysicalInfo {
    /// Times the unit has been erased
    pub erase_count: u32,
    /// False when no erase record survived and the count was estimated
    pub erase_count_known: bool,
    /// Unit is erased and ready to become a working block
    pub erased: bool,
    /// Logical block served, if any
    pub logical: Option<LogicalBlock>,
}

/// State of one logical block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogicalInfo {
    /// Unit currently serving this block
    pub physical: Option<PhysicalBlock>,
    /// Block is excluded from allocation
    pub reserved: bool,
}

/// Bindings, wear and reservations for a store.
#[derive(Debug, Clone)]
pub struct BlockTable {
    physical: Vec<PhysicalInfo>,
    logical: Vec<LogicalInfo>,
    required_spares: u32,
    average_erase_count: u32,
}

impl BlockTable {
    /// Create a table with nothing bound.
    pub fn new(physical_count: u32, logical_count: u32, required_spares: u32) -> Self {
        BlockTable {
            physical: vec![PhysicalInfo::default(); physical_count as usize],
            logical: vec![LogicalInfo::default(); logical_count as usize],
            required_spares,
            average_erase_count: 0,
        }
    }

    /// Number of erase units.
    pub fn physical_count(&self) -> u32 {
        self.physical.len() as u32
    }

    /// Number of logical blocks.
    pub fn logical_count(&self) -> u32 {
        self.logical.len() as u32
    }

    /// Spares that must stay unbound.
    pub fn required_spares(&self) -> u32 {
        self.required_spares
    }

    /// Unit state.
    pub fn info(&self, physical: PhysicalBlock) -> Option<&PhysicalInfo> {
        self.physical.get(physical.index())
    }

    /// Mutable unit state.
    pub fn info_mut(&mut self, physical: PhysicalBlock) -> Option<&mut PhysicalInfo> {
        self.physical.get_mut(physical.index())
    }

    /// Unit serving `logical`.
    pub fn physical_of(&self, logical: LogicalBlock) -> Option<PhysicalBlock> {
        self.logical.get(logical.index()).and_then(|l| l.physical)
    }

    /// Logical block served by `physical`.
    pub fn logical_of(&self, physical: PhysicalBlock) -> Option<LogicalBlock> {
        self.info(physical).and_then(|p| p.logical)
    }

    /// Bind `logical` to `physical`, releasing whatever either side held.
    pub fn bind(&mut self, logical: LogicalBlock, physical: PhysicalBlock) {
        if let Some(old) = self.physical_of(logical) {
            if let Some(info) = self.info_mut(old) {
                info.logical = None;
            }
        }
        self.unbind_physical(physical);
        if let Some(info) = self.logical.get_mut(logical.index()) {
            info.physical = Some(physical);
        }
        if let Some(info) = self.info_mut(physical) {
            info.logical = Some(logical);
            info.erased = false;
        }
    }

    /// Make `physical` a spare.
    pub fn unbind_physical(&mut self, physical: PhysicalBlock) {
        let Some(logical) = self.logical_of(physical) else {
            return;
        };
        if let Some(info) = self.logical.get_mut(logical.index()) {
            if info.physical == Some(physical) {
                info.physical = None;
            }
        }
        if let Some(info) = self.info_mut(physical) {
            info.logical = None;
        }
    }

    /// True if `logical` is reserved.
    pub fn is_reserved(&self, logical: LogicalBlock) -> bool {
        self.logical
            .get(logical.index())
            .map(|l| l.reserved)
            .unwrap_or(false)
    }

    /// Mark `logical` reserved or not.
    pub fn set_reserved(&mut self, logical: LogicalBlock, reserved: bool) {
        if let Some(info) = self.logical.get_mut(logical.index()) {
            info.reserved = reserved;
        }
    }

    /// Units not serving any logical block.
    pub fn spares(&self) -> impl Iterator<Item = PhysicalBlock> + '_ {
        self.physical
            .iter()
            .enumerate()
            .filter(|(_, p)| p.logical.is_none())
            .map(|(i, _)| PhysicalBlock(i as u16))
    }

    /// Number of spare units.
    pub fn spare_count(&self) -> u32 {
        self.spares().count() as u32
    }

    /// Spare with the fewest erases.
    pub fn lowest_wear_spare(&self) -> Option<PhysicalBlock> {
        self.spares().min_by_key(|&p| {
            self.info(p)
                .map(|info| info.erase_count)
                .unwrap_or(u32::MAX)
        })
    }

    /// Erase count of a unit, zero if out of range.
    pub fn erase_count(&self, physical: PhysicalBlock) -> u32 {
        self.info(physical).map_or(0, |info| info.erase_count)
    }

    /// Bound block whose unit has the fewest erases, other than `excluding`.
    pub fn coldest_bound(&self, excluding: LogicalBlock) -> Option<(LogicalBlock, PhysicalBlock)> {
        self.bound()
            .filter(|&(logical, _)| logical != excluding)
            .min_by_key(|&(_, physical)| self.erase_count(physical))
    }

    /// True if a spare can be turned into a working block and still leave
    /// the required number behind.
    pub fn can_promote(&self) -> bool {
        self.spare_count() > self.required_spares
    }

    /// First logical block with no unit behind it and no reservation.
    pub fn first_virgin_logical(&self) -> Option<LogicalBlock> {
        self.logical
            .iter()
            .position(|l| l.physical.is_none() && !l.reserved)
            .map(|i| LogicalBlock(i as u16))
    }

    /// Bound blocks in logical order.
    pub fn bound(&self) -> impl Iterator<Item = (LogicalBlock, PhysicalBlock)> + '_ {
        self.logical
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.physical.map(|p| (LogicalBlock(i as u16), p)))
    }

    /// Record an erase of `physical`; returns the new count.
    pub fn record_erase(&mut self, physical: PhysicalBlock) -> u32 {
        match self.info_mut(physical) {
            Some(info) => {
                info.erase_count = info.erase_count.saturating_add(1);
                info.erase_count_known = true;
                info.erased = true;
                info.erase_count
            }
            None => 0,
        }
    }

    /// Recompute the mean erase count over units with a known count.
    pub fn recompute_average(&mut self) -> u32 {
        let known: Vec<u64> = self
            .physical
            .iter()
            .filter(|p| p.erase_count_known)
            .map(|p| p.erase_count as u64)
            .collect();
        self.average_erase_count = if known.is_empty() {
            0
        } else {
            (known.iter().sum::<u64>() / known.len() as u64) as u32
        };
        self.average_erase_count
    }

    /// Mean erase count as of the last recompute.
    pub fn average_erase_count(&self) -> u32 {
        self.average_erase_count
    }

    /// Erase count of every unit in physical order.
    pub fn wear(&self) -> Vec<u32> {
        self.physical.iter().map(|p| p.erase_count).collect()
    }
}
