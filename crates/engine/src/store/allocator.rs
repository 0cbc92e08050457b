//! Block allocation and wear leveling
//!
//! `choose_working_block` walks the allocation policy in order:
//!
//! 1. the preferred block, if it has room
//! 2. the first bound block with room
//! 3. promote the least-worn spare into the first virgin logical block
//! 4. rewritable media: compact blocks in place, best yield first
//! 5. erase-block media: migrate the block with the best erase heuristic
//!    into a freshly erased spare, up to `max_migration_attempts` times
//!
//! Migration writes the new block's identity record last, so a crash at any
//! point leaves either the old binding or the new one.
//!
//! Migration targets the least-worn spare. If that spare is already more
//! than `wear_leveling_margin` erases above the average, the least-worn
//! other bound block is first moved onto it. Its low-wear unit becomes the
//! spare, and blocks holding static data take their turn absorbing erases.

use super::Store;
use flashstore_core::{LogicalBlock, MediaMode, PhysicalBlock, StoreError, StoreResult};
use flashstore_durability::{LogPayload, RecordRef};
use flashstore_storage::{BlockDirectory, MediaDriver};
use tracing::{debug, info, warn};

impl<M: MediaDriver> Store<M> {
    /// Pick a bound block with room for `size` bytes, leaving
    /// `reserve_extra` directory slots free.
    ///
    /// # Errors
    ///
    /// `StoreError::StoreFull` once every policy step is exhausted.
    pub(crate) fn choose_working_block(
        &mut self,
        size: u32,
        reserve_extra: u32,
        preferred: Option<LogicalBlock>,
    ) -> StoreResult<LogicalBlock> {
        if let Some(logical) = preferred {
            if self.fits(logical, size, reserve_extra) {
                return Ok(logical);
            }
        }
        if let Some(logical) = self
            .bound_directories()
            .find(|(_, dir)| dir.can_fit(size, reserve_extra))
            .map(|(logical, _)| logical)
        {
            return Ok(logical);
        }
        if let Some(logical) = self.promote_spare()? {
            if self.fits(logical, size, reserve_extra) {
                return Ok(logical);
            }
        }
        match self.mode {
            MediaMode::Rewritable => self.reclaim_in_place(size, reserve_extra),
            MediaMode::EraseBlock => self.reclaim_by_migration(size, reserve_extra),
        }
    }

    fn fits(&self, logical: LogicalBlock, size: u32, reserve_extra: u32) -> bool {
        self.dir(logical)
            .map(|dir| dir.can_fit(size, reserve_extra))
            .unwrap_or(false)
    }

    /// Bind the least-worn spare to the first virgin logical block.
    fn promote_spare(&mut self) -> StoreResult<Option<LogicalBlock>> {
        if !self.blocks.can_promote() {
            return Ok(None);
        }
        let (Some(logical), Some(physical)) = (
            self.blocks.first_virgin_logical(),
            self.blocks.lowest_wear_spare(),
        ) else {
            return Ok(None);
        };
        self.prepare_spare(physical)?;
        self.log
            .append(&mut self.media, physical, LogPayload::identity(logical, physical), false)?;
        self.blocks.bind(logical, physical);
        info!(target: "flashstore::alloc", logical = %logical, physical = %physical, "Promoted spare block");
        Ok(Some(logical))
    }

    fn reclaim_in_place(&mut self, size: u32, reserve_extra: u32) -> StoreResult<LogicalBlock> {
        let mut ranked: Vec<(LogicalBlock, u32)> = self
            .bound_directories()
            .map(|(logical, dir)| (logical, dir.yield_bytes()))
            .filter(|&(_, y)| y > 0)
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        for (logical, _) in ranked {
            let reclaimed = self.with_dir(logical, |dir, media| dir.compact_in_place(media))?;
            self.cache.forget_all();
            debug!(target: "flashstore::alloc", logical = %logical, reclaimed, "Compacted block in place");
            if self.fits(logical, size, reserve_extra) {
                return Ok(logical);
            }
        }
        warn!(target: "flashstore::alloc", size, "No block can be compacted to fit allocation");
        Err(StoreError::StoreFull)
    }

    fn reclaim_by_migration(&mut self, size: u32, reserve_extra: u32) -> StoreResult<LogicalBlock> {
        for attempt in 0..self.config.max_migration_attempts {
            let Some(victim) = self.migration_victim() else {
                break;
            };
            self.migrate_block(victim)?;
            if self.fits(victim, size, reserve_extra) {
                return Ok(victim);
            }
            debug!(target: "flashstore::alloc", attempt, logical = %victim, "Migration did not free enough space");
        }
        warn!(target: "flashstore::alloc", size, "Migration attempts exhausted");
        Err(StoreError::StoreFull)
    }

    /// Bound block with the highest erase heuristic, if any would yield space.
    fn migration_victim(&self) -> Option<LogicalBlock> {
        let average = self.blocks.average_erase_count();
        self.bound_directories()
            .filter_map(|(logical, dir)| {
                let erase_count = self
                    .blocks
                    .info(dir.physical())
                    .map(|info| info.erase_count)
                    .unwrap_or(0);
                let score = BlockDirectory::erase_heuristic(dir.yield_bytes(), erase_count, average);
                (score > 0).then_some((logical, score))
            })
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(logical, _)| logical)
    }

    /// Make a spare ready to take a role: erase it unless it is already
    /// clean, log the erase, and give it an empty directory.
    pub(crate) fn prepare_spare(&mut self, physical: PhysicalBlock) -> StoreResult<()> {
        let erased = self.blocks.info(physical).map_or(false, |info| info.erased);
        if !erased {
            let base = self.layout.block_base(physical);
            self.media.erase(base)?;
            self.media
                .wait_for_erase_done(base, self.config.erase_poll_limit)?;
            let count = self.blocks.record_erase(physical);
            self.log.reset_block(physical);
            self.log
                .append(&mut self.media, physical, LogPayload::erase(physical, count), false)?;
            let average = self.blocks.recompute_average();
            debug!(target: "flashstore::alloc", physical = %physical, erase_count = count, average, "Erased block");
        }
        self.directories[physical.index()] =
            Some(BlockDirectory::empty(self.layout, self.mode, physical));
        Ok(())
    }

    /// Move a logical block's live revisions into the least-worn spare.
    ///
    /// Returns the physical block now serving `logical`.
    pub(crate) fn migrate_block(&mut self, logical: LogicalBlock) -> StoreResult<PhysicalBlock> {
        self.level_spare_wear(logical)?;
        let target = self.blocks.lowest_wear_spare().ok_or(StoreError::StoreFull)?;
        self.move_block(logical, target)
    }

    /// Swap a worn spare with the least-worn bound block other than `busy`.
    fn level_spare_wear(&mut self, busy: LogicalBlock) -> StoreResult<()> {
        let Some(spare) = self.blocks.lowest_wear_spare() else {
            return Ok(());
        };
        let margin = self.config.wear_leveling_margin;
        let spare_erases = self.blocks.erase_count(spare);
        if spare_erases <= self.blocks.average_erase_count().saturating_add(margin) {
            return Ok(());
        }
        let Some((cold, physical)) = self.blocks.coldest_bound(busy) else {
            return Ok(());
        };
        let cold_erases = self.blocks.erase_count(physical);
        if cold_erases.saturating_add(margin) >= spare_erases {
            return Ok(());
        }
        info!(
            target: "flashstore::alloc",
            logical = %cold,
            from = %physical,
            to = %spare,
            cold_erases,
            spare_erases,
            "Moving static block onto worn spare"
        );
        self.move_block(cold, spare)?;
        Ok(())
    }

    /// Copy a logical block's live revisions into the spare `target` and
    /// rebind it there.
    fn move_block(
        &mut self,
        logical: LogicalBlock,
        target: PhysicalBlock,
    ) -> StoreResult<PhysicalBlock> {
        let old = self
            .blocks
            .physical_of(logical)
            .ok_or(StoreError::InvalidBlock(logical.0))?;
        self.prepare_spare(target)?;
        if let Some(info) = self.blocks.info_mut(target) {
            info.erased = false;
        }

        let source = self.directories[old.index()]
            .take()
            .ok_or_else(|| StoreError::Corruption(format!("{} has no directory", old)))?;
        let mut moved = BlockDirectory::empty(self.layout, self.mode, target);
        let copied = source.compact_into(&mut self.media, &mut moved);
        self.directories[old.index()] = Some(source);
        copied?;

        // Marker and reservations follow the block; identity goes last
        let carried: Vec<_> = self
            .log
            .records(old)
            .filter(|(_, r)| {
                matches!(
                    r.payload,
                    LogPayload::TransactionMarker { .. } | LogPayload::ReservedBlock { .. }
                )
            })
            .map(|(slot, r)| (slot, *r))
            .collect();
        for (slot, record) in &carried {
            let written =
                self.log
                    .append(&mut self.media, target, record.payload, record.commit_point)?;
            if let Some(marker) = self.marker.as_mut() {
                if marker.at.physical == old && marker.at.slot == *slot {
                    marker.at = written;
                }
            }
        }
        self.log
            .append(&mut self.media, target, LogPayload::identity(logical, target), false)?;

        self.blocks.bind(logical, target);
        self.directories[target.index()] = Some(moved);
        self.directories[old.index()] = None;

        let stale: Vec<u32> = self
            .log
            .records(old)
            .filter(|(_, r)| !matches!(r.payload, LogPayload::EraseEvent { .. }))
            .map(|(slot, _)| slot)
            .collect();
        for slot in stale {
            self.log.zap(&mut self.media, old, slot)?;
        }
        self.cache.forget_all();

        info!(target: "flashstore::alloc", logical = %logical, from = %old, to = %target, "Migrated block");
        Ok(target)
    }

    /// Append a marker or reservation record to the first bound block with
    /// a free log slot.
    pub(crate) fn append_record(
        &mut self,
        payload: LogPayload,
        commit_point: bool,
    ) -> StoreResult<RecordRef> {
        let bound: Vec<PhysicalBlock> = self.blocks.bound().map(|(_, p)| p).collect();
        for physical in bound {
            if self.log.free_slots(physical) == 0 {
                continue;
            }
            match self
                .log
                .append(&mut self.media, physical, payload, commit_point)
            {
                Err(StoreError::BlockFull) => continue,
                other => return other,
            }
        }
        if self.mode == MediaMode::Rewritable {
            return Err(StoreError::StoreFull);
        }

        // Every bound log is full: move the least-worn block to a fresh one
        let victim = self
            .blocks
            .bound()
            .min_by_key(|&(_, p)| {
                self.blocks
                    .info(p)
                    .map(|info| info.erase_count)
                    .unwrap_or(u32::MAX)
            })
            .map(|(l, _)| l)
            .ok_or(StoreError::StoreFull)?;
        let physical = self.migrate_block(victim)?;
        self.log
            .append(&mut self.media, physical, payload, commit_point)
    }

    /// Exclude a virgin logical block from allocation, durably.
    ///
    /// # Errors
    ///
    /// `StoreError::InvalidBlock` if the block is out of range or already
    /// holds data.
    pub fn reserve_block(&mut self, logical: LogicalBlock) -> StoreResult<()> {
        self.check_mounted()?;
        if logical.0 as u32 >= self.logical_count || self.blocks.physical_of(logical).is_some() {
            return Err(StoreError::InvalidBlock(logical.0));
        }
        if self.blocks.is_reserved(logical) {
            return Ok(());
        }
        self.check_writable()?;
        self.append_record(LogPayload::ReservedBlock { logical }, false)?;
        self.blocks.set_reserved(logical, true);
        info!(target: "flashstore::alloc", logical = %logical, "Reserved block");
        Ok(())
    }
}
