//! Mount and format
//!
//! Mount rebuilds the block table from the logs, loads every bound
//! directory, repairs torn state changes, zaps stale log records and then
//! settles the interrupted transaction, if any:
//!
//! - no marker: nothing to do
//! - marker without commit point: abort table over every object
//! - marker with commit point: commit table, then the abort table to clean
//!   up anything the commit table leaves (separate sub-transactions)
//!
//! The tracked set does not survive a crash, so recovery always visits
//! every object.

use super::transaction::Marker;
use super::{MountState, Store};
use flashstore_core::{
    EntryFlags, LogicalBlock, ObjectId, ObjectState, PhysicalBlock, StoreError, StoreResult,
};
use flashstore_durability::{
    scan_erase_history, spare_is_clean, BlockTable, LogPayload, LogStream, RecordRef, RecoveryCoordinator,
    RecoveryPlan,
};
use flashstore_storage::{BlockDirectory, MediaDriver, NewEntry};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// What `mount` had to do to bring the store to a consistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No transaction was in flight
    Clean,
    /// An uncommitted transaction was rolled back
    RolledBack {
        /// Objects changed by the rollback
        objects: usize,
    },
    /// A transaction past its commit point was finished
    RolledForward {
        /// Objects changed by finishing the commit
        objects: usize,
    },
}

impl<M: MediaDriver> Store<M> {
    /// Drop every piece of in-memory state.
    fn reset(&mut self) {
        let physical_count = self.media.block_count();
        self.blocks = BlockTable::new(physical_count, self.logical_count, self.required_spares);
        self.directories = vec![None; physical_count as usize];
        self.log = LogStream::empty(self.layout, self.mode, physical_count);
        self.cache.forget_all();
        self.tracker.clear();
        self.separate.clear();
        self.lock_depth = 0;
        self.marker = None;
        self.handles.clear();
        self.last_block = None;
        self.state = MountState::Unmounted;
    }

    /// Rebuild state from the media and finish any interrupted transaction.
    ///
    /// # Errors
    ///
    /// - `StoreError::NeedsFormat` if the media holds no valid store
    /// - `StoreError::WriteProtectedNeedsRepair` if the media is write
    ///   protected and a transaction must be settled
    pub fn mount(&mut self) -> StoreResult<RecoveryOutcome> {
        self.reset();
        let coordinator =
            RecoveryCoordinator::new(self.layout, self.logical_count, self.required_spares);
        let plan = match coordinator.plan(&self.media) {
            Ok(plan) => plan,
            Err(e @ StoreError::NeedsFormat(_)) => {
                warn!(target: "flashstore::recovery", error = %e, "Media needs format");
                self.state = MountState::NeedsFormat;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let RecoveryPlan {
            table,
            log,
            marker,
            stale_records,
            stats,
        } = plan;
        self.blocks = table;
        self.log = log;

        let mut repairs: Vec<(LogicalBlock, Vec<u32>)> = Vec::new();
        let bound: Vec<(LogicalBlock, PhysicalBlock)> = self.blocks.bound().collect();
        for (logical, physical) in bound {
            let (dir, fixes) = BlockDirectory::load(&self.media, self.layout, physical)?;
            if !fixes.is_empty() {
                repairs.push((logical, fixes));
            }
            self.directories[physical.index()] = Some(dir);
        }

        if self.media.write_protected() {
            if marker.is_some() {
                warn!(target: "flashstore::recovery", "Write-protected media holds an unsettled transaction");
                return Err(StoreError::WriteProtectedNeedsRepair);
            }
            self.state = MountState::Mounted;
            info!(target: "flashstore::recovery", records = stats.records_read, "Mounted read-only");
            return Ok(RecoveryOutcome::Clean);
        }

        for (logical, fixes) in repairs {
            warn!(target: "flashstore::recovery", logical = %logical, slots = fixes.len(), "Repairing directory");
            self.with_dir(logical, |dir, media| dir.repair(media, &fixes))?;
        }
        // Before marker recovery, which may migrate or erase blocks
        for (physical, slot) in &stale_records {
            self.log.zap(&mut self.media, *physical, *slot)?;
        }

        let outcome = match marker {
            None => RecoveryOutcome::Clean,
            Some(found) => {
                self.marker = Some(Marker {
                    at: RecordRef {
                        physical: found.physical,
                        slot: found.slot,
                        sequence: found.sequence,
                    },
                    commit_point: found.commit_point,
                });
                let objects = self.settle_interrupted(found.commit_point)?;
                self.zap_marker()?;
                if found.commit_point {
                    RecoveryOutcome::RolledForward { objects }
                } else {
                    RecoveryOutcome::RolledBack { objects }
                }
            }
        };

        self.cache.forget_all();
        self.state = MountState::Mounted;
        info!(
            target: "flashstore::recovery",
            records = stats.records_read,
            stale = stale_records.len(),
            outcome = ?outcome,
            "Store mounted"
        );
        Ok(outcome)
    }

    /// Run the recovery tables over every object; returns how many changed.
    fn settle_interrupted(&mut self, commit_point: bool) -> StoreResult<usize> {
        let ids = self.all_ids();
        let mut changed: BTreeSet<ObjectId> = BTreeSet::new();
        if commit_point {
            for &id in &ids {
                if self.flagged_separate(id) {
                    continue;
                }
                if self.commit_object(id)? {
                    changed.insert(id);
                }
            }
        }
        for &id in &ids {
            if self.abort_object(id)? {
                changed.insert(id);
            }
        }
        Ok(changed.len())
    }

    /// Wipe the store and create an empty one with its root object.
    ///
    /// Erase counts recorded on the media survive.
    pub fn format(&mut self) -> StoreResult<()> {
        if self.media.write_protected() {
            warn!(target: "flashstore::store", "Cannot format write-protected media");
            return Err(StoreError::WriteProtected);
        }
        let history = scan_erase_history(&LogStream::scan(&self.media, self.layout)?);
        self.reset();
        self.log = LogStream::scan(&self.media, self.layout)?;
        for (p, count) in history.iter().enumerate() {
            if let (Some(count), Some(info)) = (count, self.blocks.info_mut(PhysicalBlock(p as u16))) {
                info.erase_count = *count;
                info.erase_count_known = true;
            }
        }

        // Retire old bindings first so a torn format cannot mix stores
        for p in 2..self.media.block_count() {
            let physical = PhysicalBlock(p as u16);
            let doomed: Vec<u32> = self
                .log
                .records(physical)
                .filter(|(_, r)| !matches!(r.payload, LogPayload::EraseEvent { .. }))
                .map(|(slot, _)| slot)
                .collect();
            for slot in doomed {
                self.log.zap(&mut self.media, physical, slot)?;
            }
        }

        // Surviving erase records would put the next mount back at the end
        // of the sequence space, so their blocks are erased and re-logged
        if self.log.is_exhausted() {
            warn!(target: "flashstore::recovery", "Log sequence numbers exhausted; restarting from one");
            self.log.restart_sequence();
            for p in 2..self.media.block_count() {
                let physical = PhysicalBlock(p as u16);
                if self.log.records(physical).next().is_none() {
                    continue;
                }
                let base = self.layout.block_base(physical);
                self.media.erase(base)?;
                self.media
                    .wait_for_erase_done(base, self.config.erase_poll_limit)?;
                let count = self.blocks.record_erase(physical);
                self.log.reset_block(physical);
                self.log
                    .append(&mut self.media, physical, LogPayload::erase(physical, count), false)?;
            }
        }

        for n in 0..2u16 {
            let physical = PhysicalBlock(n);
            let logical = LogicalBlock(n);
            let base = self.layout.block_base(physical);
            self.media.erase(base)?;
            self.media
                .wait_for_erase_done(base, self.config.erase_poll_limit)?;
            let count = self.blocks.record_erase(physical);
            self.log.reset_block(physical);
            self.log
                .append(&mut self.media, physical, LogPayload::erase(physical, count), false)?;
            self.log
                .append(&mut self.media, physical, LogPayload::identity(logical, physical), false)?;
            self.blocks.bind(logical, physical);
            let mut dir = BlockDirectory::empty(self.layout, self.mode, physical);
            dir.write_root_directory(&mut self.media)?;
            self.directories[physical.index()] = Some(dir);
        }

        let spares: Vec<PhysicalBlock> = self.blocks.spares().collect();
        for physical in spares {
            let clean = spare_is_clean(&self.media, &self.layout, &self.log, physical)?;
            if let Some(info) = self.blocks.info_mut(physical) {
                info.erased = clean;
            }
        }
        let average = self.blocks.recompute_average();
        for p in 0..self.blocks.physical_count() {
            if let Some(info) = self.blocks.info_mut(PhysicalBlock(p as u16)) {
                if !info.erase_count_known {
                    info.erase_count = average;
                }
            }
        }

        let root = self.root_id();
        let size = self.config.root_object_size.min(self.max_object_size());
        self.with_dir(LogicalBlock(0), |dir, media| {
            dir.add_object(
                media,
                NewEntry {
                    id: root,
                    state: ObjectState::Stable,
                    flags: EntryFlags::empty(),
                    size,
                    reserve_extra: 0,
                },
            )
        })?;
        self.cache.forget_all();
        self.state = MountState::Mounted;
        info!(
            target: "flashstore::store",
            blocks = self.media.block_count(),
            logical = self.logical_count,
            average_erase_count = average,
            "Store formatted"
        );
        Ok(())
    }
}
