//! Transactions
//!
//! One transaction is open at a time, counted by `lock_store` /
//! `unlock_store`. The first mutation appends a transaction marker to the
//! log. Commit sets the marker's commit-point bit, walks the commit table
//! over every touched object, then retires the marker; abort walks the abort
//! table. Recovery finds the marker and replays whichever table the bit
//! selects, so a crash at any point resolves to all-or-nothing.
//!
//! # Commit table
//!
//! | revisions                  | step                          |
//! |----------------------------|-------------------------------|
//! | any cloning scratch        | kill it                       |
//! | superseded + pending       | kill superseded               |
//! | superseded alone           | restore to stable             |
//! | pending                    | pending -> stable             |
//! | new                        | new -> stable                 |
//! | deleting                   | kill                          |
//! | stable with flags          | clear flags                   |
//!
//! # Abort table
//!
//! | revisions                  | step                          |
//! |----------------------------|-------------------------------|
//! | any cloning scratch        | kill it                       |
//! | pending                    | kill                          |
//! | superseded                 | restore to stable             |
//! | new                        | kill                          |
//! | deleting, born in txn      | kill                          |
//! | deleting                   | restore to stable             |
//! | stable with flags          | clear flags                   |
//!
//! Each call applies one step and re-reads the object's revisions, so a
//! table can be re-run from any intermediate state.

use super::Store;
use flashstore_core::{EntryFlags, ObjectId, ObjectState, StoreError, StoreResult};
use flashstore_durability::{LogPayload, RecordRef};
use flashstore_storage::{DirEntry, Location, MediaDriver};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

/// Steps one object can need before a table settles it.
const MAX_STEPS_PER_OBJECT: usize = 8;

/// The live transaction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Marker {
    pub at: RecordRef,
    pub commit_point: bool,
}

/// What the tracker knows about the open transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Tracked {
    /// Exactly these ids were touched
    Ids(Vec<ObjectId>),
    /// Too many ids; every object must be visited
    Everything,
}

/// Ids touched since the last commit or abort, up to a fixed capacity.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    ids: FxHashSet<ObjectId>,
    capacity: usize,
    overflowed: bool,
}

impl Tracker {
    pub fn new(capacity: usize) -> Self {
        Tracker {
            ids: FxHashSet::default(),
            capacity,
            overflowed: false,
        }
    }

    /// Record `id`. Returns true if this call made the tracker overflow.
    pub fn track(&mut self, id: ObjectId) -> bool {
        if self.overflowed || self.ids.contains(&id) {
            return false;
        }
        if self.ids.len() >= self.capacity {
            self.overflowed = true;
            self.ids.clear();
            return true;
        }
        self.ids.insert(id);
        false
    }

    pub fn untrack(&mut self, id: ObjectId) {
        self.ids.remove(&id);
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.overflowed = false;
    }

    pub fn is_empty(&self) -> bool {
        !self.overflowed && self.ids.is_empty()
    }

    /// Touched ids in ascending order, or `Everything` after an overflow.
    pub fn ids(&self) -> Tracked {
        if self.overflowed {
            return Tracked::Everything;
        }
        let mut ids: Vec<ObjectId> = self.ids.iter().copied().collect();
        ids.sort();
        Tracked::Ids(ids)
    }
}

/// Passed to the write-protect hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteProtectEvent {
    /// A transaction marker is live, so the store cannot settle until the
    /// media is writable again.
    pub needs_repair: bool,
}

/// The hook's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProtectAction {
    /// Check the switch again
    Retry,
    /// Give up with a write-protect error
    Cancel,
}

pub(crate) type WriteProtectHook =
    Box<dyn FnMut(WriteProtectEvent) -> WriteProtectAction + Send>;

/// One mutation a table wants applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Kill {
        at: Location,
    },
    Set {
        at: Location,
        from: ObjectState,
        to: ObjectState,
        flags: EntryFlags,
    },
}

fn find_state(
    revisions: &[(Location, DirEntry)],
    pred: impl Fn(ObjectState) -> bool,
) -> Option<(Location, DirEntry)> {
    revisions.iter().copied().find(|(_, e)| pred(e.state))
}

fn restore(at: Location, entry: DirEntry) -> Step {
    Step::Set {
        at,
        from: entry.state,
        to: ObjectState::Stable,
        flags: EntryFlags::empty(),
    }
}

/// Next commit step for an object, or `None` once it is settled.
pub(crate) fn commit_step(revisions: &[(Location, DirEntry)]) -> Option<Step> {
    use ObjectState::*;
    if let Some((at, _)) = find_state(revisions, ObjectState::is_cloning) {
        return Some(Step::Kill { at });
    }
    let superseded = find_state(revisions, |s| s == Superseded);
    let pending = find_state(revisions, |s| s == Pending);
    match (superseded, pending) {
        (Some((at, _)), Some(_)) => return Some(Step::Kill { at }),
        (Some((at, entry)), None) => return Some(restore(at, entry)),
        (None, Some((at, entry))) => return Some(restore(at, entry)),
        (None, None) => {}
    }
    if let Some((at, entry)) = find_state(revisions, |s| s == New) {
        return Some(restore(at, entry));
    }
    if let Some((at, _)) = find_state(revisions, |s| s == Deleting) {
        return Some(Step::Kill { at });
    }
    revisions
        .iter()
        .find(|(_, e)| e.state == Stable && !e.flags.is_empty())
        .map(|&(at, entry)| restore(at, entry))
}

/// Next abort step for an object, or `None` once it is settled.
pub(crate) fn abort_step(revisions: &[(Location, DirEntry)]) -> Option<Step> {
    use ObjectState::*;
    if let Some((at, _)) = find_state(revisions, ObjectState::is_cloning) {
        return Some(Step::Kill { at });
    }
    if let Some((at, _)) = find_state(revisions, |s| s == Pending) {
        return Some(Step::Kill { at });
    }
    if let Some((at, entry)) = find_state(revisions, |s| s == Superseded) {
        return Some(restore(at, entry));
    }
    if let Some((at, _)) = find_state(revisions, |s| s == New) {
        return Some(Step::Kill { at });
    }
    if let Some((at, entry)) = find_state(revisions, |s| s == Deleting) {
        if entry.flags.contains(EntryFlags::BORN_IN_TXN) {
            return Some(Step::Kill { at });
        }
        return Some(restore(at, entry));
    }
    revisions
        .iter()
        .find(|(_, e)| e.state == Stable && !e.flags.is_empty())
        .map(|&(at, entry)| restore(at, entry))
}

impl<M: MediaDriver> Store<M> {
    /// Open (or nest into) the store's transaction.
    pub fn lock_store(&mut self) -> StoreResult<()> {
        self.check_mounted()?;
        self.lock_depth += 1;
        Ok(())
    }

    /// Leave one nesting level. Leaving the outermost level commits.
    ///
    /// # Errors
    ///
    /// `StoreError::NotInTransaction` if the store is not locked.
    pub fn unlock_store(&mut self) -> StoreResult<()> {
        self.check_mounted()?;
        if self.lock_depth == 0 {
            return Err(StoreError::NotInTransaction);
        }
        self.lock_depth -= 1;
        if self.lock_depth == 0 {
            self.commit()?;
        }
        Ok(())
    }

    /// Current lock nesting depth.
    pub fn lock_depth(&self) -> u32 {
        self.lock_depth
    }

    /// Make every change since the last commit durable.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.check_mounted()?;
        if self.tracker.is_empty() {
            return self.retire_marker_if_idle();
        }
        self.check_writable()?;
        self.ensure_marker()?;
        self.reach_commit_point()?;

        let ids = self.tracked_ids();
        let mut changed = 0usize;
        for id in ids {
            if self.separate.contains(&id) || self.flagged_separate(id) {
                continue;
            }
            if self.commit_object(id)? {
                changed += 1;
            }
        }
        self.tracker.clear();
        self.settle_marker()?;
        info!(target: "flashstore::txn", objects = changed, "Transaction committed");
        Ok(())
    }

    /// Roll back every change since the last commit. Objects in a separate
    /// transaction are left alone.
    pub fn abort(&mut self) -> StoreResult<()> {
        self.check_mounted()?;
        if self.tracker.is_empty() {
            // A failed create can leave a marker with nothing tracked
            return self.retire_marker_if_idle();
        }
        self.check_writable()?;

        let ids = self.tracked_ids();
        let mut changed = 0usize;
        for id in ids {
            if self.separate.contains(&id) || self.flagged_separate(id) {
                continue;
            }
            if self.abort_object(id)? {
                changed += 1;
            }
        }
        self.tracker.clear();
        self.retire_marker_if_idle()?;
        info!(target: "flashstore::txn", objects = changed, "Transaction aborted");
        Ok(())
    }

    /// Move `id` out of the enclosing transaction so it can be rolled back
    /// on its own.
    pub fn start_transaction_against(&mut self, id: ObjectId) -> StoreResult<()> {
        self.check_mounted()?;
        self.check_id(id)?;
        self.find_visible(id)?;
        if self.separate.contains(&id) {
            return Ok(());
        }
        self.check_writable()?;
        self.ensure_marker()?;
        self.tracker.untrack(id);
        self.separate.insert(id);
        while let Some((at, entry)) = self
            .revisions(id)
            .into_iter()
            .find(|(_, e)| !e.flags.contains(EntryFlags::SEPARATE))
        {
            self.transition_at(id, at, entry.state, entry.state, entry.flags.with(EntryFlags::SEPARATE))?;
        }
        debug!(target: "flashstore::txn", id = %id, "Started separate transaction");
        Ok(())
    }

    /// Fold a separate transaction back into the enclosing one.
    ///
    /// # Errors
    ///
    /// `StoreError::NotInTransaction` if no transaction is open.
    pub fn add_to_current_transaction(&mut self, id: ObjectId) -> StoreResult<()> {
        self.check_mounted()?;
        self.check_id(id)?;
        if self.lock_depth == 0 {
            return Err(StoreError::NotInTransaction);
        }
        if !self.separate.contains(&id) {
            return Ok(());
        }
        self.check_writable()?;
        while let Some((at, entry)) = self
            .revisions(id)
            .into_iter()
            .find(|(_, e)| e.flags.contains(EntryFlags::SEPARATE))
        {
            self.transition_at(id, at, entry.state, entry.state, entry.flags.without(EntryFlags::SEPARATE))?;
        }
        self.separate.remove(&id);
        self.track(id);
        debug!(target: "flashstore::txn", id = %id, "Joined enclosing transaction");
        Ok(())
    }

    /// Roll back only `id`'s separate transaction.
    pub fn separately_abort(&mut self, id: ObjectId) -> StoreResult<()> {
        self.check_mounted()?;
        self.check_id(id)?;
        if !self.separate.contains(&id) {
            return Ok(());
        }
        self.check_writable()?;
        self.abort_object(id)?;
        self.separate.remove(&id);
        self.retire_marker_if_idle()?;
        debug!(target: "flashstore::txn", id = %id, "Separate transaction aborted");
        Ok(())
    }

    fn write_protect_clears(&self) -> bool {
        (0..self.config.erase_poll_limit).any(|_| {
            std::hint::spin_loop();
            !self.media.write_protected()
        })
    }

    /// True if `id` is in a separate transaction.
    pub fn in_separate_transaction(&self, id: ObjectId) -> bool {
        self.separate.contains(&id)
    }

    /// Ask the hook until the media is writable or the hook gives up.
    /// Without a hook, poll the switch up to `erase_poll_limit` times and
    /// then cancel.
    pub(crate) fn check_writable(&mut self) -> StoreResult<()> {
        loop {
            if !self.media.write_protected() {
                return Ok(());
            }
            let needs_repair = self.marker.is_some();
            let action = match self.write_protect_hook.as_mut() {
                Some(hook) => hook(WriteProtectEvent { needs_repair }),
                None => {
                    if self.write_protect_clears() {
                        return Ok(());
                    }
                    WriteProtectAction::Cancel
                }
            };
            match action {
                WriteProtectAction::Retry => {
                    debug!(target: "flashstore::txn", needs_repair, "Rechecking write protection");
                }
                WriteProtectAction::Cancel => {
                    warn!(target: "flashstore::txn", needs_repair, "Media is write protected");
                    return Err(if needs_repair {
                        StoreError::WriteProtectedNeedsRepair
                    } else {
                        StoreError::WriteProtected
                    });
                }
            }
        }
    }

    /// Mutations need an open transaction unless the object is in a
    /// separate one.
    pub(crate) fn require_txn(&self, id: Option<ObjectId>) -> StoreResult<()> {
        let separate = id.map_or(false, |id| self.separate.contains(&id));
        if self.lock_depth > 0 || separate {
            Ok(())
        } else {
            Err(StoreError::NotInTransaction)
        }
    }

    /// Note `id` as changed by the enclosing transaction.
    pub(crate) fn track(&mut self, id: ObjectId) {
        if self.separate.contains(&id) {
            return;
        }
        if self.tracker.track(id) {
            debug!(target: "flashstore::txn", capacity = self.config.tracker_capacity, "Tracker overflowed; commit will scan every object");
        }
    }

    pub(crate) fn ensure_marker(&mut self) -> StoreResult<()> {
        if self.marker.is_some() {
            return Ok(());
        }
        let at = self.append_record(LogPayload::marker(), false)?;
        self.marker = Some(Marker {
            at,
            commit_point: false,
        });
        debug!(target: "flashstore::txn", physical = %at.physical, slot = at.slot, sequence = at.sequence, "Wrote transaction marker");
        Ok(())
    }

    fn reach_commit_point(&mut self) -> StoreResult<()> {
        let Some(marker) = self.marker else {
            return Err(StoreError::Corruption("commit without a marker".to_string()));
        };
        if marker.commit_point {
            return Ok(());
        }
        self.log
            .set_commit_point(&mut self.media, marker.at.physical, marker.at.slot)?;
        self.marker = Some(Marker {
            commit_point: true,
            ..marker
        });
        Ok(())
    }

    /// After a commit: keep a fresh marker for open separate transactions,
    /// otherwise retire it.
    fn settle_marker(&mut self) -> StoreResult<()> {
        if self.separate.is_empty() {
            return self.zap_marker();
        }
        // Append first; a migration on the way moves the old marker too
        let fresh = self.append_record(LogPayload::marker(), false)?;
        let old = self.marker.replace(Marker {
            at: fresh,
            commit_point: false,
        });
        if let Some(old) = old {
            self.log
                .zap(&mut self.media, old.at.physical, old.at.slot)?;
        }
        Ok(())
    }

    pub(crate) fn retire_marker_if_idle(&mut self) -> StoreResult<()> {
        if self.tracker.is_empty() && self.separate.is_empty() {
            self.zap_marker()?;
        }
        Ok(())
    }

    pub(crate) fn zap_marker(&mut self) -> StoreResult<()> {
        if let Some(marker) = self.marker {
            self.log
                .zap(&mut self.media, marker.at.physical, marker.at.slot)?;
            self.marker = None;
            debug!(target: "flashstore::txn", physical = %marker.at.physical, slot = marker.at.slot, "Retired transaction marker");
        }
        Ok(())
    }

    fn tracked_ids(&self) -> Vec<ObjectId> {
        match self.tracker.ids() {
            Tracked::Ids(ids) => ids,
            Tracked::Everything => self.all_ids(),
        }
    }

    /// True if any revision of `id` carries the separate flag.
    pub(crate) fn flagged_separate(&self, id: ObjectId) -> bool {
        self.revisions(id)
            .iter()
            .any(|(_, e)| e.flags.contains(EntryFlags::SEPARATE))
    }

    /// Run the commit table on one object. Returns true if anything changed.
    pub(crate) fn commit_object(&mut self, id: ObjectId) -> StoreResult<bool> {
        self.settle_object(id, commit_step)
    }

    /// Run the abort table on one object. Returns true if anything changed.
    pub(crate) fn abort_object(&mut self, id: ObjectId) -> StoreResult<bool> {
        self.settle_object(id, abort_step)
    }

    fn settle_object(
        &mut self,
        id: ObjectId,
        table: fn(&[(Location, DirEntry)]) -> Option<Step>,
    ) -> StoreResult<bool> {
        let mut changed = false;
        for _ in 0..MAX_STEPS_PER_OBJECT {
            let Some(step) = table(&self.revisions(id)) else {
                return Ok(changed);
            };
            self.apply_step(id, step)?;
            changed = true;
        }
        Err(StoreError::Corruption(format!(
            "{} did not settle after {} steps",
            id, MAX_STEPS_PER_OBJECT
        )))
    }

    fn apply_step(&mut self, id: ObjectId, step: Step) -> StoreResult<()> {
        match step {
            Step::Kill { at } => {
                self.with_dir(at.logical, |dir, media| dir.kill(media, at.slot))?;
                self.cache.forget(id);
                debug!(target: "flashstore::txn", id = %id, logical = %at.logical, slot = at.slot, "Killed revision");
            }
            Step::Set { at, from, to, flags } => {
                self.transition_at(id, at, from, to, flags)?;
            }
        }
        Ok(())
    }

    /// Move the revision of `id` in state `from` to `to` with `flags`.
    pub(crate) fn transition(
        &mut self,
        id: ObjectId,
        from: ObjectState,
        to: ObjectState,
        flags: EntryFlags,
    ) -> StoreResult<Location> {
        let at = self.find(id, from).ok_or(StoreError::ObjectNotFound(id))?;
        self.transition_at(id, at, from, to, flags)
    }

    /// As `transition`, for a revision already located. A full directory
    /// is migrated to a fresh block and the change retried once.
    pub(crate) fn transition_at(
        &mut self,
        id: ObjectId,
        at: Location,
        from: ObjectState,
        to: ObjectState,
        flags: EntryFlags,
    ) -> StoreResult<Location> {
        let slot = match self.with_dir(at.logical, |dir, media| dir.set_state(media, at.slot, to, flags)) {
            Ok(slot) => slot,
            Err(StoreError::BlockFull) => {
                self.migrate_block(at.logical)?;
                let moved = self.find(id, from).ok_or_else(|| {
                    StoreError::Corruption(format!("{} lost its {} revision in migration", id, from))
                })?;
                self.with_dir(moved.logical, |dir, media| {
                    dir.set_state(media, moved.slot, to, flags)
                })?
            }
            Err(e) => return Err(e),
        };
        let now = Location {
            logical: at.logical,
            slot,
        };
        self.cache.change(id, from, to, now);
        debug!(target: "flashstore::txn", id = %id, from = %from, to = %to, "Revision changed state");
        Ok(now)
    }

    /// Kill the revision of `id` in `state`.
    pub(crate) fn remove(&mut self, id: ObjectId, state: ObjectState) -> StoreResult<()> {
        let at = self.find(id, state).ok_or(StoreError::ObjectNotFound(id))?;
        self.with_dir(at.logical, |dir, media| dir.kill(media, at.slot))?;
        self.cache.forget(id);
        Ok(())
    }
}
