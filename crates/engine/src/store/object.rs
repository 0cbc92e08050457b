//! Object operations
//!
//! Reads resolve the visible revision (pending, then new, then stable).
//! Writes go in place when the media allows it and the revision is private
//! to the open transaction; everything else produces a clone. A clone is
//! built in a scratch `Cloning*` revision and only published once its bytes
//! are on the media, so an interrupted clone is always discarded.

use super::handle::Handle;
use super::Store;
use flashstore_core::{
    align4, EntryFlags, MediaError, MediaMode, ObjectId, ObjectState, StoreError, StoreResult,
    ERASED_BYTE,
};
use flashstore_storage::{Location, MediaDriver, NewEntry};
use tracing::{debug, warn};

/// How a clone's content differs from its source.
#[derive(Debug, Clone, Copy)]
enum Edit<'a> {
    Write { offset: u32, data: &'a [u8] },
    Resize(u32),
    Replace(&'a [u8]),
}

impl Edit<'_> {
    fn new_size(&self, old: u32) -> u32 {
        match self {
            Edit::Write { .. } => old,
            Edit::Resize(size) => *size,
            Edit::Replace(data) => data.len() as u32,
        }
    }

    fn apply(&self, content: &mut [u8]) {
        match self {
            Edit::Write { offset, data } => {
                let start = *offset as usize;
                content[start..start + data.len()].copy_from_slice(data);
            }
            Edit::Resize(_) => {}
            Edit::Replace(data) => content.copy_from_slice(data),
        }
    }
}

impl<M: MediaDriver> Store<M> {
    /// Create an object of `size` bytes inside the open transaction.
    ///
    /// Bytes not covered by `data` read as `0xFF`.
    ///
    /// # Errors
    ///
    /// - `StoreError::ObjectTooBig` if `size` exceeds what one block holds,
    ///   or `data` is longer than `size`
    /// - `StoreError::NotInTransaction` if the store is not locked
    /// - `StoreError::StoreFull` if no block can be made to fit it
    pub fn new_object(&mut self, size: u32, data: Option<&[u8]>) -> StoreResult<ObjectId> {
        self.check_mounted()?;
        let max = self.max_object_size();
        if size > max {
            return Err(StoreError::ObjectTooBig { size, max });
        }
        if let Some(data) = data {
            if data.len() as u64 > size as u64 {
                return Err(StoreError::ObjectTooBig {
                    size: data.len() as u32,
                    max: size,
                });
            }
        }
        self.require_txn(None)?;
        self.check_writable()?;
        self.ensure_marker()?;

        let mut failures = 0;
        loop {
            match self.guarded(|s| s.allocate_object(size, data)) {
                Err(StoreError::WriteError { addr }) if failures < self.config.write_retry_limit => {
                    failures += 1;
                    warn!(target: "flashstore::store", addr, attempt = failures, "Write failed; retrying new object elsewhere");
                }
                other => return other,
            }
        }
    }

    /// Create an object, opening and committing a transaction if none is open.
    pub fn new_within_transaction(
        &mut self,
        size: u32,
        data: Option<&[u8]>,
    ) -> StoreResult<ObjectId> {
        if self.lock_depth > 0 {
            return self.new_object(size, data);
        }
        self.lock_store()?;
        match self.new_object(size, data) {
            Ok(id) => {
                self.unlock_store()?;
                Ok(id)
            }
            Err(e) => {
                if let Err(abort_err) = self.abort() {
                    warn!(target: "flashstore::txn", error = %abort_err, "Abort after failed create also failed");
                }
                self.lock_depth = self.lock_depth.saturating_sub(1);
                Err(e)
            }
        }
    }

    fn allocate_object(&mut self, size: u32, data: Option<&[u8]>) -> StoreResult<ObjectId> {
        let logical = self.choose_working_block(size, 0, self.last_block)?;
        let top = self.dir(logical)?.data_top();
        let id = self.unused_id(logical.0 as u32 * self.layout.block_size() + top);
        let slot = self.with_dir(logical, |dir, media| {
            dir.add_object(
                media,
                NewEntry {
                    id,
                    state: ObjectState::New,
                    flags: EntryFlags::empty(),
                    size,
                    reserve_extra: 0,
                },
            )
        })?;
        self.handles.push(Handle {
            id,
            state: ObjectState::New,
        });
        self.cache.add(id, ObjectState::New, Location { logical, slot });

        if let Some(data) = data.filter(|d| !d.is_empty()) {
            let addr = self.dir(logical)?.address(top);
            self.media.write(addr, data)?;
        }
        self.track(id);
        self.last_block = Some(logical);
        debug!(target: "flashstore::store", id = %id, size, logical = %logical, "Created object");
        Ok(id)
    }

    /// First free id at or above `start`, probing in steps of 4.
    fn unused_id(&self, start: u32) -> ObjectId {
        let limit = self.logical_count * self.layout.block_size();
        let mut candidate = align4(start.max(4));
        while candidate == 0 || self.id_in_use(ObjectId::from_raw(candidate)) {
            candidate = candidate.wrapping_add(4);
            if candidate >= limit {
                candidate = 4;
            }
        }
        ObjectId::from_raw(candidate)
    }

    /// Read `len` bytes at `offset` from the visible revision.
    ///
    /// # Errors
    ///
    /// `StoreError::ObjectOverrun` if the range runs past the end.
    pub fn read(&mut self, id: ObjectId, offset: u32, len: u32) -> StoreResult<Vec<u8>> {
        self.check_mounted()?;
        self.check_id(id)?;
        let (loc, entry) = self.find_visible(id)?;
        check_range(id, offset, len, entry.size)?;
        let mut buf = vec![0u8; len as usize];
        let addr = self.dir(loc.logical)?.address(entry.offset + offset);
        self.media.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Size of the visible revision.
    pub fn get_object_size(&mut self, id: ObjectId) -> StoreResult<u32> {
        self.check_mounted()?;
        self.check_id(id)?;
        Ok(self.find_visible(id)?.1.size)
    }

    /// Write `data` at `offset`.
    ///
    /// # Errors
    ///
    /// - `StoreError::ObjectOverrun` if the range runs past the end
    /// - `StoreError::NotInTransaction` outside a transaction
    pub fn write(&mut self, id: ObjectId, offset: u32, data: &[u8]) -> StoreResult<()> {
        self.check_mounted()?;
        self.check_id(id)?;
        self.require_txn(Some(id))?;
        let (loc, entry) = self.find_visible(id)?;
        check_range(id, offset, data.len() as u32, entry.size)?;
        if data.is_empty() {
            return Ok(());
        }
        self.check_writable()?;
        self.ensure_marker()?;
        self.track(id);

        if matches!(entry.state, ObjectState::New | ObjectState::Pending) {
            let addr = self.dir(loc.logical)?.address(entry.offset + offset);
            let in_place = self.mode == MediaMode::Rewritable
                || self.media.is_virgin(addr, data.len() as u32)?;
            if in_place {
                match self.media.write(addr, data) {
                    Ok(()) => return Ok(()),
                    Err(MediaError::WriteVerify { addr }) => {
                        warn!(target: "flashstore::store", id = %id, addr, "In-place write failed; cloning");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.clone_with(id, Edit::Write { offset, data })
    }

    /// Grow or shrink an object. The common prefix is kept; grown bytes
    /// read as `0xFF`.
    pub fn set_object_size(&mut self, id: ObjectId, size: u32) -> StoreResult<()> {
        self.check_mounted()?;
        self.check_id(id)?;
        self.require_txn(Some(id))?;
        let (_, entry) = self.find_visible(id)?;
        if entry.size == size {
            return Ok(());
        }
        let max = self.max_object_size();
        if size > max {
            return Err(StoreError::ObjectTooBig { size, max });
        }
        self.check_writable()?;
        self.ensure_marker()?;
        self.track(id);
        self.clone_with(id, Edit::Resize(size))
    }

    /// Replace an object's whole content, resizing it to `data.len()`.
    pub fn replace_object(&mut self, id: ObjectId, data: &[u8]) -> StoreResult<()> {
        self.check_mounted()?;
        self.check_id(id)?;
        self.require_txn(Some(id))?;
        self.find_visible(id)?;
        let max = self.max_object_size();
        if data.len() as u64 > max as u64 {
            return Err(StoreError::ObjectTooBig {
                size: data.len() as u32,
                max,
            });
        }
        self.check_writable()?;
        self.ensure_marker()?;
        self.track(id);
        self.clone_with(id, Edit::Replace(data))
    }

    /// Delete an object. The removal becomes durable at commit.
    pub fn delete_object(&mut self, id: ObjectId) -> StoreResult<()> {
        self.check_mounted()?;
        self.check_id(id)?;
        self.require_txn(Some(id))?;
        let (_, entry) = self.find_visible(id)?;
        self.check_writable()?;
        self.ensure_marker()?;

        match entry.state {
            ObjectState::Pending => {
                self.remove(id, ObjectState::Pending)?;
                let superseded = self
                    .revisions(id)
                    .into_iter()
                    .find(|(_, e)| e.state == ObjectState::Superseded)
                    .ok_or_else(|| {
                        StoreError::Corruption(format!("{} is pending without a superseded revision", id))
                    })?;
                self.transition_at(
                    id,
                    superseded.0,
                    ObjectState::Superseded,
                    ObjectState::Deleting,
                    superseded.1.flags,
                )?;
                self.track(id);
            }
            ObjectState::New if self.separate.contains(&id) => {
                self.remove(id, ObjectState::New)?;
                self.separate.remove(&id);
                self.tracker.untrack(id);
                self.retire_marker_if_idle()?;
            }
            ObjectState::New => {
                self.transition(
                    id,
                    ObjectState::New,
                    ObjectState::Deleting,
                    entry.flags.with(EntryFlags::BORN_IN_TXN),
                )?;
                self.track(id);
            }
            ObjectState::Stable => {
                self.transition(id, ObjectState::Stable, ObjectState::Deleting, entry.flags)?;
                self.track(id);
            }
            other => {
                return Err(StoreError::Corruption(format!(
                    "{} resolved to {} revision",
                    id, other
                )))
            }
        }
        debug!(target: "flashstore::store", id = %id, "Deleted object");
        Ok(())
    }

    /// Per-object erase hook. Flash reclaims space by block, so there is
    /// nothing to do beyond validating the id.
    pub fn erase_object(&mut self, id: ObjectId) -> StoreResult<()> {
        self.check_mounted()?;
        self.check_id(id)
    }

    fn clone_with(&mut self, id: ObjectId, edit: Edit<'_>) -> StoreResult<()> {
        let mut failures = 0;
        loop {
            match self.guarded(|s| s.clone_revision(id, edit)) {
                Err(StoreError::WriteError { addr }) if failures < self.config.write_retry_limit => {
                    failures += 1;
                    warn!(target: "flashstore::store", id = %id, addr, attempt = failures, "Write failed; retrying clone elsewhere");
                }
                other => return other,
            }
        }
    }

    /// Build the edited content in a scratch revision, then publish it.
    fn clone_revision(&mut self, id: ObjectId, edit: Edit<'_>) -> StoreResult<()> {
        let (src_loc, src) = self.find_visible(id)?;
        let size = edit.new_size(src.size);
        let scratch = match src.state {
            ObjectState::New => ObjectState::CloningNew,
            _ => ObjectState::CloningPending,
        };

        let mut content = vec![ERASED_BYTE; size as usize];
        let kept = src.size.min(size) as usize;
        let src_addr = self.dir(src_loc.logical)?.address(src.offset);
        self.media.read(src_addr, &mut content[..kept])?;
        edit.apply(&mut content);

        let reserve_extra = match self.mode {
            MediaMode::EraseBlock => 1,
            MediaMode::Rewritable => 0,
        };
        let logical = self.choose_working_block(size, reserve_extra, Some(src_loc.logical))?;
        let slot = self.with_dir(logical, |dir, media| {
            dir.add_object(
                media,
                NewEntry {
                    id,
                    state: scratch,
                    flags: src.flags,
                    size,
                    reserve_extra,
                },
            )
        })?;
        self.handles.push(Handle { id, state: scratch });
        self.cache.add(id, scratch, Location { logical, slot });

        // Trailing erased bytes are already in place
        let written = content
            .iter()
            .rposition(|&b| b != ERASED_BYTE)
            .map_or(0, |i| i + 1);
        if written > 0 {
            let dst = self.dir(logical)?.entry(slot).map(|e| e.offset).ok_or_else(|| {
                StoreError::Corruption(format!("{} scratch slot {} vanished", id, slot))
            })?;
            let addr = self.dir(logical)?.address(dst);
            self.media.write(addr, &content[..written])?;
        }

        match src.state {
            ObjectState::Stable => {
                self.transition(id, ObjectState::Stable, ObjectState::Superseded, src.flags)?;
                self.transition(id, scratch, ObjectState::Pending, src.flags)?;
            }
            ObjectState::New | ObjectState::Pending => {
                self.remove(id, src.state)?;
                self.transition(id, scratch, src.state, src.flags)?;
            }
            other => {
                return Err(StoreError::Corruption(format!(
                    "{} cloned from {} revision",
                    id, other
                )))
            }
        }
        self.last_block = Some(logical);
        debug!(target: "flashstore::store", id = %id, size, logical = %logical, "Published clone");
        Ok(())
    }
}

fn check_range(id: ObjectId, offset: u32, len: u32, size: u32) -> StoreResult<()> {
    if offset as u64 + len as u64 > size as u64 {
        return Err(StoreError::ObjectOverrun {
            id,
            offset,
            len,
            size,
        });
    }
    Ok(())
}
