//! The transactional object store
//!
//! `Store` owns one media instance and everything rebuilt from it on
//! mount: the block table, one directory per bound block, the log stream
//! and the lookup cache. It is single-threaded; wrap it in a
//! [`SharedStore`](crate::SharedStore) to share it.
//!
//! The implementation is split by concern:
//! - `allocator`: working-block choice, promotion, compaction, migration
//! - `object`: create/read/write/resize/delete
//! - `transaction`: lock/commit/abort, separate sub-transactions
//! - `recovery`: mount and format
//! - `handle`: scratch revisions released on error

mod allocator;
mod handle;
mod object;
mod recovery;
mod transaction;

pub use recovery::RecoveryOutcome;
pub use transaction::{WriteProtectAction, WriteProtectEvent};

use crate::config::StoreConfig;
use flashstore_core::{
    BlockLayout, LogicalBlock, MediaMode, ObjectId, ObjectState, PhysicalBlock,
    StoreError, StoreResult,
};
use flashstore_durability::{BlockTable, LogStream};
use flashstore_storage::{BlockDirectory, CacheStats, DirEntry, Location, LookupCache, MediaDriver};
use handle::HandleStack;
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;
use transaction::{Marker, Tracker, WriteProtectHook};

/// Mount lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// Neither mounted nor formatted
    Unmounted,
    /// The last mount found no usable store
    NeedsFormat,
    /// Ready for use
    Mounted,
}

/// Erase counts of every physical block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WearStats {
    /// Erase count per physical block
    pub erase_counts: Vec<u32>,
    /// Mean over blocks with a known count
    pub average: u32,
}

impl WearStats {
    /// Highest erase count.
    pub fn max(&self) -> u32 {
        self.erase_counts.iter().copied().max().unwrap_or(0)
    }
}

/// Where one live revision's bytes sit on the media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Object id
    pub id: ObjectId,
    /// Revision state
    pub state: ObjectState,
    /// Block holding the revision
    pub physical: PhysicalBlock,
    /// First media address
    pub start: u32,
    /// One past the last media address (4-byte aligned)
    pub end: u32,
}

/// Flash-resident transactional object store.
pub struct Store<M: MediaDriver> {
    pub(crate) media: M,
    pub(crate) config: StoreConfig,
    pub(crate) layout: BlockLayout,
    pub(crate) mode: MediaMode,
    pub(crate) logical_count: u32,
    pub(crate) required_spares: u32,
    pub(crate) state: MountState,
    pub(crate) blocks: BlockTable,
    pub(crate) directories: Vec<Option<BlockDirectory>>,
    pub(crate) log: LogStream,
    pub(crate) cache: LookupCache,
    pub(crate) tracker: Tracker,
    pub(crate) separate: FxHashSet<ObjectId>,
    pub(crate) lock_depth: u32,
    pub(crate) marker: Option<Marker>,
    pub(crate) handles: HandleStack,
    pub(crate) last_block: Option<LogicalBlock>,
    pub(crate) write_protect_hook: Option<WriteProtectHook>,
}

impl<M: MediaDriver> Store<M> {
    /// Wrap a media driver. Call [`mount`](Self::mount) or
    /// [`format`](Self::format) before use.
    ///
    /// # Errors
    ///
    /// `StoreError::Config` if the configuration is invalid, the block size
    /// is unsupported, or the media has too few blocks.
    pub fn new(media: M, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let layout = BlockLayout::new(media.block_size())?;
        let mode = media.mode();
        let physical_count = media.block_count();
        if physical_count > u16::MAX as u32 || media.capacity() > u32::MAX as u64 {
            return Err(StoreError::Config(format!(
                "{} blocks of {} bytes exceed the addressable maximum",
                physical_count,
                media.block_size()
            )));
        }
        let required_spares = match mode {
            MediaMode::EraseBlock => config.spare_blocks,
            MediaMode::Rewritable => 0,
        };
        let logical_count = physical_count.saturating_sub(required_spares);
        if logical_count < 2 {
            return Err(StoreError::Config(format!(
                "{} blocks with {} spares leave fewer than 2 logical blocks",
                physical_count, required_spares
            )));
        }
        Ok(Store {
            blocks: BlockTable::new(physical_count, logical_count, required_spares),
            directories: vec![None; physical_count as usize],
            log: LogStream::empty(layout, mode, physical_count),
            cache: LookupCache::new(config.cache_capacity),
            tracker: Tracker::new(config.tracker_capacity),
            separate: FxHashSet::default(),
            lock_depth: 0,
            marker: None,
            handles: HandleStack::default(),
            last_block: None,
            write_protect_hook: None,
            state: MountState::Unmounted,
            media,
            config,
            layout,
            mode,
            logical_count,
            required_spares,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Block geometry.
    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    /// Media mode.
    pub fn mode(&self) -> MediaMode {
        self.mode
    }

    /// Mount state.
    pub fn mount_state(&self) -> MountState {
        self.state
    }

    /// Number of logical blocks.
    pub fn logical_count(&self) -> u32 {
        self.logical_count
    }

    /// The underlying media.
    pub fn media(&self) -> &M {
        &self.media
    }

    /// Give the media back, e.g. to remount its image.
    pub fn into_media(self) -> M {
        self.media
    }

    /// Largest object a block can hold.
    pub fn max_object_size(&self) -> u32 {
        self.layout.max_object_size()
    }

    /// Id of the root object created by `format`.
    pub fn root_id(&self) -> ObjectId {
        ObjectId::from_raw(self.layout.data_start())
    }

    /// True if the media's write-protect switch is on.
    pub fn is_read_only(&self) -> bool {
        self.media.write_protected()
    }

    /// Total object capacity and bytes used by live revisions.
    pub fn get_store_size(&self) -> StoreResult<(u64, u64)> {
        self.check_mounted()?;
        let total = self.logical_count as u64 * self.layout.max_object_size() as u64;
        let used = self
            .bound_directories()
            .map(|(_, dir)| dir.live_bytes() as u64)
            .sum();
        Ok((total, used))
    }

    /// Erase counts per physical block.
    pub fn wear_stats(&self) -> WearStats {
        WearStats {
            erase_counts: self.blocks.wear(),
            average: self.blocks.average_erase_count(),
        }
    }

    /// Media extent of every live revision, in block order.
    pub fn live_extents(&self) -> Vec<Extent> {
        self.bound_directories()
            .flat_map(|(_, dir)| {
                dir.entries()
                    .map(|(_, e)| Extent {
                        id: e.id,
                        state: e.state,
                        physical: dir.physical(),
                        start: dir.address(e.offset),
                        end: dir.address(e.end()),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Ids of every object with a visible revision, in ascending order.
    pub fn object_ids(&self) -> StoreResult<Vec<ObjectId>> {
        self.check_mounted()?;
        let visible = ObjectState::visible();
        let ids: BTreeSet<ObjectId> = self
            .bound_directories()
            .flat_map(|(_, dir)| {
                dir.entries()
                    .filter(|(_, e)| visible.contains(&e.state))
                    .map(|(_, e)| e.id)
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(ids.into_iter().collect())
    }

    /// Lookup cache hit/miss counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Install the hook asked what to do when the media is write protected.
    ///
    /// Without a hook a write waits for the switch, polling it up to
    /// `erase_poll_limit` times, and then fails with `WriteProtected` (or
    /// `WriteProtectedNeedsRepair` inside a transaction).
    pub fn set_write_protect_hook<F>(&mut self, hook: F)
    where
        F: FnMut(WriteProtectEvent) -> WriteProtectAction + Send + 'static,
    {
        self.write_protect_hook = Some(Box::new(hook));
    }

    pub(crate) fn check_mounted(&self) -> StoreResult<()> {
        match self.state {
            MountState::Mounted => Ok(()),
            MountState::NeedsFormat => Err(StoreError::NeedsFormat(
                "mount found no usable store".to_string(),
            )),
            MountState::Unmounted => Err(StoreError::NotMounted),
        }
    }

    /// Reject ids that cannot name an object in this store.
    pub(crate) fn check_id(&self, id: ObjectId) -> StoreResult<()> {
        let limit = self.logical_count as u64 * self.layout.block_size() as u64;
        if !id.is_well_formed() || id.as_u32() as u64 >= limit {
            return Err(StoreError::BadObjectId(id.as_u32()));
        }
        Ok(())
    }

    /// Directories of bound blocks in logical order.
    pub(crate) fn bound_directories(
        &self,
    ) -> impl Iterator<Item = (LogicalBlock, &BlockDirectory)> + '_ {
        self.blocks.bound().filter_map(move |(logical, physical)| {
            self.directories
                .get(physical.index())
                .and_then(Option::as_ref)
                .map(|dir| (logical, dir))
        })
    }

    pub(crate) fn dir(&self, logical: LogicalBlock) -> StoreResult<&BlockDirectory> {
        let physical = self
            .blocks
            .physical_of(logical)
            .ok_or(StoreError::InvalidBlock(logical.0))?;
        self.directories
            .get(physical.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| StoreError::Corruption(format!("{} has no directory", physical)))
    }

    /// Run `f` against a bound block's directory and the media.
    pub(crate) fn with_dir<R>(
        &mut self,
        logical: LogicalBlock,
        f: impl FnOnce(&mut BlockDirectory, &mut M) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let physical = self
            .blocks
            .physical_of(logical)
            .ok_or(StoreError::InvalidBlock(logical.0))?;
        let dir = self
            .directories
            .get_mut(physical.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| StoreError::Corruption(format!("{} has no directory", physical)))?;
        f(dir, &mut self.media)
    }

    /// Locate the revision of `id` in `state`, trying the cache first.
    pub(crate) fn find(&mut self, id: ObjectId, state: ObjectState) -> Option<Location> {
        if let Some(loc) = self.cache.lookup(id, state) {
            let valid = self
                .dir(loc.logical)
                .ok()
                .and_then(|dir| dir.entry(loc.slot))
                .map_or(false, |e| e.id == id && e.state == state);
            if valid {
                return Some(loc);
            }
            self.cache.forget(id);
        }
        let found = self.bound_directories().find_map(|(logical, dir)| {
            dir.lookup(id, state).map(|slot| Location { logical, slot })
        });
        if let Some(loc) = found {
            self.cache.add(id, state, loc);
        }
        found
    }

    /// Entry at a location.
    pub(crate) fn entry_at(&self, loc: Location) -> StoreResult<DirEntry> {
        self.dir(loc.logical)?
            .entry(loc.slot)
            .copied()
            .ok_or_else(|| StoreError::Corruption(format!("{} slot {} is not live", loc.logical, loc.slot)))
    }

    /// The revision readers see: PENDING, then NEW, then STABLE.
    pub(crate) fn find_visible(&mut self, id: ObjectId) -> StoreResult<(Location, DirEntry)> {
        for state in ObjectState::visible() {
            if let Some(loc) = self.find(id, state) {
                return Ok((loc, self.entry_at(loc)?));
            }
        }
        Err(StoreError::ObjectNotFound(id))
    }

    /// Every live revision of `id`.
    pub(crate) fn revisions(&self, id: ObjectId) -> Vec<(Location, DirEntry)> {
        self.bound_directories()
            .flat_map(|(logical, dir)| {
                dir.entries()
                    .filter(|(_, e)| e.id == id)
                    .map(|(slot, e)| (Location { logical, slot }, *e))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Every id with any live revision, in ascending order.
    pub(crate) fn all_ids(&self) -> Vec<ObjectId> {
        let ids: BTreeSet<ObjectId> = self
            .bound_directories()
            .flat_map(|(_, dir)| dir.entries().map(|(_, e)| e.id).collect::<Vec<_>>())
            .collect();
        ids.into_iter().collect()
    }

    pub(crate) fn id_in_use(&self, id: ObjectId) -> bool {
        self.bound_directories().any(|(_, dir)| dir.contains_id(id))
    }
}
