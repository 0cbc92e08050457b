//! Recovery coordinator
//!
//! Recovery algorithm:
//! 1. Scan every physical log into memory
//! 2. Replay block-identity records (bind logical -> physical)
//! 3. Replay erase-event records (erase counts)
//! 4. Replay reserved-block records
//! 5. Recompute the average erase count and check block ordering
//! 6. Locate the transaction marker
//!
//! # Recovery Properties
//!
//! - **Deterministic**: Same media image -> same plan
//! - **Read-only**: Planning never writes; the engine applies the plan
//!
//! Superseded and misplaced records end up in `RecoveryPlan::stale_records`
//! for the engine to zap once the store is mounted and writable.

use flashstore_core::{BlockLayout, LogicalBlock, PhysicalBlock, StoreError, StoreResult};
use flashstore_storage::MediaDriver;
use tracing::{debug, info, warn};

use crate::blocks::BlockTable;
use crate::format::{LogPayload, RecordKind};
use crate::log::{LogSlot, LogStream};

use super::replayer::{LogReplayer, ReplayStats, Replayed};

/// Free log slots an unbound block needs to count as ready for promotion.
const MIN_FREE_LOG_SLOTS: usize = 4;

/// Transaction marker found on the media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerState {
    /// Block holding the marker
    pub physical: PhysicalBlock,
    /// Log slot of the marker
    pub slot: u32,
    /// Marker sequence number
    pub sequence: u32,
    /// Commit point reached before the crash
    pub commit_point: bool,
}

/// Everything the engine needs to finish mounting.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    /// Rebuilt block table
    pub table: BlockTable,
    /// Scanned log, ready for appends
    pub log: LogStream,
    /// Live transaction marker, if any
    pub marker: Option<MarkerState>,
    /// Records to zap once mounted
    pub stale_records: Vec<(PhysicalBlock, u32)>,
    /// Replay statistics
    pub stats: ReplayStats,
}

/// Recovery coordinator
///
/// Rebuilds block state from the media's logs.
pub struct RecoveryCoordinator {
    layout: BlockLayout,
    logical_count: u32,
    required_spares: u32,
}

impl RecoveryCoordinator {
    /// Create a coordinator for a store geometry.
    pub fn new(layout: BlockLayout, logical_count: u32, required_spares: u32) -> Self {
        RecoveryCoordinator {
            layout,
            logical_count,
            required_spares,
        }
    }

    /// Scan the media and build a recovery plan.
    ///
    /// # Errors
    ///
    /// `StoreError::NeedsFormat` when the logs do not describe a valid store.
    pub fn plan<M: MediaDriver>(&self, media: &M) -> StoreResult<RecoveryPlan> {
        let log = LogStream::scan(media, self.layout)?;
        let mut table = BlockTable::new(
            media.block_count(),
            self.logical_count,
            self.required_spares,
        );
        let mut stats = ReplayStats {
            blocks_scanned: log.block_count(),
            records_corrupt: log.invalid_slots(),
            ..ReplayStats::default()
        };
        let mut stale = Vec::new();
        let replayer = LogReplayer::new(&log);

        // Pass 1: identities
        let logical_count = self.logical_count;
        replayer.replay(RecordKind::BlockIdentity, &mut stats, &mut stale, |p, _, record| {
            let LogPayload::BlockIdentity {
                logical, physical, ..
            } = record.payload
            else {
                return Ok(Replayed::Stale);
            };
            if physical != p {
                return Ok(Replayed::Stale);
            }
            if logical.0 as u32 >= logical_count {
                return Err(StoreError::NeedsFormat(format!(
                    "{} bound to {} is out of range",
                    logical, physical
                )));
            }
            if table.physical_of(logical).is_some() || table.logical_of(physical).is_some() {
                return Ok(Replayed::Stale);
            }
            table.bind(logical, physical);
            Ok(Replayed::Applied)
        })?;

        // Pass 2: erase counts
        replayer.replay(RecordKind::EraseEvent, &mut stats, &mut stale, |p, _, record| {
            let LogPayload::EraseEvent {
                physical,
                erase_count,
                ..
            } = record.payload
            else {
                return Ok(Replayed::Stale);
            };
            if physical != p {
                return Ok(Replayed::Stale);
            }
            match table.info_mut(physical) {
                Some(info) if !info.erase_count_known => {
                    info.erase_count = erase_count;
                    info.erase_count_known = true;
                    Ok(Replayed::Applied)
                }
                _ => Ok(Replayed::Stale),
            }
        })?;

        // Pass 3: reservations
        replayer.replay(RecordKind::ReservedBlock, &mut stats, &mut stale, |p, _, record| {
            let LogPayload::ReservedBlock { logical } = record.payload else {
                return Ok(Replayed::Stale);
            };
            if table.logical_of(p).is_none()
                || logical.0 as u32 >= logical_count
                || table.is_reserved(logical)
            {
                return Ok(Replayed::Stale);
            }
            table.set_reserved(logical, true);
            Ok(Replayed::Applied)
        })?;

        let average = table.recompute_average();
        for p in 0..table.physical_count() {
            if let Some(info) = table.info_mut(PhysicalBlock(p as u16)) {
                if !info.erase_count_known {
                    info.erase_count = average;
                }
            }
        }

        self.check_ordering(&table)?;

        // Marker: newest in a bound block wins
        let mut marker = None;
        replayer.replay(RecordKind::Marker, &mut stats, &mut stale, |p, slot, record| {
            if marker.is_some() || table.logical_of(p).is_none() {
                return Ok(Replayed::Stale);
            }
            marker = Some(MarkerState {
                physical: p,
                slot,
                sequence: record.sequence,
                commit_point: record.commit_point,
            });
            Ok(Replayed::Applied)
        })?;

        // Spares ready for promotion
        let spares: Vec<PhysicalBlock> = table.spares().collect();
        for p in spares {
            let erased = spare_is_clean(media, &self.layout, &log, p)?;
            if let Some(info) = table.info_mut(p) {
                info.erased = erased;
            }
        }

        if stats.records_corrupt > 0 {
            warn!(target: "flashstore::recovery", corrupt = stats.records_corrupt, "Skipped unreadable log slots during recovery");
        }
        debug!(target: "flashstore::recovery", stale = stale.len(), "Log replay finished");
        info!(
            target: "flashstore::recovery",
            bound = table.bound().count(),
            spares = table.spare_count(),
            average_erase_count = table.average_erase_count(),
            marker = marker.is_some(),
            "Recovery plan ready"
        );

        Ok(RecoveryPlan {
            table,
            log,
            marker,
            stale_records: stale,
            stats,
        })
    }

    /// Once a virgin slot is seen, every later slot must be virgin or
    /// reserved.
    fn check_ordering(&self, table: &BlockTable) -> StoreResult<()> {
        if table.physical_of(LogicalBlock(0)).is_none() {
            return Err(StoreError::NeedsFormat(
                "no block identity for logical block 0".to_string(),
            ));
        }
        let mut seen_virgin = false;
        for l in 0..self.logical_count {
            let logical = LogicalBlock(l as u16);
            if table.is_reserved(logical) {
                continue;
            }
            match table.physical_of(logical) {
                None => seen_virgin = true,
                Some(physical) if seen_virgin => {
                    return Err(StoreError::NeedsFormat(format!(
                        "{} ({}) follows a virgin block",
                        logical, physical
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// True when an unbound block can be promoted without erasing it first:
/// its directory and data areas are virgin, its log holds nothing but erase
/// records, and enough log slots are left for the records a promotion writes.
pub fn spare_is_clean<M: MediaDriver>(
    media: &M,
    layout: &BlockLayout,
    log: &LogStream,
    physical: PhysicalBlock,
) -> StoreResult<bool> {
    let only_erase_records = log.slots(physical).iter().all(|slot| match slot {
        LogSlot::Erased => true,
        LogSlot::Valid(record) => record.payload.kind() == RecordKind::EraseEvent,
        LogSlot::Invalid => false,
    });
    if !only_erase_records || log.free_slots(physical) < MIN_FREE_LOG_SLOTS {
        return Ok(false);
    }
    let start = layout.block_base(physical) + layout.dir_offset();
    let len = layout.block_size() - layout.dir_offset();
    Ok(media.is_virgin(start, len)?)
}

/// Latest surviving erase count of every physical block.
///
/// Used by `format` so a reformat does not reset wear history.
pub fn scan_erase_history(log: &LogStream) -> Vec<Option<u32>> {
    let mut history: Vec<Option<(u32, u32)>> = vec![None; log.block_count()];
    for (p, _, record) in log.all_records() {
        if let LogPayload::EraseEvent {
            physical,
            erase_count,
            ..
        } = record.payload
        {
            if physical != p {
                continue;
            }
            let entry = &mut history[p.index()];
            if entry.map_or(true, |(seq, _)| record.sequence > seq) {
                *entry = Some((record.sequence, erase_count));
            }
        }
    }
    history
        .into_iter()
        .map(|e| e.map(|(_, count)| count))
        .collect()
}
