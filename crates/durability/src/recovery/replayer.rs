//! Log replay for recovery
//!
//! Feeds the records of one kind to a closure, newest first. The closure
//! decides whether each record is applied or stale; replay keeps the
//! statistics and the list of stale records so they can be zapped once the
//! store is mounted.
//!
//! # Replay Properties
//!
//! - **Deterministic**: records are visited in descending sequence order
//! - **Idempotent**: replaying the same log yields the same decisions

use flashstore_core::{PhysicalBlock, StoreResult};

use crate::format::{LogRecord, RecordKind};
use crate::log::LogStream;

/// What the apply closure did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replayed {
    /// Record was folded into the recovered state
    Applied,
    /// Record was superseded or misplaced
    Stale,
}

/// Log replay engine over a scanned `LogStream`.
pub struct LogReplayer<'a> {
    log: &'a LogStream,
}

impl<'a> LogReplayer<'a> {
    /// Create a replayer over a scanned log.
    pub fn new(log: &'a LogStream) -> Self {
        LogReplayer { log }
    }

    /// Records of `kind` in descending sequence order.
    pub fn newest_first(&self, kind: RecordKind) -> Vec<(PhysicalBlock, u32, LogRecord)> {
        let mut records: Vec<_> = self
            .log
            .all_records()
            .filter(|(_, _, r)| r.payload.kind() == kind)
            .map(|(p, slot, r)| (p, slot, *r))
            .collect();
        records.sort_by(|a, b| b.2.sequence.cmp(&a.2.sequence));
        records
    }

    /// Replay every record of `kind`, newest first.
    ///
    /// Stale records are appended to `stale`.
    pub fn replay<F>(
        &self,
        kind: RecordKind,
        stats: &mut ReplayStats,
        stale: &mut Vec<(PhysicalBlock, u32)>,
        mut apply_fn: F,
    ) -> StoreResult<()>
    where
        F: FnMut(PhysicalBlock, u32, &LogRecord) -> StoreResult<Replayed>,
    {
        for (physical, slot, record) in self.newest_first(kind) {
            stats.records_read += 1;
            match apply_fn(physical, slot, &record)? {
                Replayed::Applied => stats.records_applied += 1,
                Replayed::Stale => {
                    stats.records_stale += 1;
                    stale.push((physical, slot));
                }
            }
        }
        Ok(())
    }
}

/// Statistics from log replay
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    /// Number of physical logs scanned
    pub blocks_scanned: usize,
    /// Total number of valid records visited
    pub records_read: usize,
    /// Records folded into the recovered state
    pub records_applied: usize,
    /// Records superseded or misplaced
    pub records_stale: usize,
    /// Slots holding torn, zapped or corrupt records
    pub records_corrupt: usize,
}

impl ReplayStats {
    /// Check if any records were applied
    pub fn has_records(&self) -> bool {
        self.records_applied > 0
    }

    /// Check if any stale records were found
    pub fn has_stale(&self) -> bool {
        self.records_stale > 0
    }
}
