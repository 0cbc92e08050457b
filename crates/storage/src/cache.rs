//! Object lookup cache
//!
//! Direct-mapped cache from `(ObjectId, ObjectState)` to the directory slot
//! holding that revision. Purely an optimization: callers validate every hit
//! against the directory and fall back to a scan on a miss.

use flashstore_core::{LogicalBlock, ObjectId, ObjectState};

/// Where a revision lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// Logical block holding the entry
    pub logical: LogicalBlock,
    /// Directory slot within that block
    pub slot: u32,
}

#[derive(Debug, Clone, Copy)]
struct Line {
    id: ObjectId,
    state: ObjectState,
    location: Location,
}

/// Hit/miss counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that fell through
    pub misses: u64,
}

/// Fixed-capacity direct-mapped lookup cache.
#[derive(Debug, Clone)]
pub struct LookupCache {
    lines: Vec<Option<Line>>,
    stats: CacheStats,
}

impl LookupCache {
    /// Create a cache with `capacity` lines. Zero disables caching.
    pub fn new(capacity: usize) -> Self {
        LookupCache {
            lines: vec![None; capacity],
            stats: CacheStats::default(),
        }
    }

    fn index(&self, id: ObjectId, state: ObjectState) -> Option<usize> {
        if self.lines.is_empty() {
            return None;
        }
        let hash = (id.as_u32() >> 2).wrapping_mul(0x9E37_79B9) ^ state.to_byte() as u32;
        Some(hash as usize % self.lines.len())
    }

    /// Cached location of a revision.
    pub fn lookup(&mut self, id: ObjectId, state: ObjectState) -> Option<Location> {
        let found = self
            .index(id, state)
            .and_then(|i| self.lines[i])
            .filter(|line| line.id == id && line.state == state)
            .map(|line| line.location);
        match found {
            Some(_) => self.stats.hits += 1,
            None => self.stats.misses += 1,
        }
        found
    }

    /// Remember where a revision lives, evicting whatever shared its line.
    pub fn add(&mut self, id: ObjectId, state: ObjectState, location: Location) {
        if let Some(i) = self.index(id, state) {
            self.lines[i] = Some(Line {
                id,
                state,
                location,
            });
        }
    }

    /// Record a state transition.
    pub fn change(
        &mut self,
        id: ObjectId,
        from: ObjectState,
        to: ObjectState,
        location: Location,
    ) {
        self.forget_state(id, from);
        self.add(id, to, location);
    }

    fn forget_state(&mut self, id: ObjectId, state: ObjectState) {
        if let Some(i) = self.index(id, state) {
            if matches!(self.lines[i], Some(line) if line.id == id && line.state == state) {
                self.lines[i] = None;
            }
        }
    }

    /// Drop every cached revision of `id`.
    pub fn forget(&mut self, id: ObjectId) {
        for state in ObjectState::ALL {
            self.forget_state(id, state);
        }
    }

    /// Drop everything (mount, compaction, migration).
    pub fn forget_all(&mut self) {
        self.lines.iter_mut().for_each(|line| *line = None);
    }

    /// Hit/miss counters since creation.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
