//! Allocation tests: write-failure retry, reclamation, reservations and
//! non-overlapping extents under random workloads.

use crate::common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

// ============================================================================
// Write failures
// ============================================================================

/// Store whose block 0 data area (past the root object) rejects writes.
fn failing_store(times: u32, config: StoreConfig) -> FaultyStore {
    let probe = RamFlash::new(MediaMode::EraseBlock, SMALL_BLOCK, 4);
    let data_start = Store::new(probe, config.clone())
        .unwrap()
        .layout()
        .data_start();
    let start = data_start + config.root_object_size;
    let media = FaultyMedia::new(
        RamFlash::new(MediaMode::EraseBlock, SMALL_BLOCK, 4),
        FaultPolicy::FailWrites {
            start,
            end: SMALL_BLOCK,
            times,
        },
    );
    let mut store = Store::new(media, config).unwrap();
    store.format().unwrap();
    store
}

#[test]
fn failed_data_write_is_retried_elsewhere() {
    let mut store = failing_store(2, StoreConfig::for_testing());
    let id = store
        .new_within_transaction(16, Some(b"survives retries".as_slice()))
        .unwrap();

    assert_eq!(store.media().injected_failures(), 2);
    assert_eq!(content(&mut store, id), b"survives retries");
    assert_eq!(store.object_ids().unwrap().len(), 2);
    assert_no_overlap(&store.live_extents());
}

#[test]
fn write_error_surfaces_after_retry_limit() {
    let config = StoreConfig::for_testing().with_write_retry_limit(2);
    let mut store = failing_store(100, config);
    let result = store.new_within_transaction(16, Some(b"never lands here".as_slice()));

    assert!(matches!(result, Err(StoreError::WriteError { .. })));
    assert_eq!(store.media().injected_failures(), 3);
    assert_eq!(store.lock_depth(), 0);
    assert_eq!(store.object_ids().unwrap(), vec![store.root_id()]);
}

// ============================================================================
// Reclamation
// ============================================================================

#[test]
fn rewritable_store_compacts_freed_space() {
    let mut store = formatted(MediaMode::Rewritable, SMALL_BLOCK, 2);
    let big = store.max_object_size() / 2;

    // Fill both blocks, free half, then ask for a block-sized hole again
    let ids: Vec<ObjectId> = (0..2).map(|_| store.new_within_transaction(big, None).unwrap()).collect();
    let keep = committed(&mut store, b"kept across compaction");
    store.lock_store().unwrap();
    for id in &ids {
        store.delete_object(*id).unwrap();
    }
    store.unlock_store().unwrap();

    let again = store.new_within_transaction(big, None).unwrap();
    assert_eq!(store.get_object_size(again).unwrap(), big);
    assert_eq!(content(&mut store, keep), b"kept across compaction");
    assert_no_overlap(&store.live_extents());
}

#[test]
fn erase_block_store_migrates_to_reclaim() {
    let mut store = formatted(MediaMode::EraseBlock, SMALL_BLOCK, 4);
    let before = store.wear_stats();
    let size = store.max_object_size() / 2;

    for round in 0..12u8 {
        let id = store
            .new_within_transaction(size, Some(vec![round; size as usize].as_slice()))
            .unwrap();
        assert_eq!(store.read(id, 0, 4).unwrap(), vec![round; 4]);
        store.lock_store().unwrap();
        store.delete_object(id).unwrap();
        store.unlock_store().unwrap();
    }

    let after = store.wear_stats();
    assert!(after.erase_counts.iter().sum::<u32>() > before.erase_counts.iter().sum::<u32>());
    assert_eq!(store.object_ids().unwrap(), vec![store.root_id()]);
}

#[test]
fn full_store_reports_store_full() {
    let mut store = formatted(MediaMode::EraseBlock, SMALL_BLOCK, 4);
    let size = store.max_object_size() - 64;
    let mut created = 0;
    let err = loop {
        match store.new_within_transaction(size, None) {
            Ok(_) => created += 1,
            Err(e) => break e,
        }
        assert!(created < 10, "store never filled up");
    };
    assert!(matches!(err, StoreError::StoreFull));
    assert_eq!(store.lock_depth(), 0);
    assert_eq!(store.object_ids().unwrap().len(), created + 1);
}

// ============================================================================
// Reservations
// ============================================================================

fn objects_that_fit(store: &mut Store<RamFlash>, size: u32) -> usize {
    let mut count = 0;
    while store.new_within_transaction(size, None).is_ok() {
        count += 1;
        assert!(count < 64, "store never filled up");
    }
    count
}

#[test]
fn reserved_block_is_never_allocated() {
    let mut plain = formatted(MediaMode::EraseBlock, SMALL_BLOCK, 4);
    let unreserved = objects_that_fit(&mut plain, 1000);

    let mut store = formatted(MediaMode::EraseBlock, SMALL_BLOCK, 4);
    store.reserve_block(LogicalBlock(2)).unwrap();
    store.reserve_block(LogicalBlock(2)).unwrap();
    assert!(matches!(
        store.reserve_block(LogicalBlock(0)),
        Err(StoreError::InvalidBlock(0))
    ));
    assert!(matches!(
        store.reserve_block(LogicalBlock(3)),
        Err(StoreError::InvalidBlock(3))
    ));

    // The reservation is durable
    let (mut store, outcome) = remount(MediaMode::EraseBlock, SMALL_BLOCK, crash(store));
    assert_eq!(outcome, RecoveryOutcome::Clean);
    let reserved = objects_that_fit(&mut store, 1000);
    assert!(reserved < unreserved, "{} !< {}", reserved, unreserved);
}

// ============================================================================
// No double allocation
// ============================================================================

struct Workload {
    rng: StdRng,
    committed: BTreeMap<ObjectId, Vec<u8>>,
    working: BTreeMap<ObjectId, Vec<u8>>,
}

impl Workload {
    fn new(seed: u64) -> Self {
        Workload {
            rng: StdRng::seed_from_u64(seed),
            committed: BTreeMap::new(),
            working: BTreeMap::new(),
        }
    }

    fn pick(&mut self) -> Option<ObjectId> {
        if self.working.is_empty() {
            return None;
        }
        let n = self.rng.gen_range(0..self.working.len());
        self.working.keys().nth(n).copied()
    }

    /// One random mutation inside the open transaction.
    fn step(&mut self, store: &mut Store<RamFlash>) {
        match self.rng.gen_range(0..10) {
            0..=2 if self.working.len() < 10 => {
                let len = self.rng.gen_range(1..160usize);
                let data: Vec<u8> = (0..len).map(|_| self.rng.gen()).collect();
                let id = store.new_object(len as u32, Some(data.as_slice())).unwrap();
                self.working.insert(id, data);
            }
            3..=5 => {
                if let Some(id) = self.pick() {
                    let current = self.working[&id].clone();
                    let offset = self.rng.gen_range(0..current.len());
                    let len = self.rng.gen_range(1..=current.len() - offset);
                    let patch: Vec<u8> = (0..len).map(|_| self.rng.gen()).collect();
                    store.write(id, offset as u32, &patch).unwrap();
                    let entry = self.working.get_mut(&id).unwrap();
                    entry[offset..offset + len].copy_from_slice(&patch);
                }
            }
            6 => {
                if let Some(id) = self.pick() {
                    let size = self.rng.gen_range(1..200usize);
                    store.set_object_size(id, size as u32).unwrap();
                    self.working.get_mut(&id).unwrap().resize(size, 0xFF);
                }
            }
            7 => {
                if let Some(id) = self.pick() {
                    store.delete_object(id).unwrap();
                    self.working.remove(&id);
                }
            }
            _ => {}
        }
    }
}

fn run_random_workload(mode: MediaMode, config: StoreConfig, seed: u64) {
    let mut store = formatted_with(mode, SMALL_BLOCK, 4, config);
    let root = store.root_id();
    let root_bytes = content(&mut store, root);
    let mut workload = Workload::new(seed);

    for _ in 0..40 {
        store.lock_store().unwrap();
        for _ in 0..workload.rng.gen_range(1..6) {
            workload.step(&mut store);
            assert_no_overlap(&store.live_extents());
        }
        if workload.rng.gen_bool(0.25) {
            store.abort().unwrap();
            workload.working = workload.committed.clone();
        } else {
            workload.committed = workload.working.clone();
        }
        store.unlock_store().unwrap();
        assert_no_overlap(&store.live_extents());
    }

    let mut expected = ReferenceModel::new();
    expected.put(root, root_bytes);
    for (id, bytes) in &workload.committed {
        expected.put(*id, bytes.clone());
    }
    let (mut store, outcome) = remount(mode, SMALL_BLOCK, crash(store));
    assert_eq!(outcome, RecoveryOutcome::Clean);
    let actual = ReferenceModel::capture(&mut store).unwrap();
    let mismatches = expected.compare(&actual);
    assert!(mismatches.is_empty(), "seed {}: {:?}", seed, mismatches);
}

#[test]
fn random_workload_never_overlaps_on_rewritable_media() {
    for seed in 0..4 {
        run_random_workload(MediaMode::Rewritable, StoreConfig::for_testing(), seed);
    }
}

#[test]
fn random_workload_never_overlaps_on_erase_block_media() {
    for seed in 0..4 {
        run_random_workload(MediaMode::EraseBlock, StoreConfig::for_testing(), seed);
    }
}

#[test]
fn random_workload_without_lookup_cache() {
    for mode in [MediaMode::Rewritable, MediaMode::EraseBlock] {
        for seed in 0..2 {
            run_random_workload(mode, StoreConfig::for_testing().with_cache_capacity(0), seed);
        }
    }
}
