//! Wear leveling over long allocate/free workloads.

use crate::common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn churn(store: &mut Store<RamFlash>, rng: &mut StdRng, cycles: usize) {
    let max = store.max_object_size() / 3;
    for _ in 0..cycles {
        let size = rng.gen_range(64..max);
        let fill: u8 = rng.gen();
        let id = store
            .new_within_transaction(size, Some(vec![fill; size as usize].as_slice()))
            .unwrap();
        assert_eq!(store.read(id, size - 1, 1).unwrap(), vec![fill]);
        store.lock_store().unwrap();
        store.delete_object(id).unwrap();
        store.unlock_store().unwrap();
    }
}

#[test]
fn erase_counts_stay_near_the_average() {
    let mut store = formatted(MediaMode::EraseBlock, SMALL_BLOCK, 8);
    let mut rng = StdRng::seed_from_u64(0x5EED);

    // Long-lived objects pin part of the store
    let pinned: Vec<ObjectId> = (0..4u8).map(|n| committed(&mut store, &[n; 256])).collect();
    churn(&mut store, &mut rng, 400);

    let wear = store.wear_stats();
    assert!(wear.max() > 2, "workload never reclaimed: {:?}", wear.erase_counts);
    assert!(
        wear.max() <= wear.average * 3 + 2,
        "max {} vs average {}: {:?}",
        wear.max(),
        wear.average,
        wear.erase_counts
    );
    for (n, id) in pinned.iter().enumerate() {
        assert_eq!(content(&mut store, *id), vec![n as u8; 256]);
    }
}

#[test]
fn recorded_erase_counts_cover_every_media_erase() {
    let mut store = formatted(MediaMode::EraseBlock, SMALL_BLOCK, 6);
    let mut rng = StdRng::seed_from_u64(7);
    churn(&mut store, &mut rng, 120);

    // Blocks first erased after format start from the average, so the
    // recorded count is at least the number of erases the media saw.
    let recorded = store.wear_stats().erase_counts;
    let physical = store.media().erase_counts().to_vec();
    assert!(physical.iter().filter(|&&n| n > 0).count() > 2);
    for (p, (&logged, &actual)) in recorded.iter().zip(physical.iter()).enumerate() {
        assert!(logged >= actual, "block {}: logged {} < erased {}", p, logged, actual);
    }
}

#[test]
fn erase_counts_survive_remount() {
    let mut store = formatted(MediaMode::EraseBlock, SMALL_BLOCK, 6);
    let mut rng = StdRng::seed_from_u64(11);
    churn(&mut store, &mut rng, 80);
    let before = store.wear_stats();
    let erased: Vec<bool> = store.media().erase_counts().iter().map(|&n| n > 0).collect();

    let (store, outcome) = remount(MediaMode::EraseBlock, SMALL_BLOCK, crash(store));
    assert_eq!(outcome, RecoveryOutcome::Clean);
    let after = store.wear_stats();
    for (p, was_erased) in erased.iter().enumerate() {
        if *was_erased {
            assert_eq!(before.erase_counts[p], after.erase_counts[p], "block {}", p);
        }
    }
    assert_eq!(before.max(), after.max());
}

/// Three small objects rewritten one committed write at a time.
fn hot_writes(blocks: u32, writes: usize) {
    let margin = 8;
    let config = StoreConfig::for_testing().with_wear_leveling_margin(margin);
    let mut store = formatted_with(MediaMode::EraseBlock, SMALL_BLOCK, blocks, config);
    let ids: Vec<ObjectId> = (0..3u8).map(|n| committed(&mut store, &[n; 8])).collect();

    for i in 0..writes {
        let stamp = (i as u64).to_le_bytes();
        store.lock_store().unwrap();
        store.write(ids[i % 3], 0, &stamp).unwrap();
        store.unlock_store().unwrap();
    }

    let wear = store.wear_stats();
    assert!(wear.max() > 2, "workload never reclaimed: {:?}", wear.erase_counts);
    assert!(
        wear.max() <= wear.average + 2 * margin,
        "{} blocks: max {} vs average {}: {:?}",
        blocks,
        wear.max(),
        wear.average,
        wear.erase_counts
    );

    let (mut store, outcome) = remount(MediaMode::EraseBlock, SMALL_BLOCK, crash(store));
    assert_eq!(outcome, RecoveryOutcome::Clean);
    for (n, id) in ids.iter().enumerate() {
        let last = (0..writes).rev().find(|i| i % 3 == n).unwrap();
        assert_eq!(content(&mut store, *id), (last as u64).to_le_bytes().to_vec());
    }
}

#[test]
fn committed_hot_writes_spread_wear_over_eight_blocks() {
    hot_writes(8, 3000);
}

#[test]
fn committed_hot_writes_spread_wear_over_sixteen_blocks() {
    hot_writes(16, 3000);
}
