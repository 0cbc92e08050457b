//! Format: wipes objects, keeps erase history, recovers from a torn format.

use crate::common::*;

#[test]
fn format_wipes_objects_and_keeps_erase_counts() {
    let mut store = formatted(MediaMode::EraseBlock, SMALL_BLOCK, 5);
    let size = store.max_object_size() / 2;
    for round in 0..15u8 {
        let id = store
            .new_within_transaction(size, Some(vec![round; 16].as_slice()))
            .unwrap();
        store.lock_store().unwrap();
        store.delete_object(id).unwrap();
        store.unlock_store().unwrap();
    }
    let kept = committed(&mut store, b"about to vanish");
    let before = store.wear_stats();
    assert!(before.max() > 1);

    store.format().unwrap();
    let after = store.wear_stats();
    assert_eq!(after.erase_counts[0], before.erase_counts[0] + 1);
    assert_eq!(after.erase_counts[1], before.erase_counts[1] + 1);
    assert!(after.max() >= before.max());
    assert!(store.read(kept, 0, 1).is_err());
    assert_eq!(store.object_ids().unwrap(), vec![store.root_id()]);

    // And the counts are on the media, not just in memory
    let (store, outcome) = remount(MediaMode::EraseBlock, SMALL_BLOCK, crash(store));
    assert_eq!(outcome, RecoveryOutcome::Clean);
    assert_eq!(store.wear_stats().erase_counts[0], after.erase_counts[0]);
    assert_eq!(store.object_ids().unwrap(), vec![store.root_id()]);
}

#[test]
fn reformat_on_rewritable_media() {
    let mut store = formatted(MediaMode::Rewritable, SMALL_BLOCK, 3);
    let id = committed(&mut store, b"old store");
    store.format().unwrap();
    assert!(store.read(id, 0, 1).is_err());

    let fresh = committed(&mut store, b"new store");
    let (mut store, _) = remount(MediaMode::Rewritable, SMALL_BLOCK, crash(store));
    assert_eq!(content(&mut store, fresh), b"new store");
}

#[test]
fn torn_format_never_mixes_stores() {
    // A formatted store with data, then a format cut at every unit
    let mut old = formatted(MediaMode::EraseBlock, SMALL_BLOCK, 4);
    committed(&mut old, b"old data");
    let image = crash(old);

    let measure = {
        let media = FaultyMedia::new(
            RamFlash::from_image(MediaMode::EraseBlock, SMALL_BLOCK, image.clone()),
            FaultPolicy::Never,
        );
        let mut store = Store::new(media, StoreConfig::for_testing()).unwrap();
        store.format().unwrap();
        store.media().units()
    };

    for budget in 0..measure {
        let media = FaultyMedia::new(
            RamFlash::from_image(MediaMode::EraseBlock, SMALL_BLOCK, image.clone()),
            FaultPolicy::PowerCutAfter(budget),
        );
        let mut store = Store::new(media, StoreConfig::for_testing()).unwrap();
        let err = store.format().unwrap_err();
        assert!(err.is_power_loss(), "cut after {}: {}", budget, err);
        let surviving = store.into_media().into_inner().into_image();

        let media = RamFlash::from_image(MediaMode::EraseBlock, SMALL_BLOCK, surviving);
        let mut store = Store::new(media, StoreConfig::for_testing()).unwrap();
        match store.mount() {
            // Old store intact, or some prefix of the new empty one
            Ok(_) => {
                let root = store.root_id();
                let ids = store.object_ids().unwrap();
                assert!(ids.len() <= 2, "cut after {}: {:?}", budget, ids);
                for id in ids.into_iter().filter(|id| *id != root) {
                    assert_eq!(content(&mut store, id), b"old data", "cut after {}", budget);
                }
                assert_settled(&store);
            }
            Err(StoreError::NeedsFormat(_)) => {
                store.format().unwrap();
                assert_eq!(store.object_ids().unwrap(), vec![store.root_id()]);
            }
            Err(e) => panic!("cut after {}: {}", budget, e),
        }
    }
}

#[test]
fn format_restarts_an_exhausted_log_sequence() {
    use flashstore::PhysicalBlock;
    use flashstore_durability::{LogPayload, LogRecord};

    // A spare whose erase record took the last usable sequence number
    let mut image = crash(formatted(MediaMode::EraseBlock, SMALL_BLOCK, 4));
    let last = LogRecord {
        sequence: u32::MAX - 1,
        payload: LogPayload::erase(PhysicalBlock(3), 5),
        commit_point: false,
    };
    let base = 3 * SMALL_BLOCK as usize;
    let bytes = last.to_bytes();
    image[base..base + bytes.len()].copy_from_slice(&bytes);

    let (mut store, outcome) = remount(MediaMode::EraseBlock, SMALL_BLOCK, image);
    assert_eq!(outcome, RecoveryOutcome::Clean);
    assert!(matches!(
        store.new_within_transaction(4, Some(b"full".as_slice())),
        Err(StoreError::NeedsFormat(_))
    ));

    store.format().unwrap();
    assert_eq!(store.wear_stats().erase_counts[3], 6);
    let id = committed(&mut store, b"numbered again");

    let (mut store, outcome) = remount(MediaMode::EraseBlock, SMALL_BLOCK, crash(store));
    assert_eq!(outcome, RecoveryOutcome::Clean);
    assert_eq!(content(&mut store, id), b"numbered again");
    assert_eq!(store.wear_stats().erase_counts[3], 6);
    let more = committed(&mut store, b"and again");
    assert_eq!(content(&mut store, more), b"and again");
}
