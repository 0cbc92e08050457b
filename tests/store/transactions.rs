//! Transaction tests: nesting, commit, abort and tracker overflow.

use crate::common::*;

fn both_modes() -> [MediaMode; 2] {
    [MediaMode::Rewritable, MediaMode::EraseBlock]
}

fn store(mode: MediaMode) -> Store<RamFlash> {
    formatted(mode, SMALL_BLOCK, 4)
}

#[test]
fn mutations_need_a_transaction() {
    for mode in both_modes() {
        let mut store = store(mode);
        let id = committed(&mut store, b"data");
        assert!(matches!(store.new_object(4, None), Err(StoreError::NotInTransaction)));
        assert!(matches!(store.write(id, 0, b"x"), Err(StoreError::NotInTransaction)));
        assert!(matches!(store.set_object_size(id, 8), Err(StoreError::NotInTransaction)));
        assert!(matches!(store.replace_object(id, b"y"), Err(StoreError::NotInTransaction)));
        assert!(matches!(store.delete_object(id), Err(StoreError::NotInTransaction)));
        assert!(matches!(store.unlock_store(), Err(StoreError::NotInTransaction)));
        // Reads never need one
        assert_eq!(store.read(id, 0, 4).unwrap(), b"data");
    }
}

#[test]
fn only_outermost_unlock_commits() {
    for mode in both_modes() {
        let mut store = store(mode);
        let id = committed(&mut store, b"aaaa");

        store.lock_store().unwrap();
        store.lock_store().unwrap();
        store.write(id, 0, b"bb").unwrap();
        store.unlock_store().unwrap();
        assert_eq!(store.lock_depth(), 1);

        // Still open: a crash now would roll back
        store.abort().unwrap();
        assert_eq!(content(&mut store, id), b"aaaa");

        store.write(id, 0, b"cc").unwrap();
        store.unlock_store().unwrap();
        assert_eq!(store.lock_depth(), 0);

        let (mut store, outcome) = remount(mode, SMALL_BLOCK, crash(store));
        assert_eq!(outcome, RecoveryOutcome::Clean);
        assert_eq!(content(&mut store, id), b"ccaa");
    }
}

#[test]
fn abort_restores_every_kind_of_change() {
    for mode in both_modes() {
        let mut store = store(mode);
        let written = committed(&mut store, b"original");
        let resized = committed(&mut store, b"resize me");
        let deleted = committed(&mut store, b"delete me");
        let before = ReferenceModel::capture(&mut store).unwrap();

        store.lock_store().unwrap();
        store.write(written, 0, b"CHANGED!").unwrap();
        store.write(written, 0, b"twice").unwrap();
        store.set_object_size(resized, 3).unwrap();
        store.delete_object(deleted).unwrap();
        let created = store.new_object(8, Some(b"new".as_slice())).unwrap();
        store.abort().unwrap();
        store.unlock_store().unwrap();

        let after = ReferenceModel::capture(&mut store).unwrap();
        assert!(before.compare(&after).is_empty(), "{:?}", before.compare(&after));
        assert!(store.read(created, 0, 1).is_err());
        assert!(store.live_extents().iter().all(|e| e.state == ObjectState::Stable));
    }
}

#[test]
fn abort_twice_is_a_no_op() {
    for mode in both_modes() {
        let mut store = store(mode);
        let id = committed(&mut store, b"same");

        store.lock_store().unwrap();
        store.write(id, 0, b"diff").unwrap();
        store.abort().unwrap();
        store.abort().unwrap();
        store.unlock_store().unwrap();
        assert_eq!(content(&mut store, id), b"same");

        // Nothing tracked at all
        store.abort().unwrap();
        store.abort().unwrap();
    }
}

#[test]
fn commit_applies_every_kind_of_change() {
    for mode in both_modes() {
        let mut store = store(mode);
        let written = committed(&mut store, b"original");
        let replaced = committed(&mut store, b"short");
        let deleted = committed(&mut store, b"delete me");

        store.lock_store().unwrap();
        store.write(written, 4, b"AL!!").unwrap();
        store.replace_object(replaced, b"a longer replacement").unwrap();
        store.delete_object(deleted).unwrap();
        let created = store.new_object(3, Some(b"new".as_slice())).unwrap();
        store.unlock_store().unwrap();

        let (mut store, _) = remount(mode, SMALL_BLOCK, crash(store));
        assert_eq!(content(&mut store, written), b"origAL!!");
        assert_eq!(content(&mut store, replaced), b"a longer replacement");
        assert_eq!(content(&mut store, created), b"new");
        assert!(matches!(store.read(deleted, 0, 1), Err(StoreError::ObjectNotFound(_))));
        assert_settled(&store);
    }
}

#[test]
fn object_created_and_deleted_in_one_transaction_is_gone_either_way() {
    for mode in both_modes() {
        let mut store = store(mode);

        store.lock_store().unwrap();
        let committed_id = store.new_object(4, None).unwrap();
        store.delete_object(committed_id).unwrap();
        store.unlock_store().unwrap();

        store.lock_store().unwrap();
        let aborted_id = store.new_object(4, None).unwrap();
        store.delete_object(aborted_id).unwrap();
        store.abort().unwrap();
        store.unlock_store().unwrap();

        assert_eq!(store.object_ids().unwrap(), vec![store.root_id()]);
        assert_settled(&store);
    }
}

#[test]
fn deleting_a_pending_revision_deletes_the_object() {
    for mode in both_modes() {
        let mut store = store(mode);
        let id = committed(&mut store, b"v1");

        store.lock_store().unwrap();
        store.write(id, 0, b"v2").unwrap();
        store.delete_object(id).unwrap();
        store.abort().unwrap();
        assert_eq!(content(&mut store, id), b"v1");

        store.write(id, 0, b"v3").unwrap();
        store.delete_object(id).unwrap();
        store.unlock_store().unwrap();
        assert!(matches!(store.read(id, 0, 1), Err(StoreError::ObjectNotFound(_))));
    }
}

#[test]
fn tracker_overflow_still_commits_and_aborts_everything() {
    for mode in both_modes() {
        // Capacity 4 from the testing config; touch more than that
        let mut store = store(mode);
        let ids: Vec<ObjectId> = (0..6u8).map(|n| committed(&mut store, &[n; 8])).collect();

        store.lock_store().unwrap();
        for id in &ids {
            store.write(*id, 0, &[0xEE; 4]).unwrap();
        }
        store.abort().unwrap();
        for (n, id) in ids.iter().enumerate() {
            assert_eq!(content(&mut store, *id), vec![n as u8; 8]);
        }

        for id in &ids {
            store.write(*id, 4, &[0xDD; 4]).unwrap();
        }
        store.unlock_store().unwrap();

        let (mut store, _) = remount(mode, SMALL_BLOCK, crash(store));
        for (n, id) in ids.iter().enumerate() {
            let mut expected = vec![n as u8; 4];
            expected.extend_from_slice(&[0xDD; 4]);
            assert_eq!(content(&mut store, *id), expected);
        }
        assert_settled(&store);
    }
}

#[test]
fn new_objects_read_as_erased() {
    for mode in both_modes() {
        let mut store = store(mode);
        let id = store.new_within_transaction(12, None).unwrap();
        assert_eq!(content(&mut store, id), vec![0xFF; 12]);

        let partial = store.new_within_transaction(8, Some(b"ab".as_slice())).unwrap();
        assert_eq!(content(&mut store, partial), b"ab\xFF\xFF\xFF\xFF\xFF\xFF");
    }
}

#[test]
fn new_within_transaction_joins_an_open_transaction() {
    let mut store = store(MediaMode::EraseBlock);
    store.lock_store().unwrap();
    let id = store.new_within_transaction(4, Some(b"join".as_slice())).unwrap();
    assert_eq!(store.lock_depth(), 1);
    store.abort().unwrap();
    store.unlock_store().unwrap();
    assert!(store.read(id, 0, 4).is_err());
}

#[test]
fn object_ids_are_aligned_and_distinct() {
    let mut store = store(MediaMode::EraseBlock);
    let ids: Vec<ObjectId> = (0..10u8).map(|n| committed(&mut store, &[n; 5])).collect();
    for id in &ids {
        assert_ne!(id.as_u32(), 0);
        assert_eq!(id.as_u32() % 4, 0);
    }
    let mut sorted: Vec<u32> = ids.iter().map(|id| id.as_u32()).collect();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), ids.len());
}
