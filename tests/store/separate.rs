//! Separate sub-transactions: objects that commit or roll back on their own.

use crate::common::*;

fn store(mode: MediaMode) -> Store<RamFlash> {
    formatted(mode, SMALL_BLOCK, 4)
}

#[test]
fn separately_abort_restores_only_that_object() {
    for mode in [MediaMode::Rewritable, MediaMode::EraseBlock] {
        let mut store = store(mode);
        let lone = committed(&mut store, b"aaaa");
        let other = committed(&mut store, b"xxxx");

        store.lock_store().unwrap();
        store.start_transaction_against(lone).unwrap();
        assert!(store.in_separate_transaction(lone));
        store.write(lone, 0, b"bb").unwrap();
        store.write(other, 0, b"yy").unwrap();
        assert_eq!(content(&mut store, lone), b"bbaa");

        store.separately_abort(lone).unwrap();
        assert!(!store.in_separate_transaction(lone));
        assert_eq!(content(&mut store, lone), b"aaaa");
        assert_eq!(content(&mut store, other), b"yyxx");
        store.unlock_store().unwrap();

        let (mut store, _) = remount(mode, SMALL_BLOCK, crash(store));
        assert_eq!(content(&mut store, lone), b"aaaa");
        assert_eq!(content(&mut store, other), b"yyxx");
        assert_settled(&store);
    }
}

#[test]
fn enclosing_abort_leaves_separate_object_alone() {
    let mut store = store(MediaMode::EraseBlock);
    let lone = committed(&mut store, b"aaaa");
    let other = committed(&mut store, b"xxxx");

    store.lock_store().unwrap();
    store.write(other, 0, b"yy").unwrap();
    store.start_transaction_against(lone).unwrap();
    store.write(lone, 0, b"bb").unwrap();
    store.abort().unwrap();

    assert_eq!(content(&mut store, other), b"xxxx");
    assert_eq!(content(&mut store, lone), b"bbaa");
    assert!(store.in_separate_transaction(lone));

    store.separately_abort(lone).unwrap();
    assert_eq!(content(&mut store, lone), b"aaaa");
    store.unlock_store().unwrap();
    assert_settled(&store);
}

#[test]
fn add_to_current_transaction_folds_back_in() {
    for mode in [MediaMode::Rewritable, MediaMode::EraseBlock] {
        let mut store = store(mode);
        let id = committed(&mut store, b"aaaa");

        store.lock_store().unwrap();
        store.start_transaction_against(id).unwrap();
        store.write(id, 0, b"cc").unwrap();
        store.add_to_current_transaction(id).unwrap();
        assert!(!store.in_separate_transaction(id));
        store.unlock_store().unwrap();

        let (mut store, outcome) = remount(mode, SMALL_BLOCK, crash(store));
        assert_eq!(outcome, RecoveryOutcome::Clean);
        assert_eq!(content(&mut store, id), b"ccaa");
        assert_settled(&store);
    }
}

#[test]
fn add_to_current_transaction_needs_an_open_transaction() {
    let mut store = store(MediaMode::EraseBlock);
    let id = committed(&mut store, b"aaaa");
    assert!(matches!(
        store.add_to_current_transaction(id),
        Err(StoreError::NotInTransaction)
    ));
}

#[test]
fn separate_object_can_change_outside_a_transaction() {
    let mut store = store(MediaMode::Rewritable);
    let id = committed(&mut store, b"aaaa");

    store.start_transaction_against(id).unwrap();
    assert_eq!(store.lock_depth(), 0);
    store.write(id, 2, b"zz").unwrap();
    assert_eq!(content(&mut store, id), b"aazz");
    store.separately_abort(id).unwrap();
    assert_eq!(content(&mut store, id), b"aaaa");
}

#[test]
fn separately_abort_of_a_plain_object_is_a_no_op() {
    let mut store = store(MediaMode::EraseBlock);
    let id = committed(&mut store, b"aaaa");
    store.separately_abort(id).unwrap();
    assert_eq!(content(&mut store, id), b"aaaa");
}

#[test]
fn commit_keeps_separate_object_open() {
    let mut store = store(MediaMode::EraseBlock);
    let lone = committed(&mut store, b"aaaa");
    let other = committed(&mut store, b"xxxx");

    store.lock_store().unwrap();
    store.start_transaction_against(lone).unwrap();
    store.write(lone, 0, b"bb").unwrap();
    store.write(other, 0, b"yy").unwrap();
    store.unlock_store().unwrap();
    assert!(store.in_separate_transaction(lone));

    // A crash now rolls back the still-open separate change only
    let (mut store, outcome) = remount(MediaMode::EraseBlock, SMALL_BLOCK, crash(store));
    assert!(matches!(outcome, RecoveryOutcome::RolledBack { .. }));
    assert_eq!(content(&mut store, lone), b"aaaa");
    assert_eq!(content(&mut store, other), b"yyxx");
    assert!(!store.in_separate_transaction(lone));
    assert_settled(&store);
}

#[test]
fn deleting_a_new_separate_object_removes_it_at_once() {
    let mut store = store(MediaMode::EraseBlock);
    store.lock_store().unwrap();
    let id = store.new_object(4, Some(b"temp".as_slice())).unwrap();
    store.start_transaction_against(id).unwrap();
    store.delete_object(id).unwrap();
    assert!(!store.in_separate_transaction(id));
    store.abort().unwrap();
    store.unlock_store().unwrap();

    assert!(store.read(id, 0, 1).is_err());
    assert_eq!(store.object_ids().unwrap(), vec![store.root_id()]);
    assert_settled(&store);
}
