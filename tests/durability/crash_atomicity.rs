//! Power loss at every byte boundary of a transaction.
//!
//! Each test measures how many media units a workload needs, then replays
//! it once per possible cut point. After every cut the remounted store must
//! hold exactly the pre-transaction or the post-transaction object set.

use crate::common::*;

/// Replay `workload` with every possible power cut and check atomicity.
fn atomic_under_power_loss<S, W>(mode: MediaMode, blocks: u32, setup: S, workload: W)
where
    S: FnOnce(&mut Store<RamFlash>) -> StoreResult<Vec<ObjectId>>,
    W: Fn(&mut FaultyStore, &[ObjectId]) -> StoreResult<()>,
{
    atomic_under_power_loss_with(mode, blocks, StoreConfig::for_testing(), setup, workload)
}

/// Like `atomic_under_power_loss`, running the workload under `config`.
fn atomic_under_power_loss_with<S, W>(
    mode: MediaMode,
    blocks: u32,
    config: StoreConfig,
    setup: S,
    workload: W,
) where
    S: FnOnce(&mut Store<RamFlash>) -> StoreResult<Vec<ObjectId>>,
    W: Fn(&mut FaultyStore, &[ObjectId]) -> StoreResult<()>,
{
    let mut ids = Vec::new();
    let harness = CrashHarness::new(mode, SMALL_BLOCK, blocks, config, |s| {
        ids = setup(s)?;
        Ok(())
    })
    .unwrap();
    let run = |s: &mut FaultyStore| workload(s, &ids);

    let before = ReferenceModel::capture(&mut harness.base_store().unwrap()).unwrap();
    let total = harness.measure(&run).unwrap();
    let full = harness.run_cut(total, &run).unwrap();
    assert!(full.completed);
    assert_eq!(full.outcome, RecoveryOutcome::Clean);
    let mut full_store = full.store;
    let after = ReferenceModel::capture(&mut full_store).unwrap();
    assert_ne!(before, after, "workload changed nothing");

    for budget in 0..total {
        let cut = harness
            .run_cut(budget, &run)
            .unwrap_or_else(|e| panic!("cut after {} of {} units: {}", budget, total, e));
        let mut store = cut.store;
        let actual = ReferenceModel::capture(&mut store).unwrap();
        let result = VerificationResult::one_of(&actual, &[&before, &after]);
        assert!(
            result.is_valid,
            "cut after {} of {} units ({:?}): {:?}",
            budget,
            total,
            cut.outcome,
            result.mismatches.iter().map(ToString::to_string).collect::<Vec<_>>()
        );
        assert_settled(&store);
        assert_no_overlap(&store.live_extents());

        // Recovery leaves nothing for the next mount to do
        let (mut again, outcome) = remount(mode, SMALL_BLOCK, crash(store));
        assert_eq!(outcome, RecoveryOutcome::Clean, "cut after {} units", budget);
        assert_eq!(ReferenceModel::capture(&mut again).unwrap(), actual);
    }
}

fn three_objects(store: &mut Store<RamFlash>) -> StoreResult<Vec<ObjectId>> {
    Ok(vec![
        store.new_within_transaction(12, Some(b"first object".as_slice()))?,
        store.new_within_transaction(6, Some(b"second".as_slice()))?,
        store.new_within_transaction(5, Some(b"third".as_slice()))?,
    ])
}

/// Write, create, delete and resize in one transaction.
fn mixed_transaction(store: &mut FaultyStore, ids: &[ObjectId]) -> StoreResult<()> {
    store.lock_store()?;
    store.write(ids[0], 0, b"FIRST")?;
    store.new_object(10, Some(b"brand new!".as_slice()))?;
    store.delete_object(ids[1])?;
    store.set_object_size(ids[2], 9)?;
    store.write(ids[2], 5, b"ness")?;
    store.unlock_store()
}

#[test]
fn mixed_transaction_is_atomic_on_erase_block_media() {
    atomic_under_power_loss(MediaMode::EraseBlock, 4, three_objects, mixed_transaction);
}

#[test]
fn mixed_transaction_is_atomic_on_rewritable_media() {
    atomic_under_power_loss(MediaMode::Rewritable, 4, three_objects, mixed_transaction);
}

#[test]
fn single_create_is_atomic() {
    for mode in [MediaMode::Rewritable, MediaMode::EraseBlock] {
        atomic_under_power_loss(
            mode,
            4,
            |_| Ok(Vec::new()),
            |s, _| s.new_within_transaction(8, Some(b"lonely".as_slice())).map(|_| ()),
        );
    }
}

#[test]
fn transaction_spanning_a_migration_is_atomic() {
    // Six objects fill most of block 0's directory, so rewriting all of
    // them needs fresh slots and migrates the block mid-transaction.
    atomic_under_power_loss(
        MediaMode::EraseBlock,
        4,
        |s| (0..6u8).map(|n| s.new_within_transaction(8, Some([n; 8].as_slice()))).collect(),
        |s, ids| {
            s.lock_store()?;
            for id in ids {
                s.write(*id, 0, b"rewrite!")?;
            }
            s.unlock_store()
        },
    );
}

#[test]
fn separate_transaction_rolls_back_on_power_loss() {
    atomic_under_power_loss(
        MediaMode::EraseBlock,
        4,
        three_objects,
        |s, ids| {
            s.lock_store()?;
            s.write(ids[0], 0, b"main")?;
            s.start_transaction_against(ids[1])?;
            s.write(ids[1], 0, b"SIDE")?;
            s.separately_abort(ids[1])?;
            s.unlock_store()
        },
    );
}

#[test]
fn mixed_transaction_is_atomic_without_lookup_cache() {
    for mode in [MediaMode::Rewritable, MediaMode::EraseBlock] {
        atomic_under_power_loss_with(
            mode,
            4,
            StoreConfig::for_testing().with_cache_capacity(0),
            three_objects,
            mixed_transaction,
        );
    }
}

/// Ten 600-byte objects fill both blocks; two of them are then deleted.
fn two_full_blocks_with_holes(store: &mut Store<RamFlash>) -> StoreResult<Vec<ObjectId>> {
    let ids = (0..10u8)
        .map(|n| store.new_within_transaction(600, Some([n; 600].as_slice())))
        .collect::<StoreResult<Vec<_>>>()?;
    store.lock_store()?;
    store.delete_object(ids[1])?;
    store.delete_object(ids[6])?;
    store.unlock_store()?;
    Ok(ids)
}

#[test]
fn compaction_on_rewritable_media_is_atomic() {
    // Neither block has 500 free bytes, so the create compacts one in place
    atomic_under_power_loss(
        MediaMode::Rewritable,
        2,
        two_full_blocks_with_holes,
        |s, _| {
            s.lock_store()?;
            s.new_object(500, Some([0xA5; 500].as_slice()))?;
            s.unlock_store()
        },
    );
}
