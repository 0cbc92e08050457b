//! Shared test utilities for all integration test suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

pub use flashstore::testing::{
    CrashHarness, CrashRun, FaultPolicy, FaultyMedia, FaultyStore, ReferenceModel,
    VerificationResult,
};
pub use flashstore::{
    Extent, LogicalBlock, MediaDriver, MediaMode, MountState, ObjectId, ObjectState, RamFlash,
    RecoveryOutcome, SharedStore, Store, StoreConfig, StoreError, StoreResult,
    WriteProtectAction, WriteProtectEvent,
};

// ============================================================================
// Store construction
// ============================================================================

/// Small block size used by most suites.
pub const SMALL_BLOCK: u32 = 4096;

/// Block size used by the end-to-end scenarios.
pub const LARGE_BLOCK: u32 = 64 * 1024;

/// Format fresh in-memory media and return the mounted store.
pub fn formatted(mode: MediaMode, block_size: u32, blocks: u32) -> Store<RamFlash> {
    formatted_with(mode, block_size, blocks, StoreConfig::for_testing())
}

/// Like `formatted`, with an explicit configuration.
pub fn formatted_with(
    mode: MediaMode,
    block_size: u32,
    blocks: u32,
    config: StoreConfig,
) -> Store<RamFlash> {
    let media = RamFlash::new(mode, block_size, blocks);
    let mut store = Store::new(media, config).expect("valid geometry");
    store.format().expect("format");
    store
}

/// Simulate a power cut: drop all in-memory state, keep only the media.
pub fn crash(store: Store<RamFlash>) -> Vec<u8> {
    store.into_media().into_image()
}

/// Mount a saved image on fresh media.
pub fn remount(mode: MediaMode, block_size: u32, image: Vec<u8>) -> (Store<RamFlash>, RecoveryOutcome) {
    let media = RamFlash::from_image(mode, block_size, image);
    let mut store = Store::new(media, StoreConfig::for_testing()).expect("valid geometry");
    let outcome = store.mount().expect("mount");
    (store, outcome)
}

/// Create a committed object holding `data`.
pub fn committed<M: MediaDriver>(store: &mut Store<M>, data: &[u8]) -> ObjectId {
    store
        .new_within_transaction(data.len() as u32, Some(data))
        .expect("create object")
}

/// Read an object's full content.
pub fn content<M: MediaDriver>(store: &mut Store<M>, id: ObjectId) -> Vec<u8> {
    let size = store.get_object_size(id).expect("object size");
    store.read(id, 0, size).expect("read object")
}

// ============================================================================
// Invariant checks
// ============================================================================

/// Panic if two live revisions share a byte on the media.
pub fn assert_no_overlap(extents: &[Extent]) {
    for (i, a) in extents.iter().enumerate() {
        for b in &extents[i + 1..] {
            let disjoint = a.end <= b.start || b.end <= a.start;
            assert!(
                disjoint || a.start == a.end || b.start == b.end,
                "{} {} [{:#x}, {:#x}) overlaps {} {} [{:#x}, {:#x})",
                a.id,
                a.state,
                a.start,
                a.end,
                b.id,
                b.state,
                b.start,
                b.end
            );
        }
    }
}

/// Panic unless every revision left after recovery is stable.
pub fn assert_settled(store: &Store<RamFlash>) {
    for extent in store.live_extents() {
        assert_eq!(
            extent.state,
            ObjectState::Stable,
            "{} left {} after recovery",
            extent.id,
            extent.state
        );
    }
}
