//! Crash harness for power-loss testing
//!
//! A harness holds a media image prepared by a setup closure. Each run
//! mounts a copy of that image behind `FaultyMedia`, runs the workload until
//! the power cut, then remounts the surviving image on fresh media.
//!
//! # Example
//!
//! ```ignore
//! use flashstore_engine::testing::CrashHarness;
//!
//! let harness = CrashHarness::new(MediaMode::EraseBlock, 4096, 4, config, |s| Ok(()))?;
//! let total = harness.measure(&workload)?;
//! for budget in 0..=total {
//!     let run = harness.run_cut(budget, &workload)?;
//!     // check run.store against the expected states
//! }
//! ```

use super::reference_model::{ReferenceModel, StateMismatch};
use crate::config::StoreConfig;
use crate::store::{RecoveryOutcome, Store};
use flashstore_core::{MediaMode, StoreResult};
use flashstore_storage::testing::{FaultPolicy, FaultyMedia};
use flashstore_storage::RamFlash;
use tracing::debug;

/// Store running on fault-injecting in-memory media.
pub type FaultyStore = Store<FaultyMedia<RamFlash>>;

/// Outcome of one power-cut run.
pub struct CrashRun {
    /// Units the media accepted before the cut
    pub budget: u64,
    /// The workload finished before power was lost
    pub completed: bool,
    /// Store remounted from the surviving image
    pub store: Store<RamFlash>,
    /// What the remount had to do
    pub outcome: RecoveryOutcome,
}

/// Replays a workload against a saved image with power cuts.
pub struct CrashHarness {
    mode: MediaMode,
    block_size: u32,
    config: StoreConfig,
    base: Vec<u8>,
}

impl CrashHarness {
    /// Format fresh media, run `setup` on it, and keep the resulting image.
    pub fn new<F>(
        mode: MediaMode,
        block_size: u32,
        block_count: u32,
        config: StoreConfig,
        setup: F,
    ) -> StoreResult<Self>
    where
        F: FnOnce(&mut Store<RamFlash>) -> StoreResult<()>,
    {
        let media = RamFlash::new(mode, block_size, block_count);
        let mut store = Store::new(media, config.clone())?;
        store.format()?;
        setup(&mut store)?;
        Ok(CrashHarness {
            mode,
            block_size,
            config,
            base: store.into_media().into_image(),
        })
    }

    /// Mount the saved image without faults.
    pub fn base_store(&self) -> StoreResult<Store<RamFlash>> {
        let media = RamFlash::from_image(self.mode, self.block_size, self.base.clone());
        let mut store = Store::new(media, self.config.clone())?;
        store.mount()?;
        Ok(store)
    }

    /// Units (bytes written plus erases) the mount and workload use when
    /// nothing fails.
    pub fn measure<W>(&self, workload: &W) -> StoreResult<u64>
    where
        W: Fn(&mut FaultyStore) -> StoreResult<()>,
    {
        let media = FaultyMedia::new(
            RamFlash::from_image(self.mode, self.block_size, self.base.clone()),
            FaultPolicy::Never,
        );
        let mut store = Store::new(media, self.config.clone())?;
        store.mount()?;
        workload(&mut store)?;
        Ok(store.media().units())
    }

    /// Mount and run the workload with power lost after `budget` units,
    /// then remount whatever reached the media.
    ///
    /// # Errors
    ///
    /// Any error other than the injected power loss, from the workload or
    /// from the remount.
    pub fn run_cut<W>(&self, budget: u64, workload: &W) -> StoreResult<CrashRun>
    where
        W: Fn(&mut FaultyStore) -> StoreResult<()>,
    {
        let media = FaultyMedia::new(
            RamFlash::from_image(self.mode, self.block_size, self.base.clone()),
            FaultPolicy::PowerCutAfter(budget),
        );
        let mut store = Store::new(media, self.config.clone())?;
        let result = store.mount().and_then(|_| workload(&mut store));
        let completed = match result {
            Ok(()) => true,
            Err(e) if e.is_power_loss() => false,
            Err(e) => return Err(e),
        };
        let image = store.into_media().into_inner().into_image();

        let media = RamFlash::from_image(self.mode, self.block_size, image);
        let mut store = Store::new(media, self.config.clone())?;
        let outcome = store.mount()?;
        debug!(target: "flashstore::recovery", budget, completed, outcome = ?outcome, "Crash run remounted");
        Ok(CrashRun {
            budget,
            completed,
            store,
            outcome,
        })
    }
}

/// Result of verifying state after recovery
#[derive(Debug)]
pub struct VerificationResult {
    /// Whether the state is valid
    pub is_valid: bool,
    /// Error message if any
    pub error: Option<String>,
    /// State mismatches found
    pub mismatches: Vec<StateMismatch>,
}

impl VerificationResult {
    /// Create successful verification
    pub fn success() -> Self {
        VerificationResult {
            is_valid: true,
            error: None,
            mismatches: vec![],
        }
    }

    /// Create failed verification with error
    pub fn error(msg: impl Into<String>) -> Self {
        VerificationResult {
            is_valid: false,
            error: Some(msg.into()),
            mismatches: vec![],
        }
    }

    /// Create failed verification with mismatches
    pub fn mismatches(mismatches: Vec<StateMismatch>) -> Self {
        VerificationResult {
            is_valid: mismatches.is_empty(),
            error: None,
            mismatches,
        }
    }

    /// Check that `actual` equals one of the allowed states exactly.
    ///
    /// Reports the mismatches against the closest candidate otherwise.
    pub fn one_of(actual: &ReferenceModel, allowed: &[&ReferenceModel]) -> Self {
        let mut best: Option<Vec<StateMismatch>> = None;
        for candidate in allowed {
            let mismatches = candidate.compare(actual);
            if mismatches.is_empty() {
                return Self::success();
            }
            if best.as_ref().map_or(true, |b| mismatches.len() < b.len()) {
                best = Some(mismatches);
            }
        }
        match best {
            Some(mismatches) => Self::mismatches(mismatches),
            None => Self::error("no allowed state given"),
        }
    }
}
