//! Crash testing support
//!
//! - `ReferenceModel`: expected object contents, captured from a store or
//!   built by hand, and compared after recovery
//! - `CrashHarness`: replays a workload against a saved image, cutting power
//!   after every unit the workload writes, and remounts what is left

pub mod crash_harness;
pub mod reference_model;

pub use crash_harness::{CrashHarness, CrashRun, FaultyStore, VerificationResult};
pub use reference_model::{ReferenceModel, StateMismatch};
