//! Integration tests for durability.
//!
//! These tests cut power at every byte boundary of a workload and check
//! what the next mount recovers, and they check that erase counts and wear
//! leveling survive long workloads and reformatting.

#[path = "../common/mod.rs"]
mod common;

mod crash_atomicity;
mod format;
mod wear;
