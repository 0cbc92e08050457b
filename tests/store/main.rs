//! Integration tests for store operations.
//!
//! These tests drive a formatted store through its public API: object
//! lifecycle, transactions, separate sub-transactions, write protection and
//! allocation. Crash and wear behaviour live in the durability suite.

#[path = "../common/mod.rs"]
mod common;

mod allocation;
mod properties;
mod separate;
mod transactions;
