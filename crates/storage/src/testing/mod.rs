//! Testing support for storage-level fault injection
//!
//! `FaultyMedia` wraps any `MediaDriver` and injects power cuts or write
//! verification failures. The engine's crash harness drives it byte by byte.

pub mod faulty;

pub use faulty::{FaultPolicy, FaultyMedia};
