//! Fault-injecting media wrapper
//!
//! Wraps a `MediaDriver` and fails writes according to a `FaultPolicy`.
//! Only the required driver methods are forwarded; `set` and `copy` use the
//! trait defaults so every programmed byte passes through `write` and is
//! counted.

use crate::media::{MediaDriver, MediaStatus};
use flashstore_core::{MediaError, MediaMode};
use std::sync::atomic::{AtomicU32, Ordering};

/// When the wrapper should inject failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Never fail (passthrough)
    Never,
    /// Let exactly this many units reach the media, then lose power.
    ///
    /// A unit is one programmed byte or one block erase. A write that
    /// crosses the limit keeps the bytes before the cut.
    PowerCutAfter(u64),
    /// Fail the next `times` writes that touch `[start, end)`. The touched
    /// bytes are programmed to zero, as a marginal cell would read back.
    FailWrites {
        /// First address of the bad range
        start: u32,
        /// One past the last address
        end: u32,
        /// How many writes still fail
        times: u32,
    },
}

/// Media wrapper that simulates power loss and bad cells.
pub struct FaultyMedia<M: MediaDriver> {
    inner: M,
    policy: FaultPolicy,
    units: u64,
    powered_off: bool,
    injected: u32,
    held_protect: AtomicU32,
}

impl<M: MediaDriver> FaultyMedia<M> {
    /// Wrap `inner` with the given policy.
    pub fn new(inner: M, policy: FaultPolicy) -> Self {
        FaultyMedia {
            inner,
            policy,
            units: 0,
            powered_off: false,
            injected: 0,
            held_protect: AtomicU32::new(0),
        }
    }

    /// Get the underlying media (for inspection)
    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Unwrap the underlying media, e.g. to remount its image.
    pub fn into_inner(self) -> M {
        self.inner
    }

    /// Units (bytes written plus erases) that reached the media.
    pub fn units(&self) -> u64 {
        self.units
    }

    /// True once a power cut has happened.
    pub fn is_powered_off(&self) -> bool {
        self.powered_off
    }

    /// Number of write failures injected so far.
    pub fn injected_failures(&self) -> u32 {
        self.injected
    }

    /// Replace the policy; counters keep running.
    pub fn set_policy(&mut self, policy: FaultPolicy) {
        self.policy = policy;
    }

    /// Report write protection for the next `queries` checks, whatever the
    /// inner media says.
    pub fn hold_write_protect(&self, queries: u32) {
        self.held_protect.store(queries, Ordering::Relaxed);
    }

    fn remaining_budget(&self) -> Option<u64> {
        match self.policy {
            FaultPolicy::PowerCutAfter(limit) => Some(limit.saturating_sub(self.units)),
            _ => None,
        }
    }
}

impl<M: MediaDriver> MediaDriver for FaultyMedia<M> {
    fn mode(&self) -> MediaMode {
        self.inner.mode()
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u32 {
        self.inner.block_count()
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), MediaError> {
        if self.powered_off {
            return Err(MediaError::PowerLoss);
        }
        self.inner.read(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MediaError> {
        if self.powered_off {
            return Err(MediaError::PowerLoss);
        }
        if let Some(remaining) = self.remaining_budget() {
            if (data.len() as u64) > remaining {
                let kept = remaining as usize;
                if kept > 0 {
                    self.inner.write(addr, &data[..kept])?;
                }
                self.units += kept as u64;
                self.powered_off = true;
                return Err(MediaError::PowerLoss);
            }
        }
        if let FaultPolicy::FailWrites { start, end, times } = &mut self.policy {
            let write_end = addr + data.len() as u32;
            if *times > 0 && addr < *end && write_end > *start {
                *times -= 1;
                self.injected += 1;
                let zeros = vec![0u8; data.len()];
                // Best effort: the range is burned whether or not this lands.
                let _ = self.inner.write(addr, &zeros);
                return Err(MediaError::WriteVerify {
                    addr: addr.max(*start),
                });
            }
        }
        self.inner.write(addr, data)?;
        self.units += data.len() as u64;
        Ok(())
    }

    fn erase(&mut self, addr: u32) -> Result<(), MediaError> {
        if self.powered_off {
            return Err(MediaError::PowerLoss);
        }
        if self.remaining_budget() == Some(0) {
            self.powered_off = true;
            return Err(MediaError::PowerLoss);
        }
        self.inner.erase(addr)?;
        self.units += 1;
        Ok(())
    }

    fn status(&mut self, addr: u32) -> MediaStatus {
        self.inner.status(addr)
    }

    fn write_protected(&self) -> bool {
        let held = self
            .held_protect
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        held.is_ok() || self.inner.write_protected()
    }
}
