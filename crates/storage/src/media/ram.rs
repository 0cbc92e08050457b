//! In-memory media
//!
//! `RamFlash` keeps the whole device in a `Vec<u8>`. In erase-block mode it
//! programs bytes the way NOR flash does (`new = old & data`), so writing
//! over a programmed byte fails verification exactly where real hardware
//! would. Erases complete immediately but report `Erasing` for a configurable
//! number of status polls.

use super::{MediaDriver, MediaStatus};
use flashstore_core::{MediaError, MediaMode, ERASED_BYTE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Simulated flash or SRAM card.
#[derive(Debug, Clone)]
pub struct RamFlash {
    mode: MediaMode,
    block_size: u32,
    data: Vec<u8>,
    erase_counts: Vec<u32>,
    busy_polls: Vec<u32>,
    erase_latency: u32,
    protect: Arc<AtomicBool>,
}

impl RamFlash {
    /// Create fully erased media.
    pub fn new(mode: MediaMode, block_size: u32, block_count: u32) -> Self {
        let len = block_size as usize * block_count as usize;
        Self::from_image(mode, block_size, vec![ERASED_BYTE; len])
    }

    /// Rebuild media from a raw image (e.g. one captured after a power cut).
    ///
    /// Erase counters start at zero and the write-protect switch is off.
    pub fn from_image(mode: MediaMode, block_size: u32, image: Vec<u8>) -> Self {
        let blocks = image.len() / block_size.max(1) as usize;
        RamFlash {
            mode,
            block_size,
            data: image,
            erase_counts: vec![0; blocks],
            busy_polls: vec![0; blocks],
            erase_latency: 0,
            protect: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make each erase report `Erasing` for `polls` status calls.
    pub fn with_erase_latency(mut self, polls: u32) -> Self {
        self.erase_latency = polls;
        self
    }

    /// Raw contents.
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    /// Consume the media and return its raw contents.
    pub fn into_image(self) -> Vec<u8> {
        self.data
    }

    /// Physical erase operations performed per block since creation.
    pub fn erase_counts(&self) -> &[u32] {
        &self.erase_counts
    }

    /// Shared handle to the write-protect switch.
    ///
    /// Clones of this media share the same switch.
    pub fn write_protect_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.protect)
    }

    /// Flip the write-protect switch.
    pub fn set_write_protected(&self, on: bool) {
        self.protect.store(on, Ordering::SeqCst);
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>, MediaError> {
        let start = addr as usize;
        let end = start.checked_add(len).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => Ok(start..end),
            None => Err(MediaError::OutOfRange {
                addr,
                len: len as u32,
            }),
        }
    }

    fn check_idle(&self, range: &std::ops::Range<usize>) -> Result<(), MediaError> {
        if range.is_empty() {
            return Ok(());
        }
        let first = range.start / self.block_size as usize;
        let last = (range.end - 1) / self.block_size as usize;
        for block in first..=last {
            if self.busy_polls[block] > 0 {
                return Err(MediaError::EraseInProgress {
                    addr: (block as u32) * self.block_size,
                });
            }
        }
        Ok(())
    }
}

impl MediaDriver for RamFlash {
    fn mode(&self) -> MediaMode {
        self.mode
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.erase_counts.len() as u32
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), MediaError> {
        let range = self.check_range(addr, buf.len())?;
        self.check_idle(&range)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MediaError> {
        if self.write_protected() {
            return Err(MediaError::WriteProtected);
        }
        let range = self.check_range(addr, data.len())?;
        self.check_idle(&range)?;
        let target = &mut self.data[range];
        match self.mode {
            MediaMode::Rewritable => {
                target.copy_from_slice(data);
                Ok(())
            }
            MediaMode::EraseBlock => {
                let mut failed = None;
                for (i, (cell, &byte)) in target.iter_mut().zip(data).enumerate() {
                    *cell &= byte;
                    if *cell != byte && failed.is_none() {
                        failed = Some(i);
                    }
                }
                match failed {
                    Some(i) => Err(MediaError::WriteVerify {
                        addr: addr + i as u32,
                    }),
                    None => Ok(()),
                }
            }
        }
    }

    fn erase(&mut self, addr: u32) -> Result<(), MediaError> {
        if self.write_protected() {
            return Err(MediaError::WriteProtected);
        }
        let block = (addr / self.block_size) as usize;
        if block >= self.erase_counts.len() {
            return Err(MediaError::OutOfRange {
                addr,
                len: self.block_size,
            });
        }
        let start = block * self.block_size as usize;
        let end = start + self.block_size as usize;
        self.data[start..end].fill(ERASED_BYTE);
        self.erase_counts[block] += 1;
        self.busy_polls[block] = self.erase_latency;
        Ok(())
    }

    fn status(&mut self, addr: u32) -> MediaStatus {
        let block = (addr / self.block_size) as usize;
        match self.busy_polls.get_mut(block) {
            Some(polls) if *polls > 0 => {
                *polls -= 1;
                MediaStatus::Erasing
            }
            _ => MediaStatus::Idle,
        }
    }

    fn write_protected(&self) -> bool {
        self.protect.load(Ordering::SeqCst)
    }
}
