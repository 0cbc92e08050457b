//! Media driver abstraction
//!
//! The store talks to its media only through `MediaDriver`. Addresses are
//! absolute byte addresses; block `n` spans `[n * block_size, (n + 1) * block_size)`.
//!
//! Only `read`, `write` and `erase` must be implemented by a driver. `set`,
//! `copy` and `is_virgin` have default implementations layered on top of them,
//! so a wrapping driver that intercepts `write` sees every programmed byte.

mod ram;

pub use ram::RamFlash;

use flashstore_core::{MediaError, MediaMode, ERASED_BYTE};

/// Chunk size used by the default `copy` and `is_virgin`.
const CHUNK: usize = 512;

/// Busy state of the block containing an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    /// Ready for reads and writes.
    Idle,
    /// An erase is still running.
    Erasing,
}

/// Byte-level access to erase-block media.
pub trait MediaDriver {
    /// Overwrite semantics of the media.
    fn mode(&self) -> MediaMode;

    /// Bytes per erase block.
    fn block_size(&self) -> u32;

    /// Number of erase blocks.
    fn block_count(&self) -> u32;

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), MediaError>;

    /// Program `data` at `addr` and verify it.
    ///
    /// On erase-block media a byte can only move bits from 1 to 0; a write
    /// that would need the reverse fails with `MediaError::WriteVerify`.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MediaError>;

    /// Start erasing the block that contains `addr`.
    fn erase(&mut self, addr: u32) -> Result<(), MediaError>;

    /// Poll the busy state of the block containing `addr`.
    fn status(&mut self, addr: u32) -> MediaStatus;

    /// State of the write-protect switch.
    fn write_protected(&self) -> bool;

    /// Total size in bytes.
    fn capacity(&self) -> u64 {
        self.block_size() as u64 * self.block_count() as u64
    }

    /// Fill `len` bytes at `addr` with `value`.
    fn set(&mut self, addr: u32, len: u32, value: u8) -> Result<(), MediaError> {
        let mut done = 0u32;
        let chunk = vec![value; CHUNK];
        while done < len {
            let n = (len - done).min(CHUNK as u32);
            self.write(addr + done, &chunk[..n as usize])?;
            done += n;
        }
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst`. The ranges may overlap only
    /// when `dst < src`.
    fn copy(&mut self, src: u32, dst: u32, len: u32) -> Result<(), MediaError> {
        let mut buf = vec![0u8; CHUNK];
        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(CHUNK as u32) as usize;
            self.read(src + done, &mut buf[..n])?;
            self.write(dst + done, &buf[..n])?;
            done += n as u32;
        }
        Ok(())
    }

    /// True if every byte in the range still holds the erased value.
    fn is_virgin(&self, addr: u32, len: u32) -> Result<bool, MediaError> {
        let mut buf = vec![0u8; CHUNK];
        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(CHUNK as u32) as usize;
            self.read(addr + done, &mut buf[..n])?;
            if buf[..n].iter().any(|&b| b != ERASED_BYTE) {
                return Ok(false);
            }
            done += n as u32;
        }
        Ok(true)
    }

    /// Poll `status` until the erase at `addr` completes.
    ///
    /// # Errors
    ///
    /// `MediaError::EraseInProgress` if the block is still busy after
    /// `poll_limit` polls.
    fn wait_for_erase_done(&mut self, addr: u32, poll_limit: u32) -> Result<(), MediaError> {
        for _ in 0..poll_limit {
            if self.status(addr) == MediaStatus::Idle {
                return Ok(());
            }
        }
        Err(MediaError::EraseInProgress { addr })
    }
}
