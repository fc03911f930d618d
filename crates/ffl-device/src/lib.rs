#![forbid(unsafe_code)]
//! Flash device abstraction.
//!
//! The engine talks to the medium only through [`FlashDevice`]: page reads
//! and programs, whole-block erases and bad-block marking. Two media are
//! provided:
//!
//! - [`MemFlash`]: NOR semantics in memory (programming can only clear bits,
//!   erase resets a block to `0xFF`) with fault injection for tests.
//! - [`FileFlash`]: a flash image in a regular file, using positional
//!   `pread`/`pwrite` style I/O.

mod file;
mod mem;

pub use file::FileFlash;
pub use mem::{FaultPlan, MemFlash};

use ffl_error::{DeviceErrorKind, FflError, Result};
use ffl_types::{BlockIndex, FlashGeometry};
use serde::{Deserialize, Serialize};

/// Outcome of a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadStatus {
    Clean,
    /// ECC corrected bit flips; the returned data is valid.
    Corrected,
}

/// Operation counters kept by the in-tree devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_written: u64,
    pub erases: u64,
    pub bad_marks: u64,
}

pub trait FlashDevice: Send + Sync {
    fn geometry(&self) -> FlashGeometry;

    /// Read `buf.len()` bytes at `offset`.
    ///
    /// Uncorrectable ECC failures are reported as
    /// [`DeviceErrorKind::Uncorrectable`].
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<ReadStatus>;

    /// Program `data` at `offset`.
    ///
    /// On failure the error is [`DeviceErrorKind::Write`] carrying the number
    /// of bytes that reached the medium.
    fn write(&self, offset: u32, data: &[u8]) -> Result<()>;

    /// Erase a whole block back to `0xFF`.
    fn erase(&self, block: BlockIndex) -> Result<()>;

    /// Record `block` as permanently unusable.
    fn mark_bad(&self, block: BlockIndex) -> Result<()>;

    /// True if bits of an already programmed node may be cleared in place.
    fn can_mark_obsolete(&self) -> bool {
        true
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Reject ranges that leave the medium.
pub(crate) fn check_range(geometry: &FlashGeometry, offset: u32, len: usize) -> Result<()> {
    let end = u32::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or(FflError::Device {
            offset,
            kind: DeviceErrorKind::Fatal,
        })?;
    if end > geometry.flash_size {
        return Err(FflError::Device {
            offset,
            kind: DeviceErrorKind::Fatal,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_rejects_overflow() {
        let geo = FlashGeometry::new(8192, 4096, 512).expect("geometry");
        assert!(check_range(&geo, 0, 8192).is_ok());
        assert!(check_range(&geo, 4096, 4097).is_err());
        assert!(check_range(&geo, u32::MAX, 2).is_err());
    }
}
