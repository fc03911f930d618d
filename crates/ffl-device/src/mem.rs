use crate::{FlashDevice, FlashStats, ReadStatus, check_range};
use ffl_error::{DeviceErrorKind, FflError, Result};
use ffl_types::{BlockIndex, FlashGeometry};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

/// Pending faults for [`MemFlash`].
///
/// Every fault is one-shot unless stated otherwise; it is consumed by the
/// first operation it matches.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Next write programs this many bytes, then fails.
    pub fail_next_write_after: Option<u32>,
    /// Every write into these blocks fails without programming anything.
    pub failing_write_blocks: BTreeSet<u32>,
    /// Next write programs one flipped byte and reports success.
    pub corrupt_next_write: bool,
    /// Erase failures still to deliver, per block.
    pub erase_failures: BTreeMap<u32, u32>,
    /// Reads overlapping these ranges fail uncorrectably.
    pub unreadable: Vec<Range<u32>>,
    /// Reads overlapping these ranges succeed with corrected bit flips.
    pub corrected: Vec<Range<u32>>,
}

#[derive(Debug)]
struct MemFlashState {
    data: Vec<u8>,
    bad: BTreeSet<u32>,
    faults: FaultPlan,
    stats: FlashStats,
}

/// In-memory NOR flash.
///
/// Programming ANDs the new bytes into the medium, so bits only ever move
/// from 1 to 0 until the block is erased.
#[derive(Debug)]
pub struct MemFlash {
    geometry: FlashGeometry,
    mark_obsolete: bool,
    state: Mutex<MemFlashState>,
}

impl MemFlash {
    /// A fully erased medium.
    #[must_use]
    pub fn new(geometry: FlashGeometry) -> Self {
        Self {
            geometry,
            mark_obsolete: true,
            state: Mutex::new(MemFlashState {
                data: vec![0xFF; geometry.flash_size as usize],
                bad: BTreeSet::new(),
                faults: FaultPlan::default(),
                stats: FlashStats::default(),
            }),
        }
    }

    /// Model a medium that cannot clear bits inside a programmed page.
    #[must_use]
    pub fn without_obsolete_marking(mut self) -> Self {
        self.mark_obsolete = false;
        self
    }

    pub fn with_faults<R>(&self, f: impl FnOnce(&mut FaultPlan) -> R) -> R {
        f(&mut self.state.lock().faults)
    }

    #[must_use]
    pub fn stats(&self) -> FlashStats {
        self.state.lock().stats
    }

    #[must_use]
    pub fn bad_blocks(&self) -> Vec<BlockIndex> {
        self.state.lock().bad.iter().copied().map(BlockIndex).collect()
    }

    /// Copy of the raw medium contents, bypassing faults and counters.
    #[must_use]
    pub fn snapshot(&self, range: Range<u32>) -> Vec<u8> {
        let state = self.state.lock();
        let end = range.end.min(self.geometry.flash_size) as usize;
        let start = (range.start as usize).min(end);
        state.data[start..end].to_vec()
    }
}

fn overlaps(ranges: &[Range<u32>], offset: u32, len: u32) -> bool {
    let end = offset.saturating_add(len);
    ranges.iter().any(|r| r.start < end && offset < r.end)
}

impl FlashDevice for MemFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<ReadStatus> {
        check_range(&self.geometry, offset, buf.len())?;
        let len = buf.len() as u32;
        let mut state = self.state.lock();
        state.stats.reads += 1;
        if overlaps(&state.faults.unreadable, offset, len) {
            tracing::warn!(target: "ffl::device", offset, len, "mem_flash_injected_read_failure");
            return Err(FflError::Device {
                offset,
                kind: DeviceErrorKind::Uncorrectable,
            });
        }
        let start = offset as usize;
        buf.copy_from_slice(&state.data[start..start + buf.len()]);
        if overlaps(&state.faults.corrected, offset, len) {
            return Ok(ReadStatus::Corrected);
        }
        Ok(ReadStatus::Clean)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        check_range(&self.geometry, offset, data.len())?;
        let block = self.geometry.block_of(offset).0;
        let mut state = self.state.lock();
        state.stats.writes += 1;

        let mut programmed = data.len();
        let mut failure = None;
        if state.faults.failing_write_blocks.contains(&block) {
            programmed = 0;
            failure = Some(0);
        } else if let Some(after) = state.faults.fail_next_write_after.take() {
            programmed = programmed.min(after as usize);
            failure = Some(programmed as u32);
        }

        let start = offset as usize;
        for (dst, src) in state.data[start..start + programmed]
            .iter_mut()
            .zip(data.iter())
        {
            *dst &= *src;
        }
        state.stats.bytes_written += programmed as u64;

        if let Some(written) = failure {
            tracing::warn!(target: "ffl::device", offset, written, "mem_flash_injected_write_failure");
            return Err(FflError::Device {
                offset,
                kind: DeviceErrorKind::Write { written },
            });
        }
        if state.faults.corrupt_next_write && !data.is_empty() {
            state.faults.corrupt_next_write = false;
            let byte = state.data[start];
            state.data[start] = if byte == 0 { 1 } else { byte & (byte - 1) };
            tracing::warn!(target: "ffl::device", offset, "mem_flash_injected_silent_corruption");
        }
        Ok(())
    }

    fn erase(&self, block: BlockIndex) -> Result<()> {
        let start = self.geometry.block_start(block);
        check_range(&self.geometry, start, self.geometry.sector_size as usize)?;
        let mut state = self.state.lock();
        state.stats.erases += 1;
        if let Some(remaining) = state.faults.erase_failures.get_mut(&block.0) {
            *remaining -= 1;
            if *remaining == 0 {
                state.faults.erase_failures.remove(&block.0);
            }
            tracing::warn!(target: "ffl::device", block = block.0, "mem_flash_injected_erase_failure");
            return Err(FflError::Device {
                offset: start,
                kind: DeviceErrorKind::Erase,
            });
        }
        let start = start as usize;
        let end = start + self.geometry.sector_size as usize;
        state.data[start..end].fill(0xFF);
        Ok(())
    }

    fn mark_bad(&self, block: BlockIndex) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.bad_marks += 1;
        state.bad.insert(block.0);
        Ok(())
    }

    fn can_mark_obsolete(&self) -> bool {
        self.mark_obsolete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flash() -> MemFlash {
        MemFlash::new(FlashGeometry::new(16 * 1024, 4096, 256).expect("geometry"))
    }

    #[test]
    fn programming_only_clears_bits() {
        let dev = flash();
        dev.write(0, &[0xF0, 0x0F]).expect("write");
        dev.write(0, &[0x3C, 0xFF]).expect("write");
        let mut buf = [0_u8; 2];
        dev.read(0, &mut buf).expect("read");
        assert_eq!(buf, [0x30, 0x0F]);
    }

    #[test]
    fn erase_restores_block() {
        let dev = flash();
        dev.write(4096, &[0; 16]).expect("write");
        dev.erase(BlockIndex(1)).expect("erase");
        assert!(dev.snapshot(4096..8192).iter().all(|b| *b == 0xFF));
        assert_eq!(dev.stats().erases, 1);
    }

    #[test]
    fn injected_partial_write_reports_progress() {
        let dev = flash();
        dev.with_faults(|f| f.fail_next_write_after = Some(3));
        let err = dev.write(8, &[0; 8]).expect_err("fault");
        assert_eq!(err.bytes_written(), 3);
        assert_eq!(dev.snapshot(8..16), vec![0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        dev.write(8, &[0; 8]).expect("fault consumed");
    }

    #[test]
    fn block_write_failures_persist() {
        let dev = flash();
        dev.with_faults(|f| f.failing_write_blocks.insert(2));
        assert!(dev.write(8192, &[1]).is_err());
        assert!(dev.write(8200, &[1]).is_err());
        assert!(dev.write(0, &[1]).is_ok());
    }

    #[test]
    fn silent_corruption_differs_from_source() {
        let dev = flash();
        dev.with_faults(|f| f.corrupt_next_write = true);
        dev.write(0, &[0xAB]).expect("reports success");
        assert_ne!(dev.snapshot(0..1), vec![0xAB]);
    }

    #[test]
    fn read_faults_and_corrections() {
        let dev = flash();
        dev.with_faults(|f| {
            f.unreadable.push(100..104);
            f.corrected.push(200..300);
        });
        let mut buf = [0_u8; 8];
        assert!(matches!(
            dev.read(96, &mut buf),
            Err(FflError::Device {
                kind: DeviceErrorKind::Uncorrectable,
                ..
            })
        ));
        assert_eq!(dev.read(196, &mut buf).expect("read"), ReadStatus::Corrected);
        assert_eq!(dev.read(0, &mut buf).expect("read"), ReadStatus::Clean);
    }

    #[test]
    fn erase_failures_are_counted_down() {
        let dev = flash();
        dev.with_faults(|f| f.erase_failures.insert(1, 2));
        assert!(dev.erase(BlockIndex(1)).is_err());
        assert!(dev.erase(BlockIndex(1)).is_err());
        assert!(dev.erase(BlockIndex(1)).is_ok());
    }

    #[test]
    fn out_of_range_access_is_fatal() {
        let dev = flash();
        let mut buf = [0_u8; 4];
        assert!(dev.read(16 * 1024 - 2, &mut buf).is_err());
        assert!(dev.erase(BlockIndex(4)).is_err());
    }
}
