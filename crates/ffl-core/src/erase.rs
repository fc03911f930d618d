//! Erase scheduling.
//!
//! Blocks queued for erase are erased either inline
//! ([`Volume::erase_pending_blocks`]) or by an external executor that
//! claims them with [`Volume::start_erases`] and reports back through
//! [`Volume::erase_completed`] / [`Volume::erase_failed`]. Either way a
//! finished erase is checked for all-ones, gets its clean marker, and joins
//! the free list; repeated failures retire the block as bad.

use crate::Volume;
use ffl_error::{FflError, Result};
use ffl_ledger::BlockState;
use ffl_ondisk::cleanmarker;
use ffl_types::BlockIndex;

impl Volume {
    /// Erase up to `count` pending blocks now. Returns how many reached the
    /// free list.
    pub fn erase_pending_blocks(&self, count: usize) -> Result<usize> {
        let mut freed = 0;
        for _ in 0..count {
            let Some(block) = self.claim_erase()? else {
                break;
            };
            match self.device.erase(block) {
                Ok(()) => {
                    if self.finish_erase(block)? {
                        freed += 1;
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(target: "ffl::core", block = block.0, error = %err, "erase_failed");
                    self.fail_erase(block)?;
                }
            }
        }
        Ok(freed)
    }

    /// Claim up to `count` pending blocks for an external erase executor.
    pub fn start_erases(&self, count: usize) -> Result<Vec<BlockIndex>> {
        let mut started = Vec::new();
        while started.len() < count {
            let Some(block) = self.claim_erase()? else {
                break;
            };
            started.push(block);
        }
        Ok(started)
    }

    /// An externally run erase of `block` finished successfully.
    pub fn erase_completed(&self, block: BlockIndex) -> Result<()> {
        self.expect_erasing(block)?;
        self.finish_erase(block).map(|_| ())
    }

    /// An externally run erase of `block` failed. Returns true if the block
    /// was retired as bad.
    pub fn erase_failed(&self, block: BlockIndex) -> Result<bool> {
        self.expect_erasing(block)?;
        self.fail_erase(block)
    }

    fn expect_erasing(&self, block: BlockIndex) -> Result<()> {
        let state = self.with_ledger(|l| l.block(block).map(|b| b.state));
        if state != Some(BlockState::Erasing) {
            return Err(FflError::NotFound(format!(
                "block {block} is not being erased (state {state:?})"
            )));
        }
        Ok(())
    }

    /// Move the first pending block to `Erasing`.
    fn claim_erase(&self) -> Result<Option<BlockIndex>> {
        let _erase_free = self.erase_free.lock();
        let mut space = self.space.lock();
        let Some(block) = space.ledger.first_in(BlockState::ErasePending) else {
            return Ok(None);
        };
        space.ledger.begin_erase(block)?;
        tracing::debug!(target: "ffl::core", block = block.0, "erase_started");
        Ok(Some(block))
    }

    /// Verify an erased block, write its clean marker and free it. Returns
    /// false if the block turned out unusable and went back for another try
    /// (or was retired).
    fn finish_erase(&self, block: BlockIndex) -> Result<bool> {
        self.space.lock().ledger.erase_succeeded(block)?;

        let start = self.geometry.block_start(block);
        let page = self.geometry.page_size;
        let mut buf = vec![0_u8; page as usize];
        for ofs in (0..self.geometry.sector_size).step_by(page as usize) {
            let verdict = match self.device.read(start + ofs, &mut buf) {
                Ok(_) => buf.iter().position(|b| *b != 0xFF).map(|at| {
                    format!("byte {:#x} reads {:#04x}", start + ofs + at as u32, buf[at])
                }),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => Some(err.to_string()),
            };
            if let Some(detail) = verdict {
                tracing::warn!(target: "ffl::core", block = block.0, detail = %detail, "erase_verify_failed");
                self.fail_erase(block)?;
                return Ok(false);
            }
        }

        let marker = self.config.cleanmarker_size;
        if marker > 0 {
            if let Err(err) = self.device.write(start, &cleanmarker()) {
                if err.is_fatal() {
                    return Err(err);
                }
                tracing::warn!(target: "ffl::core", block = block.0, error = %err, "cleanmarker_write_failed");
                self.fail_erase(block)?;
                return Ok(false);
            }
        }

        let mut space = self.space.lock();
        space.ledger.mark_erased(block, marker)?;
        self.erase_wait.notify_all();
        tracing::debug!(target: "ffl::core", block = block.0, "erase_finished");
        Ok(true)
    }

    fn fail_erase(&self, block: BlockIndex) -> Result<bool> {
        let retired = {
            let mut space = self.space.lock();
            let retired = space
                .ledger
                .erase_failed(block, self.config.max_erase_failures)?;
            self.erase_wait.notify_all();
            retired
        };
        if retired {
            tracing::warn!(target: "ffl::core", block = block.0, "block_retired");
            if let Err(err) = self.device.mark_bad(block) {
                tracing::warn!(target: "ffl::core", block = block.0, error = %err, "mark_bad_failed");
            }
        }
        Ok(retired)
    }
}
