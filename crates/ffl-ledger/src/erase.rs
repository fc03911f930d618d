//! Erase lifecycle and failure refiling.

use crate::{BlockState, Ledger, ListEnd, inconsistent};
use ffl_error::Result;
use ffl_types::{BlockIndex, RefState};

impl Ledger {
    /// Queue an erasable block for erasure.
    pub fn admit_erase(&mut self, index: BlockIndex) -> Result<()> {
        let block = self.blk(index)?;
        if block.live_size() != 0 {
            return Err(inconsistent(format!(
                "block {index} queued for erase with {} live bytes",
                block.live_size()
            )));
        }
        self.file_block(index, BlockState::ErasePending, ListEnd::Tail)
    }

    /// The write buffer has been flushed: blocks that were only waiting for
    /// it become plain erasable. Returns the blocks that moved.
    pub fn release_flush_waiters(&mut self) -> Result<Vec<BlockIndex>> {
        let waiting = self.blocks_in(BlockState::ErasablePendingFlush);
        for index in &waiting {
            self.file_block(*index, BlockState::Erasable, ListEnd::Tail)?;
        }
        Ok(waiting)
    }

    /// Start erasing a pending block: drop its references, zero its
    /// counters and move its sector into `erasing_size`.
    pub fn begin_erase(&mut self, index: BlockIndex) -> Result<()> {
        let block = self.blk(index)?;
        if block.state != BlockState::ErasePending {
            return Err(inconsistent(format!(
                "erase started on block {index} in state {:?}",
                block.state
            )));
        }
        if block.live_size() != 0 {
            return Err(inconsistent(format!(
                "erase started on block {index} holding {} live bytes",
                block.live_size()
            )));
        }
        let (free, dirty, wasted) = (block.free_size, block.dirty_size, block.wasted_size);
        let nodes = std::mem::take(&mut self.blk_mut(index)?.nodes);
        for id in nodes {
            let owner = self.node(id).and_then(|n| n.owner);
            if let Some(ino) = owner {
                if let Some(ic) = self.inode_mut(ino) {
                    ic.nodes.remove(&id);
                }
            }
            self.release_ref(id);
        }

        let block = self.blk_mut(index)?;
        block.free_size = 0;
        block.dirty_size = 0;
        block.wasted_size = 0;
        block.gc_cursor = 0;
        self.totals.free_size -= free;
        self.totals.dirty_size -= dirty;
        self.totals.wasted_size -= wasted;
        self.totals.erasing_size += self.geometry.sector_size;
        self.file_block(index, BlockState::Erasing, ListEnd::Tail)?;
        tracing::debug!(target: "ffl::ledger", block = index.0, "erase_started");
        Ok(())
    }

    /// The device finished erasing; the block awaits verification and its
    /// clean marker.
    pub fn erase_succeeded(&mut self, index: BlockIndex) -> Result<()> {
        let state = self.blk(index)?.state;
        if state != BlockState::Erasing {
            return Err(inconsistent(format!(
                "erase completion for block {index} in state {state:?}"
            )));
        }
        self.file_block(index, BlockState::EraseComplete, ListEnd::Tail)
    }

    /// Return a verified, marked block to the free list.
    ///
    /// `cleanmarker_len` bytes at the start of the block are linked as a
    /// live, owner-less node (zero for media without clean markers).
    pub fn mark_erased(&mut self, index: BlockIndex, cleanmarker_len: u32) -> Result<()> {
        let state = self.blk(index)?.state;
        if state != BlockState::EraseComplete {
            return Err(inconsistent(format!(
                "block {index} marked erased from state {state:?}"
            )));
        }
        let sector = self.geometry.sector_size;
        self.totals.erasing_size -= sector;
        self.totals.free_size += sector;
        let block = self.blk_mut(index)?;
        block.free_size = sector;
        let offset = block.offset;
        self.file_block(index, BlockState::Free, ListEnd::Tail)?;
        if cleanmarker_len > 0 {
            self.link_node_ref(index, offset, cleanmarker_len, RefState::Normal, None)?;
        }
        tracing::info!(target: "ffl::ledger", block = index.0, "block_erased");
        Ok(())
    }

    /// An erase (or its verification) failed.
    ///
    /// Below `max_failures` accumulated failures the block is queued again
    /// as fully dirty; at the limit it becomes `Bad` for good. Returns true
    /// when the block was retired.
    pub fn erase_failed(&mut self, index: BlockIndex, max_failures: u32) -> Result<bool> {
        let state = self.blk(index)?.state;
        if !state.in_erase() {
            return Err(inconsistent(format!(
                "erase failure reported for block {index} in state {state:?}"
            )));
        }
        let sector = self.geometry.sector_size;
        self.totals.erasing_size -= sector;
        let block = self.blk_mut(index)?;
        block.bad_count += 1;
        let failures = block.bad_count;
        if failures < max_failures {
            block.dirty_size = sector;
            self.totals.dirty_size += sector;
            self.file_block(index, BlockState::ErasePending, ListEnd::Tail)?;
            tracing::warn!(target: "ffl::ledger", block = index.0, failures, "erase_failed_retry");
            return Ok(false);
        }
        self.totals.bad_size += sector;
        self.file_block(index, BlockState::Bad, ListEnd::Tail)?;
        tracing::error!(target: "ffl::ledger", block = index.0, failures, "block_retired_bad");
        Ok(true)
    }

    /// File a block whose programming failed.
    ///
    /// Remaining free space becomes wasted, then the block moves to
    /// `BadUsed` if it still holds live nodes, or straight to
    /// `ErasePending` otherwise.
    pub fn refile_failed_block(&mut self, index: BlockIndex) -> Result<BlockState> {
        self.fill_remainder(index, true)?;
        let live = self.blk(index)?.live_size();
        let state = if live > 0 {
            BlockState::BadUsed
        } else {
            BlockState::ErasePending
        };
        self.file_block(index, state, ListEnd::Head)?;
        tracing::warn!(target: "ffl::ledger", block = index.0, state = ?state, live, "failed_block_refiled");
        Ok(state)
    }
}
