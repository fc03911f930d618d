#![forbid(unsafe_code)]
//! Space reservation policy.
//!
//! Everything here is a decision over the [`Ledger`]: whether a reservation
//! may proceed or must wait for garbage collection, which block becomes the
//! next write target, which block the collector should empty next, when an
//! erasable block is queued for erase, and when the background reclaimer
//! should run. No I/O happens in this crate; `ffl-core` carries out the
//! steps it asks for.
//!
//! ## Reservation admission
//!
//! A reservation needs `resv_blocks_write` blocks (`resv_blocks_deletion`
//! for deletions) counted as free or already being erased. While that is not
//! met the caller must collect garbage, unless reclaimable space is too low
//! to make progress:
//!
//! | Condition | Outcome |
//! |-----------|---------|
//! | enough free + erasing blocks | [`Admission::Ready`] |
//! | reclaimable bytes below `nospc_dirty_size` | `NoSpace` |
//! | free + dirty + erasing + unchecked ≤ needed blocks | `NoSpace` |
//! | otherwise | [`Admission::CollectGarbage`] |
//!
//! A deletion that would fail with `NoSpace` proceeds anyway while at least
//! `resv_blocks_deletion` blocks are free or erasing, so a full medium can
//! always be emptied.

mod levels;
mod summary;

pub use levels::{ReserveLevels, ReserveOverrides};
pub use summary::SummaryCollector;

use ffl_error::{FflError, Result};
use ffl_ledger::{BlockState, Ledger, ListEnd};
use ffl_types::BlockIndex;
use serde::{Deserialize, Serialize};

/// Selections per round of the garbage-collection source lottery.
const GC_PICK_ROUND: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Normal,
    /// Writes that free space (unlink records). May use the deletion reserve.
    Deletion,
}

/// Verdict of [`Allocator::check_admission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ready,
    CollectGarbage,
}

/// Verdict of [`Allocator::select_nextblock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextblockStep {
    /// `block` is now the write target.
    Selected(BlockIndex),
    /// No free block: erase one pending block and retry.
    EraseOne,
    /// Only blocks waiting for a write-buffer flush remain: pad-flush the
    /// buffer and retry.
    FlushBuffer,
}

/// Verdict of [`Allocator::find_gc_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPick {
    Block(BlockIndex),
    /// Only blocks waiting for a write-buffer flush are collectable.
    FlushBuffer,
    Nothing,
}

/// Blocks on their way back to the free list.
#[must_use]
pub fn erasing_blocks(ledger: &Ledger) -> u32 {
    ledger.count(BlockState::ErasePending)
        + ledger.count(BlockState::Erasing)
        + ledger.count(BlockState::EraseComplete)
}

/// Dirty bytes that an erase would actually reclaim.
///
/// Blocks already queued for erase count their whole sector as dirty in
/// the ledger; subtracting them avoids counting that space twice.
#[must_use]
pub fn reclaimable_size(ledger: &Ledger) -> u64 {
    let totals = ledger.totals();
    let queued = u64::from(erasing_blocks(ledger)) * u64::from(ledger.sector_size());
    (u64::from(totals.dirty_size) + u64::from(totals.erasing_size) + u64::from(totals.unchecked_size))
        .saturating_sub(queued)
}

#[derive(Debug, Clone)]
pub struct Allocator {
    levels: ReserveLevels,
    erase_defer_interval: u32,
    erasable_seen: u32,
    gc_tick: u32,
}

impl Allocator {
    /// `erase_defer_interval` of `n` leaves every `n`-th newly erasable
    /// block on the erasable list instead of queueing it for erase; zero
    /// queues every block at once.
    #[must_use]
    pub fn new(levels: ReserveLevels, erase_defer_interval: u32) -> Self {
        Self {
            levels,
            erase_defer_interval,
            erasable_seen: 0,
            gc_tick: 0,
        }
    }

    #[must_use]
    pub fn levels(&self) -> &ReserveLevels {
        &self.levels
    }

    #[must_use]
    pub fn blocks_needed(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Normal => self.levels.resv_blocks_write,
            Priority::Deletion => self.levels.resv_blocks_deletion,
        }
    }

    // ── Admission ───────────────────────────────────────────────────────────

    /// Decide whether a reservation may go ahead.
    pub fn check_admission(&self, ledger: &Ledger, priority: Priority) -> Result<Admission> {
        let needed = self.blocks_needed(priority);
        let available = ledger.count(BlockState::Free) + erasing_blocks(ledger);
        if available >= needed {
            return Ok(Admission::Ready);
        }
        let deletion_allowance =
            priority == Priority::Deletion && available >= self.levels.resv_blocks_deletion;

        let dirty = reclaimable_size(ledger);
        if dirty < u64::from(self.levels.nospc_dirty_size) {
            if deletion_allowance {
                tracing::info!(
                    target: "ffl::alloc",
                    dirty,
                    available,
                    "deletion_uses_reserve"
                );
                return Ok(Admission::Ready);
            }
            tracing::debug!(
                target: "ffl::alloc",
                dirty,
                floor = self.levels.nospc_dirty_size,
                "reserve_refused_low_dirty"
            );
            return Err(FflError::NoSpace);
        }

        let totals = ledger.totals();
        let avail_bytes = u64::from(totals.free_size)
            + u64::from(totals.dirty_size)
            + u64::from(totals.erasing_size)
            + u64::from(totals.unchecked_size);
        if avail_bytes / u64::from(ledger.sector_size()) <= u64::from(needed) {
            if deletion_allowance {
                tracing::info!(
                    target: "ffl::alloc",
                    avail_bytes,
                    available,
                    "deletion_uses_reserve"
                );
                return Ok(Admission::Ready);
            }
            tracing::debug!(
                target: "ffl::alloc",
                avail_bytes,
                needed,
                "reserve_refused_low_space"
            );
            return Err(FflError::NoSpace);
        }

        tracing::debug!(
            target: "ffl::alloc",
            available,
            needed,
            dirty,
            "reserve_needs_gc"
        );
        Ok(Admission::CollectGarbage)
    }

    // ── Write target ────────────────────────────────────────────────────────

    /// Make the head of the free list the write target, or say what must
    /// happen first.
    pub fn select_nextblock(&self, ledger: &mut Ledger) -> Result<NextblockStep> {
        if let Some(current) = ledger.nextblock() {
            return Ok(NextblockStep::Selected(current));
        }
        if let Some(free) = ledger.first_in(BlockState::Free) {
            ledger.file_block(free, BlockState::Nextblock, ListEnd::Tail)?;
            tracing::debug!(target: "ffl::alloc", block = free.0, "nextblock_selected");
            return Ok(NextblockStep::Selected(free));
        }
        if erasing_blocks(ledger) == 0 {
            if let Some(erasable) = ledger.first_in(BlockState::Erasable) {
                ledger.admit_erase(erasable)?;
                tracing::debug!(target: "ffl::alloc", block = erasable.0, "erasable_forced_to_erase");
            }
        }
        if erasing_blocks(ledger) == 0 {
            if ledger.count(BlockState::ErasablePendingFlush) > 0 {
                return Ok(NextblockStep::FlushBuffer);
            }
            tracing::warn!(target: "ffl::alloc", "no_free_or_erasable_blocks");
            return Err(FflError::NoSpace);
        }
        Ok(NextblockStep::EraseOne)
    }

    // ── Erase admission ─────────────────────────────────────────────────────

    /// Queue a block that just became erasable, unless this one is the
    /// periodic exception left on the erasable list. Returns true if the
    /// block was queued.
    pub fn admit_erasable(&mut self, ledger: &mut Ledger, index: BlockIndex) -> Result<bool> {
        let state = ledger.block(index).map(|b| b.state);
        if state != Some(BlockState::Erasable) {
            return Ok(false);
        }
        self.erasable_seen = self.erasable_seen.wrapping_add(1);
        if self.erase_defer_interval != 0 && self.erasable_seen % self.erase_defer_interval == 0 {
            tracing::debug!(target: "ffl::alloc", block = index.0, "erase_deferred");
            return Ok(false);
        }
        ledger.admit_erase(index)?;
        Ok(true)
    }

    // ── Garbage collection source ───────────────────────────────────────────

    /// Choose the block the collector empties next.
    ///
    /// Failed blocks go first when enough free blocks remain. Otherwise a
    /// rotating lottery prefers erasable (50 of 128 picks), very dirty (60),
    /// dirty (16) and clean (2) blocks, falling back through the other lists
    /// when the preferred one is empty. The chosen block becomes the GC
    /// source with its cursor at the first node and its wasted space turned
    /// into dirty space.
    pub fn find_gc_block(&mut self, ledger: &mut Ledger) -> Result<GcPick> {
        if let Some(current) = ledger.gcblock() {
            return Ok(GcPick::Block(current));
        }
        let n = self.gc_tick % GC_PICK_ROUND;
        self.gc_tick = self.gc_tick.wrapping_add(1);

        let has = |state: BlockState| ledger.count(state) > 0;
        let list = if has(BlockState::BadUsed)
            && ledger.count(BlockState::Free) > self.levels.resv_blocks_gcbad
        {
            BlockState::BadUsed
        } else if n < 50 && has(BlockState::Erasable) {
            BlockState::Erasable
        } else if n < 110 && has(BlockState::VeryDirty) {
            BlockState::VeryDirty
        } else if n < 126 && has(BlockState::Dirty) {
            BlockState::Dirty
        } else if has(BlockState::Clean) {
            BlockState::Clean
        } else if has(BlockState::Dirty) {
            BlockState::Dirty
        } else if has(BlockState::VeryDirty) {
            BlockState::VeryDirty
        } else if has(BlockState::Erasable) {
            BlockState::Erasable
        } else if has(BlockState::ErasablePendingFlush) {
            return Ok(GcPick::FlushBuffer);
        } else {
            tracing::debug!(target: "ffl::alloc", "no_gc_candidate");
            return Ok(GcPick::Nothing);
        };

        let Some(index) = ledger.first_in(list) else {
            return Ok(GcPick::Nothing);
        };
        ledger.file_block(index, BlockState::GcSource, ListEnd::Tail)?;
        ledger.reset_gc_cursor(index)?;
        ledger.convert_wasted_to_dirty(index)?;
        if let Some(block) = ledger.block(index) {
            tracing::debug!(
                target: "ffl::alloc",
                block = index.0,
                from = ?list,
                used = block.used_size,
                dirty = block.dirty_size,
                "gc_block_selected"
            );
        }
        Ok(GcPick::Block(index))
    }

    // ── Background reclaim ──────────────────────────────────────────────────

    /// True when the background reclaimer has work worth doing.
    #[must_use]
    pub fn should_wake(&self, ledger: &Ledger) -> bool {
        if ledger.count(BlockState::ErasePending) > 0 || ledger.count(BlockState::EraseComplete) > 0 {
            return true;
        }
        if ledger.totals().unchecked_size > 0 {
            return true;
        }
        let available = ledger.count(BlockState::Free) + erasing_blocks(ledger);
        let dirty = u64::from(ledger.totals().dirty_size) + u64::from(ledger.totals().erasing_size);
        let dirty = dirty
            .saturating_sub(u64::from(erasing_blocks(ledger)) * u64::from(ledger.sector_size()));
        if available < self.levels.resv_blocks_gctrigger
            && dirty > u64::from(self.levels.nospc_dirty_size)
        {
            return true;
        }
        ledger.count(BlockState::VeryDirty) >= self.levels.vdirty_blocks_gctrigger
    }
}
