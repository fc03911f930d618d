//! Space reservation.
//!
//! A reservation hands out a contiguous run at the write frontier of the
//! current nextblock. Ordinary writes first pass admission control and run
//! garbage collection until enough blocks are free; the collector itself and
//! write-buffer recovery reserve without admission.

use crate::gc::GcOutcome;
use crate::{SpaceState, Txn, Volume};
use ffl_alloc::{Admission, NextblockStep, Priority};
use ffl_error::{FflError, Result};
use ffl_ledger::BlockState;
use ffl_ondisk::{NodeHeader, NodeKind, SummaryEntry, encode_summary};
use ffl_types::{BlockIndex, InodeNumber, NodeRefId, RefState, pad4, read_le_u32};
use std::time::Duration;

/// Longest a reservation sleeps before re-checking for erased blocks.
const ERASE_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Space granted at the frontier of `block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Grant {
    pub(crate) block: BlockIndex,
    pub(crate) offset: u32,
    pub(crate) len: u32,
}

/// How space for a node is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reserve {
    /// Subject to admission control; may run the collector first.
    Write(Priority),
    /// For the collector and recovery: no admission control.
    Gc,
}

/// Summary entry describing `bytes` written at block-relative `offset`, for
/// node types the summary records.
pub(crate) fn summary_entry(bytes: &[u8], offset: u32) -> Option<SummaryEntry> {
    let header = NodeHeader::parse(bytes).ok()?;
    if !matches!(header.kind(), NodeKind::Inode | NodeKind::Unlink) {
        return None;
    }
    Some(SummaryEntry {
        nodetype: header.nodetype,
        offset,
        totlen: header.totlen,
        ino: read_le_u32(bytes, 12).ok()?,
        version: read_le_u32(bytes, 16).ok()?,
    })
}

fn node_len(bytes: &[u8]) -> Result<u32> {
    u32::try_from(bytes.len())
        .map(pad4)
        .map_err(|_| FflError::Inconsistent(format!("node of {} bytes", bytes.len())))
}

impl Volume {
    /// Sleep until an erase finishes or the wait is interrupted.
    pub(crate) fn wait_for_erase(&self) -> Result<()> {
        let mut space = self.space.lock();
        if !self.take_interrupt() {
            let ledger = &space.ledger;
            let ready = ledger.count(BlockState::Free) > 0
                || ledger.count(BlockState::ErasePending) > 0
                || ledger.count(BlockState::EraseComplete) > 0;
            if !ready {
                tracing::debug!(
                    target: "ffl::core",
                    erasing = ledger.count(BlockState::Erasing),
                    "erase_wait"
                );
                let _ = self.erase_wait.wait_for(&mut space, ERASE_WAIT_SLICE);
            }
            if !self.take_interrupt() {
                return Ok(());
            }
        }
        tracing::info!(target: "ffl::core", "reserve_interrupted");
        Err(FflError::Interrupted)
    }

    /// Reserve at least `min` bytes for nodes the caller writes through the
    /// returned [`Reservation`].
    ///
    /// The reservation locks out every other writer until it is dropped.
    pub fn reserve_space(&self, min: u32, priority: Priority) -> Result<Reservation<'_>> {
        let usable = self.geometry.sector_size - self.config.cleanmarker_size;
        if min == 0 || pad4(min) > usable {
            return Err(FflError::Config(format!(
                "reservation of {min} bytes outside 1..={usable}"
            )));
        }
        let mut txn = self.txn()?;
        let result = txn.reserve(min, usable, Reserve::Write(priority), Some(1));
        self.note_result(&result);
        let grant = result?;
        Ok(Reservation { txn, grant })
    }
}

impl Txn<'_> {
    // ── Reservation ─────────────────────────────────────────────────────────

    /// Reserve between `min` and `desired` bytes.
    ///
    /// `entries` is the number of summary entries the caller will record in
    /// the space; `None` writes nodes the summary cannot describe and turns
    /// summary collection off for the block.
    pub(crate) fn reserve(
        &mut self,
        min: u32,
        desired: u32,
        reserve: Reserve,
        entries: Option<u32>,
    ) -> Result<Grant> {
        let usable = self.vol.geometry.sector_size - self.vol.config.cleanmarker_size;
        if pad4(min) > usable {
            tracing::error!(target: "ffl::core", min, usable, "reservation_exceeds_block");
            return Err(FflError::Inconsistent(format!(
                "reservation of {min} bytes exceeds the {usable} usable bytes of a block"
            )));
        }
        let Reserve::Write(priority) = reserve else {
            loop {
                if let Some(grant) = self.do_reserve(min, desired, entries)? {
                    return Ok(grant);
                }
            }
        };
        loop {
            let admission = {
                let space = self.vol.space.lock();
                space.alloc.check_admission(&space.ledger, priority)?
            };
            match admission {
                Admission::CollectGarbage => match self.gc_pass()? {
                    GcOutcome::Progress => {}
                    GcOutcome::Waiting => self.vol.wait_for_erase()?,
                    GcOutcome::Idle => {
                        tracing::debug!(target: "ffl::core", min, "reserve_gc_idle");
                        return Err(FflError::NoSpace);
                    }
                },
                Admission::Ready => {
                    if let Some(grant) = self.do_reserve(min, desired, entries)? {
                        return Ok(grant);
                    }
                }
            }
        }
    }

    /// One attempt at carving space out of the nextblock. `None` means
    /// something changed underneath (an erase ran, the buffer was flushed)
    /// and the caller should start over.
    fn do_reserve(
        &mut self,
        min: u32,
        desired: u32,
        entries: Option<u32>,
    ) -> Result<Option<Grant>> {
        let vol = self.vol;
        let min = pad4(min);
        loop {
            let mut space = vol.space.lock();
            if entries.is_none() {
                space.summary.disable();
            }
            let Some(block) = space.ledger.nextblock() else {
                let SpaceState {
                    ledger,
                    alloc,
                    summary,
                } = &mut *space;
                match alloc.select_nextblock(ledger)? {
                    NextblockStep::Selected(block) => {
                        summary.reset(block);
                        continue;
                    }
                    NextblockStep::EraseOne => {
                        drop(space);
                        let erased = vol.erase_pending_blocks(1)?;
                        if erased == 0 && vol.with_ledger(|l| l.count(BlockState::Free)) == 0 {
                            vol.wait_for_erase()?;
                        }
                        return Ok(None);
                    }
                    NextblockStep::FlushBuffer => {
                        drop(space);
                        self.flush_padded()?;
                        return Ok(None);
                    }
                }
            };

            let (free, used, nodes, first) = space
                .ledger
                .block(block)
                .map(|b| (b.free_size, b.used_size, b.node_count(), b.first_node()))
                .ok_or_else(|| FflError::Inconsistent(format!("nextblock {block} missing")))?;
            let reserved = space.summary.reserved_size(entries.unwrap_or(0));

            if space.summary.is_active() {
                if min + reserved > free {
                    if space.summary.is_empty() {
                        space.summary.disable();
                        continue;
                    }
                    drop(space);
                    self.write_summary(block)?;
                    continue;
                }
            } else if min > free {
                if self.wbuf.is_dirty() && self.wbuf.block() == Some(block) {
                    drop(space);
                    self.flush_padded()?;
                    continue;
                }
                space.ledger.fill_remainder(block, true)?;
                space.ledger.close_nextblock()?;
                continue;
            }

            // The clean marker goes obsolete with the first node after it.
            let marker = vol.config.cleanmarker_size;
            if marker > 0 && nodes == 1 && used == marker {
                let lone_marker = first.filter(|id| {
                    space
                        .ledger
                        .node(*id)
                        .is_some_and(|n| n.owner.is_none() && !n.is_obsolete())
                });
                if let Some(id) = lone_marker {
                    drop(space);
                    self.obsolete_ref(id)?;
                    continue;
                }
            }

            let offset = space.ledger.frontier(block)?;
            let len = pad4(desired).max(min).min(free - reserved);
            tracing::trace!(
                target: "ffl::core",
                block = block.0,
                offset,
                len,
                min,
                reserved,
                "space_reserved"
            );
            return Ok(Some(Grant { block, offset, len }));
        }
    }

    /// Close `block` with a summary node covering the rest of it. Summary
    /// failures only cost the summary.
    fn write_summary(&mut self, block: BlockIndex) -> Result<()> {
        let vol = self.vol;
        let (entries, offset, span) = {
            let mut space = vol.space.lock();
            let offset = space.ledger.frontier(block)?;
            let span = space.ledger.block(block).map_or(0, |b| b.free_size);
            (space.summary.take(), offset, span)
        };
        let relative = offset - vol.geometry.block_start(block);
        let bytes = match encode_summary(&entries, relative, span) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(target: "ffl::core", block = block.0, span, error = %err, "summary_encode_failed");
                return Ok(());
            }
        };
        if let Err(err) = self.write_bytes(offset, &bytes, None) {
            if err.is_fatal() {
                return Err(err);
            }
            tracing::warn!(target: "ffl::core", block = block.0, error = %err, "summary_write_failed");
            return Ok(());
        }
        let mut space = vol.space.lock();
        space
            .ledger
            .link_node_ref(block, offset, span, RefState::Normal, None)?;
        space.ledger.close_nextblock()?;
        tracing::debug!(
            target: "ffl::core",
            block = block.0,
            entries = entries.len(),
            span,
            "summary_written"
        );
        Ok(())
    }

    // ── Committing nodes ────────────────────────────────────────────────────

    /// Write a complete node at `first`, or at a fresh reservation when
    /// `None`. A write that fails without bringing the volume down is retried
    /// once at a new reservation. Returns where the node landed, with `len`
    /// set to its padded length.
    pub(crate) fn commit(
        &mut self,
        first: Option<Grant>,
        bytes: &[u8],
        reserve: Reserve,
        ino: Option<InodeNumber>,
    ) -> Result<Grant> {
        let len = node_len(bytes)?;
        let entries = Some(u32::from(summary_entry(bytes, 0).is_some()));
        let mut grant = match first {
            Some(grant) => grant,
            None => self.reserve(len, len, reserve, entries)?,
        };
        let mut retried = false;
        loop {
            if grant.len < len {
                return Err(FflError::Inconsistent(format!(
                    "node of {len} bytes does not fit a grant of {}",
                    grant.len
                )));
            }
            match self.write_bytes(grant.offset, bytes, ino) {
                Ok(()) => return Ok(Grant { len, ..grant }),
                Err(err) if err.is_fatal() || retried => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        target: "ffl::core",
                        offset = grant.offset,
                        len,
                        error = %err,
                        "node_write_retry"
                    );
                    retried = true;
                    grant = self.reserve(len, len, reserve, entries)?;
                }
            }
        }
    }

    /// Record a node written by [`commit`](Self::commit).
    pub(crate) fn link(
        &mut self,
        at: Grant,
        bytes: &[u8],
        state: RefState,
        owner: Option<InodeNumber>,
    ) -> Result<NodeRefId> {
        let block_start = self.vol.geometry.block_start(at.block);
        let mut space = self.vol.space.lock();
        let id = space
            .ledger
            .link_node_ref(at.block, at.offset, at.len, state, owner)?;
        if let Some(entry) = summary_entry(bytes, at.offset - block_start) {
            space.summary.record(at.block, entry);
        }
        Ok(id)
    }
}

// ── Caller-held reservations ────────────────────────────────────────────────

/// Space held for nodes the caller encodes itself.
///
/// Every other writer waits until the reservation is dropped (or
/// [`complete`](Self::complete)d).
pub struct Reservation<'a> {
    txn: Txn<'a>,
    grant: Grant,
}

impl std::fmt::Debug for Reservation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("block", &self.grant.block)
            .field("offset", &self.grant.offset)
            .field("len", &self.grant.len)
            .finish()
    }
}

impl Reservation<'_> {
    #[must_use]
    pub fn block(&self) -> BlockIndex {
        self.grant.block
    }

    /// Flash offset of the next node.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.grant.offset
    }

    /// Bytes still available.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.grant.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grant.len == 0
    }

    /// Write one complete node at [`offset`](Self::offset) and record it.
    ///
    /// If the write fails and is retried elsewhere, the rest of the
    /// reservation is given up.
    pub fn write_node(
        &mut self,
        bytes: &[u8],
        state: RefState,
        owner: Option<InodeNumber>,
    ) -> Result<NodeRefId> {
        let result = self.place(bytes, state, owner);
        self.txn.vol.note_result(&result);
        result
    }

    fn place(
        &mut self,
        bytes: &[u8],
        state: RefState,
        owner: Option<InodeNumber>,
    ) -> Result<NodeRefId> {
        let len = node_len(bytes)?;
        if state == RefState::Obsolete || len == 0 || len > self.grant.len {
            return Err(FflError::Config(format!(
                "node of {len} bytes in state {state:?} cannot use a reservation of {}",
                self.grant.len
            )));
        }
        let at = self.txn.commit(
            Some(self.grant),
            bytes,
            Reserve::Write(Priority::Normal),
            owner,
        )?;
        let id = self.txn.link(at, bytes, state, owner)?;
        self.grant = if at.offset == self.grant.offset {
            Grant {
                block: at.block,
                offset: at.offset + at.len,
                len: self.grant.len - at.len,
            }
        } else {
            Grant {
                block: at.block,
                offset: at.offset + at.len,
                len: 0,
            }
        };
        Ok(id)
    }

    /// Give back whatever is left and release the volume.
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        tracing::trace!(
            target: "ffl::core",
            block = self.grant.block.0,
            unused = self.grant.len,
            "reservation_released"
        );
        self.txn.vol.trigger_reclaim();
    }
}
