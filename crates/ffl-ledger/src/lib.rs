#![forbid(unsafe_code)]
//! Node reference ledger and eraseblock accounting.
//!
//! The ledger records every node ever written to the medium and keeps, for
//! each eraseblock, five byte counters that always sum to the sector size:
//!
//! | Counter | Meaning |
//! |---------|---------|
//! | `free_size` | never written since the last erase |
//! | `used_size` | live, checked nodes |
//! | `unchecked_size` | nodes found on flash but not yet CRC-checked |
//! | `dirty_size` | obsolete nodes, reclaimable by GC |
//! | `wasted_size` | unusable space (padding, obsolete nodes in the write target) |
//!
//! Blocks in `Erasing`/`EraseComplete` carry zero counters; their sector is
//! counted in the volume-level `erasing_size`. `Bad` blocks likewise carry
//! zero counters and are tallied in `bad_size`.
//!
//! ## Design
//!
//! - Node references live in an arena indexed by [`NodeRefId`]. A block
//!   keeps its references in flash order; an inode cache keeps the set of
//!   live references it owns.
//! - List membership is a [`BlockState`] field plus an ordering key, so
//!   "first block in list X" is a scan for the minimum key.
//! - Relocation (garbage collection and write-buffer recovery) moves a
//!   reference *handle* to its new flash location and leaves an obsolete
//!   placeholder in the old chain. Every holder of the handle stays valid.
//!
//! The ledger performs no I/O and takes no locks; `ffl-core` wraps it.

mod accounting;
mod block;
mod erase;
mod node;

pub use accounting::{Obsoleted, Relocation};
pub use block::{BlockState, Eraseblock, ListEnd};
pub use node::{InodeCache, InodeState, NodeRef};

use ffl_error::{FflError, Result};
use ffl_types::{BlockIndex, FlashGeometry, InodeNumber, NodeRefId, RefState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Volume-wide totals of the per-block counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceTotals {
    pub free_size: u32,
    pub used_size: u32,
    pub dirty_size: u32,
    pub wasted_size: u32,
    pub unchecked_size: u32,
    /// Sectors of blocks currently being erased or awaiting their marker.
    pub erasing_size: u32,
    pub bad_size: u32,
}

impl SpaceTotals {
    #[must_use]
    pub fn sum(&self) -> u64 {
        u64::from(self.free_size)
            + u64::from(self.used_size)
            + u64::from(self.dirty_size)
            + u64::from(self.wasted_size)
            + u64::from(self.unchecked_size)
            + u64::from(self.erasing_size)
            + u64::from(self.bad_size)
    }
}

/// Serializable snapshot of the ledger for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceStats {
    pub flash_size: u32,
    pub sector_size: u32,
    pub totals: SpaceTotals,
    pub blocks: BTreeMap<String, u32>,
    pub nextblock: Option<BlockIndex>,
    pub gcblock: Option<BlockIndex>,
    pub live_refs: usize,
    pub inode_caches: usize,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    geometry: FlashGeometry,
    dirty_threshold: u32,
    blocks: Vec<Eraseblock>,
    refs: Vec<Option<NodeRef>>,
    free_refs: Vec<u32>,
    inodes: BTreeMap<InodeNumber, InodeCache>,
    totals: SpaceTotals,
    state_counts: [u32; BlockState::COUNT],
    nextblock: Option<BlockIndex>,
    gcblock: Option<BlockIndex>,
    head_seq: i64,
    tail_seq: i64,
}

pub(crate) fn inconsistent(detail: String) -> FflError {
    tracing::error!(target: "ffl::ledger", detail = %detail, "ledger_inconsistency");
    FflError::Inconsistent(detail)
}

impl Ledger {
    /// A ledger for a medium of unknown content: every block is dirty and
    /// waiting to be erased.
    #[must_use]
    pub fn new(geometry: FlashGeometry, dirty_threshold: u32) -> Self {
        let count = geometry.block_count();
        let blocks: Vec<Eraseblock> = (0..count)
            .map(|i| {
                let index = BlockIndex(i);
                let mut block = Eraseblock::new(index, geometry.block_start(index));
                block.dirty_size = geometry.sector_size;
                block.list_seq = i64::from(i);
                block
            })
            .collect();
        let mut state_counts = [0; BlockState::COUNT];
        state_counts[BlockState::ErasePending.index()] = count;
        Self {
            geometry,
            dirty_threshold,
            blocks,
            refs: Vec::new(),
            free_refs: Vec::new(),
            inodes: BTreeMap::new(),
            totals: SpaceTotals {
                dirty_size: geometry.flash_size,
                ..SpaceTotals::default()
            },
            state_counts,
            nextblock: None,
            gcblock: None,
            head_seq: 0,
            tail_seq: i64::from(count),
        }
    }

    // ── Geometry and thresholds ─────────────────────────────────────────────

    #[must_use]
    pub fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    #[must_use]
    pub fn sector_size(&self) -> u32 {
        self.geometry.sector_size
    }

    /// Dirty space worth garbage-collecting a block for.
    #[must_use]
    pub fn is_dirty(&self, size: u32) -> bool {
        size > self.dirty_threshold
    }

    /// More than half of a sector is reclaimable.
    #[must_use]
    pub fn is_very_dirty(&self, size: u32) -> bool {
        size > self.geometry.sector_size / 2
    }

    // ── Blocks and lists ────────────────────────────────────────────────────

    #[must_use]
    pub fn block(&self, index: BlockIndex) -> Option<&Eraseblock> {
        self.blocks.get(index.as_usize())
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Eraseblock> {
        self.blocks.iter()
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.geometry.block_count()
    }

    #[must_use]
    pub fn nextblock(&self) -> Option<BlockIndex> {
        self.nextblock
    }

    #[must_use]
    pub fn gcblock(&self) -> Option<BlockIndex> {
        self.gcblock
    }

    #[must_use]
    pub fn totals(&self) -> SpaceTotals {
        self.totals
    }

    #[must_use]
    pub fn count(&self, state: BlockState) -> u32 {
        self.state_counts[state.index()]
    }

    /// Head of the list for `state`.
    #[must_use]
    pub fn first_in(&self, state: BlockState) -> Option<BlockIndex> {
        self.blocks
            .iter()
            .filter(|b| b.state == state)
            .min_by_key(|b| b.list_seq)
            .map(|b| b.index)
    }

    /// All blocks in `state`, head first.
    #[must_use]
    pub fn blocks_in(&self, state: BlockState) -> Vec<BlockIndex> {
        let mut found: Vec<&Eraseblock> = self.blocks.iter().filter(|b| b.state == state).collect();
        found.sort_by_key(|b| b.list_seq);
        found.into_iter().map(|b| b.index).collect()
    }

    /// Write frontier of `index`: the first never-written byte.
    pub fn frontier(&self, index: BlockIndex) -> Result<u32> {
        let block = self.blk(index)?;
        Ok(block.offset + self.geometry.sector_size - block.free_size)
    }

    /// Move `index` to the list for `state`.
    ///
    /// This is the only place list membership changes; it also maintains
    /// the nextblock and GC-source pointers.
    pub fn file_block(&mut self, index: BlockIndex, state: BlockState, end: ListEnd) -> Result<()> {
        let seq = match end {
            ListEnd::Head => {
                self.head_seq -= 1;
                self.head_seq
            }
            ListEnd::Tail => {
                self.tail_seq += 1;
                self.tail_seq
            }
        };
        let old = self.blk(index)?.state;
        if state == BlockState::Nextblock && self.nextblock.is_some_and(|n| n != index) {
            return Err(inconsistent(format!(
                "block {index} made nextblock while {:?} still is",
                self.nextblock
            )));
        }
        if state == BlockState::GcSource && self.gcblock.is_some_and(|g| g != index) {
            return Err(inconsistent(format!(
                "block {index} made GC source while {:?} still is",
                self.gcblock
            )));
        }
        if old == BlockState::Nextblock {
            self.nextblock = None;
        }
        if old == BlockState::GcSource {
            self.gcblock = None;
        }
        match state {
            BlockState::Nextblock => self.nextblock = Some(index),
            BlockState::GcSource => self.gcblock = Some(index),
            _ => {}
        }
        self.state_counts[old.index()] -= 1;
        self.state_counts[state.index()] += 1;
        let block = self.blk_mut(index)?;
        block.state = state;
        block.list_seq = seq;
        tracing::debug!(
            target: "ffl::ledger",
            block = index.0,
            from = ?old,
            to = ?state,
            "block_refiled"
        );
        Ok(())
    }

    pub(crate) fn blk(&self, index: BlockIndex) -> Result<&Eraseblock> {
        self.blocks
            .get(index.as_usize())
            .ok_or_else(|| inconsistent(format!("block {index} out of range")))
    }

    pub(crate) fn blk_mut(&mut self, index: BlockIndex) -> Result<&mut Eraseblock> {
        self.blocks
            .get_mut(index.as_usize())
            .ok_or_else(|| inconsistent(format!("block {index} out of range")))
    }

    // ── Node references ─────────────────────────────────────────────────────

    #[must_use]
    pub fn node(&self, id: NodeRefId) -> Option<&NodeRef> {
        self.refs.get(id.as_usize()).and_then(Option::as_ref)
    }

    pub(crate) fn node_checked(&self, id: NodeRefId) -> Result<NodeRef> {
        self.node(id)
            .copied()
            .ok_or_else(|| inconsistent(format!("node ref {id} does not exist")))
    }

    pub(crate) fn node_mut(&mut self, id: NodeRefId) -> Result<&mut NodeRef> {
        self.refs
            .get_mut(id.as_usize())
            .and_then(Option::as_mut)
            .ok_or_else(|| inconsistent(format!("node ref {id} does not exist")))
    }

    pub(crate) fn alloc_ref(&mut self, node: NodeRef) -> NodeRefId {
        if let Some(idx) = self.free_refs.pop() {
            self.refs[idx as usize] = Some(node);
            return NodeRefId(idx);
        }
        self.refs.push(Some(node));
        NodeRefId((self.refs.len() - 1) as u32)
    }

    pub(crate) fn release_ref(&mut self, id: NodeRefId) {
        if let Some(slot) = self.refs.get_mut(id.as_usize()) {
            if slot.take().is_some() {
                self.free_refs.push(id.0);
            }
        }
    }

    /// Number of references currently allocated.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.len() - self.free_refs.len()
    }

    /// Physical length of a node, derived from its successor in the block.
    pub fn ref_totlen(&self, id: NodeRefId) -> Result<u32> {
        let node = self.node_checked(id)?;
        let block = self.blk(node.block)?;
        let end = match block.nodes.get(node.slot as usize + 1) {
            Some(next) => self.node_checked(*next)?.offset(),
            None => block.offset + self.geometry.sector_size - block.free_size,
        };
        end.checked_sub(node.offset()).ok_or_else(|| {
            inconsistent(format!(
                "node ref {id} at {:#x} lies past its successor or frontier {end:#x}",
                node.offset()
            ))
        })
    }

    /// Advance the GC cursor of `index` and return the next non-obsolete
    /// reference, or `None` once the block has been fully walked.
    pub fn gc_next_live(&mut self, index: BlockIndex) -> Result<Option<NodeRefId>> {
        loop {
            let block = self.blk(index)?;
            let Some(&id) = block.nodes.get(block.gc_cursor) else {
                return Ok(None);
            };
            if !self.node_checked(id)?.is_obsolete() {
                return Ok(Some(id));
            }
            self.blk_mut(index)?.gc_cursor += 1;
        }
    }

    /// Forget the GC cursor so the next walk starts at the first node.
    pub fn reset_gc_cursor(&mut self, index: BlockIndex) -> Result<()> {
        self.blk_mut(index)?.gc_cursor = 0;
        Ok(())
    }

    // ── Inode caches ────────────────────────────────────────────────────────

    #[must_use]
    pub fn inode(&self, ino: InodeNumber) -> Option<&InodeCache> {
        self.inodes.get(&ino)
    }

    pub fn inode_mut(&mut self, ino: InodeNumber) -> Option<&mut InodeCache> {
        self.inodes.get_mut(&ino)
    }

    /// The cache for `ino`, created in `state` if absent.
    pub fn ensure_inode(&mut self, ino: InodeNumber, state: InodeState) -> &mut InodeCache {
        self.inodes
            .entry(ino)
            .or_insert_with(|| InodeCache::new(ino, state))
    }

    pub fn inodes(&self) -> impl Iterator<Item = &InodeCache> {
        self.inodes.values()
    }

    /// Drop the cache for `ino` if nothing keeps it alive.
    pub fn release_inode_if_unused(&mut self, ino: InodeNumber) -> bool {
        if self.inodes.get(&ino).is_some_and(InodeCache::is_disposable) {
            self.inodes.remove(&ino);
            tracing::debug!(target: "ffl::ledger", ino = ino.0, "inode_cache_released");
            return true;
        }
        false
    }

    // ── Reporting ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn stats(&self) -> SpaceStats {
        let blocks = BlockState::ALL
            .iter()
            .filter(|s| self.count(**s) > 0)
            .map(|s| (format!("{s:?}"), self.count(*s)))
            .collect();
        SpaceStats {
            flash_size: self.geometry.flash_size,
            sector_size: self.geometry.sector_size,
            totals: self.totals,
            blocks,
            nextblock: self.nextblock,
            gcblock: self.gcblock,
            live_refs: self.ref_count(),
            inode_caches: self.inodes.len(),
        }
    }

    /// Recompute every counter from the per-block chains and compare.
    ///
    /// Checks, per block, that the counters sum to the sector size and match
    /// the lengths of the references in each state; and, volume-wide, that
    /// the totals equal the per-block sums and account for the whole medium.
    pub fn check_accounting(&self) -> Result<()> {
        let sector = self.geometry.sector_size;
        let mut sums = SpaceTotals::default();
        let mut counts = [0_u32; BlockState::COUNT];

        for block in &self.blocks {
            counts[block.state.index()] += 1;
            if !block.state.is_accounted() {
                if block.accounted() != 0 || !block.nodes.is_empty() {
                    return Err(inconsistent(format!(
                        "block {} in {:?} still carries counters or nodes",
                        block.index, block.state
                    )));
                }
                if block.state.in_erase() {
                    sums.erasing_size += sector;
                } else {
                    sums.bad_size += sector;
                }
                continue;
            }
            if block.accounted() != u64::from(sector) {
                return Err(inconsistent(format!(
                    "block {} counters sum to {} (free {} used {} dirty {} wasted {} unchecked {})",
                    block.index,
                    block.accounted(),
                    block.free_size,
                    block.used_size,
                    block.dirty_size,
                    block.wasted_size,
                    block.unchecked_size
                )));
            }

            sums.free_size += block.free_size;
            sums.used_size += block.used_size;
            sums.dirty_size += block.dirty_size;
            sums.wasted_size += block.wasted_size;
            sums.unchecked_size += block.unchecked_size;

            // A block queued for erase with an empty chain has unknown content.
            if block.nodes.is_empty() && block.state == BlockState::ErasePending {
                continue;
            }

            let mut used = 0_u32;
            let mut unchecked = 0_u32;
            let mut obsolete = 0_u32;
            let mut expected_offset = block.offset;
            for (slot, id) in block.nodes.iter().enumerate() {
                let node = self.node_checked(*id)?;
                if node.block != block.index || node.slot as usize != slot {
                    return Err(inconsistent(format!(
                        "node ref {id} is filed in block {} slot {slot} but records block {} slot {}",
                        block.index, node.block, node.slot
                    )));
                }
                if node.offset() != expected_offset {
                    return Err(inconsistent(format!(
                        "node ref {id} at {:#x}, expected {expected_offset:#x}",
                        node.offset()
                    )));
                }
                let len = self.ref_totlen(*id)?;
                expected_offset += len;
                match node.state() {
                    RefState::Obsolete => obsolete += len,
                    RefState::Unchecked => unchecked += len,
                    _ => used += len,
                }
                if let Some(owner) = node.owner {
                    let owned = self
                        .inodes
                        .get(&owner)
                        .is_some_and(|ic| ic.nodes.contains(id));
                    if node.is_obsolete() || !owned {
                        return Err(inconsistent(format!(
                            "node ref {id} ownership by inode {owner} is inconsistent"
                        )));
                    }
                }
            }
            if used != block.used_size
                || unchecked != block.unchecked_size
                || obsolete != block.dirty_size + block.wasted_size
            {
                return Err(inconsistent(format!(
                    "block {} chain holds used {used} unchecked {unchecked} obsolete {obsolete}, \
                     counters say used {} unchecked {} dirty+wasted {}",
                    block.index,
                    block.used_size,
                    block.unchecked_size,
                    block.dirty_size + block.wasted_size
                )));
            }
        }

        if sums != self.totals {
            return Err(inconsistent(format!(
                "volume totals {:?} disagree with per-block sums {sums:?}",
                self.totals
            )));
        }
        if self.totals.sum() != u64::from(self.geometry.flash_size) {
            return Err(inconsistent(format!(
                "totals cover {} bytes of a {} byte medium",
                self.totals.sum(),
                self.geometry.flash_size
            )));
        }
        if counts != self.state_counts {
            return Err(inconsistent("per-state block counts drifted".to_owned()));
        }
        for ic in self.inodes.values() {
            for id in &ic.nodes {
                let node = self.node_checked(*id)?;
                if node.owner != Some(ic.ino) || node.is_obsolete() {
                    return Err(inconsistent(format!(
                        "inode {} chain holds foreign or obsolete ref {id}",
                        ic.ino
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
