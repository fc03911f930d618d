//! Linking, obsoleting and relocating node references.

use crate::{BlockState, InodeState, Ledger, ListEnd, NodeRef, inconsistent};
use ffl_error::Result;
use ffl_types::{BlockIndex, InodeNumber, NodeRefId, RawOffset, RefState};

/// Result of [`Ledger::mark_obsolete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Obsoleted {
    pub block: BlockIndex,
    pub offset: u32,
    pub len: u32,
    /// False when the reference was already obsolete and nothing changed.
    pub changed: bool,
    /// The list the block moved to, if it moved.
    pub refiled: Option<BlockState>,
}

/// Why a reference is being moved to a new flash location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    /// The old copy is obsoleted through the normal path, which may refile
    /// the source block.
    GarbageCollect,
    /// The old block has already been refiled; the old copy is accounted as
    /// dirty in place.
    Recovery,
}

fn take(counter: &mut u32, len: u32, what: &str, block: BlockIndex) -> Result<()> {
    *counter = counter.checked_sub(len).ok_or_else(|| {
        inconsistent(format!(
            "{what} of block {block} would underflow ({} - {len})",
            *counter
        ))
    })?;
    Ok(())
}

impl Ledger {
    /// Record a node written at the write frontier of `block`.
    ///
    /// `len` is the padded on-flash length. Linking anywhere other than the
    /// frontier is a consistency violation.
    pub fn link_node_ref(
        &mut self,
        block: BlockIndex,
        offset: u32,
        len: u32,
        state: RefState,
        owner: Option<InodeNumber>,
    ) -> Result<NodeRefId> {
        let frontier = self.frontier(block)?;
        let target = self.blk(block)?;
        if !target.state.is_accounted() {
            return Err(inconsistent(format!(
                "node linked into block {block} in state {:?}",
                target.state
            )));
        }
        if offset != frontier {
            return Err(inconsistent(format!(
                "node linked at {offset:#x} but block {block} frontier is {frontier:#x}"
            )));
        }
        if len == 0 || len % 4 != 0 || len > target.free_size {
            return Err(inconsistent(format!(
                "node length {len} invalid for block {block} with {} bytes free",
                target.free_size
            )));
        }
        let raw = RawOffset::new(offset, state).map_err(|err| inconsistent(err.to_string()))?;
        let owner = owner.filter(|_| state != RefState::Obsolete);
        let slot = target.nodes.len() as u32;
        let id = self.alloc_ref(NodeRef {
            raw,
            block,
            slot,
            owner,
        });

        let target = self.blk_mut(block)?;
        target.nodes.push(id);
        target.free_size -= len;
        match state {
            RefState::Unchecked => target.unchecked_size += len,
            RefState::Obsolete => target.dirty_size += len,
            RefState::Normal | RefState::Pristine => target.used_size += len,
        }
        self.totals.free_size -= len;
        match state {
            RefState::Unchecked => self.totals.unchecked_size += len,
            RefState::Obsolete => self.totals.dirty_size += len,
            RefState::Normal | RefState::Pristine => self.totals.used_size += len,
        }
        if let Some(ino) = owner {
            self.ensure_inode(ino, InodeState::Present).nodes.insert(id);
        }
        tracing::trace!(
            target: "ffl::ledger",
            node = id.0,
            block = block.0,
            offset,
            len,
            state = ?state,
            owner = owner.map(|i| i.0),
            "node_linked"
        );
        Ok(id)
    }

    /// Link obsolete space (padding, a failed write, a filler) at the
    /// frontier, counted as wasted or dirty.
    pub fn link_obsolete_space(
        &mut self,
        block: BlockIndex,
        offset: u32,
        len: u32,
        as_wasted: bool,
    ) -> Result<NodeRefId> {
        let id = self.link_node_ref(block, offset, len, RefState::Obsolete, None)?;
        if as_wasted {
            let target = self.blk_mut(block)?;
            target.dirty_size -= len;
            target.wasted_size += len;
            self.totals.dirty_size -= len;
            self.totals.wasted_size += len;
        }
        Ok(id)
    }

    /// Fill whatever free space remains in `block` with obsolete space.
    pub fn fill_remainder(&mut self, block: BlockIndex, as_wasted: bool) -> Result<Option<NodeRefId>> {
        let free = self.blk(block)?.free_size;
        if free == 0 {
            return Ok(None);
        }
        let frontier = self.frontier(block)?;
        self.link_obsolete_space(block, frontier, free, as_wasted)
            .map(Some)
    }

    /// Move all wasted space of `block` to dirty.
    pub fn convert_wasted_to_dirty(&mut self, block: BlockIndex) -> Result<()> {
        let target = self.blk_mut(block)?;
        let wasted = target.wasted_size;
        target.dirty_size += wasted;
        target.wasted_size = 0;
        self.totals.wasted_size -= wasted;
        self.totals.dirty_size += wasted;
        Ok(())
    }

    /// Mark a reference obsolete. Idempotent.
    ///
    /// The freed bytes become wasted when the block is the write target and
    /// dirty otherwise. The block is then refiled: it becomes erasable once
    /// nothing live remains in it (`ErasablePendingFlush` while the write
    /// buffer still holds unflushed data, `ErasePending` for a failed block),
    /// or moves up the dirtiness lists as thresholds are crossed.
    pub fn mark_obsolete(&mut self, id: NodeRefId, flush_pending: bool) -> Result<Obsoleted> {
        let node = self.node_checked(id)?;
        let len = self.ref_totlen(id)?;
        if node.is_obsolete() {
            return Ok(Obsoleted {
                block: node.block,
                offset: node.offset(),
                len,
                changed: false,
                refiled: None,
            });
        }
        let state = self.blk(node.block)?.state;
        if !state.is_accounted() {
            return Err(inconsistent(format!(
                "node ref {id} obsoleted inside block {} in state {state:?}",
                node.block
            )));
        }

        let is_nextblock = self.nextblock == Some(node.block);
        let mut converted = 0;
        {
            let block = self.blk_mut(node.block)?;
            let index = block.index;
            if node.state() == RefState::Unchecked {
                take(&mut block.unchecked_size, len, "unchecked_size", index)?;
            } else {
                take(&mut block.used_size, len, "used_size", index)?;
            }
            if is_nextblock {
                block.wasted_size += len;
            } else {
                block.dirty_size += len;
                if block.wasted_size > 0 && block.state != BlockState::BadUsed {
                    converted = block.wasted_size;
                    block.dirty_size += converted;
                    block.wasted_size = 0;
                }
            }
        }
        if node.state() == RefState::Unchecked {
            self.totals.unchecked_size -= len;
        } else {
            self.totals.used_size -= len;
        }
        if is_nextblock {
            self.totals.wasted_size += len;
        } else {
            self.totals.dirty_size += len + converted;
            self.totals.wasted_size -= converted;
        }

        {
            let entry = self.node_mut(id)?;
            entry.raw = entry.raw.with_state(RefState::Obsolete);
            entry.owner = None;
        }
        if let Some(ino) = node.owner {
            if let Some(ic) = self.inode_mut(ino) {
                ic.nodes.remove(&id);
            }
            self.release_inode_if_unused(ino);
        }

        let refiled = self.refile_after_obsolete(node.block, flush_pending)?;
        tracing::trace!(
            target: "ffl::ledger",
            node = id.0,
            block = node.block.0,
            offset = node.offset(),
            len,
            refiled = ?refiled,
            "node_obsoleted"
        );
        Ok(Obsoleted {
            block: node.block,
            offset: node.offset(),
            len,
            changed: true,
            refiled,
        })
    }

    fn refile_after_obsolete(
        &mut self,
        index: BlockIndex,
        flush_pending: bool,
    ) -> Result<Option<BlockState>> {
        let block = self.blk(index)?;
        let target = match block.state {
            BlockState::Nextblock | BlockState::ErasePending | BlockState::Free => None,
            BlockState::BadUsed if block.live_size() == 0 => Some(BlockState::ErasePending),
            BlockState::GcSource | BlockState::Clean | BlockState::Dirty | BlockState::VeryDirty
                if block.live_size() == 0 =>
            {
                Some(if flush_pending {
                    BlockState::ErasablePendingFlush
                } else {
                    BlockState::Erasable
                })
            }
            BlockState::Clean if self.is_dirty(block.dirty_size + block.wasted_size) => {
                Some(if self.is_very_dirty(block.dirty_size) {
                    BlockState::VeryDirty
                } else {
                    BlockState::Dirty
                })
            }
            BlockState::Dirty if self.is_very_dirty(block.dirty_size) => Some(BlockState::VeryDirty),
            _ => None,
        };
        if let Some(state) = target {
            self.file_block(index, state, ListEnd::Tail)?;
        }
        Ok(target)
    }

    /// Change the GC classification of a live reference.
    ///
    /// Promoting an unchecked reference moves its bytes from
    /// `unchecked_size` to `used_size`. Obsolete references are left alone.
    pub fn set_ref_state(&mut self, id: NodeRefId, state: RefState) -> Result<bool> {
        let node = self.node_checked(id)?;
        if node.is_obsolete() || node.state() == state {
            return Ok(false);
        }
        match (node.state(), state) {
            (_, RefState::Obsolete) | (_, RefState::Unchecked) => {
                return Err(inconsistent(format!(
                    "node ref {id} cannot move from {:?} to {state:?} directly",
                    node.state()
                )));
            }
            (RefState::Unchecked, _) => {
                let len = self.ref_totlen(id)?;
                let block = self.blk_mut(node.block)?;
                let index = block.index;
                take(&mut block.unchecked_size, len, "unchecked_size", index)?;
                block.used_size += len;
                self.totals.unchecked_size -= len;
                self.totals.used_size += len;
            }
            _ => {}
        }
        let entry = self.node_mut(id)?;
        entry.raw = entry.raw.with_state(state);
        Ok(true)
    }

    /// Move a live reference to `offset`, the frontier of `target`.
    ///
    /// The handle keeps its identity: dnodes and inode caches that hold it
    /// need no fix-up. An obsolete placeholder takes its place in the old
    /// block's chain.
    pub fn relocate_ref(
        &mut self,
        id: NodeRefId,
        target: BlockIndex,
        offset: u32,
        mode: Relocation,
        flush_pending: bool,
    ) -> Result<Option<Obsoleted>> {
        let node = self.node_checked(id)?;
        if node.is_obsolete() {
            return Err(inconsistent(format!("obsolete node ref {id} cannot be relocated")));
        }
        if node.block == target {
            return Err(inconsistent(format!(
                "node ref {id} relocated within its own block {target}"
            )));
        }
        let len = self.ref_totlen(id)?;
        let frontier = self.frontier(target)?;
        let dest = self.blk(target)?;
        if offset != frontier || len > dest.free_size {
            return Err(inconsistent(format!(
                "relocation of node ref {id} to {offset:#x} (len {len}) but block {target} \
                 frontier is {frontier:#x} with {} free",
                dest.free_size
            )));
        }

        let placeholder = self.alloc_ref(NodeRef {
            raw: node.raw,
            block: node.block,
            slot: node.slot,
            owner: None,
        });
        self.blk_mut(node.block)?.nodes[node.slot as usize] = placeholder;

        let dest = self.blk_mut(target)?;
        let slot = dest.nodes.len() as u32;
        dest.nodes.push(id);
        dest.free_size -= len;
        if node.state() == RefState::Unchecked {
            dest.unchecked_size += len;
            self.totals.unchecked_size += len;
        } else {
            dest.used_size += len;
            self.totals.used_size += len;
        }
        self.totals.free_size -= len;
        *self.node_mut(id)? = NodeRef {
            raw: node.raw.moved_to(offset),
            block: target,
            slot,
            owner: node.owner,
        };
        tracing::debug!(
            target: "ffl::ledger",
            node = id.0,
            from = node.offset(),
            to = offset,
            len,
            mode = ?mode,
            "node_relocated"
        );

        match mode {
            Relocation::GarbageCollect => self.mark_obsolete(placeholder, flush_pending).map(Some),
            Relocation::Recovery => {
                let old = self.blk_mut(node.block)?;
                let index = old.index;
                if node.state() == RefState::Unchecked {
                    take(&mut old.unchecked_size, len, "unchecked_size", index)?;
                    self.totals.unchecked_size -= len;
                } else {
                    take(&mut old.used_size, len, "used_size", index)?;
                    self.totals.used_size -= len;
                }
                let old = self.blk_mut(node.block)?;
                old.dirty_size += len;
                self.totals.dirty_size += len;
                let entry = self.node_mut(placeholder)?;
                entry.raw = entry.raw.with_state(RefState::Obsolete);
                Ok(None)
            }
        }
    }

    /// Retire the current write target to the list matching its dirtiness.
    ///
    /// Wasted space is first converted to dirty so the garbage collector can
    /// reclaim it.
    pub fn close_nextblock(&mut self) -> Result<Option<BlockState>> {
        let Some(index) = self.nextblock else {
            return Ok(None);
        };
        self.convert_wasted_to_dirty(index)?;
        let dirty = self.blk(index)?.dirty_size;
        let state = if !self.is_dirty(dirty) {
            BlockState::Clean
        } else if self.is_very_dirty(dirty) {
            BlockState::VeryDirty
        } else {
            BlockState::Dirty
        };
        self.file_block(index, state, ListEnd::Tail)?;
        tracing::debug!(target: "ffl::ledger", block = index.0, state = ?state, dirty, "nextblock_closed");
        Ok(Some(state))
    }
}
