//! Garbage collection.
//!
//! One pass does the first thing on this list that applies:
//!
//! 1. check one inode's worth of unchecked nodes,
//! 2. erase one pending block,
//! 3. move one live node out of the collector's source block.
//!
//! Nodes that own their page (pristine) and metadata nodes are copied
//! verbatim. Data nodes partly superseded by later writes are rewritten
//! from the fragments that still use them, which drops the dead bytes.

use crate::reserve::{Reserve, summary_entry};
use crate::{FileState, SpaceState, Txn, corrupt, read_overlaid};
use ffl_alloc::GcPick;
use ffl_error::{FflError, Result};
use ffl_ledger::{BlockState, InodeState, ListEnd, Relocation};
use ffl_ondisk::{DataNode, validate_node};
use ffl_types::{BlockIndex, InodeNumber, NodeRefId, RefState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcOutcome {
    Progress,
    /// Nothing to collect until an erase in flight finishes.
    Waiting,
    /// Nothing to collect at all.
    Idle,
}

impl Txn<'_> {
    pub(crate) fn gc_pass(&mut self) -> Result<GcOutcome> {
        let vol = self.vol;
        let (unchecked, pending) = vol.with_ledger(|l| {
            (l.totals().unchecked_size, l.count(BlockState::ErasePending))
        });
        if unchecked > 0 {
            self.check_unchecked()?;
            return Ok(GcOutcome::Progress);
        }
        if pending > 0 {
            tracing::debug!(target: "ffl::core", pending, "gc_erasing_pending");
            vol.erase_pending_blocks(1)?;
            return Ok(GcOutcome::Progress);
        }

        let pick = {
            let mut space = vol.space.lock();
            let SpaceState { ledger, alloc, .. } = &mut *space;
            alloc.find_gc_block(ledger)?
        };
        let block = match pick {
            GcPick::Block(block) => block,
            GcPick::FlushBuffer => {
                self.flush_padded()?;
                return Ok(GcOutcome::Progress);
            }
            GcPick::Nothing => {
                let erasing = vol.with_ledger(|l| l.count(BlockState::Erasing));
                return Ok(if erasing > 0 {
                    GcOutcome::Waiting
                } else {
                    GcOutcome::Idle
                });
            }
        };

        let next = vol.space.lock().ledger.gc_next_live(block)?;
        if let Some(id) = next {
            self.gc_node(id)?;
        }
        self.retire_gc_block(block)?;
        Ok(GcOutcome::Progress)
    }

    /// Queue the source block for erase once nothing live is left in it.
    fn retire_gc_block(&mut self, block: BlockIndex) -> Result<()> {
        let flush_pending = self.wbuf.is_dirty();
        let mut space = self.vol.space.lock();
        if space.ledger.gcblock() != Some(block) {
            return Ok(());
        }
        let live = space.ledger.block(block).map_or(0, |b| b.live_size());
        if live > 0 {
            if space.ledger.gc_next_live(block)?.is_none() {
                return Err(FflError::Inconsistent(format!(
                    "GC source {block} walked with {live} live bytes left"
                )));
            }
            return Ok(());
        }
        if flush_pending {
            space
                .ledger
                .file_block(block, BlockState::ErasablePendingFlush, ListEnd::Tail)?;
        } else {
            space.ledger.admit_erase(block)?;
        }
        tracing::info!(target: "ffl::core", block = block.0, flush_pending, "gc_block_emptied");
        Ok(())
    }

    pub(crate) fn gc_node(&mut self, id: NodeRefId) -> Result<()> {
        let (owner, state) = {
            let space = self.vol.space.lock();
            let node = space
                .ledger
                .node(id)
                .ok_or_else(|| FflError::Inconsistent(format!("GC found released node {id}")))?;
            (node.owner, node.state())
        };
        match (state, owner) {
            (RefState::Unchecked, _) => {
                self.check_ref(id)?;
            }
            (_, None) => {
                tracing::debug!(target: "ffl::core", node = id.0, "gc_ownerless_dropped");
                self.obsolete_ref(id)?;
            }
            (RefState::Pristine, Some(ino)) => self.gc_copy(id, ino)?,
            (_, Some(ino)) => match self.files.remove(&ino) {
                Some(mut file) => {
                    let result = self.gc_file_node(&mut file, ino, id);
                    self.files.insert(ino, file);
                    result?;
                }
                None => self.gc_copy(id, ino)?,
            },
        }
        Ok(())
    }

    /// Copy a node verbatim to fresh space and move its reference.
    fn gc_copy(&mut self, id: NodeRefId, ino: InodeNumber) -> Result<()> {
        let vol = self.vol;
        let (offset, len) = {
            let space = vol.space.lock();
            let node = space
                .ledger
                .node(id)
                .ok_or_else(|| FflError::Inconsistent(format!("GC copy of released node {id}")))?;
            (node.offset(), space.ledger.ref_totlen(id)?)
        };
        let mut bytes = vec![0_u8; len as usize];
        read_overlaid(&*vol.device, &self.wbuf, offset, &mut bytes)?;
        let at = self.commit(None, &bytes, Reserve::Gc, Some(ino))?;

        let _erase_free = vol.erase_free.lock();
        let replaced = {
            let block_start = vol.geometry.block_start(at.block);
            let flush_pending = self.wbuf.is_dirty();
            let mut space = vol.space.lock();
            let SpaceState {
                ledger,
                alloc,
                summary,
            } = &mut *space;
            let replaced = ledger.relocate_ref(
                id,
                at.block,
                at.offset,
                Relocation::GarbageCollect,
                flush_pending,
            )?;
            if let Some(entry) = summary_entry(&bytes, at.offset - block_start) {
                summary.record(at.block, entry);
            }
            if let Some(out) = replaced {
                if out.refiled == Some(BlockState::Erasable) {
                    alloc.admit_erasable(ledger, out.block)?;
                }
            }
            replaced
        };
        tracing::debug!(target: "ffl::core", node = id.0, from = offset, to = at.offset, len, "gc_copied");
        if let Some(out) = replaced.filter(|o| o.changed) {
            if vol.device.can_mark_obsolete() {
                // A header left accurate is only re-checked at the next scan.
                if let Err(err) = self.invalidate_header(out.offset, out.len) {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    tracing::warn!(target: "ffl::core", offset = out.offset, error = %err, "invalidate_failed");
                }
            }
        }
        Ok(())
    }

    /// Collect a node of a file the engine tracks.
    fn gc_file_node(&mut self, file: &mut FileState, ino: InodeNumber, id: NodeRefId) -> Result<()> {
        let dnode = file
            .tree
            .dnodes()
            .find(|(_, dn)| dn.raw == id)
            .map(|(did, dn)| (did, *dn));
        let Some((did, dn)) = dnode else {
            return self.gc_copy(id, ino);
        };
        let live: Vec<(u32, u32)> = file
            .tree
            .overlapping(dn.ofs, dn.size)
            .filter(|f| f.dnode.is_some_and(|(d, _)| d == did))
            .map(|f| (f.ofs, f.size))
            .collect();
        if live == [(dn.ofs, dn.size)] {
            return self.gc_copy(id, ino);
        }

        let (offset, len) = {
            let space = self.vol.space.lock();
            let node = space
                .ledger
                .node(id)
                .ok_or_else(|| FflError::Inconsistent(format!("dnode refers to released node {id}")))?;
            (node.offset(), space.ledger.ref_totlen(id)?)
        };
        let mut bytes = vec![0_u8; len as usize];
        read_overlaid(&*self.vol.device, &self.wbuf, offset, &mut bytes)?;
        let (_, payload) = DataNode::parse(&bytes).map_err(|err| corrupt(offset, &err))?;
        let payload = payload.to_vec();
        tracing::debug!(
            target: "ffl::core",
            node = id.0,
            ino = ino.0,
            fragments = live.len(),
            "gc_rewriting_dnode"
        );
        for (ofs, size) in live {
            let lo = (ofs - dn.ofs) as usize;
            let slice = payload.get(lo..lo + size as usize).ok_or_else(|| FflError::Corruption {
                offset,
                detail: format!("data node shorter than fragment {ofs:#x}+{size:#x}"),
            })?;
            self.write_file_range(file, ino, ofs, slice, Reserve::Gc)?;
        }
        Ok(())
    }

    // ── Checking unchecked nodes ────────────────────────────────────────────

    /// Check the unchecked nodes of one inode, or a single owner-less one.
    fn check_unchecked(&mut self) -> Result<()> {
        let (ino, batch) = {
            let mut space = self.vol.space.lock();
            let ledger = &mut space.ledger;
            let picked = ledger
                .inodes()
                .find(|ic| ic.state == InodeState::Unchecked)
                .map(|ic| ic.ino);
            match picked {
                Some(ino) => {
                    let ids: Vec<NodeRefId> = ledger
                        .inode(ino)
                        .map(|ic| ic.nodes().collect())
                        .unwrap_or_default();
                    let ids: Vec<NodeRefId> = ids
                        .into_iter()
                        .filter(|id| ledger.node(*id).is_some_and(|n| n.state() == RefState::Unchecked))
                        .collect();
                    if let Some(ic) = ledger.inode_mut(ino) {
                        ic.state = InodeState::Checking;
                    }
                    (Some(ino), ids)
                }
                None => {
                    let stray = ledger.blocks().flat_map(|b| b.nodes()).find(|id| {
                        ledger
                            .node(*id)
                            .is_some_and(|n| n.state() == RefState::Unchecked)
                    });
                    let Some(id) = stray else {
                        return Err(FflError::Inconsistent(
                            "unchecked space without unchecked nodes".to_owned(),
                        ));
                    };
                    (None, vec![id])
                }
            }
        };

        let mut bad = 0_u32;
        for &id in &batch {
            if !self.check_ref(id)? {
                bad += 1;
            }
        }
        if let Some(ino) = ino {
            let present = self.files.contains_key(&ino);
            let mut space = self.vol.space.lock();
            if let Some(ic) = space.ledger.inode_mut(ino) {
                ic.state = if present {
                    InodeState::Present
                } else {
                    InodeState::CheckedAbsent
                };
            }
            space.ledger.release_inode_if_unused(ino);
            tracing::debug!(
                target: "ffl::core",
                ino = ino.0,
                checked = batch.len(),
                bad,
                "inode_checked"
            );
        }
        Ok(())
    }

    /// CRC-check one unchecked node: promote it if valid, obsolete it
    /// otherwise. Returns whether it was valid.
    pub(crate) fn check_ref(&mut self, id: NodeRefId) -> Result<bool> {
        let vol = self.vol;
        let (offset, len) = {
            let space = vol.space.lock();
            let node = space
                .ledger
                .node(id)
                .ok_or_else(|| FflError::Inconsistent(format!("check of released node {id}")))?;
            (node.offset(), space.ledger.ref_totlen(id)?)
        };
        let mut bytes = vec![0_u8; len as usize];
        let valid = match read_overlaid(&*vol.device, &self.wbuf, offset, &mut bytes) {
            Ok(_) => match validate_node(&bytes) {
                Ok(_) => true,
                Err(err) => {
                    tracing::warn!(target: "ffl::core", node = id.0, offset, error = %err, "unchecked_node_invalid");
                    false
                }
            },
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(target: "ffl::core", node = id.0, offset, error = %err, "unchecked_node_unreadable");
                false
            }
        };
        if valid {
            vol.space.lock().ledger.set_ref_state(id, RefState::Normal)?;
        } else {
            self.obsolete_ref(id)?;
        }
        Ok(valid)
    }
}
