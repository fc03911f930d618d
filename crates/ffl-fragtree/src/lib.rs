#![forbid(unsafe_code)]
//! Fragment tree: the logical layout of one inode's data.
//!
//! The tree is an ordered map from logical offset to [`Frag`]. Fragments
//! tile the range `[0, size())` with no gaps and no overlaps; a range that
//! was never written is an explicit hole fragment with no dnode.
//!
//! Each data node on flash is represented by one [`FullDnode`] in the tree's
//! arena. Overwrites can cut a dnode into several fragments, so the dnode
//! carries a `frags` count; when the last fragment referencing it goes away
//! the dnode is released and its node reference reported as obsolete.
//!
//! The tree never touches the ledger directly. Every mutating call returns a
//! [`FragChanges`] listing the node references whose state must change and
//! the caller applies them.

use ffl_types::{DnodeId, NodeRefId, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use thiserror::Error;

/// Fragments released by [`FragTree::kill`] between cooperative yields.
const KILL_BATCH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragTreeError {
    #[error("range {ofs:#x}+{size:#x} overflows the 32-bit file offset space")]
    RangeOverflow { ofs: u32, size: u32 },
}

/// A data node as seen by the fragment tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullDnode {
    pub raw: NodeRefId,
    /// Logical offset of the node's payload.
    pub ofs: u32,
    pub size: u32,
    /// Number of fragments currently pointing at this dnode.
    pub frags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frag {
    pub size: u32,
    /// `None` for a hole.
    pub node: Option<DnodeId>,
}

/// A fragment together with its offset and resolved dnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragView<'a> {
    pub ofs: u32,
    pub size: u32,
    pub dnode: Option<(DnodeId, &'a FullDnode)>,
}

impl FragView<'_> {
    #[must_use]
    pub fn end(&self) -> u32 {
        self.ofs + self.size
    }

    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.dnode.is_none()
    }
}

/// Node-reference state changes produced by a tree mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragChanges {
    /// References whose dnode lost its last fragment.
    pub obsoleted: Vec<NodeRefId>,
    /// References that now share a page with another node.
    pub mark_normal: Vec<NodeRefId>,
    /// References that may be copied verbatim by the garbage collector.
    pub mark_pristine: Vec<NodeRefId>,
}

impl FragChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.obsoleted.is_empty() && self.mark_normal.is_empty() && self.mark_pristine.is_empty()
    }

    pub fn merge(&mut self, other: Self) {
        self.obsoleted.extend(other.obsoleted);
        self.mark_normal.extend(other.mark_normal);
        self.mark_pristine.extend(other.mark_pristine);
    }
}

#[derive(Debug, Clone, Default)]
pub struct FragTree {
    frags: BTreeMap<u32, Frag>,
    dnodes: Vec<Option<FullDnode>>,
    free_dnodes: Vec<u32>,
}

impl FragTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// End of the last fragment.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.frags
            .last_key_value()
            .map_or(0, |(ofs, frag)| ofs + frag.size)
    }

    #[must_use]
    pub fn frag_count(&self) -> usize {
        self.frags.len()
    }

    #[must_use]
    pub fn dnode_count(&self) -> usize {
        self.dnodes.len() - self.free_dnodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frags.is_empty()
    }

    #[must_use]
    pub fn dnode(&self, id: DnodeId) -> Option<&FullDnode> {
        self.dnodes.get(id.as_usize()).and_then(Option::as_ref)
    }

    /// Live dnodes in arena order.
    pub fn dnodes(&self) -> impl Iterator<Item = (DnodeId, &FullDnode)> {
        self.dnodes
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|dn| (DnodeId(idx as u32), dn)))
    }

    /// Closest fragment starting at or before `ofs`.
    ///
    /// The returned fragment does not necessarily contain `ofs`: past the end
    /// of the tree the last fragment is returned.
    #[must_use]
    pub fn lookup(&self, ofs: u32) -> Option<FragView<'_>> {
        self.frags
            .range(..=ofs)
            .next_back()
            .map(|(&frag_ofs, frag)| self.view(frag_ofs, frag))
    }

    pub fn iter(&self) -> impl Iterator<Item = FragView<'_>> {
        self.frags.iter().map(|(&ofs, frag)| self.view(ofs, frag))
    }

    /// Fragments intersecting `[ofs, ofs + len)`, in order.
    pub fn overlapping(&self, ofs: u32, len: u32) -> impl Iterator<Item = FragView<'_>> {
        let end = ofs.saturating_add(len);
        let start = self
            .frags
            .range(..=ofs)
            .next_back()
            .map_or(ofs, |(&frag_ofs, _)| frag_ofs);
        self.frags
            .range(start..end)
            .filter(move |&(&frag_ofs, frag)| frag_ofs + frag.size > ofs)
            .map(|(&frag_ofs, frag)| self.view(frag_ofs, frag))
    }

    fn view<'a>(&'a self, ofs: u32, frag: &Frag) -> FragView<'a> {
        FragView {
            ofs,
            size: frag.size,
            dnode: frag
                .node
                .and_then(|id| self.dnode(id).map(|dn| (id, dn))),
        }
    }

    // ── Insert ──────────────────────────────────────────────────────────────

    /// Add a freshly written data node covering `[ofs, ofs + size)`.
    ///
    /// Last write wins: any older data in the range is cut away. Returns the
    /// new dnode handle (`None` for a zero-length node, which carries only
    /// metadata) and the resulting reference state changes.
    pub fn add_full_dnode(
        &mut self,
        raw: NodeRefId,
        ofs: u32,
        size: u32,
    ) -> Result<(Option<DnodeId>, FragChanges), FragTreeError> {
        let mut changes = FragChanges::default();
        if size == 0 {
            return Ok((None, changes));
        }
        let end = ofs
            .checked_add(size)
            .ok_or(FragTreeError::RangeOverflow { ofs, size })?;

        let id = self.alloc_dnode(FullDnode {
            raw,
            ofs,
            size,
            frags: 1,
        });
        self.insert_frag(ofs, size, id, raw, &mut changes);

        // A node that shares a page with a neighbour cannot be copied
        // verbatim: the page must be rebuilt from both.
        if ofs % PAGE_SIZE != 0 {
            changes.mark_normal.push(raw);
            if let Some(prev_raw) = self
                .frags
                .range(..ofs)
                .next_back()
                .and_then(|(_, prev)| prev.node)
                .and_then(|prev| self.dnode(prev))
                .map(|dn| dn.raw)
            {
                changes.mark_normal.push(prev_raw);
            }
        }
        if end % PAGE_SIZE != 0 {
            if let Some((_, next)) = self.frags.range(end..).next() {
                changes.mark_normal.push(raw);
                if let Some(next_raw) = next.node.and_then(|n| self.dnode(n)).map(|dn| dn.raw) {
                    changes.mark_normal.push(next_raw);
                }
            }
        }

        tracing::trace!(
            target: "ffl::fragtree",
            raw = raw.0,
            ofs,
            size,
            obsoleted = changes.obsoleted.len(),
            "fragtree_add_dnode"
        );
        Ok((Some(id), changes))
    }

    fn insert_frag(
        &mut self,
        new_ofs: u32,
        new_size: u32,
        id: DnodeId,
        raw: NodeRefId,
        changes: &mut FragChanges,
    ) {
        let new_end = new_ofs + new_size;
        let new_frag = Frag {
            size: new_size,
            node: Some(id),
        };
        let this = self
            .frags
            .range(..=new_ofs)
            .next_back()
            .map(|(&ofs, frag)| (ofs, *frag));
        let lastend = this.map_or(0, |(ofs, frag)| ofs + frag.size);

        let Some((this_ofs, this_frag)) = this.filter(|_| lastend > new_ofs) else {
            // Past the end of the tree: fill any gap with a hole.
            if let Some((_, prev)) = this {
                if lastend > 0 && (lastend - 1) / PAGE_SIZE == new_ofs / PAGE_SIZE {
                    self.push_normal(prev.node, changes);
                    changes.mark_normal.push(raw);
                }
            }
            if lastend < new_ofs {
                self.frags.insert(
                    lastend,
                    Frag {
                        size: new_ofs - lastend,
                        node: None,
                    },
                );
            }
            self.frags.insert(new_ofs, new_frag);
            return;
        };

        let this_end = this_ofs + this_frag.size;
        if new_ofs > this_ofs {
            // The head of `this` survives.
            changes.mark_normal.push(raw);
            self.push_normal(this_frag.node, changes);
            self.resize(this_ofs, new_ofs - this_ofs);
            self.frags.insert(new_ofs, new_frag);
            if this_end > new_end {
                // ...and so does its tail: split.
                if let Some(node) = this_frag.node.and_then(|n| self.dnode_mut(n)) {
                    node.frags += 1;
                }
                self.frags.insert(
                    new_end,
                    Frag {
                        size: this_end - new_end,
                        node: this_frag.node,
                    },
                );
                return;
            }
        } else if new_end >= this_end {
            self.frags.insert(new_ofs, new_frag);
            self.release_frag(this_frag, changes);
        } else {
            // Same start, new data shorter: shift the remainder of `this`.
            self.frags.insert(new_ofs, new_frag);
            self.frags.insert(
                new_end,
                Frag {
                    size: this_end - new_end,
                    node: this_frag.node,
                },
            );
            return;
        }

        // Successors wholly covered by the new fragment go away; a partially
        // covered one is trimmed from the front.
        loop {
            let next = self
                .frags
                .range((Bound::Excluded(new_ofs), Bound::Unbounded))
                .next()
                .map(|(&ofs, frag)| (ofs, *frag));
            let Some((next_ofs, next_frag)) = next else {
                break;
            };
            let next_end = next_ofs + next_frag.size;
            if next_end <= new_end {
                self.frags.remove(&next_ofs);
                self.release_frag(next_frag, changes);
                continue;
            }
            if next_ofs < new_end {
                self.frags.remove(&next_ofs);
                self.frags.insert(
                    new_end,
                    Frag {
                        size: next_end - new_end,
                        node: next_frag.node,
                    },
                );
                self.push_normal(next_frag.node, changes);
                changes.mark_normal.push(raw);
            }
            break;
        }
    }

    // ── Truncate / destroy ──────────────────────────────────────────────────

    /// Set the tree to exactly `size` bytes.
    ///
    /// Shrinking cuts fragments back and releases dnodes left without any.
    /// Growing appends a hole up to `size`.
    pub fn truncate(&mut self, size: u32) -> FragChanges {
        let mut changes = FragChanges::default();
        let end = self.size();
        if end < size {
            self.extend_hole(end, size);
            tracing::trace!(target: "ffl::fragtree", from = end, size, "fragtree_extend");
            return changes;
        }

        if let Some((&ofs, frag)) = self.frags.range_mut(..size).next_back() {
            if ofs + frag.size > size {
                frag.size = size - ofs;
            }
        }
        let doomed: Vec<u32> = self.frags.range(size..).map(|(&ofs, _)| ofs).collect();
        for ofs in doomed {
            if let Some(frag) = self.frags.remove(&ofs) {
                self.release_frag(frag, &mut changes);
            }
        }

        // A last fragment starting on a page boundary owns its whole page.
        if let Some((&last_ofs, last)) = self.frags.last_key_value() {
            if last_ofs % PAGE_SIZE == 0 {
                if let Some(raw) = last.node.and_then(|n| self.dnode(n)).map(|dn| dn.raw) {
                    changes.mark_pristine.push(raw);
                }
            }
        }
        tracing::trace!(
            target: "ffl::fragtree",
            size,
            obsoleted = changes.obsoleted.len(),
            "fragtree_truncate"
        );
        changes
    }

    /// Cover `[end, size)` with a hole, growing a trailing hole in place.
    fn extend_hole(&mut self, end: u32, size: u32) {
        if let Some(last) = self.frags.values_mut().next_back() {
            if last.node.is_none() {
                last.size += size - end;
                return;
            }
        }
        self.frags.insert(
            end,
            Frag {
                size: size - end,
                node: None,
            },
        );
    }

    /// Destroy the whole tree, reporting every dnode whose last fragment
    /// went with it.
    pub fn kill(&mut self) -> FragChanges {
        let mut changes = FragChanges::default();
        let frags = std::mem::take(&mut self.frags);
        for (released, (_, frag)) in frags.into_iter().enumerate() {
            self.release_frag(frag, &mut changes);
            if (released + 1) % KILL_BATCH == 0 {
                std::thread::yield_now();
            }
        }
        self.dnodes.clear();
        self.free_dnodes.clear();
        changes
    }

    // ── Consistency ─────────────────────────────────────────────────────────

    /// Verify the structural invariants of the tree.
    ///
    /// Fragments must be non-empty, contiguous from offset 0, lie inside
    /// their dnode's range, and every dnode's `frags` count must equal the
    /// number of fragments pointing at it.
    pub fn check_coverage(&self) -> Result<(), String> {
        let mut expected = 0_u32;
        let mut counts = vec![0_u32; self.dnodes.len()];
        for (&ofs, frag) in &self.frags {
            if ofs != expected {
                return Err(format!("fragment at {ofs:#x} but previous ended at {expected:#x}"));
            }
            if frag.size == 0 {
                return Err(format!("empty fragment at {ofs:#x}"));
            }
            if let Some(id) = frag.node {
                let dn = self
                    .dnode(id)
                    .ok_or_else(|| format!("fragment at {ofs:#x} points at freed dnode {id}"))?;
                if ofs < dn.ofs || ofs + frag.size > dn.ofs + dn.size {
                    return Err(format!(
                        "fragment {ofs:#x}+{:#x} outside dnode {:#x}+{:#x}",
                        frag.size, dn.ofs, dn.size
                    ));
                }
                counts[id.as_usize()] += 1;
            }
            expected = ofs + frag.size;
        }
        for (id, dn) in self.dnodes() {
            if counts[id.as_usize()] != dn.frags {
                return Err(format!(
                    "dnode {id} claims {} fragments, tree holds {}",
                    dn.frags,
                    counts[id.as_usize()]
                ));
            }
            if dn.frags == 0 {
                return Err(format!("dnode {id} is live with no fragments"));
            }
        }
        Ok(())
    }

    // ── Arena ───────────────────────────────────────────────────────────────

    fn alloc_dnode(&mut self, dnode: FullDnode) -> DnodeId {
        if let Some(idx) = self.free_dnodes.pop() {
            self.dnodes[idx as usize] = Some(dnode);
            return DnodeId(idx);
        }
        self.dnodes.push(Some(dnode));
        DnodeId((self.dnodes.len() - 1) as u32)
    }

    fn dnode_mut(&mut self, id: DnodeId) -> Option<&mut FullDnode> {
        self.dnodes.get_mut(id.as_usize()).and_then(Option::as_mut)
    }

    fn resize(&mut self, ofs: u32, size: u32) {
        if let Some(frag) = self.frags.get_mut(&ofs) {
            frag.size = size;
        }
    }

    fn push_normal(&self, node: Option<DnodeId>, changes: &mut FragChanges) {
        if let Some(raw) = node.and_then(|n| self.dnode(n)).map(|dn| dn.raw) {
            changes.mark_normal.push(raw);
        }
    }

    /// Drop one fragment's claim on its dnode.
    fn release_frag(&mut self, frag: Frag, changes: &mut FragChanges) {
        let Some(id) = frag.node else {
            return;
        };
        let Some(dn) = self.dnode_mut(id) else {
            return;
        };
        dn.frags = dn.frags.saturating_sub(1);
        if dn.frags > 0 {
            changes.mark_normal.push(dn.raw);
            return;
        }
        changes.obsoleted.push(dn.raw);
        self.dnodes[id.as_usize()] = None;
        self.free_dnodes.push(id.0);
    }
}
