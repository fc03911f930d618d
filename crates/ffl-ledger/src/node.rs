//! Node references and per-inode caches.

use ffl_types::{BlockIndex, InodeNumber, NodeRefId, RawOffset, RefState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One physical node on flash.
///
/// The length is not stored: it is the distance to the next reference in
/// the same block, or to the block's write frontier for the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub raw: RawOffset,
    pub block: BlockIndex,
    /// Position in the block's flash-ordered chain.
    pub(crate) slot: u32,
    pub owner: Option<InodeNumber>,
}

impl NodeRef {
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.raw.offset()
    }

    #[must_use]
    pub fn state(&self) -> RefState {
        self.raw.state()
    }

    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        self.raw.is_obsolete()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeState {
    Unchecked,
    Checking,
    Present,
    CheckedAbsent,
    Gc,
    Reading,
    Clearing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InodeCache {
    pub ino: InodeNumber,
    /// Live node references owned by this inode, in no particular order.
    pub(crate) nodes: BTreeSet<NodeRefId>,
    /// Link count while rebuilding, parent inode afterwards.
    pub pino_nlink: u32,
    pub state: InodeState,
}

impl InodeCache {
    #[must_use]
    pub fn new(ino: InodeNumber, state: InodeState) -> Self {
        Self {
            ino,
            nodes: BTreeSet::new(),
            pino_nlink: 0,
            state,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeRefId> + '_ {
        self.nodes.iter().copied()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// No node and no in-core user keeps this cache alive.
    #[must_use]
    pub fn is_disposable(&self) -> bool {
        self.nodes.is_empty()
            && self.pino_nlink == 0
            && matches!(self.state, InodeState::CheckedAbsent | InodeState::Unchecked)
    }
}
