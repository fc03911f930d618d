//! Eraseblocks and their lifecycle states.

use ffl_types::{BlockIndex, NodeRefId};
use serde::{Deserialize, Serialize};

/// Which list an eraseblock currently belongs to.
///
/// ```text
///  Free ─► Nextblock ─► Clean / Dirty / VeryDirty ─► GcSource
///   ▲                          │                        │
///   │                          ▼                        ▼
///   │                Erasable / ErasablePendingFlush ◄──┘
///   │                          │
///   │                          ▼
///   └── EraseComplete ◄── Erasing ◄── ErasePending ──► Bad (after repeated failures)
/// ```
///
/// `BadUsed` holds blocks whose programming failed while they still carry
/// live nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockState {
    Free,
    Nextblock,
    GcSource,
    Clean,
    Dirty,
    VeryDirty,
    Erasable,
    ErasablePendingFlush,
    ErasePending,
    Erasing,
    EraseComplete,
    Bad,
    BadUsed,
}

impl BlockState {
    pub const COUNT: usize = 13;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Free,
        Self::Nextblock,
        Self::GcSource,
        Self::Clean,
        Self::Dirty,
        Self::VeryDirty,
        Self::Erasable,
        Self::ErasablePendingFlush,
        Self::ErasePending,
        Self::Erasing,
        Self::EraseComplete,
        Self::Bad,
        Self::BadUsed,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// States whose sector is tracked by the volume's `erasing_size` rather
    /// than by the block's own counters.
    #[must_use]
    pub fn in_erase(self) -> bool {
        matches!(self, Self::Erasing | Self::EraseComplete)
    }

    /// True if the block's counters participate in the per-block invariant.
    #[must_use]
    pub fn is_accounted(self) -> bool {
        !self.in_erase() && self != Self::Bad
    }

    /// States from which the block can be chosen as a GC source.
    #[must_use]
    pub fn is_gc_candidate(self) -> bool {
        matches!(
            self,
            Self::Clean | Self::Dirty | Self::VeryDirty | Self::Erasable | Self::BadUsed
        )
    }
}

/// Where a block is placed within its new list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Head,
    Tail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eraseblock {
    pub index: BlockIndex,
    /// Flash offset of the first byte.
    pub offset: u32,
    pub free_size: u32,
    pub used_size: u32,
    pub dirty_size: u32,
    pub wasted_size: u32,
    pub unchecked_size: u32,
    /// Accumulated erase failures.
    pub bad_count: u32,
    pub state: BlockState,
    /// Node references in flash order.
    pub(crate) nodes: Vec<NodeRefId>,
    /// Position of the next node the garbage collector will examine.
    pub(crate) gc_cursor: usize,
    /// Ordering key within the current list (lower is nearer the head).
    pub(crate) list_seq: i64,
}

impl Eraseblock {
    pub(crate) fn new(index: BlockIndex, offset: u32) -> Self {
        Self {
            index,
            offset,
            free_size: 0,
            used_size: 0,
            dirty_size: 0,
            wasted_size: 0,
            unchecked_size: 0,
            bad_count: 0,
            state: BlockState::ErasePending,
            nodes: Vec::new(),
            gc_cursor: 0,
            list_seq: 0,
        }
    }

    /// Sum of the five per-block counters.
    #[must_use]
    pub fn accounted(&self) -> u64 {
        u64::from(self.free_size)
            + u64::from(self.used_size)
            + u64::from(self.dirty_size)
            + u64::from(self.wasted_size)
            + u64::from(self.unchecked_size)
    }

    /// Live bytes: data that must be preserved before an erase.
    #[must_use]
    pub fn live_size(&self) -> u32 {
        self.used_size + self.unchecked_size
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeRefId> + '_ {
        self.nodes.iter().copied()
    }

    #[must_use]
    pub fn first_node(&self) -> Option<NodeRefId> {
        self.nodes.first().copied()
    }
}
