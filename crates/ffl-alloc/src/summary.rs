//! Collection of summary entries for the current write target.

use ffl_ondisk::{SUMMARY_ENTRY_SIZE, SUMMARY_FRAME_SIZE, SummaryEntry};
use ffl_types::{BlockIndex, pad4};

/// Entries for the block currently receiving writes.
///
/// Collection restarts whenever a new nextblock is chosen. It can be
/// switched off for one block (after write-buffer recovery moved nodes the
/// collector never saw); the next block collects again.
#[derive(Debug, Clone, Default)]
pub struct SummaryCollector {
    enabled: bool,
    block: Option<BlockIndex>,
    entries: Vec<SummaryEntry>,
    disabled_for_block: bool,
}

impl SummaryCollector {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    /// Start collecting for a fresh nextblock.
    pub fn reset(&mut self, block: BlockIndex) {
        self.block = Some(block);
        self.entries.clear();
        self.disabled_for_block = false;
    }

    /// Stop collecting until the next [`reset`](Self::reset).
    pub fn disable(&mut self) {
        if self.is_active() {
            tracing::debug!(
                target: "ffl::alloc",
                block = self.block.map(|b| b.0),
                dropped = self.entries.len(),
                "summary_disabled"
            );
        }
        self.entries.clear();
        self.disabled_for_block = true;
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && !self.disabled_for_block && self.block.is_some()
    }

    #[must_use]
    pub fn block(&self) -> Option<BlockIndex> {
        self.block
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Note a node written into `block`. Ignored for any other block.
    pub fn record(&mut self, block: BlockIndex, entry: SummaryEntry) {
        if self.is_active() && self.block == Some(block) {
            self.entries.push(entry);
        }
    }

    /// Space to keep free at the end of the block for the summary node,
    /// assuming `extra` more entries are recorded first.
    #[must_use]
    pub fn reserved_size(&self, extra: u32) -> u32 {
        if !self.is_active() {
            return 0;
        }
        let count = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        pad4(
            SUMMARY_FRAME_SIZE
                .saturating_add(count.saturating_add(extra).saturating_mul(SUMMARY_ENTRY_SIZE)),
        )
    }

    /// Hand over the collected entries and stop collecting for this block.
    pub fn take(&mut self) -> Vec<SummaryEntry> {
        self.disabled_for_block = true;
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffl_ondisk::NODETYPE_INODE;

    fn entry(offset: u32) -> SummaryEntry {
        SummaryEntry {
            nodetype: NODETYPE_INODE,
            offset,
            totlen: 64,
            ino: 1,
            version: offset,
        }
    }

    #[test]
    fn collects_only_for_current_block() {
        let mut sum = SummaryCollector::new(true);
        assert_eq!(sum.reserved_size(1), 0);
        sum.reset(BlockIndex(3));
        sum.record(BlockIndex(3), entry(12));
        sum.record(BlockIndex(4), entry(12));
        assert_eq!(sum.len(), 1);
        assert_eq!(sum.reserved_size(1), SUMMARY_FRAME_SIZE + 2 * SUMMARY_ENTRY_SIZE);
    }

    #[test]
    fn disabled_until_next_block() {
        let mut sum = SummaryCollector::new(true);
        sum.reset(BlockIndex(1));
        sum.record(BlockIndex(1), entry(12));
        sum.disable();
        assert!(sum.is_empty());
        assert_eq!(sum.reserved_size(1), 0);
        sum.record(BlockIndex(1), entry(76));
        assert!(sum.is_empty());

        sum.reset(BlockIndex(2));
        assert!(sum.is_active());
    }

    #[test]
    fn switched_off_collector_reserves_nothing() {
        let mut sum = SummaryCollector::new(false);
        sum.reset(BlockIndex(0));
        sum.record(BlockIndex(0), entry(12));
        assert!(sum.is_empty());
        assert_eq!(sum.reserved_size(4), 0);
    }

    #[test]
    fn take_drains_and_stops() {
        let mut sum = SummaryCollector::new(true);
        sum.reset(BlockIndex(0));
        sum.record(BlockIndex(0), entry(12));
        sum.record(BlockIndex(0), entry(76));
        assert_eq!(sum.take().len(), 2);
        assert!(!sum.is_active());
    }
}
