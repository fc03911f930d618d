//! Obsoleting nodes and invalidating their on-flash headers.

use crate::{Txn, read_overlaid};
use ffl_error::Result;
use ffl_fragtree::FragChanges;
use ffl_ledger::{BlockState, Obsoleted};
use ffl_ondisk::{HEADER_SIZE, NodeHeader, clear_accurate};
use ffl_types::{NodeRefId, RefState, pad4};

impl Txn<'_> {
    /// Mark a node obsolete in the ledger and, where the medium allows,
    /// clear the accurate bit of its header on flash.
    pub(crate) fn obsolete_ref(&mut self, id: NodeRefId) -> Result<Obsoleted> {
        let vol = self.vol;
        let _erase_free = vol.erase_free.lock();
        let out = {
            let mut space = vol.space.lock();
            let flush_pending = self.wbuf.is_dirty();
            let crate::SpaceState { ledger, alloc, .. } = &mut *space;
            let out = ledger.mark_obsolete(id, flush_pending)?;
            if out.refiled == Some(BlockState::Erasable) {
                alloc.admit_erasable(ledger, out.block)?;
            }
            out
        };
        if out.changed && vol.device.can_mark_obsolete() {
            // A header left accurate is only re-checked at the next scan.
            if let Err(err) = self.invalidate_header(out.offset, out.len) {
                if err.is_fatal() {
                    return Err(err);
                }
                tracing::warn!(
                    target: "ffl::core",
                    node = id.0,
                    offset = out.offset,
                    error = %err,
                    "invalidate_failed"
                );
            }
        }
        Ok(out)
    }

    /// Clear the accurate bit of the node header at `offset`, staged or on
    /// flash. Anything that does not look like a header of a `len`-byte
    /// node is left alone.
    pub(crate) fn invalidate_header(&mut self, offset: u32, len: u32) -> Result<()> {
        if (len as usize) < HEADER_SIZE {
            return Ok(());
        }
        let mut header = [0_u8; HEADER_SIZE];
        read_overlaid(&*self.vol.device, &self.wbuf, offset, &mut header)?;
        let Ok(parsed) = NodeHeader::parse(&header) else {
            tracing::debug!(target: "ffl::core", offset, "invalidate_no_header");
            return Ok(());
        };
        if pad4(parsed.totlen) != len || !parsed.is_accurate() {
            tracing::trace!(target: "ffl::core", offset, totlen = parsed.totlen, len, "invalidate_skipped");
            return Ok(());
        }
        clear_accurate(&mut header).map_err(|err| crate::corrupt(offset, &err))?;

        if let Some(staged) = self.wbuf.staged_mut(offset, HEADER_SIZE as u32) {
            staged.copy_from_slice(&header);
            return Ok(());
        }
        if let Some(start) = self.wbuf.offset() {
            let straddles = start < offset + HEADER_SIZE as u32
                && offset < start + self.wbuf.len();
            if straddles {
                tracing::debug!(target: "ffl::core", offset, "invalidate_straddles_wbuf");
                return Ok(());
            }
        }
        self.vol.device.write(offset, &header)
    }

    /// Apply the reference changes a fragment tree mutation produced.
    pub(crate) fn apply_changes(&mut self, changes: FragChanges) -> Result<()> {
        for id in changes.obsoleted {
            self.obsolete_ref(id)?;
        }
        if changes.mark_normal.is_empty() && changes.mark_pristine.is_empty() {
            return Ok(());
        }
        let mut space = self.vol.space.lock();
        for id in changes.mark_normal {
            space.ledger.set_ref_state(id, RefState::Normal)?;
        }
        for id in changes.mark_pristine {
            space.ledger.set_ref_state(id, RefState::Pristine)?;
        }
        Ok(())
    }
}
