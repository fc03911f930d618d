//! Write path: staging through the write buffer, page programming, and
//! recovery from failed page writes.

use crate::reserve::Reserve;
use crate::{SpaceState, Txn};
use ffl_error::{DeviceErrorKind, FflError, Result};
use ffl_ledger::{BlockState, Relocation};
use ffl_types::{InodeNumber, NodeRefId};
use ffl_wbuf::Placement;

/// A node reference in the failed block, as seen before recovery.
#[derive(Debug, Clone, Copy)]
struct Salvage {
    id: NodeRefId,
    offset: u32,
    len: u32,
    obsolete: bool,
}

impl Txn<'_> {
    // ── Staging ─────────────────────────────────────────────────────────────

    /// Write `data` at flash offset `to` through the write buffer.
    ///
    /// Whole pages are programmed directly; partial pages are staged. On
    /// error the data may be partly on flash, so the caller must reserve
    /// again rather than retry at `to`.
    pub(crate) fn write_bytes(
        &mut self,
        to: u32,
        data: &[u8],
        ino: Option<InodeNumber>,
    ) -> Result<()> {
        match self.wbuf.locate(to)? {
            Placement::Unset => self.wbuf.start_at(to),
            Placement::OtherBlock => {
                self.flush(true)?;
                self.wbuf.start_at(to);
            }
            Placement::Contiguous => {
                self.wbuf.align_to(to)?;
                if self.wbuf.is_full() {
                    self.flush(false)?;
                }
            }
        }

        let mut rest = data;
        if !self.wbuf.is_empty() {
            let taken = self.wbuf.fill(rest);
            rest = &rest[taken..];
            if self.wbuf.is_full() {
                self.flush(false)?;
            }
        }

        let page = self.wbuf.page_size() as usize;
        let whole = rest.len() - rest.len() % page;
        if whole > 0 {
            let at = self.wbuf.position().ok_or_else(|| {
                FflError::Inconsistent("direct write without a buffer position".to_owned())
            })?;
            if let Err(err) = self.program(at, &rest[..whole]) {
                if err.is_fatal() {
                    return Err(err);
                }
                let block = self.vol.geometry.block_of(at);
                tracing::warn!(
                    target: "ffl::core",
                    offset = at,
                    len = whole,
                    written = err.bytes_written(),
                    error = %err,
                    "direct_write_failed"
                );
                {
                    let mut space = self.vol.space.lock();
                    space.ledger.refile_failed_block(block)?;
                    if space.summary.block() == Some(block) {
                        space.summary.disable();
                    }
                }
                self.wbuf.discard();
                return Err(err);
            }
            self.wbuf.skip(whole as u32)?;
            rest = &rest[whole..];
        }
        if !rest.is_empty() {
            self.wbuf.fill(rest);
        }
        if let Some(ino) = ino {
            if self.wbuf.is_dirty() {
                self.wbuf.mark_inode(ino);
            }
        }
        Ok(())
    }

    /// Program `data` at `offset`, reading it back when verification is on.
    ///
    /// Bytes left erased in `data` are not compared: they may sit over
    /// earlier content of the same page, such as the clean marker.
    fn program(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.vol.device.write(offset, data)?;
        if !self.vol.config.write_verify {
            return Ok(());
        }
        let mut check = vec![0_u8; data.len()];
        self.vol.device.read(offset, &mut check)?;
        let mismatch = check
            .iter()
            .zip(data)
            .any(|(got, want)| *want != 0xFF && got != want);
        if mismatch {
            tracing::warn!(target: "ffl::core", offset, len = data.len(), "write_verify_mismatch");
            return Err(FflError::Device {
                offset,
                kind: DeviceErrorKind::Verify,
            });
        }
        Ok(())
    }

    // ── Flushing ────────────────────────────────────────────────────────────

    /// Write the staged page out.
    ///
    /// Without `pad` only a full page is written. With `pad` a partial page
    /// is padded; the padding is accounted as wasted space if it sits at the
    /// block's frontier. A failed write runs recovery and then returns the
    /// write error.
    pub(crate) fn flush(&mut self, pad: bool) -> Result<()> {
        if !self.wbuf.is_dirty() || (!pad && !self.wbuf.is_full()) {
            if !self.wbuf.is_dirty() {
                self.release_flush_waiters()?;
            }
            return Ok(());
        }
        let image = self.wbuf.page_image(pad)?;
        if let Err(err) = self.program(image.offset, &image.data) {
            if err.is_fatal() {
                return Err(err);
            }
            tracing::warn!(
                target: "ffl::core",
                page = image.offset,
                written = err.bytes_written(),
                error = %err,
                "wbuf_flush_failed"
            );
            if let Err(rec) = self.recover() {
                if rec.is_fatal() {
                    return Err(rec);
                }
                tracing::error!(target: "ffl::core", page = image.offset, error = %rec, "wbuf_recovery_failed");
            }
            return Err(err);
        }

        if image.padding > 0 {
            let block = self.vol.geometry.block_of(image.offset);
            let at = image.padding_offset();
            let mut space = self.vol.space.lock();
            let accounted = space
                .ledger
                .block(block)
                .is_some_and(|b| b.state.is_accounted() && b.free_size > 0)
                && space.ledger.frontier(block)? == at;
            if accounted {
                let wasted = space.ledger.nextblock() == Some(block);
                space
                    .ledger
                    .link_obsolete_space(block, at, image.padding, wasted)?;
            } else {
                tracing::trace!(target: "ffl::core", page = image.offset, "wbuf_padding_unaccounted");
            }
        }
        self.wbuf.advance(&image);
        self.release_flush_waiters()?;
        tracing::debug!(
            target: "ffl::core",
            page = image.offset,
            padding = image.padding,
            "wbuf_flushed"
        );
        Ok(())
    }

    /// Pad-flush, trying once more if recovery left bytes staged.
    pub(crate) fn flush_padded(&mut self) -> Result<()> {
        match self.flush(true) {
            Err(err) if !err.is_fatal() => {
                tracing::debug!(target: "ffl::core", error = %err, "wbuf_flush_retry");
                self.flush(true)
            }
            other => other,
        }
    }

    /// Blocks that only waited for the buffer to reach flash become
    /// erasable.
    fn release_flush_waiters(&mut self) -> Result<()> {
        let mut space = self.vol.space.lock();
        let SpaceState { ledger, alloc, .. } = &mut *space;
        for block in ledger.release_flush_waiters()? {
            alloc.admit_erasable(ledger, block)?;
        }
        Ok(())
    }

    // ── Recovery ────────────────────────────────────────────────────────────

    /// Rescue the live nodes of a block whose staged page failed to program.
    ///
    /// The failed block is refiled (it keeps whatever already reached flash
    /// but takes no more writes). Every live node from the first one that
    /// reaches into the failed page onwards is rebuilt from flash and the
    /// staged bytes, written to fresh space, and its reference moved there.
    /// The unaligned tail stays staged at its new location.
    pub(crate) fn recover(&mut self) -> Result<()> {
        let vol = self.vol;
        let Some(wbuf_ofs) = self.wbuf.offset() else {
            return Ok(());
        };
        let failed = vol.geometry.block_of(wbuf_ofs);
        let staged = self.wbuf.contents().to_vec();
        let inodes = self.wbuf.discard();

        let chain: Vec<Salvage> = {
            let mut space = vol.space.lock();
            let chain = space
                .ledger
                .block(failed)
                .map(|b| b.nodes().collect::<Vec<_>>())
                .unwrap_or_default()
                .into_iter()
                .map(|id| -> Result<Salvage> {
                    let node = space.ledger.node(id).ok_or_else(|| {
                        FflError::Inconsistent(format!("block {failed} lists released node {id}"))
                    })?;
                    Ok(Salvage {
                        id,
                        offset: node.offset(),
                        len: space.ledger.ref_totlen(id)?,
                        obsolete: node.is_obsolete(),
                    })
                })
                .collect::<Result<_>>()?;
            if space.ledger.block(failed).is_some_and(|b| b.state.is_accounted()) {
                space.ledger.refile_failed_block(failed)?;
            }
            if space.summary.block() == Some(failed) {
                space.summary.disable();
            }
            chain
        };

        let Some(first) = chain
            .iter()
            .position(|n| !n.obsolete && n.offset + n.len > wbuf_ofs)
        else {
            tracing::info!(target: "ffl::core", block = failed.0, "wbuf_recovery_nothing_live");
            return Ok(());
        };
        let Some(last) = chain.iter().rposition(|n| !n.obsolete) else {
            return Ok(());
        };
        let mut range = &chain[first..=last];
        let end = range[range.len() - 1].offset + range[range.len() - 1].len;
        let mut start = range[0].offset;

        let mut head = Vec::new();
        if start < wbuf_ofs {
            head = vec![0_u8; (wbuf_ofs - start) as usize];
            if let Err(err) = vol.device.read(start, &mut head) {
                if err.is_fatal() {
                    return Err(err);
                }
                tracing::error!(
                    target: "ffl::core",
                    node = range[0].id.0,
                    offset = start,
                    error = %err,
                    "wbuf_recovery_data_lost"
                );
                let Some(next) = range.iter().skip(1).position(|n| !n.obsolete) else {
                    return Err(FflError::DataLoss(format!(
                        "node at {start:#x} could not be reread after a failed page write"
                    )));
                };
                range = &range[next + 1..];
                start = range[0].offset;
                head.clear();
            }
        }

        let mut data = head;
        data.resize((end - start) as usize, 0xFF);
        let from = start.max(wbuf_ofs);
        let staged_end = wbuf_ofs + staged.len() as u32;
        if from < staged_end {
            let upto = end.min(staged_end);
            data[(from - start) as usize..(upto - start) as usize]
                .copy_from_slice(&staged[(from - wbuf_ofs) as usize..(upto - wbuf_ofs) as usize]);
        }

        let total = end - start;
        let grant = match self.reserve(total, total, Reserve::Gc, None) {
            Ok(grant) => grant,
            Err(err) => {
                tracing::error!(target: "ffl::core", block = failed.0, bytes = total, error = %err, "wbuf_recovery_no_space");
                return Err(if err.is_fatal() {
                    err
                } else {
                    FflError::DataLoss(format!("no space to relocate {total} bytes: {err}"))
                });
            }
        };

        let page_base = vol.geometry.page_start(grant.offset);
        let mut image = vec![0xFF_u8; (grant.offset - page_base) as usize];
        image.extend_from_slice(&data);
        let page = vol.geometry.page_size as usize;
        let full = image.len() - image.len() % page;
        if full > 0 {
            if let Err(err) = self.program(page_base, &image[..full]) {
                if err.is_fatal() {
                    return Err(err);
                }
                tracing::error!(
                    target: "ffl::core",
                    offset = page_base,
                    error = %err,
                    "wbuf_recovery_write_failed"
                );
                let mut space = vol.space.lock();
                space.ledger.refile_failed_block(grant.block)?;
                space.summary.disable();
                return Err(FflError::DataLoss(format!(
                    "relocation of {total} bytes to {:#x} failed: {err}",
                    grant.offset
                )));
            }
        }
        if full < image.len() {
            self.wbuf
                .restart(page_base + full as u32, &image[full..], inodes)?;
        }

        let mut space = vol.space.lock();
        let flush_pending = self.wbuf.is_dirty();
        let mut at = grant.offset;
        let mut moved = 0_u32;
        for node in range {
            if node.obsolete {
                space
                    .ledger
                    .link_obsolete_space(grant.block, at, node.len, false)?;
            } else {
                space.ledger.relocate_ref(
                    node.id,
                    grant.block,
                    at,
                    Relocation::Recovery,
                    flush_pending,
                )?;
                moved += 1;
            }
            at += node.len;
        }
        let emptied = space
            .ledger
            .block(failed)
            .is_some_and(|b| b.state == BlockState::BadUsed && b.live_size() == 0);
        if emptied {
            space.ledger.admit_erase(failed)?;
        }
        tracing::info!(
            target: "ffl::core",
            failed = failed.0,
            to = grant.offset,
            nodes = moved,
            bytes = total,
            "wbuf_recovered"
        );
        Ok(())
    }
}
