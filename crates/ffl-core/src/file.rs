//! File data: writing, reading, truncating and deleting.
//!
//! A file is a fragment tree over the data nodes written for it. Writes are
//! split at page boundaries so that a node never spans two pages of the
//! file, and every node carries the file size at the time it was written.

use crate::gc::GcOutcome;
use crate::reserve::Reserve;
use crate::{FileState, MIN_DATA_LEN, Txn, Volume, corrupt, read_overlaid};
use ffl_alloc::Priority;
use ffl_error::{FflError, Result};
use ffl_ledger::InodeState;
use ffl_ondisk::{DATA_NODE_HEADER_SIZE, DataNode, UnlinkNode};
use ffl_types::{InodeNumber, NodeRefId, PAGE_SIZE, ParseError, RefState};
use serde::{Deserialize, Serialize};

/// One fragment of a file, as reported by [`Volume::fragments`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentInfo {
    pub ofs: u32,
    pub size: u32,
    /// Backing node, `None` for a hole.
    pub node: Option<NodeRefId>,
}

fn check_ino(ino: InodeNumber) -> Result<()> {
    if ino.0 == 0 {
        return Err(FflError::NotFound("inode 0 is reserved".to_owned()));
    }
    Ok(())
}

fn encode_failed(err: &ParseError) -> FflError {
    FflError::Inconsistent(format!("node encoding failed: {err}"))
}

impl Volume {
    /// Write `data` at `offset` of file `ino`, creating the file if needed.
    /// Returns the number of bytes written.
    pub fn write_data(&self, ino: InodeNumber, offset: u32, data: &[u8]) -> Result<u32> {
        check_ino(ino)?;
        let len = u32::try_from(data.len())
            .ok()
            .filter(|len| offset.checked_add(*len).is_some())
            .ok_or_else(|| {
                FflError::Config(format!(
                    "write of {} bytes at {offset:#x} overflows the file offset space",
                    data.len()
                ))
            })?;
        if len == 0 {
            return Ok(0);
        }
        self.run(|txn| {
            let existed = txn.files.contains_key(&ino);
            let mut file = txn.files.remove(&ino).unwrap_or_default();
            let result = txn.write_file_range(
                &mut file,
                ino,
                offset,
                data,
                Reserve::Write(Priority::Normal),
            );
            if existed || file.version > 0 {
                txn.files.insert(ino, file);
            }
            result.map(|()| len)
        })
    }

    /// Read up to `len` bytes at `offset`. The result stops at the end of
    /// the file; holes read as zeros.
    pub fn read_data(&self, ino: InodeNumber, offset: u32, len: u32) -> Result<Vec<u8>> {
        let files = self.files.read();
        let file = files
            .get(&ino)
            .ok_or_else(|| FflError::NotFound(format!("inode {ino}")))?;
        let end = offset.saturating_add(len).min(file.size());
        if end <= offset {
            return Ok(Vec::new());
        }
        let mut out = vec![0_u8; (end - offset) as usize];

        let wbuf = self.wbuf.read();
        for frag in file.tree.overlapping(offset, end - offset) {
            let Some((_, dn)) = frag.dnode else {
                continue;
            };
            let (at, totlen) = {
                let space = self.space.lock();
                let node = space.ledger.node(dn.raw).ok_or_else(|| {
                    FflError::Inconsistent(format!("inode {ino} refers to released node {}", dn.raw))
                })?;
                (node.offset(), space.ledger.ref_totlen(dn.raw)?)
            };
            let mut bytes = vec![0_u8; totlen as usize];
            read_overlaid(&*self.device, &wbuf, at, &mut bytes)?;
            let (_, payload) = DataNode::parse(&bytes).map_err(|err| corrupt(at, &err))?;

            let lo = frag.ofs.max(offset);
            let hi = frag.end().min(end);
            let src = (lo - dn.ofs) as usize..(hi - dn.ofs) as usize;
            let payload = payload.get(src).ok_or_else(|| FflError::Corruption {
                offset: at,
                detail: format!("data node shorter than fragment {:#x}+{:#x}", frag.ofs, frag.size),
            })?;
            out[(lo - offset) as usize..(hi - offset) as usize].copy_from_slice(payload);
        }
        Ok(out)
    }

    #[must_use]
    pub fn file_size(&self, ino: InodeNumber) -> Option<u32> {
        self.files.read().get(&ino).map(FileState::size)
    }

    /// Set the size of file `ino`, discarding data past it.
    pub fn truncate(&self, ino: InodeNumber, size: u32) -> Result<()> {
        self.run(|txn| {
            let mut file = txn
                .files
                .remove(&ino)
                .ok_or_else(|| FflError::NotFound(format!("inode {ino}")))?;
            let result = txn.truncate_file(&mut file, ino, size);
            txn.files.insert(ino, file);
            result
        })
    }

    /// Delete file `ino`. Uses the deletion reserve, so it can succeed on a
    /// volume too full for ordinary writes.
    pub fn delete_inode(&self, ino: InodeNumber) -> Result<()> {
        self.run(|txn| {
            let mut file = txn
                .files
                .remove(&ino)
                .ok_or_else(|| FflError::NotFound(format!("inode {ino}")))?;
            let result = txn.delete_file(&mut file, ino);
            if result.is_err() {
                txn.files.insert(ino, file);
            }
            result
        })
    }

    /// The fragments of file `ino` in offset order.
    pub fn fragments(&self, ino: InodeNumber) -> Result<Vec<FragmentInfo>> {
        let files = self.files.read();
        let file = files
            .get(&ino)
            .ok_or_else(|| FflError::NotFound(format!("inode {ino}")))?;
        Ok(file
            .tree
            .iter()
            .map(|frag| FragmentInfo {
                ofs: frag.ofs,
                size: frag.size,
                node: frag.dnode.map(|(_, dn)| dn.raw),
            })
            .collect())
    }

    /// Inode numbers of every file the volume holds.
    #[must_use]
    pub fn inodes(&self) -> Vec<InodeNumber> {
        self.files.read().keys().copied().collect()
    }

    /// Get the staged data of `ino` onto flash.
    ///
    /// The staged page is first topped up by garbage collection so the
    /// padding does not waste space. Falls back to padding when the
    /// collector cannot help.
    pub fn flush_buffer_for_inode(&self, ino: InodeNumber) -> Result<()> {
        self.run(|txn| txn.flush_for_inode(ino))
    }

    /// Pad-flush the write buffer and sync the device.
    pub fn sync(&self) -> Result<()> {
        self.run(|txn| txn.flush_padded())?;
        self.device.sync()
    }
}

impl Txn<'_> {
    /// Write `data` at `pos` as one data node per page-bounded chunk.
    pub(crate) fn write_file_range(
        &mut self,
        file: &mut FileState,
        ino: InodeNumber,
        pos: u32,
        data: &[u8],
        reserve: Reserve,
    ) -> Result<()> {
        let header = DATA_NODE_HEADER_SIZE as u32;
        let total = data.len() as u32;
        let mut done = 0_u32;
        while done < total {
            let ofs = pos + done;
            let want = (PAGE_SIZE - ofs % PAGE_SIZE).min(total - done);
            let grant = self.reserve(
                header + want.min(MIN_DATA_LEN),
                header + want,
                reserve,
                Some(1),
            )?;
            let dsize = want.min(grant.len - header);
            let end = ofs + dsize;
            let node = DataNode {
                ino: ino.0,
                version: file.version + 1,
                isize: file.size().max(end),
                offset: ofs,
                dsize,
            };
            let bytes = node
                .encode(&data[done as usize..(done + dsize) as usize])
                .map_err(|err| encode_failed(&err))?;
            let at = self.commit(Some(grant), &bytes, reserve, Some(ino))?;
            file.version = node.version;
            file.isize = node.isize;

            // A node that owns its whole page can be copied verbatim by GC.
            let state = if dsize >= PAGE_SIZE || (ofs % PAGE_SIZE == 0 && end == node.isize) {
                RefState::Pristine
            } else {
                RefState::Normal
            };
            let id = self.link(at, &bytes, state, Some(ino))?;
            let (_, changes) = file
                .tree
                .add_full_dnode(id, ofs, dsize)
                .map_err(|err| FflError::Inconsistent(format!("inode {ino}: {err}")))?;
            tracing::trace!(
                target: "ffl::core",
                ino = ino.0,
                node = id.0,
                ofs,
                dsize,
                version = node.version,
                "data_node_written"
            );
            self.apply_changes(changes)?;
            done += dsize;
        }
        Ok(())
    }

    fn truncate_file(&mut self, file: &mut FileState, ino: InodeNumber, size: u32) -> Result<()> {
        let node = DataNode {
            ino: ino.0,
            version: file.version + 1,
            isize: size,
            offset: size,
            dsize: 0,
        };
        let bytes = node.encode(&[]).map_err(|err| encode_failed(&err))?;
        let at = self.commit(None, &bytes, Reserve::Write(Priority::Normal), Some(ino))?;
        let id = self.link(at, &bytes, RefState::Normal, Some(ino))?;
        file.version = node.version;
        file.isize = size;
        if let Some(old) = file.meta.replace(id) {
            self.obsolete_ref(old)?;
        }
        let changes = file.tree.truncate(size);
        tracing::debug!(
            target: "ffl::core",
            ino = ino.0,
            size,
            frags = file.tree.frag_count(),
            "file_truncated"
        );
        self.apply_changes(changes)
    }

    fn delete_file(&mut self, file: &mut FileState, ino: InodeNumber) -> Result<()> {
        let unlink = UnlinkNode {
            ino: ino.0,
            version: file.version + 1,
        }
        .encode();
        let at = self.commit(None, &unlink, Reserve::Write(Priority::Deletion), None)?;
        self.link(at, &unlink, RefState::Normal, None)?;

        let mut changes = file.tree.kill();
        changes.obsoleted.extend(file.meta.take());
        self.apply_changes(changes)?;

        let leftover: Vec<NodeRefId> = self
            .vol
            .with_ledger(|l| l.inode(ino).map(|ic| ic.nodes().collect()))
            .unwrap_or_default();
        for &id in &leftover {
            self.obsolete_ref(id)?;
        }
        let mut space = self.vol.space.lock();
        if let Some(ic) = space.ledger.inode_mut(ino) {
            ic.pino_nlink = 0;
            ic.state = InodeState::CheckedAbsent;
        }
        space.ledger.release_inode_if_unused(ino);
        tracing::info!(
            target: "ffl::core",
            ino = ino.0,
            leftover = leftover.len(),
            "inode_deleted"
        );
        Ok(())
    }

    fn flush_for_inode(&mut self, ino: InodeNumber) -> Result<()> {
        if !self.wbuf.holds_inode(ino) {
            return Ok(());
        }
        if self.vol.with_ledger(|l| l.totals().unchecked_size) > 0 {
            tracing::debug!(target: "ffl::core", ino = ino.0, "fsync_pad_unchecked");
            return self.flush_padded();
        }
        let page = self.wbuf.offset();
        while self.wbuf.is_dirty() && self.wbuf.offset() == page {
            match self.gc_pass() {
                Ok(GcOutcome::Progress) => {}
                Ok(outcome) => {
                    tracing::debug!(target: "ffl::core", ino = ino.0, outcome = ?outcome, "fsync_gc_stalled");
                    break;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(target: "ffl::core", ino = ino.0, error = %err, "fsync_gc_failed");
                    break;
                }
            }
        }
        if self.wbuf.holds_inode(ino) {
            self.flush_padded()?;
        }
        Ok(())
    }
}
