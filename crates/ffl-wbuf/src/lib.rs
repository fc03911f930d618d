#![forbid(unsafe_code)]
//! Page-sized write-combining buffer.
//!
//! Flash is programmed a page at a time, but nodes are a few dozen bytes.
//! The buffer stages consecutive node writes for one page and hands back a
//! complete page image when it fills or when a flush is forced. It owns no
//! device: `ffl-core` writes the images, accounts padding, and runs recovery
//! when a page write fails.
//!
//! ## States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Empty` | no page is staged (or the staged page holds nothing yet) |
//! | `Partial` | some bytes of the current page are staged |
//! | `Full` | the page is complete and must be written before more is added |
//!
//! Bytes in the staged page that precede the first write are `0xFF`, so
//! programming the page leaves whatever the medium already holds there
//! (a clean marker, say) untouched.
//!
//! Reads overlay staged bytes over what the medium returns with a bitwise
//! AND, which is exactly the content the medium will have once the page is
//! programmed.

use ffl_error::{FflError, Result};
use ffl_ondisk::{HEADER_SIZE, padding_header};
use ffl_types::{BlockIndex, FlashGeometry, InodeNumber, pad4};
use serde::{Deserialize, Serialize};

/// Inodes tracked individually before the set degrades to "everything".
const MAX_TRACKED_INODES: usize = 64;

// ── Dirty inode tracking ────────────────────────────────────────────────────

/// Inodes with bytes in the staged page.
///
/// Tracking degrades to [`DirtyInodes::All`] when the set grows past a cap
/// or cannot be extended. `All` only costs extra flushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyInodes {
    Tracked(Vec<InodeNumber>),
    All,
}

impl Default for DirtyInodes {
    fn default() -> Self {
        Self::Tracked(Vec::new())
    }
}

impl DirtyInodes {
    pub fn mark(&mut self, ino: InodeNumber) {
        let Self::Tracked(list) = self else {
            return;
        };
        if list.contains(&ino) {
            return;
        }
        if list.len() >= MAX_TRACKED_INODES {
            tracing::debug!(target: "ffl::wbuf", tracked = list.len(), "wbuf_inode_tracking_saturated");
            *self = Self::All;
            return;
        }
        if list.try_reserve(1).is_err() {
            tracing::warn!(target: "ffl::wbuf", ino = ino.0, "wbuf_inode_tracking_degraded");
            *self = Self::All;
            return;
        }
        list.push(ino);
    }

    #[must_use]
    pub fn holds(&self, ino: InodeNumber) -> bool {
        match self {
            Self::Tracked(list) => list.contains(&ino),
            Self::All => true,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Tracked(list) if list.is_empty())
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// ── Buffer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WbufState {
    Empty,
    Partial,
    Full,
}

/// Where a write to a given offset lands relative to the staged page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Nothing staged: start a page at the target with [`WriteBuffer::start_at`].
    Unset,
    /// Continues the staged bytes; call [`WriteBuffer::align_to`].
    Contiguous,
    /// Targets another eraseblock: pad-flush the staged page first.
    OtherBlock,
}

/// A page ready to be programmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// Page-aligned flash offset.
    pub offset: u32,
    pub data: Vec<u8>,
    /// Bytes of real content at the start of `data`.
    pub valid: u32,
    /// Trailing bytes turned into padding (zero for a full page).
    pub padding: u32,
}

impl PageImage {
    /// Flash offset where the padding starts.
    #[must_use]
    pub fn padding_offset(&self) -> u32 {
        self.offset + self.valid
    }
}

/// Counters for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WbufStats {
    pub pages_flushed: u64,
    pub padded_flushes: u64,
    pub pad_bytes: u64,
    pub direct_bytes: u64,
    pub recoveries: u64,
}

#[derive(Debug)]
pub struct WriteBuffer {
    page_size: u32,
    sector_size: u32,
    /// Page-aligned flash offset of the staged page.
    ofs: Option<u32>,
    /// Staged bytes, counted from `ofs`.
    len: u32,
    buf: Vec<u8>,
    inodes: DirtyInodes,
    stats: WbufStats,
}

impl WriteBuffer {
    #[must_use]
    pub fn new(geometry: FlashGeometry) -> Self {
        Self {
            page_size: geometry.page_size,
            sector_size: geometry.sector_size,
            ofs: None,
            len: 0,
            buf: vec![0xFF; geometry.page_size as usize],
            inodes: DirtyInodes::default(),
            stats: WbufStats::default(),
        }
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Flash offset of the staged page, if any.
    #[must_use]
    pub fn offset(&self) -> Option<u32> {
        self.ofs
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flash offset of the next staged byte.
    #[must_use]
    pub fn position(&self) -> Option<u32> {
        self.ofs.map(|ofs| ofs + self.len)
    }

    /// Eraseblock of the staged page.
    #[must_use]
    pub fn block(&self) -> Option<BlockIndex> {
        self.ofs.map(|ofs| BlockIndex(ofs / self.sector_size))
    }

    /// True while staged bytes have not reached the medium.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.ofs.is_some() && self.len > 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.page_size
    }

    #[must_use]
    pub fn state(&self) -> WbufState {
        if !self.is_dirty() {
            WbufState::Empty
        } else if self.is_full() {
            WbufState::Full
        } else {
            WbufState::Partial
        }
    }

    #[must_use]
    pub fn stats(&self) -> WbufStats {
        self.stats
    }

    #[must_use]
    pub fn inodes(&self) -> &DirtyInodes {
        &self.inodes
    }

    pub fn mark_inode(&mut self, ino: InodeNumber) {
        self.inodes.mark(ino);
    }

    #[must_use]
    pub fn holds_inode(&self, ino: InodeNumber) -> bool {
        self.is_dirty() && self.inodes.holds(ino)
    }

    // ── Staging ─────────────────────────────────────────────────────────────

    /// Classify a write to flash offset `to`.
    ///
    /// A write inside the staged block that does not continue the staged
    /// bytes (after node alignment) is a consistency violation.
    pub fn locate(&self, to: u32) -> Result<Placement> {
        let Some(ofs) = self.ofs else {
            return Ok(Placement::Unset);
        };
        let same_block = ofs / self.sector_size == to / self.sector_size;
        if self.len == 0 && (ofs % self.sector_size == 0 || !same_block) {
            return Ok(Placement::Unset);
        }
        if !same_block {
            return Ok(Placement::OtherBlock);
        }
        let expected = pad4(ofs + self.len);
        if to != expected {
            tracing::error!(
                target: "ffl::wbuf",
                to,
                expected,
                wbuf_ofs = ofs,
                wbuf_len = self.len,
                "wbuf_write_not_contiguous"
            );
            return Err(FflError::Inconsistent(format!(
                "write to {to:#x} does not continue buffered data ending at {expected:#x}"
            )));
        }
        Ok(Placement::Contiguous)
    }

    /// Stage the page containing `to`, with everything before `to` left
    /// erased. Any previous content must already be flushed.
    pub fn start_at(&mut self, to: u32) {
        let ofs = to & !(self.page_size - 1);
        self.ofs = Some(ofs);
        self.len = to - ofs;
        self.buf.fill(0xFF);
        self.inodes.clear();
        tracing::trace!(target: "ffl::wbuf", wbuf_ofs = ofs, wbuf_len = self.len, "wbuf_started");
    }

    /// Skip the alignment gap up to `to` after [`locate`](Self::locate)
    /// returned `Contiguous`.
    pub fn align_to(&mut self, to: u32) -> Result<()> {
        let ofs = self.ofs.ok_or_else(|| {
            FflError::Inconsistent("alignment requested on an unset write buffer".to_owned())
        })?;
        let len = to
            .checked_sub(ofs)
            .filter(|len| *len >= self.len && *len <= self.page_size)
            .ok_or_else(|| {
                FflError::Inconsistent(format!(
                    "alignment to {to:#x} outside staged page at {ofs:#x}+{}",
                    self.len
                ))
            })?;
        self.len = len;
        Ok(())
    }

    /// Copy as much of `data` as fits in the page. Returns the bytes taken.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let start = self.len as usize;
        let room = (self.page_size - self.len) as usize;
        let take = room.min(data.len());
        self.buf[start..start + take].copy_from_slice(&data[..take]);
        self.len += take as u32;
        take
    }

    /// Advance past `len` bytes written directly to the medium. Only valid
    /// on a page boundary with nothing staged.
    pub fn skip(&mut self, len: u32) -> Result<()> {
        let ofs = self.ofs.ok_or_else(|| {
            FflError::Inconsistent("direct write past an unset write buffer".to_owned())
        })?;
        if self.len != 0 || len % self.page_size != 0 {
            return Err(FflError::Inconsistent(format!(
                "direct write of {len} bytes with {} bytes staged at {ofs:#x}",
                self.len
            )));
        }
        self.ofs = Some(ofs + len);
        self.stats.direct_bytes += u64::from(len);
        Ok(())
    }

    /// Build the image of the staged page.
    ///
    /// With `pad`, the staged length is rounded to node alignment, the rest
    /// of the page is zeroed and, room permitting, a padding header spans
    /// it. Without `pad` the page must already be full.
    pub fn page_image(&self, pad: bool) -> Result<PageImage> {
        let offset = self.ofs.ok_or_else(|| {
            FflError::Inconsistent("flush requested on an unset write buffer".to_owned())
        })?;
        let mut data = self.buf.clone();
        if !pad {
            if !self.is_full() {
                return Err(FflError::Inconsistent(format!(
                    "unpadded flush of a partial page ({} of {} bytes)",
                    self.len, self.page_size
                )));
            }
            return Ok(PageImage {
                offset,
                data,
                valid: self.page_size,
                padding: 0,
            });
        }
        let valid = pad4(self.len).min(self.page_size);
        let padding = self.page_size - valid;
        data[valid as usize..].fill(0);
        if (valid as usize) + HEADER_SIZE < self.page_size as usize {
            data[valid as usize..valid as usize + HEADER_SIZE]
                .copy_from_slice(&padding_header(padding));
        }
        Ok(PageImage {
            offset,
            data,
            valid,
            padding,
        })
    }

    /// The page in `image` reached the medium: move to the next page.
    pub fn advance(&mut self, image: &PageImage) {
        self.stats.pages_flushed += 1;
        if image.padding > 0 {
            self.stats.padded_flushes += 1;
            self.stats.pad_bytes += u64::from(image.padding);
        }
        self.ofs = Some(image.offset + self.page_size);
        self.len = 0;
        self.buf.fill(0xFF);
        self.inodes.clear();
        tracing::trace!(
            target: "ffl::wbuf",
            page = image.offset,
            padding = image.padding,
            "wbuf_advanced"
        );
    }

    // ── Recovery ────────────────────────────────────────────────────────────

    /// Staged bytes, starting at [`offset`](Self::offset).
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    /// Drop the staged page, returning the inodes that had bytes in it.
    pub fn discard(&mut self) -> DirtyInodes {
        self.ofs = None;
        self.len = 0;
        self.buf.fill(0xFF);
        std::mem::take(&mut self.inodes)
    }

    /// Stage `data` at the page-aligned `page_offset` after recovery
    /// relocated the unflushed tail of a failed page.
    pub fn restart(&mut self, page_offset: u32, data: &[u8], inodes: DirtyInodes) -> Result<()> {
        if page_offset % self.page_size != 0 || data.len() >= self.page_size as usize {
            return Err(FflError::Inconsistent(format!(
                "write buffer restart with {} bytes at {page_offset:#x}",
                data.len()
            )));
        }
        self.ofs = Some(page_offset);
        self.buf.fill(0xFF);
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len() as u32;
        self.inodes = inodes;
        self.stats.recoveries += 1;
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// AND the staged bytes overlapping `[offset, offset + buf.len())` into
    /// `buf`. Returns true if any byte was overlaid.
    pub fn overlay(&self, offset: u32, buf: &mut [u8]) -> bool {
        let Some(start) = self.ofs else {
            return false;
        };
        let end = u64::from(start) + u64::from(self.len);
        let read_end = u64::from(offset) + buf.len() as u64;
        let lo = u64::from(start.max(offset));
        let hi = end.min(read_end);
        if lo >= hi {
            return false;
        }
        for pos in lo..hi {
            buf[(pos - u64::from(offset)) as usize] &= self.buf[(pos - u64::from(start)) as usize];
        }
        true
    }

    /// Mutable view of staged bytes `[offset, offset + len)`, if they lie
    /// entirely inside the staged range.
    pub fn staged_mut(&mut self, offset: u32, len: u32) -> Option<&mut [u8]> {
        let start = self.ofs?;
        let rel = offset.checked_sub(start)?;
        if rel.checked_add(len)? > self.len {
            return None;
        }
        Some(&mut self.buf[rel as usize..(rel + len) as usize])
    }
}
