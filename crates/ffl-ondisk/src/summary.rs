//! Per-eraseblock summary node.
//!
//! While a block is the write target the engine collects one entry per
//! data or unlink node written into it. Before the block is closed the
//! entries are written as a single summary node that runs from the write
//! frontier to the end of the block:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 12 | common header (`totlen` = span to block end) |
//! | 12 | 4 | entry count |
//! | 16 | 4 | CRC32C of the entry table |
//! | 20 | 4 | CRC32C of bytes 0..20 |
//! | 24 | 20 × n | entries |
//! | … | | zero fill |
//! | end − 8 | 4 | block-relative offset of this node |
//! | end − 4 | 4 | [`SUMMARY_MARKER_MAGIC`] |
//!
//! The trailing marker lets a mount-time scan find the summary by reading
//! only the last eight bytes of each block.

use crate::{HEADER_SIZE, NODETYPE_SUMMARY, NodeHeader, NodeKind};
use ffl_types::{ParseError, ensure_slice, read_le_u16, read_le_u32, usize_to_u32};
use serde::{Deserialize, Serialize};

pub const SUMMARY_ENTRY_SIZE: u32 = 20;
pub const SUMMARY_MARKER_MAGIC: u32 = 0x0285_1885;
const SUMMARY_HEADER_SIZE: u32 = 24;
const SUMMARY_MARKER_SIZE: u32 = 8;
/// Fixed overhead of a summary node: header plus trailing marker.
pub const SUMMARY_FRAME_SIZE: u32 = SUMMARY_HEADER_SIZE + SUMMARY_MARKER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub nodetype: u16,
    /// Offset of the node relative to the start of its eraseblock.
    pub offset: u32,
    pub totlen: u32,
    pub ino: u32,
    pub version: u32,
}

/// Encode a summary node of exactly `span` bytes starting at block-relative
/// offset `node_offset`.
pub fn encode_summary(
    entries: &[SummaryEntry],
    node_offset: u32,
    span: u32,
) -> Result<Vec<u8>, ParseError> {
    let count = usize_to_u32(entries.len(), "summary_entries")?;
    let needed = count
        .checked_mul(SUMMARY_ENTRY_SIZE)
        .and_then(|table| table.checked_add(SUMMARY_FRAME_SIZE))
        .ok_or(ParseError::IntegerConversion {
            field: "summary_size",
        })?;
    if span < needed || span % 4 != 0 {
        return Err(ParseError::InvalidField {
            field: "summary_span",
            reason: "too small for the entry table or unaligned",
        });
    }

    let mut table = Vec::with_capacity((count * SUMMARY_ENTRY_SIZE) as usize);
    for entry in entries {
        table.extend_from_slice(&entry.nodetype.to_le_bytes());
        table.extend_from_slice(&0_u16.to_le_bytes());
        table.extend_from_slice(&entry.offset.to_le_bytes());
        table.extend_from_slice(&entry.totlen.to_le_bytes());
        table.extend_from_slice(&entry.ino.to_le_bytes());
        table.extend_from_slice(&entry.version.to_le_bytes());
    }

    let mut out = vec![0_u8; span as usize];
    out[..HEADER_SIZE].copy_from_slice(&NodeHeader::new(NODETYPE_SUMMARY, span).encode());
    out[12..16].copy_from_slice(&count.to_le_bytes());
    out[16..20].copy_from_slice(&crc32c::crc32c(&table).to_le_bytes());
    let node_crc = crc32c::crc32c(&out[..20]);
    out[20..24].copy_from_slice(&node_crc.to_le_bytes());
    let table_start = SUMMARY_HEADER_SIZE as usize;
    out[table_start..table_start + table.len()].copy_from_slice(&table);
    let marker = out.len() - SUMMARY_MARKER_SIZE as usize;
    out[marker..marker + 4].copy_from_slice(&node_offset.to_le_bytes());
    out[marker + 4..].copy_from_slice(&SUMMARY_MARKER_MAGIC.to_le_bytes());
    Ok(out)
}

/// Locate and decode the summary of a whole eraseblock image.
pub fn parse_summary(block: &[u8]) -> Result<Vec<SummaryEntry>, ParseError> {
    let marker_at = block
        .len()
        .checked_sub(SUMMARY_MARKER_SIZE as usize)
        .ok_or(ParseError::InsufficientData {
            needed: SUMMARY_MARKER_SIZE as usize,
            offset: 0,
            actual: block.len(),
        })?;
    let magic = read_le_u32(block, marker_at + 4)?;
    if magic != SUMMARY_MARKER_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: SUMMARY_MARKER_MAGIC,
            actual: magic,
        });
    }
    let node_offset = read_le_u32(block, marker_at)? as usize;
    let node = ensure_slice(block, node_offset, block.len() - node_offset)?;
    let header = NodeHeader::parse(node)?;
    if header.kind() != NodeKind::Summary || header.totlen as usize != node.len() {
        return Err(ParseError::InvalidField {
            field: "summary",
            reason: "marker does not point at a summary spanning the block end",
        });
    }
    let stored = read_le_u32(node, 20)?;
    let computed = crc32c::crc32c(ensure_slice(node, 0, 20)?);
    if stored != computed {
        return Err(ParseError::ChecksumMismatch {
            what: "summary header",
            stored,
            computed,
        });
    }

    let count = read_le_u32(node, 12)? as usize;
    let table_len = count
        .checked_mul(SUMMARY_ENTRY_SIZE as usize)
        .ok_or(ParseError::IntegerConversion {
            field: "summary_entries",
        })?;
    let table = ensure_slice(node, SUMMARY_HEADER_SIZE as usize, table_len)?;
    let stored = read_le_u32(node, 16)?;
    let computed = crc32c::crc32c(table);
    if stored != computed {
        return Err(ParseError::ChecksumMismatch {
            what: "summary table",
            stored,
            computed,
        });
    }

    table
        .chunks_exact(SUMMARY_ENTRY_SIZE as usize)
        .map(|raw| {
            Ok(SummaryEntry {
                nodetype: read_le_u16(raw, 0)?,
                offset: read_le_u32(raw, 4)?,
                totlen: read_le_u32(raw, 8)?,
                ino: read_le_u32(raw, 12)?,
                version: read_le_u32(raw, 16)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NODETYPE_INODE, NODETYPE_UNLINK};

    fn sample_entries() -> Vec<SummaryEntry> {
        vec![
            SummaryEntry {
                nodetype: NODETYPE_INODE,
                offset: 12,
                totlen: 140,
                ino: 5,
                version: 1,
            },
            SummaryEntry {
                nodetype: NODETYPE_UNLINK,
                offset: 152,
                totlen: 24,
                ino: 5,
                version: 2,
            },
        ]
    }

    #[test]
    fn summary_found_from_block_tail() {
        let sector = 1024_usize;
        let node_offset = 176_u32;
        let span = sector as u32 - node_offset;
        let encoded = encode_summary(&sample_entries(), node_offset, span).expect("encode");
        assert_eq!(encoded.len(), span as usize);

        let mut block = vec![0xFF_u8; sector];
        block[node_offset as usize..].copy_from_slice(&encoded);
        let parsed = parse_summary(&block).expect("parse");
        assert_eq!(parsed, sample_entries());
    }

    #[test]
    fn summary_rejects_short_span() {
        let entries = sample_entries();
        let too_small = SUMMARY_FRAME_SIZE + SUMMARY_ENTRY_SIZE;
        assert!(encode_summary(&entries, 0, too_small).is_err());
        assert!(encode_summary(&entries, 0, SUMMARY_FRAME_SIZE + 2 * SUMMARY_ENTRY_SIZE).is_ok());
    }

    #[test]
    fn erased_block_has_no_summary() {
        let block = vec![0xFF_u8; 512];
        assert!(matches!(
            parse_summary(&block),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn corrupted_table_is_detected() {
        let sector = 512_usize;
        let encoded = encode_summary(&sample_entries(), 0, sector as u32).expect("encode");
        let mut block = encoded;
        block[30] ^= 0x40;
        assert!(matches!(
            parse_summary(&block),
            Err(ParseError::ChecksumMismatch {
                what: "summary table",
                ..
            })
        ));
    }
}
