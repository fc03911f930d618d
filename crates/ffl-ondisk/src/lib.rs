#![forbid(unsafe_code)]
//! On-flash node encoding for FrankenFlash.
//!
//! Pure encoding crate: no I/O, no side effects. Every node starts with a
//! 12-byte common header:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 2 | magic (`0x1985`) |
//! | 2 | 2 | node type, including the `ACCURATE` bit |
//! | 4 | 4 | total length in bytes (unpadded) |
//! | 8 | 4 | header CRC32C over bytes 0..8 with `ACCURATE` forced on |
//!
//! The header CRC is computed as if the `ACCURATE` bit were set, so clearing
//! the bit in place (the obsolete marking done on media that allow it) keeps
//! the header valid while telling a future scan the node is dead.

pub mod summary;

pub use summary::{
    SUMMARY_ENTRY_SIZE, SUMMARY_FRAME_SIZE, SUMMARY_MARKER_MAGIC, SummaryEntry, encode_summary,
    parse_summary,
};

use ffl_types::{ParseError, ensure_slice, read_le_u16, read_le_u32, usize_to_u32};
use serde::{Deserialize, Serialize};

pub const NODE_MAGIC: u16 = 0x1985;
/// Set on every node when written; cleared to mark the node obsolete in place.
pub const NODE_ACCURATE: u16 = 0x2000;

pub const NODETYPE_CLEANMARKER: u16 = NODE_ACCURATE | 0x0003;
pub const NODETYPE_PADDING: u16 = NODE_ACCURATE | 0x0004;
pub const NODETYPE_SUMMARY: u16 = NODE_ACCURATE | 0x0006;
pub const NODETYPE_UNLINK: u16 = 0xC000 | NODE_ACCURATE | 0x0001;
pub const NODETYPE_INODE: u16 = 0xC000 | NODE_ACCURATE | 0x0002;

pub const HEADER_SIZE: usize = 12;
/// Clean marker written at the start of every freshly erased block.
pub const CLEANMARKER_SIZE: u32 = 12;
/// Fixed part of a data node, before the payload.
pub const DATA_NODE_HEADER_SIZE: usize = 40;
pub const UNLINK_NODE_SIZE: usize = 24;

// ── Common header ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Inode,
    Unlink,
    CleanMarker,
    Padding,
    Summary,
    Unknown(u16),
}

impl NodeKind {
    #[must_use]
    pub fn from_nodetype(nodetype: u16) -> Self {
        match nodetype | NODE_ACCURATE {
            NODETYPE_INODE => Self::Inode,
            NODETYPE_UNLINK => Self::Unlink,
            NODETYPE_CLEANMARKER => Self::CleanMarker,
            NODETYPE_PADDING => Self::Padding,
            NODETYPE_SUMMARY => Self::Summary,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub magic: u16,
    pub nodetype: u16,
    pub totlen: u32,
    pub hdr_crc: u32,
}

impl NodeHeader {
    #[must_use]
    pub fn new(nodetype: u16, totlen: u32) -> Self {
        let mut header = Self {
            magic: NODE_MAGIC,
            nodetype,
            totlen,
            hdr_crc: 0,
        };
        header.hdr_crc = header.compute_crc();
        header
    }

    /// Parse and verify a header from the first 12 bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(bytes, 0, HEADER_SIZE)?;
        let header = Self {
            magic: read_le_u16(raw, 0)?,
            nodetype: read_le_u16(raw, 2)?,
            totlen: read_le_u32(raw, 4)?,
            hdr_crc: read_le_u32(raw, 8)?,
        };
        if header.magic != NODE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u32::from(NODE_MAGIC),
                actual: u32::from(header.magic),
            });
        }
        let computed = header.compute_crc();
        if computed != header.hdr_crc {
            return Err(ParseError::ChecksumMismatch {
                what: "node header",
                stored: header.hdr_crc,
                computed,
            });
        }
        if (header.totlen as usize) < HEADER_SIZE {
            return Err(ParseError::InvalidField {
                field: "totlen",
                reason: "shorter than the common header",
            });
        }
        Ok(header)
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0_u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.magic.to_le_bytes());
        out[2..4].copy_from_slice(&self.nodetype.to_le_bytes());
        out[4..8].copy_from_slice(&self.totlen.to_le_bytes());
        out[8..12].copy_from_slice(&self.hdr_crc.to_le_bytes());
        out
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        NodeKind::from_nodetype(self.nodetype)
    }

    #[must_use]
    pub fn is_accurate(&self) -> bool {
        self.nodetype & NODE_ACCURATE != 0
    }

    fn compute_crc(&self) -> u32 {
        let mut raw = [0_u8; 8];
        raw[0..2].copy_from_slice(&self.magic.to_le_bytes());
        raw[2..4].copy_from_slice(&(self.nodetype | NODE_ACCURATE).to_le_bytes());
        raw[4..8].copy_from_slice(&self.totlen.to_le_bytes());
        crc32c::crc32c(&raw)
    }
}

/// Clear the `ACCURATE` bit of the header at the start of `bytes`.
///
/// Returns `Ok(false)` when the bit was already clear (nothing to write
/// back). Fails if the bytes do not hold a valid header.
pub fn clear_accurate(bytes: &mut [u8]) -> Result<bool, ParseError> {
    let header = NodeHeader::parse(bytes)?;
    if !header.is_accurate() {
        return Ok(false);
    }
    let nodetype = header.nodetype & !NODE_ACCURATE;
    bytes[2..4].copy_from_slice(&nodetype.to_le_bytes());
    Ok(true)
}

/// Header for a padding node spanning `len` bytes.
#[must_use]
pub fn padding_header(len: u32) -> [u8; HEADER_SIZE] {
    NodeHeader::new(NODETYPE_PADDING, len).encode()
}

#[must_use]
pub fn cleanmarker() -> [u8; HEADER_SIZE] {
    NodeHeader::new(NODETYPE_CLEANMARKER, CLEANMARKER_SIZE).encode()
}

/// True if `bytes` starts with a valid clean marker.
#[must_use]
pub fn is_cleanmarker(bytes: &[u8]) -> bool {
    NodeHeader::parse(bytes)
        .is_ok_and(|h| h.kind() == NodeKind::CleanMarker && h.totlen == CLEANMARKER_SIZE)
}

// ── Data node ───────────────────────────────────────────────────────────────

/// File data (or a metadata-only size change when `dsize == 0`).
///
/// | Offset | Field |
/// |--------|-------|
/// | 12 | ino |
/// | 16 | version |
/// | 20 | isize (file size after this node) |
/// | 24 | offset (logical) |
/// | 28 | dsize |
/// | 32 | data CRC32C |
/// | 36 | node CRC32C over bytes 0..36 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNode {
    pub ino: u32,
    pub version: u32,
    pub isize: u32,
    pub offset: u32,
    pub dsize: u32,
}

impl DataNode {
    #[must_use]
    pub fn totlen(&self) -> u32 {
        DATA_NODE_HEADER_SIZE as u32 + self.dsize
    }

    /// Encode header and payload. `data.len()` must equal `dsize`.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, ParseError> {
        if usize_to_u32(data.len(), "dsize")? != self.dsize {
            return Err(ParseError::InvalidField {
                field: "dsize",
                reason: "payload length mismatch",
            });
        }
        let mut out = Vec::with_capacity(DATA_NODE_HEADER_SIZE + data.len());
        out.extend_from_slice(&NodeHeader::new(NODETYPE_INODE, self.totlen()).encode());
        out.extend_from_slice(&self.ino.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.isize.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.dsize.to_le_bytes());
        out.extend_from_slice(&crc32c::crc32c(data).to_le_bytes());
        let node_crc = crc32c::crc32c(&out[..36]);
        out.extend_from_slice(&node_crc.to_le_bytes());
        out.extend_from_slice(data);
        Ok(out)
    }

    /// Parse and verify a data node, returning it with its payload.
    pub fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let header = NodeHeader::parse(bytes)?;
        if header.kind() != NodeKind::Inode {
            return Err(ParseError::InvalidField {
                field: "nodetype",
                reason: "not a data node",
            });
        }
        let fixed = ensure_slice(bytes, 0, DATA_NODE_HEADER_SIZE)?;
        let stored = read_le_u32(fixed, 36)?;
        let computed = crc32c::crc32c(&fixed[..36]);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch {
                what: "data node",
                stored,
                computed,
            });
        }
        let node = Self {
            ino: read_le_u32(fixed, 12)?,
            version: read_le_u32(fixed, 16)?,
            isize: read_le_u32(fixed, 20)?,
            offset: read_le_u32(fixed, 24)?,
            dsize: read_le_u32(fixed, 28)?,
        };
        if node.totlen() != header.totlen {
            return Err(ParseError::InvalidField {
                field: "totlen",
                reason: "disagrees with dsize",
            });
        }
        let data = ensure_slice(bytes, DATA_NODE_HEADER_SIZE, node.dsize as usize)?;
        let data_stored = read_le_u32(fixed, 32)?;
        let data_computed = crc32c::crc32c(data);
        if data_stored != data_computed {
            return Err(ParseError::ChecksumMismatch {
                what: "data payload",
                stored: data_stored,
                computed: data_computed,
            });
        }
        Ok((node, data))
    }
}

// ── Unlink node ─────────────────────────────────────────────────────────────

/// Records that an inode has been deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkNode {
    pub ino: u32,
    pub version: u32,
}

impl UnlinkNode {
    #[must_use]
    pub fn encode(&self) -> [u8; UNLINK_NODE_SIZE] {
        let mut out = [0_u8; UNLINK_NODE_SIZE];
        out[..HEADER_SIZE]
            .copy_from_slice(&NodeHeader::new(NODETYPE_UNLINK, UNLINK_NODE_SIZE as u32).encode());
        out[12..16].copy_from_slice(&self.ino.to_le_bytes());
        out[16..20].copy_from_slice(&self.version.to_le_bytes());
        let crc = crc32c::crc32c(&out[..20]);
        out[20..24].copy_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let header = NodeHeader::parse(bytes)?;
        if header.kind() != NodeKind::Unlink {
            return Err(ParseError::InvalidField {
                field: "nodetype",
                reason: "not an unlink node",
            });
        }
        let raw = ensure_slice(bytes, 0, UNLINK_NODE_SIZE)?;
        let stored = read_le_u32(raw, 20)?;
        let computed = crc32c::crc32c(&raw[..20]);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch {
                what: "unlink node",
                stored,
                computed,
            });
        }
        Ok(Self {
            ino: read_le_u32(raw, 12)?,
            version: read_le_u32(raw, 16)?,
        })
    }
}

/// Fully validate the node at the start of `bytes`, whose length must be at
/// least the header's `totlen`.
///
/// Used to promote unchecked references: a node that fails here is treated
/// as obsolete.
pub fn validate_node(bytes: &[u8]) -> Result<NodeKind, ParseError> {
    let header = NodeHeader::parse(bytes)?;
    let body = ensure_slice(bytes, 0, header.totlen as usize)?;
    match header.kind() {
        NodeKind::Inode => DataNode::parse(body).map(|_| NodeKind::Inode),
        NodeKind::Unlink => UnlinkNode::parse(body).map(|_| NodeKind::Unlink),
        kind => Ok(kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_and_crc() {
        let header = NodeHeader::new(NODETYPE_INODE, 128);
        let bytes = header.encode();
        let parsed = NodeHeader::parse(&bytes).expect("valid header");
        assert_eq!(parsed, header);
        assert_eq!(parsed.kind(), NodeKind::Inode);
        assert!(parsed.is_accurate());
    }

    #[test]
    fn header_rejects_bad_magic_and_crc() {
        let mut bytes = NodeHeader::new(NODETYPE_INODE, 128).encode();
        bytes[4] ^= 1;
        assert!(matches!(
            NodeHeader::parse(&bytes),
            Err(ParseError::ChecksumMismatch { .. })
        ));
        let erased = [0xFF_u8; HEADER_SIZE];
        assert!(matches!(
            NodeHeader::parse(&erased),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn clearing_accurate_keeps_header_valid() {
        let mut bytes = NodeHeader::new(NODETYPE_INODE, 64).encode();
        assert!(clear_accurate(&mut bytes).expect("first clear"));
        let parsed = NodeHeader::parse(&bytes).expect("still valid");
        assert!(!parsed.is_accurate());
        assert_eq!(parsed.kind(), NodeKind::Inode);
        assert!(!clear_accurate(&mut bytes).expect("second clear"));
    }

    #[test]
    fn clearing_accurate_only_clears_bits() {
        // NOR programming can only move bits from 1 to 0.
        let original = NodeHeader::new(NODETYPE_UNLINK, 24).encode();
        let mut cleared = original;
        clear_accurate(&mut cleared).expect("clear");
        for (a, b) in original.iter().zip(cleared.iter()) {
            assert_eq!(a & b, *b);
        }
    }

    #[test]
    fn data_node_roundtrip() {
        let node = DataNode {
            ino: 7,
            version: 3,
            isize: 4096,
            offset: 1024,
            dsize: 5,
        };
        let bytes = node.encode(b"hello").expect("encode");
        assert_eq!(bytes.len(), 45);
        let (parsed, data) = DataNode::parse(&bytes).expect("parse");
        assert_eq!(parsed, node);
        assert_eq!(data, b"hello");
        assert_eq!(validate_node(&bytes).expect("valid"), NodeKind::Inode);
    }

    #[test]
    fn data_node_detects_payload_corruption() {
        let node = DataNode {
            ino: 1,
            version: 1,
            isize: 3,
            offset: 0,
            dsize: 3,
        };
        let mut bytes = node.encode(b"abc").expect("encode");
        bytes[41] = b'X';
        assert!(matches!(
            DataNode::parse(&bytes),
            Err(ParseError::ChecksumMismatch {
                what: "data payload",
                ..
            })
        ));
        assert!(validate_node(&bytes).is_err());
    }

    #[test]
    fn data_node_rejects_length_mismatch() {
        let node = DataNode {
            ino: 1,
            version: 1,
            isize: 3,
            offset: 0,
            dsize: 4,
        };
        assert!(node.encode(b"abc").is_err());
    }

    #[test]
    fn unlink_node_roundtrip() {
        let node = UnlinkNode { ino: 9, version: 12 };
        let bytes = node.encode();
        assert_eq!(UnlinkNode::parse(&bytes).expect("parse"), node);
        assert_eq!(validate_node(&bytes).expect("valid"), NodeKind::Unlink);
    }

    #[test]
    fn padding_and_cleanmarker() {
        let pad = padding_header(300);
        let parsed = NodeHeader::parse(&pad).expect("pad");
        assert_eq!(parsed.kind(), NodeKind::Padding);
        assert_eq!(parsed.totlen, 300);

        assert!(is_cleanmarker(&cleanmarker()));
        assert!(!is_cleanmarker(&pad));
        assert!(!is_cleanmarker(&[0xFF; 12]));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            /// Every single-bit flip outside the accurate bit is caught.
            #[test]
            fn single_bit_flips_are_detected(
                payload in proptest::collection::vec(any::<u8>(), 0..300),
                pick in any::<usize>(),
            ) {
                let node = DataNode {
                    ino: 3,
                    version: 1,
                    isize: payload.len() as u32,
                    offset: 0,
                    dsize: payload.len() as u32,
                };
                let mut bytes = node.encode(&payload).expect("encode");
                let bit = pick % (bytes.len() * 8);
                prop_assume!(bit != 3 * 8 + 5);
                bytes[bit / 8] ^= 1 << (bit % 8);
                prop_assert!(validate_node(&bytes).is_err());
            }
        }
    }
}
