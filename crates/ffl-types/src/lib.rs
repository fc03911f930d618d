#![forbid(unsafe_code)]
//! Shared vocabulary for FrankenFlash.
//!
//! Every long-lived object in the engine (eraseblocks, node references, full
//! dnodes, inode caches) lives in an arena owned by the volume and is named
//! by a small integer handle defined here. Handles are plain `Copy` values;
//! nothing in the engine holds a pointer into another arena.
//!
//! The crate also carries [`RawOffset`], the flash offset whose two low bits
//! encode a node reference's [`RefState`], the medium [`FlashGeometry`], and
//! the little-endian parsing helpers used by `ffl-ondisk`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Logical page size used for fragment-boundary bookkeeping.
///
/// A data node that does not start or end on a multiple of this size cannot
/// be garbage-collected as a pristine copy.
pub const PAGE_SIZE: u32 = 4096;

/// Every node on flash starts on a 4-byte boundary.
pub const NODE_ALIGN: u32 = 4;

// ── Handles ─────────────────────────────────────────────────────────────────

/// Index of an eraseblock within the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u32);

/// Inode identifier. Zero is reserved to mean "any inode".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

impl InodeNumber {
    pub const ANY: Self = Self(0);
}

/// Handle of a node reference in the ledger arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeRefId(pub u32);

/// Handle of a full dnode in the fragment-tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DnodeId(pub u32);

macro_rules! display_newtype {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_newtype!(BlockIndex, InodeNumber, NodeRefId, DnodeId);

impl BlockIndex {
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl NodeRefId {
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl DnodeId {
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

// ── Reference state ─────────────────────────────────────────────────────────

/// Validation state of a node reference, stored in the two low bits of its
/// flash offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefState {
    /// Written before the current mount and not yet CRC-checked.
    Unchecked = 0,
    /// Superseded. Terminal: a reference never leaves this state.
    Obsolete = 1,
    /// Can be copied byte-for-byte by the garbage collector.
    Pristine = 2,
    /// Live, but must be rewritten (not copied) by the garbage collector.
    Normal = 3,
}

impl RefState {
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::Unchecked,
            1 => Self::Obsolete,
            2 => Self::Pristine,
            _ => Self::Normal,
        }
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self as u32
    }
}

/// Flash offset with the reference state packed into its low two bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawOffset(u32);

impl RawOffset {
    /// Pack `offset` and `state`. The offset must be 4-byte aligned.
    pub fn new(offset: u32, state: RefState) -> Result<Self, ParseError> {
        if offset % NODE_ALIGN != 0 {
            return Err(ParseError::InvalidField {
                field: "node_offset",
                reason: "nodes must be 4-byte aligned",
            });
        }
        Ok(Self(offset | state.bits()))
    }

    #[must_use]
    pub fn offset(self) -> u32 {
        self.0 & !3
    }

    #[must_use]
    pub fn state(self) -> RefState {
        RefState::from_bits(self.0)
    }

    #[must_use]
    pub fn is_obsolete(self) -> bool {
        self.state() == RefState::Obsolete
    }

    /// Same offset with a new state. An obsolete offset stays obsolete.
    #[must_use]
    pub fn with_state(self, state: RefState) -> Self {
        if self.is_obsolete() {
            return self;
        }
        Self(self.offset() | state.bits())
    }

    /// Same state at a new (aligned) offset.
    #[must_use]
    pub fn moved_to(self, offset: u32) -> Self {
        Self((offset & !3) | (self.0 & 3))
    }
}

impl fmt::Debug for RawOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}:{:?}", self.offset(), self.state())
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Shape of the flash medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashGeometry {
    /// Total medium size in bytes.
    pub flash_size: u32,
    /// Eraseblock ("sector") size in bytes.
    pub sector_size: u32,
    /// Minimum program unit. The write buffer stages exactly one page.
    pub page_size: u32,
}

impl FlashGeometry {
    /// Validate and build a geometry.
    ///
    /// The sector and page sizes must be powers of two, the page must divide
    /// the sector, and the medium must hold a whole number of sectors.
    pub fn new(flash_size: u32, sector_size: u32, page_size: u32) -> Result<Self, ParseError> {
        if !sector_size.is_power_of_two() || sector_size < 512 {
            return Err(ParseError::InvalidField {
                field: "sector_size",
                reason: "must be a power of two >= 512",
            });
        }
        if !page_size.is_power_of_two() || page_size < NODE_ALIGN || page_size > sector_size {
            return Err(ParseError::InvalidField {
                field: "page_size",
                reason: "must be a power of two between 4 and sector_size",
            });
        }
        if flash_size == 0 || flash_size % sector_size != 0 {
            return Err(ParseError::InvalidField {
                field: "flash_size",
                reason: "must be a non-zero multiple of sector_size",
            });
        }
        if sector_size > flash_size / 2 {
            return Err(ParseError::InvalidField {
                field: "flash_size",
                reason: "medium must contain at least two eraseblocks",
            });
        }
        Ok(Self {
            flash_size,
            sector_size,
            page_size,
        })
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.flash_size / self.sector_size
    }

    /// Eraseblock containing `offset`.
    #[must_use]
    pub fn block_of(&self, offset: u32) -> BlockIndex {
        BlockIndex(offset / self.sector_size)
    }

    /// First byte of `block`.
    #[must_use]
    pub fn block_start(&self, block: BlockIndex) -> u32 {
        block.0 * self.sector_size
    }

    /// Start of the page containing `offset`.
    #[must_use]
    pub fn page_start(&self, offset: u32) -> u32 {
        offset & !(self.page_size - 1)
    }
}

// ── Alignment ───────────────────────────────────────────────────────────────

/// Round `len` up to the node alignment.
#[must_use]
pub fn pad4(len: u32) -> u32 {
    len.saturating_add(NODE_ALIGN - 1) & !(NODE_ALIGN - 1)
}

/// Round `value` down to a multiple of the power-of-two `alignment`.
#[must_use]
pub fn align_down(value: u32, alignment: u32) -> Option<u32> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to a multiple of the power-of-two `alignment`.
#[must_use]
pub fn align_up(value: u32, alignment: u32) -> Option<u32> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// True if `value` sits on a [`PAGE_SIZE`] boundary.
#[must_use]
pub fn is_page_aligned(value: u32) -> bool {
    value % PAGE_SIZE == 0
}

// ── Parsing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch in {what}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        what: &'static str,
        stored: u32,
        computed: u32,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Narrow a `usize` to `u32` with an explicit error path.
pub fn usize_to_u32(value: usize, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x85_u8, 0x19, 0x02, 0xE0, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1985);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert!(matches!(
            read_le_u32(&bytes, 6),
            Err(ParseError::InsufficientData { needed: 4, .. })
        ));
    }

    #[test]
    fn raw_offset_packs_state() {
        let raw = RawOffset::new(0x1_0040, RefState::Normal).expect("aligned");
        assert_eq!(raw.offset(), 0x1_0040);
        assert_eq!(raw.state(), RefState::Normal);

        let pristine = raw.with_state(RefState::Pristine);
        assert_eq!(pristine.offset(), 0x1_0040);
        assert_eq!(pristine.state(), RefState::Pristine);

        let moved = pristine.moved_to(0x2_0000);
        assert_eq!(moved.offset(), 0x2_0000);
        assert_eq!(moved.state(), RefState::Pristine);
    }

    #[test]
    fn raw_offset_rejects_unaligned() {
        assert!(RawOffset::new(0x41, RefState::Normal).is_err());
    }

    #[test]
    fn obsolete_is_terminal() {
        let raw = RawOffset::new(64, RefState::Obsolete).expect("aligned");
        assert_eq!(raw.with_state(RefState::Normal).state(), RefState::Obsolete);
        assert_eq!(raw.with_state(RefState::Pristine).state(), RefState::Obsolete);
    }

    #[test]
    fn geometry_validation() {
        let geo = FlashGeometry::new(64 * 1024, 16 * 1024, 512).expect("valid");
        assert_eq!(geo.block_count(), 4);
        assert_eq!(geo.block_of(16 * 1024 + 5), BlockIndex(1));
        assert_eq!(geo.block_start(BlockIndex(3)), 48 * 1024);
        assert_eq!(geo.page_start(16 * 1024 + 700), 16 * 1024 + 512);

        assert!(FlashGeometry::new(64 * 1024, 3000, 512).is_err());
        assert!(FlashGeometry::new(64 * 1024, 16 * 1024, 32 * 1024).is_err());
        assert!(FlashGeometry::new(60 * 1024, 16 * 1024, 512).is_err());
        assert!(FlashGeometry::new(16 * 1024, 16 * 1024, 512).is_err());
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(pad4(0), 0);
        assert_eq!(pad4(1), 4);
        assert_eq!(pad4(68), 68);
        assert_eq!(pad4(69), 72);
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_up(5, 3), None);
        assert!(is_page_aligned(8192));
        assert!(!is_page_aligned(8190));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn raw_offset_roundtrip(offset in 0_u32..(u32::MAX / 4), bits in 0_u32..4) {
            let offset = offset * 4;
            let state = RefState::from_bits(bits);
            let raw = RawOffset::new(offset, state).expect("aligned");
            prop_assert_eq!(raw.offset(), offset);
            prop_assert_eq!(raw.state(), state);
        }
    }
}
