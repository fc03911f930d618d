#![forbid(unsafe_code)]
//! Error types for FrankenFlash.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ffl-types` | Malformed node headers and summaries detected during byte parsing |
//! | Runtime | `FflError` | `ffl-error` (this crate) | Errors returned by the engine, the devices and the CLI |
//!
//! `ffl-error` does not depend on `ffl-types`. `ParseError` is converted at
//! the `ffl-core` boundary: into `Corruption` when the flash offset is known,
//! into `Parse` otherwise.
//!
//! ## Error classes
//!
//! Only two errors surface during normal operation: `NoSpace` and
//! `Interrupted`. Everything else is one of:
//!
//! - **Consistency violations** (`Inconsistent`): the in-memory model
//!   disagrees with itself, for example a node linked away from the write
//!   frontier or a non-contiguous buffered write. These are logged at error
//!   level by the detecting code and returned; the caller must stop using
//!   the volume.
//! - **Device errors** (`Device`): classified by [`DeviceErrorKind`]. Write
//!   failures carry the number of bytes the device claims it programmed so
//!   the engine can account the damaged range as obsolete.
//! - **Data loss** (`DataLoss`): write-buffer recovery could not relocate
//!   every live node.
//!
//! ## errno Mapping
//!
//! Every `FflError` variant maps to exactly one POSIX errno via
//! [`FflError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Device` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `DataLoss` | `EIO` |
//! | `Inconsistent` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `Config` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `Interrupted` | `EINTR` |
//! | `NotFound` | `ENOENT` |
//! | `ReadOnly` | `EROFS` |

use std::fmt;
use thiserror::Error;

/// Classification of a failed device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// ECC could not correct the page.
    Uncorrectable,
    /// Programming failed after `written` bytes reached the medium.
    Write { written: u32 },
    /// Read-back after programming did not match the source.
    Verify,
    /// The block could not be erased.
    Erase,
    /// The device is gone or returned something unclassifiable.
    Fatal,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncorrectable => f.write_str("uncorrectable read"),
            Self::Write { written } => write!(f, "write failed after {written} bytes"),
            Self::Verify => f.write_str("write verification mismatch"),
            Self::Erase => f.write_str("erase failed"),
            Self::Fatal => f.write_str("fatal device error"),
        }
    }
}

/// Unified error type for all FrankenFlash operations.
#[derive(Debug, Error)]
pub enum FflError {
    /// Operating system I/O error from a file-backed device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The flash device rejected an operation at `offset`.
    #[error("device error at {offset:#x}: {kind}")]
    Device { offset: u32, kind: DeviceErrorKind },

    /// A node read back from flash failed validation.
    #[error("corrupt node at {offset:#x}: {detail}")]
    Corruption { offset: u32, detail: String },

    /// Write-buffer recovery could not relocate every live node.
    #[error("data lost during recovery: {0}")]
    DataLoss(String),

    /// Fatal consistency violation in the in-memory model.
    #[error("internal inconsistency: {0}")]
    Inconsistent(String),

    /// The medium does not carry a recognisable layout.
    #[error("invalid on-flash format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without a known flash offset.
    #[error("parse error: {0}")]
    Parse(String),

    /// Geometry parameters are out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Volume configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Not enough reclaimable space for the requested reservation.
    #[error("no space left on device")]
    NoSpace,

    /// A blocking wait was interrupted before it completed.
    #[error("operation interrupted")]
    Interrupted,

    /// The named inode or node does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The volume has been shut down after a fatal error.
    #[error("read-only volume")]
    ReadOnly,
}

impl FflError {
    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - `Inconsistent` → `EIO`: the caller sees an I/O failure while the log
    ///   carries the detail.
    /// - `Interrupted` → `EINTR`: callers may retry at a higher layer.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Device { .. }
            | Self::Corruption { .. }
            | Self::DataLoss(_)
            | Self::Inconsistent(_) => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) | Self::Config(_) => {
                libc::EINVAL
            }
            Self::NoSpace => libc::ENOSPC,
            Self::Interrupted => libc::EINTR,
            Self::NotFound(_) => libc::ENOENT,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Bytes the device reports as programmed before a write failure.
    #[must_use]
    pub fn bytes_written(&self) -> u32 {
        match self {
            Self::Device {
                kind: DeviceErrorKind::Write { written },
                ..
            } => *written,
            _ => 0,
        }
    }

    /// True for errors that leave the in-memory model untrustworthy.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Inconsistent(_)
                | Self::Device {
                    kind: DeviceErrorKind::Fatal,
                    ..
                }
        )
    }
}

/// Result alias using `FflError`.
pub type Result<T> = std::result::Result<T, FflError>;
