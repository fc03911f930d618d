#![forbid(unsafe_code)]
//! FrankenFlash public API facade.
//!
//! Re-exports the volume engine from `ffl-core` together with the device
//! layer and the handle types callers need to drive it. This is the crate
//! the CLI and other downstream consumers depend on.

pub use ffl_core::*;
pub use ffl_device::{FaultPlan, FileFlash, FlashDevice, FlashStats, MemFlash, ReadStatus};
pub use ffl_error::{FflError, Result};
pub use ffl_fragtree::{FragChanges, FragTree, FragTreeError, FullDnode};
pub use ffl_ledger::{BlockState, SpaceStats, SpaceTotals};
pub use ffl_types::{BlockIndex, FlashGeometry, InodeNumber, NodeRefId, RefState};
