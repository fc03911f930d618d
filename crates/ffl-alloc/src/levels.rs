//! Reserve levels derived from the medium geometry.

use ffl_error::{FflError, Result};
use ffl_types::FlashGeometry;
use serde::{Deserialize, Serialize};

/// Block counts and byte floors that gate reservations and wake the
/// garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveLevels {
    /// Free blocks a deletion may dig into.
    pub resv_blocks_deletion: u32,
    /// Free blocks an ordinary write must leave untouched.
    pub resv_blocks_write: u32,
    /// Below this many free blocks the collector is woken.
    pub resv_blocks_gctrigger: u32,
    /// Free blocks required before a `BadUsed` block is collected.
    pub resv_blocks_gcbad: u32,
    /// Free blocks below which the collector merges rather than copies.
    pub resv_blocks_gcmerge: u32,
    /// Very dirty blocks that wake the collector on their own.
    pub vdirty_blocks_gctrigger: u32,
    /// Reclaimable bytes below which writes fail with no space.
    pub nospc_dirty_size: u32,
}

/// Optional replacements for individual computed levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReserveOverrides {
    pub resv_blocks_deletion: Option<u32>,
    pub resv_blocks_write: Option<u32>,
    pub resv_blocks_gctrigger: Option<u32>,
    pub resv_blocks_gcbad: Option<u32>,
    pub vdirty_blocks_gctrigger: Option<u32>,
    pub nospc_dirty_size: Option<u32>,
}

impl ReserveLevels {
    /// Levels for `geometry`.
    ///
    /// Deletions keep two blocks in reserve. Writes additionally keep 2% of
    /// the medium plus 100 bytes per block, rounded up to whole blocks. The
    /// very-dirty trigger is ten times laxer on media that can mark nodes
    /// obsolete in place, since dirty space there is cheap to find.
    #[must_use]
    pub fn compute(geometry: FlashGeometry, can_mark_obsolete: bool) -> Self {
        let sector = u64::from(geometry.sector_size);
        let deletion = 2_u32;
        let slack = u64::from(geometry.flash_size) / 50
            + u64::from(geometry.block_count()) * 100
            + sector
            - 1;
        let write = deletion + u32::try_from(slack / sector).unwrap_or(u32::MAX - deletion);
        let gctrigger = write + 1;
        let vdirty = if can_mark_obsolete {
            gctrigger.saturating_mul(10)
        } else {
            gctrigger
        };
        Self {
            resv_blocks_deletion: deletion,
            resv_blocks_write: write,
            resv_blocks_gctrigger: gctrigger,
            resv_blocks_gcbad: 0,
            resv_blocks_gcmerge: deletion + 1,
            vdirty_blocks_gctrigger: vdirty,
            nospc_dirty_size: geometry.sector_size + geometry.flash_size / 100,
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: &ReserveOverrides) -> Self {
        if let Some(v) = overrides.resv_blocks_deletion {
            self.resv_blocks_deletion = v;
        }
        if let Some(v) = overrides.resv_blocks_write {
            self.resv_blocks_write = v;
        }
        if let Some(v) = overrides.resv_blocks_gctrigger {
            self.resv_blocks_gctrigger = v;
        }
        if let Some(v) = overrides.resv_blocks_gcbad {
            self.resv_blocks_gcbad = v;
        }
        if let Some(v) = overrides.vdirty_blocks_gctrigger {
            self.vdirty_blocks_gctrigger = v;
        }
        if let Some(v) = overrides.nospc_dirty_size {
            self.nospc_dirty_size = v;
        }
        self
    }

    /// Reject level sets that could never admit a write on `block_count`
    /// blocks.
    pub fn validate(&self, block_count: u32) -> Result<()> {
        if self.resv_blocks_deletion > self.resv_blocks_write {
            return Err(FflError::Config(format!(
                "deletion reserve {} exceeds write reserve {}",
                self.resv_blocks_deletion, self.resv_blocks_write
            )));
        }
        if self.resv_blocks_write >= block_count {
            return Err(FflError::Config(format!(
                "write reserve of {} blocks leaves nothing usable on a {block_count}-block medium",
                self.resv_blocks_write
            )));
        }
        if self.vdirty_blocks_gctrigger == 0 {
            return Err(FflError::Config(
                "very-dirty trigger must be at least one block".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_for_small_nor_part() {
        // 64 blocks of 64 KiB.
        let geo = FlashGeometry::new(64 * 65536, 65536, 512).expect("geometry");
        let levels = ReserveLevels::compute(geo, true);
        // 2% of 4 MiB + 6400 bytes rounds up to two blocks.
        assert_eq!(levels.resv_blocks_deletion, 2);
        assert_eq!(levels.resv_blocks_write, 4);
        assert_eq!(levels.resv_blocks_gctrigger, 5);
        assert_eq!(levels.resv_blocks_gcmerge, 3);
        assert_eq!(levels.vdirty_blocks_gctrigger, 50);
        assert_eq!(levels.nospc_dirty_size, 65536 + 41943);
        levels.validate(geo.block_count()).expect("valid");
    }

    #[test]
    fn media_without_obsolete_marking_trigger_sooner() {
        let geo = FlashGeometry::new(32 * 4096, 4096, 512).expect("geometry");
        let levels = ReserveLevels::compute(geo, false);
        assert_eq!(levels.vdirty_blocks_gctrigger, levels.resv_blocks_gctrigger);
    }

    #[test]
    fn overrides_replace_single_levels() {
        let geo = FlashGeometry::new(32 * 4096, 4096, 512).expect("geometry");
        let overrides: ReserveOverrides =
            serde_json::from_str(r#"{"resv_blocks_write": 6}"#).expect("json");
        let levels = ReserveLevels::compute(geo, true).with_overrides(&overrides);
        assert_eq!(levels.resv_blocks_write, 6);
        assert_eq!(levels.resv_blocks_deletion, 2);
    }

    #[test]
    fn validation_rejects_unusable_levels() {
        let geo = FlashGeometry::new(4 * 4096, 4096, 512).expect("geometry");
        let levels = ReserveLevels::compute(geo, true);
        assert!(levels
            .with_overrides(&ReserveOverrides {
                resv_blocks_write: Some(4),
                ..ReserveOverrides::default()
            })
            .validate(4)
            .is_err());
        assert!(levels
            .with_overrides(&ReserveOverrides {
                resv_blocks_deletion: Some(3),
                resv_blocks_write: Some(2),
                ..ReserveOverrides::default()
            })
            .validate(4)
            .is_err());
    }
}
