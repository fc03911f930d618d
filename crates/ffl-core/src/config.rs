//! Volume configuration.

use ffl_alloc::{ReserveLevels, ReserveOverrides};
use ffl_error::{FflError, Result};
use ffl_ondisk::{CLEANMARKER_SIZE, DATA_NODE_HEADER_SIZE};
use ffl_types::FlashGeometry;
use serde::{Deserialize, Serialize};

/// Smallest payload worth a data node of its own when space is tight.
pub const MIN_DATA_LEN: u32 = 128;

/// Tunables for a mounted volume.
///
/// Every field has a default, so a JSON document only needs to name the
/// values it changes:
///
/// ```json
/// { "summary": true, "reserve": { "resv_blocks_write": 3 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Bytes of clean marker written at the start of every erased block.
    /// Zero disables clean markers.
    pub cleanmarker_size: u32,
    /// Obsolete bytes that make a block count as dirty.
    pub dirty_threshold: u32,
    /// Read back every programmed page and compare.
    pub write_verify: bool,
    /// Append a summary node to every block closed by the allocator.
    pub summary: bool,
    /// Every n-th newly erasable block stays on the erasable list instead
    /// of being queued for erase. Zero queues all of them.
    pub erase_defer_interval: u32,
    /// Erase failures before a block is retired as bad.
    pub max_erase_failures: u32,
    /// How long the reclaim thread sleeps between checks.
    pub reclaim_poll_interval_ms: u64,
    /// Replacements for the reserve levels computed from the geometry.
    pub reserve: ReserveOverrides,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            cleanmarker_size: CLEANMARKER_SIZE,
            dirty_threshold: DATA_NODE_HEADER_SIZE as u32 + MIN_DATA_LEN,
            write_verify: false,
            summary: false,
            erase_defer_interval: 128,
            max_erase_failures: 2,
            reclaim_poll_interval_ms: 100,
            reserve: ReserveOverrides::default(),
        }
    }
}

impl VolumeConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| FflError::Config(format!("volume configuration: {err}")))
    }

    /// Check the configuration against `geometry`.
    pub fn validate(&self, geometry: FlashGeometry) -> Result<()> {
        if self.cleanmarker_size != 0 && self.cleanmarker_size != CLEANMARKER_SIZE {
            return Err(FflError::Config(format!(
                "cleanmarker_size must be 0 or {CLEANMARKER_SIZE}, got {}",
                self.cleanmarker_size
            )));
        }
        if self.dirty_threshold == 0 || self.dirty_threshold >= geometry.sector_size / 2 {
            return Err(FflError::Config(format!(
                "dirty_threshold {} must lie between 1 and half a block ({})",
                self.dirty_threshold,
                geometry.sector_size / 2
            )));
        }
        if self.max_erase_failures == 0 {
            return Err(FflError::Config(
                "max_erase_failures must be at least 1".to_owned(),
            ));
        }
        if self.reclaim_poll_interval_ms == 0 {
            return Err(FflError::Config(
                "reclaim_poll_interval_ms must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Reserve levels for `geometry` with the configured overrides applied.
    pub fn reserve_levels(
        &self,
        geometry: FlashGeometry,
        can_mark_obsolete: bool,
    ) -> Result<ReserveLevels> {
        let levels =
            ReserveLevels::compute(geometry, can_mark_obsolete).with_overrides(&self.reserve);
        levels.validate(geometry.block_count())?;
        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> FlashGeometry {
        FlashGeometry::new(32 * 4096, 4096, 512).expect("geometry")
    }

    #[test]
    fn defaults_are_valid() {
        let config = VolumeConfig::default();
        config.validate(geometry()).expect("valid");
        assert_eq!(config.dirty_threshold, 168);
        let levels = config.reserve_levels(geometry(), true).expect("levels");
        assert!(levels.resv_blocks_write < 32);
    }

    #[test]
    fn json_overrides_only_named_fields() {
        let config = VolumeConfig::from_json_str(
            r#"{ "summary": true, "reserve": { "resv_blocks_write": 3 } }"#,
        )
        .expect("parse");
        assert!(config.summary);
        assert_eq!(config.cleanmarker_size, CLEANMARKER_SIZE);
        assert_eq!(config.reserve.resv_blocks_write, Some(3));
        let levels = config.reserve_levels(geometry(), true).expect("levels");
        assert_eq!(levels.resv_blocks_write, 3);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = VolumeConfig::from_json_str("{ summary: yes").expect_err("bad json");
        assert!(matches!(err, FflError::Config(_)));
    }

    #[test]
    fn rejects_odd_cleanmarker_and_zero_failures() {
        let config = VolumeConfig {
            cleanmarker_size: 16,
            ..VolumeConfig::default()
        };
        assert!(config.validate(geometry()).is_err());

        let config = VolumeConfig {
            max_erase_failures: 0,
            ..VolumeConfig::default()
        };
        assert!(config.validate(geometry()).is_err());

        let config = VolumeConfig {
            dirty_threshold: 4096,
            ..VolumeConfig::default()
        };
        assert!(config.validate(geometry()).is_err());
    }

    #[test]
    fn overrides_that_starve_writes_are_rejected() {
        let mut config = VolumeConfig::default();
        config.reserve.resv_blocks_write = Some(32);
        assert!(config.reserve_levels(geometry(), true).is_err());
    }
}
