//! Device profiles: the JSON file format that carries the geometry, the
//! parameter tables, and the environment switches.
//!
//! The `params` and `env` sections are optional and fall back to the
//! built-in datasheet-typical tables. A minimal profile is just the
//! `device` geometry:
//!
//! ```json
//! {
//!   "device": {
//!     "page_size": 8192, "pages_per_block": 128, "blocks_per_plane": 2048,
//!     "planes_per_die": 2, "dies_per_lu": 2, "io_pins": 8,
//!     "nop": 1, "max_erase_count": 100000
//!   }
//! }
//! ```

use std::path::Path;
use std::rc::Rc;

use serde::Deserialize;
use thiserror::Error;

use nand_core::{
    AddressBits, DeviceConfig, EnvConfig, ParamTable, StoreMode, TraceSet,
};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("cannot read profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed profile: {0}")]
    Json(#[from] serde_json::Error),
}

/// A complete simulator configuration as loaded from disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceProfile {
    pub device: DeviceConfig,
    #[serde(default)]
    pub params: ParamTable,
    #[serde(default)]
    pub env: EnvConfig,
    #[serde(default = "default_trace_dir")]
    pub trace_dir: String,
}

fn default_trace_dir() -> String {
    "trace".into()
}

impl DeviceProfile {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProfileError> {
        let mut profile: Self = serde_json::from_str(text)?;
        profile.device = profile.device.finish();
        Ok(profile)
    }

    /// The built-in profile: a two-die, two-plane 8 KiB-page part with
    /// the default timing tables.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            device: DeviceConfig {
                page_size: 8192,
                spare_size: 436,
                pages_per_block: 128,
                blocks_per_plane: 2048,
                planes_per_die: 2,
                dies_per_lu: 2,
                luns: 1,
                queue_depth: 1,
                io_pins: 8,
                nop: 1,
                max_erase_count: 100_000,
                device_id: 0xbeef_dead,
                store: StoreMode::Buffered,
                bits: AddressBits::default(),
            }
            .finish(),
            params: ParamTable::default(),
            env: EnvConfig::default(),
            trace_dir: default_trace_dir(),
        }
    }

    /// The parameter table as a shared handle.
    #[must_use]
    pub fn shared_params(&self) -> Rc<ParamTable> {
        self.params.clone().shared()
    }

    /// Trace streams per this profile's switches.
    #[must_use]
    pub fn trace_set(&self) -> TraceSet {
        TraceSet::new(&self.trace_dir, self.env.trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nand_core::TimingMode;

    #[test]
    fn minimal_profile_uses_default_tables() {
        let profile = DeviceProfile::from_json(
            r#"{
                "device": {
                    "page_size": 4096, "pages_per_block": 64,
                    "blocks_per_plane": 1024, "planes_per_die": 2,
                    "dies_per_lu": 2, "io_pins": 8,
                    "nop": 4, "max_erase_count": 10000
                }
            }"#,
        )
        .expect("minimal profile parses");
        assert_eq!(profile.device.bits.page, 6);
        assert_eq!(profile.params.timing.t_r, ParamTable::default().timing.t_r);
        assert_eq!(profile.env.timing_mode, TimingMode::Variation);
        assert!(!profile.env.trace.plane_read);
    }

    #[test]
    fn overrides_are_honored() {
        let profile = DeviceProfile::from_json(
            r#"{
                "device": {
                    "page_size": 4096, "pages_per_block": 64,
                    "blocks_per_plane": 1024, "planes_per_die": 2,
                    "dies_per_lu": 1, "io_pins": 16,
                    "nop": 1, "max_erase_count": 1000,
                    "store": "discard"
                },
                "params": { "clock_period": 2500 },
                "env": { "timing_mode": "typical", "trace": { "io_completion": true } }
            }"#,
        )
        .expect("profile with overrides parses");
        assert_eq!(profile.device.io_bytes(), 2);
        assert_eq!(profile.device.store, StoreMode::Discard);
        assert_eq!(profile.params.clock_period_ps, 2500);
        assert_eq!(profile.env.timing_mode, TimingMode::Typical);
        assert!(profile.env.trace.io_completion);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(DeviceProfile::from_json(r#"{"gizmo": 1}"#).is_err());
    }
}
