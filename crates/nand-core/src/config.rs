//! Device geometry and derived address-field widths.

use serde::Deserialize;

use crate::addr;

/// Whether planes keep page bytes or account for timing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// Keep page bytes in lazily allocated block-group buffers.
    #[default]
    Buffered,
    /// Skip byte movement; constraint and timing accounting still run.
    Discard,
}

/// Bit width of each address field, derived from the geometry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressBits {
    pub page_size: u32,
    pub page: u32,
    pub plane: u32,
    pub block: u32,
    pub die: u32,
    pub lun: u32,
}

/// One page named by its physical coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLocation {
    pub die: u8,
    pub plane: u8,
    pub block: u16,
    pub page: u8,
}

impl PageLocation {
    /// Pack into a row register.
    #[must_use]
    pub const fn row(self) -> u32 {
        addr::compose(self.die, self.plane, self.block, self.page)
    }
}

/// Immutable device geometry. Built once, copied freely.
///
/// Every count must be a power of two so address fields pack cleanly.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Page size in bytes, spare area excluded.
    pub page_size: u32,
    /// Spare bytes per page (reported, not simulated).
    #[serde(default)]
    pub spare_size: u32,
    pub pages_per_block: u32,
    pub blocks_per_plane: u32,
    pub planes_per_die: u32,
    pub dies_per_lu: u32,
    /// Logical units sharing the controller. Only one is actively driven.
    #[serde(default = "default_one")]
    pub luns: u32,
    /// Stage packets a die's bus queue will hold before refusing more.
    #[serde(default = "default_one")]
    pub queue_depth: u32,
    /// I/O pin count; `pins / 8` bytes move per data cycle.
    pub io_pins: u32,
    /// Max writes per page between erases.
    pub nop: u32,
    /// Erase endurance per block.
    pub max_erase_count: u32,
    #[serde(default = "default_device_id")]
    pub device_id: u32,
    #[serde(default)]
    pub store: StoreMode,
    #[serde(skip)]
    pub bits: AddressBits,
}

fn default_one() -> u32 {
    1
}

fn default_device_id() -> u32 {
    0xbeef_dead
}

fn bit_width(n: u32) -> u32 {
    assert!(n.is_power_of_two(), "geometry value {n} is not a power of two");
    n.trailing_zeros()
}

impl DeviceConfig {
    /// Derive the address-field widths. Must be called before the config is
    /// handed to any component; profile loading does this automatically.
    #[must_use]
    pub fn finish(mut self) -> Self {
        self.bits = AddressBits {
            page_size: bit_width(self.page_size),
            page: bit_width(self.pages_per_block),
            plane: bit_width(self.planes_per_die),
            block: bit_width(self.blocks_per_plane),
            die: bit_width(self.dies_per_lu),
            lun: bit_width(self.luns),
        };
        self
    }

    /// Bytes transferred per data cycle.
    #[must_use]
    pub fn io_bytes(&self) -> u32 {
        self.io_pins / 8
    }

    /// Bytes in one block.
    #[must_use]
    pub fn block_bytes(&self) -> u64 {
        u64::from(self.page_size) * u64::from(self.pages_per_block)
    }

    /// Shared-bus count across the device.
    #[must_use]
    pub fn buses(&self) -> u32 {
        self.luns * self.dies_per_lu
    }

    /// Bus index for a die within a logical unit.
    #[must_use]
    pub fn bus_of(&self, lun: u32, die: u8) -> u32 {
        lun * self.dies_per_lu + u32::from(die)
    }

    /// Break a semi-physical linear page address into coordinates.
    ///
    /// The linear address counts pages die-major:
    /// `(((die * blocks + block) * planes) + plane) * pages + page`.
    #[must_use]
    pub fn decompose(&self, linear: u32) -> PageLocation {
        let page = linear % self.pages_per_block;
        let rest = linear / self.pages_per_block;
        let plane = rest % self.planes_per_die;
        let rest = rest / self.planes_per_die;
        let block = rest % self.blocks_per_plane;
        let die = (rest / self.blocks_per_plane) % self.dies_per_lu;
        PageLocation {
            die: die as u8,
            plane: plane as u8,
            block: block as u16,
            page: page as u8,
        }
    }

    /// Compose a semi-physical linear page address.
    #[must_use]
    pub fn linear(&self, loc: PageLocation) -> u32 {
        ((u32::from(loc.die) * self.blocks_per_plane + u32::from(loc.block))
            * self.planes_per_die
            + u32::from(loc.plane))
            * self.pages_per_block
            + u32::from(loc.page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeviceConfig {
        DeviceConfig {
            page_size: 8192,
            spare_size: 0,
            pages_per_block: 128,
            blocks_per_plane: 2048,
            planes_per_die: 2,
            dies_per_lu: 2,
            luns: 1,
            queue_depth: 1,
            io_pins: 8,
            nop: 1,
            max_erase_count: 1000,
            device_id: 1,
            store: StoreMode::Buffered,
            bits: AddressBits::default(),
        }
        .finish()
    }

    #[test]
    fn derived_bit_widths() {
        let cfg = config();
        assert_eq!(cfg.bits.page_size, 13);
        assert_eq!(cfg.bits.page, 7);
        assert_eq!(cfg.bits.plane, 1);
        assert_eq!(cfg.bits.block, 11);
        assert_eq!(cfg.bits.die, 1);
    }

    #[test]
    fn linear_round_trip() {
        let cfg = config();
        let loc = PageLocation {
            die: 1,
            plane: 1,
            block: 37,
            page: 5,
        };
        assert_eq!(cfg.decompose(cfg.linear(loc)), loc);
    }

    #[test]
    fn bus_index_is_linear_in_die() {
        let cfg = config();
        assert_eq!(cfg.bus_of(0, 0), 0);
        assert_eq!(cfg.bus_of(0, 1), 1);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn non_power_of_two_geometry_is_rejected() {
        let mut cfg = config();
        cfg.pages_per_block = 100;
        let _ = cfg.finish();
    }
}
