//! One plane: constraint bookkeeping and the optional page-byte store.
//!
//! The store materializes lazily in groups of [`BLOCK_GROUP`] blocks the
//! first time a group is touched, so a sparse workload on a large device
//! only pays for the regions it visits. In [`StoreMode::Discard`] the byte
//! movement is skipped entirely; the constraint accounting still runs.

use nand_core::{DeviceConfig, PlaneViolation, StoreMode, TraceHandle, addr};

/// Blocks per lazily-allocated store region.
pub const BLOCK_GROUP: u32 = 8;

/// A single plane of a die.
pub struct Plane {
    id: u32,
    config: DeviceConfig,
    /// Writes since last erase, per page.
    nop: Vec<Box<[u8]>>,
    /// Highest page offset programmed since last erase, per block.
    last_programmed: Vec<u32>,
    /// Erases survived, per block.
    erase_count: Vec<u32>,
    /// Page bytes, one buffer per block group, allocated on first touch.
    groups: Vec<Option<Box<[u8]>>>,
    trace: TraceHandle,
}

impl Plane {
    #[must_use]
    pub fn new(config: &DeviceConfig, trace: TraceHandle) -> Self {
        let blocks = config.blocks_per_plane as usize;
        let pages = config.pages_per_block as usize;
        Self {
            id: 0,
            config: config.clone(),
            nop: (0..blocks).map(|_| vec![0u8; pages].into_boxed_slice()).collect(),
            last_programmed: vec![0; blocks],
            erase_count: vec![0; blocks],
            groups: vec![None; blocks.div_ceil(BLOCK_GROUP as usize)],
            trace,
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    /// Erase cycles a block has survived.
    #[must_use]
    pub fn erase_count(&self, block: u16) -> u32 {
        self.erase_count[block as usize]
    }

    /// Highest page offset programmed in a block since its last erase.
    #[must_use]
    pub fn last_programmed_page(&self, block: u16) -> u32 {
        self.last_programmed[block as usize]
    }

    /// Writes a page has taken since the last erase of its block.
    #[must_use]
    pub fn nop_count(&self, block: u16, page: u8) -> u8 {
        self.nop[block as usize][page as usize]
    }

    fn group_region(&mut self, block: usize) -> Option<(&mut [u8], usize)> {
        if self.config.store == StoreMode::Discard {
            return None;
        }
        let group = block / BLOCK_GROUP as usize;
        let region = self.groups[group].get_or_insert_with(|| {
            vec![0u8; self.config.block_bytes() as usize * BLOCK_GROUP as usize]
                .into_boxed_slice()
        });
        let offset = (block % BLOCK_GROUP as usize) * self.config.block_bytes() as usize;
        Some((region, offset))
    }

    /// Program one page from the cache register.
    ///
    /// Violations accumulate into the returned set; the page is written
    /// regardless, as the real array would.
    pub fn write(&mut self, col: u16, row: u32, data: Option<&[u8]>) -> PlaneViolation {
        let block = addr::block_of(row) as usize;
        let page = addr::page_of(row) as usize;
        if block >= self.config.blocks_per_plane as usize
            || page >= self.config.pages_per_block as usize
        {
            return PlaneViolation::ADDRESS;
        }
        self.trace
            .borrow_mut()
            .plane_write(self.id, block as u16, page as u8);

        let mut violations = PlaneViolation::empty();
        self.nop[block][page] = self.nop[block][page].saturating_add(1);
        if u32::from(self.nop[block][page]) > self.config.nop {
            violations |= PlaneViolation::NOP;
            tracing::warn!(plane = self.id, block, page, "NOP violation");
        }
        if self.last_programmed[block] > page as u32 {
            violations |= PlaneViolation::IN_ORDER;
            tracing::warn!(plane = self.id, block, page, "in-place update violation");
        }
        if self.erase_count[block] >= self.config.max_erase_count {
            violations |= PlaneViolation::WEAROUT;
            tracing::warn!(plane = self.id, block, "write to worn-out block");
        }
        self.last_programmed[block] = page as u32;

        let page_size = self.config.page_size as usize;
        if let (Some((region, base)), Some(data)) = (self.group_region(block), data) {
            let start = base + page * page_size + col as usize;
            let len = page_size - col as usize;
            region[start..start + len].copy_from_slice(&data[col as usize..col as usize + len]);
        }
        violations
    }

    /// Read one page into the cache register.
    pub fn read(&mut self, col: u16, row: u32, data: Option<&mut [u8]>) -> PlaneViolation {
        let block = addr::block_of(row) as usize;
        let page = addr::page_of(row) as usize;
        if block >= self.config.blocks_per_plane as usize
            || page >= self.config.pages_per_block as usize
        {
            return PlaneViolation::ADDRESS;
        }
        self.trace
            .borrow_mut()
            .plane_read(self.id, block as u16, page as u8);

        let page_size = self.config.page_size as usize;
        if let (Some((region, base)), Some(data)) = (self.group_region(block), data) {
            let start = base + page * page_size + col as usize;
            let len = page_size - col as usize;
            data[col as usize..col as usize + len].copy_from_slice(&region[start..start + len]);
        }
        PlaneViolation::empty()
    }

    /// Erase the addressed block: clear the write-order and NOP tracking,
    /// zero the backing bytes, and burn one endurance cycle.
    ///
    /// The store models erase as all-zeros (a fresh buffer is zeroed, so an
    /// untouched block and an erased block read the same).
    pub fn erase(&mut self, row: u32) -> PlaneViolation {
        let block = addr::block_of(row) as usize;
        if block >= self.config.blocks_per_plane as usize {
            return PlaneViolation::ADDRESS;
        }
        self.last_programmed[block] = 0;
        self.nop[block].fill(0);
        let page_size = self.config.page_size as usize;
        let pages = self.config.pages_per_block as usize;
        if let Some((region, base)) = self.group_region(block) {
            region[base..base + pages * page_size].fill(0);
        }
        self.erase_count[block] += 1;
        let mut violations = PlaneViolation::empty();
        if self.erase_count[block] >= self.config.max_erase_count {
            violations |= PlaneViolation::WEAROUT;
            tracing::warn!(plane = self.id, block, "block erased past endurance");
        }
        violations
    }

    /// Reinitialize from a (possibly new) configuration, dropping all
    /// tracking state and backing bytes.
    pub fn hard_reset(&mut self, config: &DeviceConfig) {
        let trace = self.trace.clone();
        let id = self.id;
        *self = Self::new(config, trace);
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nand_core::{AddressBits, TraceSet};

    fn config(store: StoreMode) -> DeviceConfig {
        DeviceConfig {
            page_size: 64,
            spare_size: 0,
            pages_per_block: 4,
            blocks_per_plane: 16,
            planes_per_die: 2,
            dies_per_lu: 1,
            luns: 1,
            queue_depth: 1,
            io_pins: 8,
            nop: 1,
            max_erase_count: 4,
            device_id: 0,
            store,
            bits: AddressBits::default(),
        }
        .finish()
    }

    fn plane(store: StoreMode) -> Plane {
        Plane::new(&config(store), TraceSet::disabled().shared())
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut plane = plane(StoreMode::Buffered);
        let row = addr::compose(0, 0, 3, 1);
        let data = vec![0xA5u8; 64];
        assert!(plane.write(0, row, Some(&data)).is_empty());
        let mut out = vec![0u8; 64];
        assert!(plane.read(0, row, Some(&mut out)).is_empty());
        assert_eq!(out, data);
    }

    #[test]
    fn partial_column_write_preserves_prefix() {
        let mut plane = plane(StoreMode::Buffered);
        let row = addr::compose(0, 0, 0, 0);
        let data = vec![0x11u8; 64];
        plane.write(16, row, Some(&data));
        let mut out = vec![0u8; 64];
        plane.read(0, row, Some(&mut out));
        assert!(out[..16].iter().all(|&b| b == 0));
        assert!(out[16..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn second_write_without_erase_is_a_nop_violation() {
        let mut plane = plane(StoreMode::Discard);
        let row = addr::compose(0, 0, 0, 0);
        assert!(plane.write(0, row, None).is_empty());
        assert!(plane.write(0, row, None).contains(PlaneViolation::NOP));
    }

    #[test]
    fn descending_page_order_is_flagged() {
        let mut plane = plane(StoreMode::Discard);
        assert!(plane.write(0, addr::compose(0, 0, 0, 2), None).is_empty());
        let violations = plane.write(0, addr::compose(0, 0, 0, 1), None);
        assert!(violations.contains(PlaneViolation::IN_ORDER));
    }

    #[test]
    fn erase_resets_constraints_and_counts_wear() {
        let mut plane = plane(StoreMode::Buffered);
        let row = addr::compose(0, 0, 5, 0);
        let data = vec![0xFFu8; 64];
        plane.write(0, row, Some(&data));
        assert!(plane.erase(row).is_empty());
        assert_eq!(plane.erase_count(5), 1);
        assert_eq!(plane.last_programmed_page(5), 0);
        assert_eq!(plane.nop_count(5, 0), 0);
        // the block reads back zeroed, and can be written again
        let mut out = vec![0xAAu8; 64];
        plane.read(0, row, Some(&mut out));
        assert!(out.iter().all(|&b| b == 0));
        assert!(plane.write(0, row, Some(&data)).is_empty());
    }

    #[test]
    fn double_erase_is_idempotent_but_burns_two_cycles() {
        let mut plane = plane(StoreMode::Buffered);
        let row = addr::compose(0, 0, 2, 0);
        plane.erase(row);
        plane.erase(row);
        assert_eq!(plane.erase_count(2), 2);
        let mut out = vec![0x55u8; 64];
        plane.read(0, row, Some(&mut out));
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn wearout_surfaces_at_endurance() {
        let mut plane = plane(StoreMode::Discard);
        let row = addr::compose(0, 0, 0, 0);
        for _ in 0..3 {
            assert!(plane.erase(row).is_empty());
        }
        assert!(plane.erase(row).contains(PlaneViolation::WEAROUT));
        assert!(plane.write(0, row, None).contains(PlaneViolation::WEAROUT));
    }

    #[test]
    fn neighboring_block_in_same_group_survives_erase() {
        let mut plane = plane(StoreMode::Buffered);
        let kept = addr::compose(0, 0, 1, 0);
        let erased = addr::compose(0, 0, 2, 0);
        let data = vec![0x7Eu8; 64];
        plane.write(0, kept, Some(&data));
        plane.write(0, erased, Some(&data));
        plane.erase(erased);
        let mut out = vec![0u8; 64];
        plane.read(0, kept, Some(&mut out));
        assert_eq!(out, data);
    }
}
