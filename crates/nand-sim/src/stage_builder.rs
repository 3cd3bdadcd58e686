//! Stage builder: translate one transaction into the stage packets the
//! datasheet's command sequences call for.
//!
//! Stateless apart from the device configuration. Each method fills in a
//! packet the controller has already stamped with an id and arrival cycle.
//! Sequences, for callers driving the packets directly:
//!
//! - erase: `erase_block`; multi-plane: `erase_nx_block` per plane, last
//!   one flagged.
//! - read: `read_page`; random column follow-ups via
//!   `read_random_col_selection`.
//! - cache read: `read_page_cache_add_addr` then `read_page_cache` per
//!   page.
//! - multi-plane read: `read_nx_plane_add_addr` per plane (last flagged),
//!   then `read_nx_plane_selection` per plane; random column follow-ups
//!   within the open rows via `read_nx_plane_random_col_selection`.
//! - program: `write_page`; cache: `write_page_cache` per page;
//!   multi-plane: `write_nx_plane` per plane; multi-plane cache:
//!   `write_nx_plane_cache` per plane and page, plane order outranking
//!   page order.
//! - copyback: `read_internal_page` then `write_internal_page` (or the
//!   `_nx_plane` forms per plane).

use nand_core::{
    Command, DataBuffer, DeviceConfig, StagePacket, StatusCell, SubmitError,
};

/// Fills stage packets from transactions; owns nothing but the geometry.
pub struct StageBuilder {
    config: DeviceConfig,
}

impl StageBuilder {
    #[must_use]
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn set_device_config(&mut self, config: &DeviceConfig) {
        self.config = config.clone();
    }

    fn row(&self, linear: u32) -> u32 {
        self.config.decompose(linear).row()
    }

    /// Clamp-check a transfer length against the page remainder.
    fn check_length(&self, col: u32, bytes: u32) -> Result<(), SubmitError> {
        assert!(col <= self.config.page_size, "column beyond the page");
        if bytes > self.config.page_size - col {
            return Err(SubmitError::IoLength);
        }
        Ok(())
    }

    pub fn read_status(&self, packet: &mut StagePacket, die: u8, status: Option<StatusCell>) {
        packet.row = Some(nand_core::addr::compose(die, 0, 0, 0));
        packet.command = Command::ReadStatus;
        packet.status = status;
        packet.last_of_transaction = true;
    }

    pub fn reset(&self, packet: &mut StagePacket, die: u8) {
        packet.row = Some(nand_core::addr::compose(die, 0, 0, 0));
        packet.command = Command::Reset;
        packet.last_of_transaction = true;
    }

    pub fn read_page(
        &self,
        packet: &mut StagePacket,
        linear: u32,
        col: u32,
        data: Option<DataBuffer>,
        bytes: u32,
    ) -> Result<(), SubmitError> {
        self.check_length(col, bytes)?;
        packet.command = Command::ReadPage;
        packet.col = col as u16;
        packet.random_bytes = Some(bytes);
        packet.data = data;
        packet.last_of_transaction = true;
        packet.row = Some(self.row(linear));
        Ok(())
    }

    /// Random data-out within the open row.
    pub fn read_random_col_selection(
        &self,
        packet: &mut StagePacket,
        open_linear: u32,
        col: u32,
        data: Option<DataBuffer>,
        bytes: u32,
    ) -> Result<(), SubmitError> {
        self.check_length(col, bytes)?;
        packet.command = Command::ReadRandom;
        packet.col = col as u16;
        packet.random_bytes = Some(bytes);
        packet.data = data;
        packet.last_of_transaction = true;
        packet.row = Some(self.row(open_linear));
        Ok(())
    }

    pub fn write_page(
        &self,
        packet: &mut StagePacket,
        linear: u32,
        col: u32,
        data: Option<DataBuffer>,
        status: Option<StatusCell>,
        bytes: u32,
        random_in: bool,
    ) -> Result<(), SubmitError> {
        self.check_length(col, bytes)?;
        if let (Some(cell), false) = (&status, random_in) {
            cell.set(0);
        }
        packet.command = if random_in {
            Command::ProgRandom
        } else {
            Command::ProgPage
        };
        packet.col = col as u16;
        packet.random_bytes = Some(bytes);
        packet.data = data;
        packet.status = if random_in { None } else { status };
        packet.last_of_transaction = !random_in;
        packet.row = Some(self.row(linear));
        Ok(())
    }

    /// Random data-in within the open row.
    pub fn write_random_col_selection(
        &self,
        packet: &mut StagePacket,
        open_linear: u32,
        col: u32,
        data: Option<DataBuffer>,
        status: Option<StatusCell>,
        bytes: u32,
        last: bool,
    ) -> Result<(), SubmitError> {
        self.check_length(col, bytes)?;
        packet.command = if last {
            Command::ProgRandomFin
        } else {
            Command::ProgRandom
        };
        packet.col = col as u16;
        packet.random_bytes = Some(bytes);
        packet.data = data;
        packet.status = if last { status } else { None };
        packet.last_of_transaction = last;
        packet.row = Some(self.row(open_linear));
        Ok(())
    }

    pub fn read_page_cache_add_addr(&self, packet: &mut StagePacket, linear: u32) {
        packet.command = Command::ReadCacheAddrInit;
        packet.random_bytes = Some(self.config.page_size);
        packet.row = Some(self.row(linear));
        packet.last_of_transaction = false;
    }

    pub fn read_page_cache(
        &self,
        packet: &mut StagePacket,
        open_linear: u32,
        data: Option<DataBuffer>,
    ) {
        packet.command = Command::ReadCache;
        packet.random_bytes = Some(self.config.page_size);
        packet.data = data;
        packet.last_of_transaction = true;
        packet.row = Some(self.row(open_linear));
    }

    pub fn write_page_cache(
        &self,
        packet: &mut StagePacket,
        linear: u32,
        col: u32,
        data: Option<DataBuffer>,
        status: Option<StatusCell>,
    ) {
        if let Some(cell) = &status {
            cell.set(0);
        }
        packet.command = Command::ProgCache;
        packet.col = col as u16;
        packet.random_bytes = Some(self.config.page_size - col);
        packet.data = data;
        packet.status = status;
        packet.row = Some(self.row(linear));
        packet.last_of_transaction = true;
    }

    /// Multi-plane read, addressing half: one per plane, the last flagged.
    /// No completion fires from these.
    pub fn read_nx_plane_add_addr(
        &self,
        packet: &mut StagePacket,
        linear: u32,
        col: u32,
        last: bool,
    ) {
        assert!(col <= self.config.page_size, "column beyond the page");
        packet.command = if last {
            Command::ReadMultiplaneInitFin
        } else {
            Command::ReadMultiplaneInit
        };
        packet.col = col as u16;
        packet.random_bytes = Some(self.config.page_size - col);
        packet.last_of_transaction = false;
        packet.row = Some(self.row(linear));
    }

    /// Multi-plane read, data-out half: plane selection plus transfer.
    pub fn read_nx_plane_selection(
        &self,
        packet: &mut StagePacket,
        linear: u32,
        data: Option<DataBuffer>,
        bytes: u32,
        col: u32,
    ) -> Result<(), SubmitError> {
        self.check_length(col, bytes)?;
        packet.command = Command::ReadMultiplane;
        packet.col = col as u16;
        packet.random_bytes = Some(bytes);
        packet.data = data;
        packet.last_of_transaction = true;
        packet.row = Some(self.row(linear));
        Ok(())
    }

    /// Multi-plane random data-out within one plane's open row. Column
    /// selection is plane-agnostic once the rows are open; the packet's
    /// plane field picks the cache register.
    pub fn read_nx_plane_random_col_selection(
        &self,
        packet: &mut StagePacket,
        open_linear: u32,
        col: u32,
        data: Option<DataBuffer>,
        bytes: u32,
    ) -> Result<(), SubmitError> {
        self.read_random_col_selection(packet, open_linear, col, data, bytes)
    }

    pub fn write_nx_plane(
        &self,
        packet: &mut StagePacket,
        linear: u32,
        col: u32,
        data: Option<DataBuffer>,
        status: Option<StatusCell>,
        last_plane: bool,
    ) {
        assert!(col <= self.config.page_size, "column beyond the page");
        if let (Some(cell), true) = (&status, last_plane) {
            cell.set(0);
        }
        packet.command = if last_plane {
            Command::ProgMultiplaneFin
        } else {
            Command::ProgMultiplane
        };
        packet.col = col as u16;
        packet.random_bytes = Some(self.config.page_size - col);
        packet.data = data;
        packet.status = if last_plane { status } else { None };
        packet.last_of_transaction = true;
        packet.row = Some(self.row(linear));
    }

    /// Multi-plane cache program sub-command. Plane order outranks page
    /// order: the last plane of each page flags a completion, and the
    /// final sub-transaction switches to the FIN chain.
    pub fn write_nx_plane_cache(
        &self,
        packet: &mut StagePacket,
        linear: u32,
        col: u32,
        data: Option<DataBuffer>,
        status: Option<StatusCell>,
        last_plane: bool,
        last_sub: bool,
    ) {
        assert!(col <= self.config.page_size, "column beyond the page");
        if let (Some(cell), true) = (&status, last_plane) {
            cell.set(0);
        }
        packet.command = if last_sub {
            Command::ProgMultiplaneCacheFin
        } else if last_plane {
            Command::ProgMultiplaneCache
        } else {
            Command::ProgMultiplane
        };
        packet.col = col as u16;
        packet.random_bytes = Some(self.config.page_size - col);
        packet.data = data;
        packet.status = if last_plane { status } else { None };
        packet.last_of_transaction = last_plane;
        packet.row = Some(self.row(linear));
    }

    /// Multi-plane random program, opening sub-command.
    pub fn write_nx_plane_for_random(
        &self,
        packet: &mut StagePacket,
        linear: u32,
        col: u32,
        data: Option<DataBuffer>,
        bytes: u32,
    ) -> Result<(), SubmitError> {
        self.check_length(col, bytes)?;
        packet.command = Command::ProgMultiplaneRandom;
        packet.col = col as u16;
        packet.random_bytes = Some(bytes);
        packet.data = data;
        packet.status = None;
        packet.last_of_transaction = false;
        packet.row = Some(self.row(linear));
        Ok(())
    }

    /// Multi-plane random program, column follow-up.
    pub fn write_nx_plane_random_col_selection(
        &self,
        packet: &mut StagePacket,
        open_linear: u32,
        col: u32,
        data: Option<DataBuffer>,
        status: Option<StatusCell>,
        bytes: u32,
        last_random: bool,
        last_sub: bool,
    ) -> Result<(), SubmitError> {
        self.check_length(col, bytes)?;
        if let (Some(cell), true) = (&status, last_sub) {
            cell.set(0);
        }
        packet.command = if last_sub {
            Command::ProgMultiplaneFinRandom
        } else if last_random {
            Command::ProgMultiplaneRandomDummy
        } else {
            Command::ProgMultiplaneRandom
        };
        packet.col = col as u16;
        packet.random_bytes = Some(bytes);
        packet.data = data;
        packet.status = if last_sub { status } else { None };
        packet.last_of_transaction = last_sub;
        packet.row = Some(self.row(open_linear));
        Ok(())
    }

    /// Copyback, array-read half. No bus transfer, whole pages only.
    pub fn read_internal_page(&self, packet: &mut StagePacket, linear: u32) {
        packet.command = Command::ReadInternal;
        packet.col = 0;
        packet.random_bytes = Some(self.config.page_size);
        packet.data = None;
        packet.status = None;
        packet.last_of_transaction = false;
        packet.row = Some(self.row(linear));
    }

    /// Copyback, program half.
    pub fn write_internal_page(
        &self,
        packet: &mut StagePacket,
        linear: u32,
        status: Option<StatusCell>,
    ) {
        if let Some(cell) = &status {
            cell.set(0);
        }
        packet.command = Command::ProgInternal;
        packet.col = 0;
        packet.random_bytes = Some(self.config.page_size);
        packet.data = None;
        packet.status = status;
        packet.last_of_transaction = true;
        packet.row = Some(self.row(linear));
    }

    pub fn read_internal_page_nx_plane(&self, packet: &mut StagePacket, linear: u32, last: bool) {
        packet.command = if last {
            Command::ReadInternalMultiplaneFin
        } else {
            Command::ReadInternalMultiplane
        };
        packet.col = 0;
        packet.random_bytes = Some(self.config.page_size);
        packet.data = None;
        packet.status = None;
        packet.last_of_transaction = false;
        packet.row = Some(self.row(linear));
    }

    pub fn write_internal_page_nx_plane(
        &self,
        packet: &mut StagePacket,
        linear: u32,
        status: Option<StatusCell>,
        last: bool,
    ) {
        if let (Some(cell), true) = (&status, last) {
            cell.set(0);
        }
        packet.command = if last {
            Command::ProgInternalMultiplaneFin
        } else {
            Command::ProgInternalMultiplane
        };
        packet.col = 0;
        packet.random_bytes = Some(self.config.page_size);
        packet.data = None;
        packet.status = if last { status } else { None };
        packet.last_of_transaction = last;
        packet.row = Some(self.row(linear));
    }

    pub fn erase_block(&self, packet: &mut StagePacket, linear: u32, status: Option<StatusCell>) {
        if let Some(cell) = &status {
            cell.set(0);
        }
        packet.command = Command::BlockErase;
        packet.status = status;
        packet.last_of_transaction = true;
        packet.row = Some(self.row(linear));
    }

    pub fn erase_nx_block(
        &self,
        packet: &mut StagePacket,
        linear: u32,
        status: Option<StatusCell>,
        last: bool,
    ) {
        if let Some(cell) = &status {
            cell.set(0);
        }
        packet.command = if last {
            Command::BlockMultiplaneEraseFin
        } else {
            Command::BlockMultiplaneErase
        };
        packet.status = status;
        packet.last_of_transaction = last;
        packet.row = Some(self.row(linear));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nand_core::{AddressBits, StoreMode, addr};

    fn config() -> DeviceConfig {
        DeviceConfig {
            page_size: 2048,
            spare_size: 0,
            pages_per_block: 64,
            blocks_per_plane: 256,
            planes_per_die: 2,
            dies_per_lu: 2,
            luns: 1,
            queue_depth: 1,
            io_pins: 8,
            nop: 1,
            max_erase_count: 1000,
            device_id: 0,
            store: StoreMode::Discard,
            bits: AddressBits::default(),
        }
        .finish()
    }

    fn builder() -> StageBuilder {
        StageBuilder::new(&config())
    }

    #[test]
    fn read_page_addresses_the_right_die() {
        let builder = builder();
        let linear = config().linear(nand_core::PageLocation {
            die: 1,
            plane: 1,
            block: 3,
            page: 7,
        });
        let mut packet = StagePacket::new(0, 0);
        builder
            .read_page(&mut packet, linear, 0, None, 2048)
            .expect("valid read");
        let row = packet.row.expect("row set");
        assert_eq!(addr::die_of(row), 1);
        assert_eq!(addr::block_of(row), 3);
        assert_eq!(addr::plane_of(row), 1);
        assert_eq!(addr::page_of(row), 7);
        assert!(packet.last_of_transaction);
    }

    #[test]
    fn oversized_transfer_is_refused() {
        let builder = builder();
        let mut packet = StagePacket::new(0, 0);
        assert_eq!(
            builder.read_page(&mut packet, 0, 100, None, 2048),
            Err(SubmitError::IoLength)
        );
    }

    #[test]
    fn nx_erase_flags_only_the_last_plane() {
        let builder = builder();
        let mut first = StagePacket::new(0, 0);
        builder.erase_nx_block(&mut first, 0, None, false);
        assert_eq!(first.command, Command::BlockMultiplaneErase);
        assert!(!first.last_of_transaction);

        let mut last = StagePacket::new(1, 0);
        builder.erase_nx_block(&mut last, 64, None, true);
        assert_eq!(last.command, Command::BlockMultiplaneEraseFin);
        assert!(last.last_of_transaction);
    }

    #[test]
    fn nx_random_col_selection_keeps_the_plane() {
        let builder = builder();
        let linear = config().linear(nand_core::PageLocation {
            die: 0,
            plane: 1,
            block: 2,
            page: 4,
        });
        let mut packet = StagePacket::new(0, 0);
        builder
            .read_nx_plane_random_col_selection(&mut packet, linear, 128, None, 64)
            .expect("valid column selection");
        assert_eq!(packet.command, Command::ReadRandom);
        assert_eq!(packet.col, 128);
        assert_eq!(packet.random_bytes, Some(64));
        assert_eq!(addr::plane_of(packet.row.expect("row set")), 1);
    }

    #[test]
    fn cache_program_chain_commands() {
        let builder = builder();
        let mut packet = StagePacket::new(0, 0);
        builder.write_nx_plane_cache(&mut packet, 0, 0, None, None, false, false);
        assert_eq!(packet.command, Command::ProgMultiplane);
        builder.write_nx_plane_cache(&mut packet, 64, 0, None, None, true, false);
        assert_eq!(packet.command, Command::ProgMultiplaneCache);
        builder.write_nx_plane_cache(&mut packet, 128, 0, None, None, true, true);
        assert_eq!(packet.command, Command::ProgMultiplaneCacheFin);
    }
}
