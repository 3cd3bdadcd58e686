//! Controller: transaction expansion, dispatch, and statistics.
//!
//! One command chain per bus (die) holds the stage packets of the queued
//! transactions. Each update pushes time into the logical unit, commits
//! the head packet of any chain whose die is free, and fires the system
//! ISR when a chain drains. Host stalls are modeled as bubble time: a
//! pending bubble absorbs update time into host-idle accounting before
//! any simulation work happens.

use std::collections::VecDeque;
use std::rc::Rc;

use nand_core::{
    Command, DeviceConfig, EnvConfig, FsmState, IsrType, ParamTable, PlaneViolation, StagePacket,
    SubmitError, TraceHandle, TransOp, Transaction, addr,
};

use crate::logical_unit::LogicalUnit;
use crate::stage_builder::StageBuilder;

/// System interrupt callback: `(kind, bus, current_time)`.
pub type IsrFn = Box<dyn FnMut(IsrType, u32, u64)>;

/// Expands transactions into per-die command chains and owns the LUNs.
pub struct Controller {
    luns: Vec<LogicalUnit>,
    chains: Vec<VecDeque<StagePacket>>,
    prev_command: Vec<Command>,
    prev_op: Vec<Option<TransOp>>,
    trans_completion: Vec<bool>,
    lun_host_idle: Vec<u64>,
    die_nand_idle: Vec<Vec<u64>>,
    die_host_idle: Vec<Vec<u64>>,
    contention: Vec<Vec<u64>>,
    read_reqs: Vec<Vec<u32>>,
    write_reqs: Vec<Vec<u32>>,
    erase_reqs: Vec<Vec<u32>>,
    config: DeviceConfig,
    builder: StageBuilder,
    /// Open row per bus for cache reads; ascending order is enforced
    /// against it.
    open_address: Vec<Option<u32>>,
    /// Multi-plane selection packets parked until the last plane arrives.
    staged_nx: Vec<VecDeque<StagePacket>>,
    /// Auto plane addressing cursor per bus, round-robin with wraparound.
    plane_cursor: Vec<Option<u16>>,
    isr: Option<IsrFn>,
    current_time: u64,
    fine_grain_id: u32,
    min_next_activate: u64,
    /// Host-stall time still to absorb before simulating.
    bubble_time: u64,
    /// Idle budget ticked over by back-to-back updates.
    idle_time: u64,
}

impl Controller {
    #[must_use]
    pub fn new(
        start_time: u64,
        config: &DeviceConfig,
        params: &Rc<ParamTable>,
        env: EnvConfig,
        trace: &TraceHandle,
    ) -> Self {
        let luns = config.luns as usize;
        let dies = config.dies_per_lu as usize;
        let buses = luns * dies;
        let mut controller = Self {
            luns: (0..luns)
                .map(|_| LogicalUnit::new(start_time, config, params.clone(), env, trace.clone()))
                .collect(),
            chains: vec![VecDeque::new(); buses],
            prev_command: vec![Command::NotDetermined; buses],
            prev_op: vec![None; buses],
            trans_completion: vec![false; buses],
            lun_host_idle: vec![0; luns],
            die_nand_idle: vec![vec![0; dies]; luns],
            die_host_idle: vec![vec![0; dies]; luns],
            contention: vec![vec![0; dies]; luns],
            read_reqs: vec![vec![0; dies]; luns],
            write_reqs: vec![vec![0; dies]; luns],
            erase_reqs: vec![vec![0; dies]; luns],
            config: config.clone(),
            builder: StageBuilder::new(config),
            open_address: vec![None; buses],
            staged_nx: vec![VecDeque::new(); buses],
            plane_cursor: vec![None; buses],
            isr: None,
            current_time: start_time,
            fine_grain_id: 0,
            min_next_activate: 0,
            bubble_time: 0,
            idle_time: 0,
        };
        for (idx, lun) in controller.luns.iter_mut().enumerate() {
            lun.set_id(idx as u32);
        }
        controller
    }

    pub fn set_system_isr(&mut self, isr: IsrFn) {
        self.isr = Some(isr);
    }

    fn next_id(&mut self) -> u32 {
        let id = self.fine_grain_id;
        self.fine_grain_id += 1;
        id
    }

    /// Walk the auto plane-addressing cursor: `None → 0 → … → planes-1`
    /// (last plane) and back to `None`.
    fn advance_plane_cursor(&mut self, bus: usize) -> (u8, bool) {
        let last = (self.config.planes_per_die - 1) as u16;
        match self.plane_cursor[bus] {
            None => {
                self.plane_cursor[bus] = Some(1 % (last + 1));
                (0, last == 0)
            }
            Some(idx) if idx == last => {
                self.plane_cursor[bus] = None;
                (idx as u8, true)
            }
            Some(idx) => {
                self.plane_cursor[bus] = Some(idx + 1);
                (idx as u8, false)
            }
        }
    }

    fn plane_for(&mut self, bus: usize, trans: &Transaction) -> (Option<u8>, bool) {
        if trans.auto_plane_addressing {
            let (plane, last) = self.advance_plane_cursor(bus);
            (Some(plane), last)
        } else {
            (None, trans.last_plane)
        }
    }

    /// Retarget a packet's row at an auto-assigned plane.
    fn apply_plane(packet: &mut StagePacket, plane: Option<u8>) {
        if let (Some(row), Some(plane)) = (packet.row, plane) {
            packet.row = Some(addr::with_plane(row, plane));
        }
    }

    /// Expand one transaction into stage packets and append them to the
    /// target die's command chain.
    pub fn build_and_add(&mut self, trans: &Transaction) -> Result<(), SubmitError> {
        let lun = 0usize;
        let die = self.config.decompose(trans.addr).die;
        let bus = self.config.bus_of(lun as u32, die) as usize;
        let mut packet = StagePacket::new(self.next_id(), self.current_time);

        match trans.op {
            TransOp::Read => {
                self.builder.read_page(
                    &mut packet,
                    trans.addr,
                    trans.byte_off,
                    trans.data.clone(),
                    trans.num_bytes,
                )?;
                self.chains[bus].push_back(packet.clone());
                self.read_reqs[lun][die as usize] += 1;
            }

            TransOp::ReadCache => {
                match self.open_address[bus] {
                    Some(open) if open == trans.addr => {
                        // continuation of the open row
                        self.builder
                            .read_page_cache(&mut packet, open, trans.data.clone());
                        self.chains[bus].push_back(packet.clone());
                        self.read_reqs[lun][die as usize] += 1;
                    }
                    Some(open) if trans.addr < open => {
                        // cache reads only walk forward through the block
                        tracing::warn!(bus, open, addr = trans.addr, "descending cache read refused");
                        return Err(SubmitError::UndefinedOrder);
                    }
                    _ => {
                        let mut init = StagePacket::new(self.next_id(), self.current_time);
                        self.builder.read_page_cache_add_addr(&mut init, trans.addr);
                        if self.prev_command[bus] == init.command {
                            // addressing twice in a row reads nothing
                            tracing::warn!(bus, "redundant cache-read addressing refused");
                            return Err(SubmitError::UndefinedOrder);
                        }
                        self.chains[bus].push_back(init.clone());
                        self.read_reqs[lun][die as usize] += 1;
                        packet = init;
                        self.builder
                            .read_page_cache(&mut packet, trans.addr, trans.data.clone());
                        packet.stage_id = self.next_id();
                        self.chains[bus].push_back(packet.clone());
                        self.read_reqs[lun][die as usize] += 1;
                    }
                }
                self.open_address[bus] = Some(trans.addr + 1);
            }

            TransOp::ReadMultiplane => {
                let (plane, last) = self.plane_for(bus, trans);
                if last
                    && (self.staged_nx[bus].is_empty()
                        || self.prev_op[bus] != Some(TransOp::ReadMultiplane))
                {
                    tracing::warn!(bus, "multi-plane FIN without preceding sub-commands");
                    return Err(SubmitError::UndefinedOrder);
                }
                self.builder
                    .read_nx_plane_add_addr(&mut packet, trans.addr, trans.byte_off, last);
                Self::apply_plane(&mut packet, plane);
                let row = packet.row;
                self.chains[bus].push_back(packet.clone());
                self.read_reqs[lun][die as usize] += 1;

                let mut selection = StagePacket::new(self.next_id(), self.current_time);
                self.builder.read_nx_plane_selection(
                    &mut selection,
                    trans.addr,
                    trans.data.clone(),
                    trans.num_bytes,
                    trans.byte_off,
                )?;
                selection.row = row;
                packet = selection.clone();
                self.staged_nx[bus].push_back(selection);

                if last {
                    // the selection half runs only once every plane is
                    // addressed
                    let staged = std::mem::take(&mut self.staged_nx[bus]);
                    self.chains[bus].extend(staged);
                }
            }

            TransOp::Prog => {
                self.builder.write_page(
                    &mut packet,
                    trans.addr,
                    trans.byte_off,
                    trans.data.clone(),
                    trans.status.clone(),
                    trans.num_bytes,
                    false,
                )?;
                self.chains[bus].push_back(packet.clone());
                self.write_reqs[lun][die as usize] += 1;
            }

            TransOp::ProgCache => {
                self.builder.write_page_cache(
                    &mut packet,
                    trans.addr,
                    trans.byte_off,
                    trans.data.clone(),
                    trans.status.clone(),
                );
                self.chains[bus].push_back(packet.clone());
                self.write_reqs[lun][die as usize] += 1;
            }

            TransOp::ProgMultiplane => {
                let (plane, last) = self.plane_for(bus, trans);
                self.builder.write_nx_plane(
                    &mut packet,
                    trans.addr,
                    trans.byte_off,
                    trans.data.clone(),
                    trans.status.clone(),
                    last,
                );
                Self::apply_plane(&mut packet, plane);
                self.chains[bus].push_back(packet.clone());
                self.write_reqs[lun][die as usize] += 1;
            }

            TransOp::ProgMultiplaneCache => {
                let (plane, last) = self.plane_for(bus, trans);
                self.builder.write_nx_plane_cache(
                    &mut packet,
                    trans.addr,
                    trans.byte_off,
                    trans.data.clone(),
                    trans.status.clone(),
                    last,
                    trans.last_nx_sub,
                );
                Self::apply_plane(&mut packet, plane);
                self.chains[bus].push_back(packet.clone());
                self.write_reqs[lun][die as usize] += 1;
            }

            TransOp::InternalDataMovement => {
                let dest = trans.dest_addr.ok_or(SubmitError::Unsupported)?;
                self.builder.read_internal_page(&mut packet, trans.addr);
                self.chains[bus].push_back(packet.clone());
                self.read_reqs[lun][die as usize] += 1;

                let mut program = StagePacket::new(self.next_id(), self.current_time);
                self.builder
                    .write_internal_page(&mut program, dest, trans.status.clone());
                packet = program.clone();
                self.chains[bus].push_back(program);
                self.write_reqs[lun][die as usize] += 1;
            }

            TransOp::InternalDataMovementMultiplane => {
                let dest = trans.dest_addr.ok_or(SubmitError::Unsupported)?;
                let (plane, last) = self.plane_for(bus, trans);
                if last
                    && (self.staged_nx[bus].is_empty()
                        || self.prev_op[bus] != Some(TransOp::InternalDataMovementMultiplane))
                {
                    tracing::warn!(bus, "multi-plane copyback FIN without preceding sub-commands");
                    return Err(SubmitError::UndefinedOrder);
                }
                self.builder
                    .read_internal_page_nx_plane(&mut packet, trans.addr, last);
                Self::apply_plane(&mut packet, plane);
                self.chains[bus].push_back(packet.clone());
                self.read_reqs[lun][die as usize] += 1;

                let mut program = StagePacket::new(self.next_id(), self.current_time);
                self.builder
                    .write_internal_page_nx_plane(&mut program, dest, trans.status.clone(), last);
                Self::apply_plane(&mut program, plane);
                packet = program.clone();
                self.staged_nx[bus].push_back(program);
                self.write_reqs[lun][die as usize] += 1;

                if last {
                    let staged = std::mem::take(&mut self.staged_nx[bus]);
                    self.chains[bus].extend(staged);
                }
            }

            TransOp::BlockErase => {
                self.builder
                    .erase_block(&mut packet, trans.addr, trans.status.clone());
                self.chains[bus].push_back(packet.clone());
                self.erase_reqs[lun][die as usize] += 1;
            }

            TransOp::BlockEraseMultiplane => {
                let (plane, last) = self.plane_for(bus, trans);
                self.builder
                    .erase_nx_block(&mut packet, trans.addr, trans.status.clone(), last);
                Self::apply_plane(&mut packet, plane);
                self.chains[bus].push_back(packet.clone());
                self.erase_reqs[lun][die as usize] += 1;
            }

            TransOp::ReadMultiplaneRandom => {
                // a column selection within rows an earlier multi-plane
                // read left open in the cache registers
                if !matches!(
                    self.prev_op[bus],
                    Some(TransOp::ReadMultiplane | TransOp::ReadMultiplaneRandom)
                ) {
                    tracing::warn!(bus, "multi-plane random read without an open multi-plane read");
                    return Err(SubmitError::UndefinedOrder);
                }
                self.builder.read_nx_plane_random_col_selection(
                    &mut packet,
                    trans.addr,
                    trans.byte_off,
                    trans.data.clone(),
                    trans.num_bytes,
                )?;
                self.chains[bus].push_back(packet.clone());
                self.read_reqs[lun][die as usize] += 1;
            }

            // single-plane random chains are driven packet by packet
            // through commit_stage; the transaction front end does not
            // expand them
            TransOp::ReadRandom | TransOp::ProgRandom | TransOp::ProgMultiplaneRandom => {
                tracing::warn!(
                    bus,
                    op = ?trans.op,
                    "random-mode chain refused by the transaction front end"
                );
                return Err(SubmitError::Unsupported);
            }
        }

        self.prev_command[bus] = packet.command;
        self.prev_op[bus] = Some(trans.op);
        if trans.op != TransOp::ReadCache {
            self.open_address[bus] = None;
        }
        // patch the head of the chain forward in delta time
        self.update(0);
        Ok(())
    }

    /// Append a caller-built stage packet to a bus's command chain.
    pub fn commit_stage(&mut self, bus: u32, packet: StagePacket) {
        self.chains[bus as usize].push_back(packet);
    }

    /// Fine-grain id for caller-built packets.
    pub fn gen_trans_id(&mut self) -> u32 {
        self.next_id()
    }

    /// Advance the whole device by `dt` picoseconds.
    pub fn update(&mut self, dt: u64) {
        let lun = 0usize;
        self.current_time += dt;

        if self.bubble_time == 0 || dt > self.bubble_time {
            let bubble = self.bubble_time;
            let dt = dt - bubble;
            self.lun_host_idle[lun] += bubble;
            self.luns[lun].update(dt);

            let mut min_idle = u64::MAX;
            for die in 0..self.config.dies_per_lu as usize {
                let bus = lun * self.config.dies_per_lu as usize + die;

                if dt != 0
                    && self.trans_completion[bus]
                    && !self.luns[lun].check_busy(Some(die))
                {
                    self.chains[bus]
                        .pop_front()
                        .expect("completed transaction with an empty chain");
                    if self.chains[bus].is_empty() {
                        // each chain carries one host transaction's packets
                        let now = self.current_time();
                        if let Some(isr) = &mut self.isr {
                            isr(IsrType::CompleteTrans, bus as u32, now);
                        }
                    }
                    self.trans_completion[bus] = false;
                }

                if !self.chains[bus].is_empty() {
                    // bus activity is emulated inside the LUN; commit the
                    // head packet whenever the die is free
                    if !self.luns[lun].check_busy(Some(die)) {
                        let head = self.chains[bus][0].clone();
                        if self.luns[lun].issue(head).is_ok() {
                            self.trans_completion[bus] = true;
                        }
                    }
                    if self.luns[lun].is_die_idle(die) {
                        self.contention[lun][die] += dt;
                    }
                }

                self.die_nand_idle[lun][die] += self.luns[lun].die_clock_idle(die);
                let host_idle = self.luns[lun].die_host_idle(die);
                self.die_host_idle[lun][die] += bubble + host_idle;
                min_idle = min_idle.min(host_idle);
            }
            if min_idle != u64::MAX {
                self.lun_host_idle[lun] += min_idle;
            }
            self.bubble_time = 0;
        } else {
            // still absorbing a host stall; queued commands may be issued
            // but no simulation time passes
            for die in 0..self.config.dies_per_lu as usize {
                let bus = lun * self.config.dies_per_lu as usize + die;
                if !self.chains[bus].is_empty() && !self.luns[lun].check_busy(Some(die)) {
                    let head = self.chains[bus][0].clone();
                    if self.luns[lun].issue(head).is_ok() {
                        self.trans_completion[bus] = true;
                    }
                }
                self.die_host_idle[lun][die] += dt;
            }
            self.lun_host_idle[lun] += dt;
            self.bubble_time -= dt;
        }

        self.min_next_activate = self.luns[lun].min_next_activity();
    }

    /// Least time to the next state change, or the pending bubble.
    #[must_use]
    pub fn min_next_activity(&self) -> u64 {
        if self.bubble_time != 0 {
            self.bubble_time
        } else {
            self.min_next_activate
        }
    }

    /// Least time to the next state change while the I/O bus is held.
    #[must_use]
    pub fn min_io_bus_activity(&self) -> u64 {
        if self.is_io_bus_active() {
            self.min_next_activate
        } else {
            0
        }
    }

    /// Model a host stall: the next updates absorb this much time as
    /// host idle before simulating.
    pub fn delay_update(&mut self, bubble: u64) {
        self.bubble_time = bubble;
    }

    pub fn add_delay_update(&mut self, bubble: u64) {
        self.bubble_time += bubble;
    }

    /// Account idle time skipped over without simulation.
    pub fn tick_over(&mut self, time: u64) {
        self.idle_time += time;
    }

    #[must_use]
    pub fn is_io_bus_active(&self) -> bool {
        self.luns[0].is_bus_active()
    }

    /// Simulated time plus the ticked-over idle budget.
    #[must_use]
    pub fn current_time(&self) -> u64 {
        self.current_time + self.idle_time
    }

    #[must_use]
    pub fn die_current_time(&self, die: usize) -> u64 {
        self.luns[0].current_time(die)
    }

    #[must_use]
    pub fn tick_over_time(&self) -> u64 {
        self.idle_time
    }

    #[must_use]
    pub fn nand_clock_idle_time(&self, lun: usize, die: usize) -> u64 {
        self.die_nand_idle[lun][die]
    }

    #[must_use]
    pub fn host_clock_idle_time(&self, lun: usize, die: usize) -> u64 {
        self.die_host_idle[lun][die]
    }

    #[must_use]
    pub fn lun_host_idle_time(&self, lun: usize) -> u64 {
        self.lun_host_idle[lun]
    }

    #[must_use]
    pub fn resource_contention_time(&self, lun: usize, die: usize) -> u64 {
        self.contention[lun][die]
    }

    /// Accumulated bus-stage time of one die.
    #[must_use]
    pub fn active_bus_time(&self, lun: usize, die: usize) -> u64 {
        self.luns[lun].fsm_time(FsmState::Ale, die)
            + self.luns[lun].fsm_time(FsmState::Cle, die)
            + self.luns[lun].fsm_time(FsmState::Tir, die)
            + self.luns[lun].fsm_time(FsmState::Tor, die)
    }

    #[must_use]
    pub fn lun(&self, lun: usize) -> &LogicalUnit {
        &self.luns[lun]
    }

    pub fn lun_mut(&mut self, lun: usize) -> &mut LogicalUnit {
        &mut self.luns[lun]
    }

    /// Drain the plane violations a die has accumulated.
    pub fn take_violations(&mut self, lun: usize, die: usize) -> PlaneViolation {
        self.luns[lun].take_violations(die)
    }

    #[must_use]
    pub fn request_counts(&self, lun: usize, die: usize) -> (u32, u32, u32) {
        (
            self.read_reqs[lun][die],
            self.write_reqs[lun][die],
            self.erase_reqs[lun][die],
        )
    }

    /// Print the performance report to stdout.
    pub fn report_performance(&self) {
        for (lun_idx, lun) in self.luns.iter().enumerate() {
            let traffic = lun.accumulated_traffic();
            let host_idle = self.lun_host_idle[lun_idx];
            let (mut reads, mut writes, mut erases) = (0u64, 0u64, 0u64);
            for die in 0..self.config.dies_per_lu as usize {
                reads += u64::from(self.read_reqs[lun_idx][die]);
                writes += u64::from(self.write_reqs[lun_idx][die]);
                erases += u64::from(self.erase_reqs[lun_idx][die]);
            }
            let time = self.current_time as f64;
            let bandwidth = if traffic != 0 {
                traffic as f64 / (time / 1_000_000.0)
            } else {
                0.0
            };

            println!("LUN {lun_idx} ******************************************");
            println!("System time (ps)                  : {}", self.current_time);
            println!("System idle time (ps)             : {host_idle}");
            println!(
                "System working time (ps)          : {}",
                self.current_time - host_idle
            );
            println!("Page read requests                : {reads}");
            println!("Page write requests               : {writes}");
            println!("Block erase requests              : {erases}");
            println!(
                "IOPS (including idle)             : {:.3}",
                (reads + writes + erases) as f64 / (time / 1_000_000_000.0)
            );
            println!("Throughput (KB/s, incl. idle)     : {bandwidth:.3}");
            println!(
                "LUN utilization (%)               : {:.2}",
                (time - host_idle as f64) * 100.0 / time
            );
            println!("Request bytes                     : {traffic}");
            println!();

            for die in 0..self.config.dies_per_lu as usize {
                let die_traffic = lun.request_traffic(die);
                let mut busy = 0u64;
                if die_traffic != 0 {
                    for state in FsmState::ALL {
                        busy += lun.fsm_time(state, die);
                    }
                }
                let die_bw = if die_traffic != 0 {
                    die_traffic as f64 / (busy as f64 / 1_000_000.0)
                } else {
                    0.0
                };
                let die_idle = self.die_host_idle[lun_idx][die];
                println!("  Die {die}");
                println!("    page reads                    : {}", self.read_reqs[lun_idx][die]);
                println!("    page writes                   : {}", self.write_reqs[lun_idx][die]);
                println!("    block erases                  : {}", self.erase_reqs[lun_idx][die]);
                println!("    bandwidth (KB/s)              : {die_bw:.3}");
                println!("    working time (ps)             : {busy}");
                println!("    I/O traffic (bytes)           : {die_traffic}");
                println!(
                    "    NAND clock idle (ps)          : {}",
                    self.die_nand_idle[lun_idx][die]
                );
                println!("    host clock idle (ps)          : {die_idle}");
                println!(
                    "    utilization (%)               : {:.2}",
                    (time - die_idle as f64) * 100.0 / time
                );
                println!(
                    "    contention time (ps)          : {}",
                    self.contention[lun_idx][die]
                );
            }
            println!();
        }
    }

    /// Emit the per-state and per-DC accumulators into their trace
    /// streams.
    pub fn report_statistics(&self) {
        for lun in &self.luns {
            lun.report_time_per_each_state();
            lun.report_power_time_per_each_dc();
        }
    }

    /// Reinitialize from a (possibly new) configuration.
    pub fn hard_reset(&mut self, start_time: u64, config: &DeviceConfig) {
        self.config = config.clone();
        self.current_time = start_time;
        self.fine_grain_id = 0;
        self.min_next_activate = 0;
        self.bubble_time = 0;
        self.idle_time = 0;
        self.builder.set_device_config(config);

        for bus in 0..self.chains.len() {
            self.chains[bus].clear();
            self.staged_nx[bus].clear();
            self.prev_command[bus] = Command::NotDetermined;
            self.prev_op[bus] = None;
            self.trans_completion[bus] = false;
            self.open_address[bus] = None;
            self.plane_cursor[bus] = None;
        }
        for lun in 0..self.luns.len() {
            self.lun_host_idle[lun] = 0;
            for die in 0..self.config.dies_per_lu as usize {
                self.die_nand_idle[lun][die] = 0;
                self.die_host_idle[lun][die] = 0;
                self.contention[lun][die] = 0;
                self.read_reqs[lun][die] = 0;
                self.write_reqs[lun][die] = 0;
                self.erase_reqs[lun][die] = 0;
            }
            self.luns[lun].hard_reset(start_time, config);
            self.luns[lun].set_id(lun as u32);
        }
    }
}
