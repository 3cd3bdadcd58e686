//! The per-die protocol state machine.
//!
//! A die accepts one stage transition at a time from the bus layer. Each
//! accepted transition validates the command chain, moves bytes between the
//! host buffer, the per-plane cache registers, and the planes, converts the
//! step into a picosecond busy time, and announces the stage it expects
//! next. The bus layer feeds that expectation back in once the busy time
//! has drained.
//!
//! # Register file
//!
//! Row, column, and transfer-length registers exist per plane so that
//! multi-plane chains can address one page on every plane before the
//! confirm command fires the array. The command register holds the latest
//! latched command and steers every subsequent stage.
//!
//! # Poisoning
//!
//! An illegal chain sets `need_reset`. From then on the die refuses every
//! transition except a status read (which reports bit 17) and the reset
//! command; the embedder recovers with `READ_STATUS` followed by `RESET`.

use std::rc::Rc;

use nand_core::{
    ArrayOp, Command, DcRegion, DeviceConfig, EnvConfig, FsmState, ParamTable, PlaneViolation,
    Stage, StagePacket, StoreMode, TimingMode, TraceHandle, addr,
};

use crate::plane::Plane;

/// One NAND die: planes, register file, state machine, and accumulators.
pub struct Die {
    id: u32,
    current_time: u64,
    config: DeviceConfig,
    params: Rc<ParamTable>,
    env: EnvConfig,
    trace: TraceHandle,

    planes: Vec<Plane>,
    /// Per-plane cache registers; empty in discard mode.
    cache: Vec<Box<[u8]>>,

    row_reg: Vec<Option<u32>>,
    col_reg: Vec<Option<u16>>,
    transfer_reg: Vec<Option<u32>>,
    command_reg: Command,

    need_reset: bool,
    current_stage: Stage,
    expected_stage: Stage,
    /// Remaining busy time of the stage in flight, picoseconds.
    next_activate: u64,
    /// Sub-cycle remainder from the last update.
    clock_idle_time: u64,
    nand_busy: bool,
    last_ale_bytes: Option<u8>,
    /// Multi-plane sub-commands issued since the last FIN.
    nx_command_count: Option<u8>,
    standby_dc: bool,
    leak_dc: bool,

    /// First cache read still owes the long initial busy.
    cache_load_first: bool,
    /// The next cache TON pays full `tR` instead of the cache busy.
    cache_no_hide_ton: bool,

    fsm_time: [u64; FsmState::COUNT],
    power_time: [u64; DcRegion::COUNT],
    violations: PlaneViolation,
}

impl Die {
    #[must_use]
    pub fn new(
        start_time: u64,
        config: &DeviceConfig,
        params: Rc<ParamTable>,
        env: EnvConfig,
        trace: TraceHandle,
    ) -> Self {
        let planes = config.planes_per_die as usize;
        let cache = if config.store == StoreMode::Discard {
            Vec::new()
        } else {
            (0..planes)
                .map(|_| vec![0u8; config.page_size as usize].into_boxed_slice())
                .collect()
        };
        let mut die = Self {
            id: 0,
            current_time: start_time,
            config: config.clone(),
            params,
            env,
            trace: trace.clone(),
            planes: (0..planes).map(|_| Plane::new(config, trace.clone())).collect(),
            cache,
            row_reg: vec![None; planes],
            col_reg: vec![None; planes],
            transfer_reg: vec![None; planes],
            command_reg: Command::NotDetermined,
            need_reset: false,
            current_stage: Stage::NotDetermined,
            expected_stage: Stage::Idle,
            next_activate: 0,
            clock_idle_time: 0,
            nand_busy: false,
            last_ale_bytes: None,
            nx_command_count: None,
            standby_dc: true,
            leak_dc: true,
            cache_load_first: false,
            cache_no_hide_ton: false,
            fsm_time: [0; FsmState::COUNT],
            power_time: [0; DcRegion::COUNT],
            violations: PlaneViolation::empty(),
        };
        die.soft_reset();
        die
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
        for (idx, plane) in self.planes.iter_mut().enumerate() {
            plane.set_id(id * self.config.planes_per_die + idx as u32);
        }
    }

    #[must_use]
    pub fn current_time(&self) -> u64 {
        self.current_time
    }

    /// Remaining busy time of the stage in flight, picoseconds.
    #[must_use]
    pub fn next_activate(&self) -> u64 {
        self.next_activate
    }

    /// True while the state machine is consuming time.
    #[must_use]
    pub fn fsm_busy(&self) -> bool {
        self.next_activate != 0
    }

    #[must_use]
    pub fn expected_next_stage(&self) -> Stage {
        self.expected_stage
    }

    #[must_use]
    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    /// Ready/busy pin: true while the array is not working. Bus activity
    /// does not drive this pin.
    #[must_use]
    pub fn rb_ready(&self) -> bool {
        !self.nand_busy
    }

    /// Idle with no expected continuation.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.next_activate == 0 && self.expected_stage == Stage::Idle
    }

    #[must_use]
    pub fn needs_reset(&self) -> bool {
        self.need_reset
    }

    /// Sub-cycle remainder left over by the last update.
    #[must_use]
    pub fn clock_idle_time(&self) -> u64 {
        self.clock_idle_time
    }

    /// Accumulated time in one FSM state, picoseconds.
    #[must_use]
    pub fn fsm_time(&self, state: FsmState) -> u64 {
        self.fsm_time[state.index()]
    }

    /// Accumulated time in one DC power region, picoseconds.
    #[must_use]
    pub fn power_time(&self, region: DcRegion) -> u64 {
        self.power_time[region.index()]
    }

    /// Drain the plane violations observed since the last call.
    pub fn take_violations(&mut self) -> PlaneViolation {
        std::mem::take(&mut self.violations)
    }

    #[must_use]
    pub fn plane(&self, idx: usize) -> &Plane {
        &self.planes[idx]
    }

    // -----------------------------------------------------------------------
    // Time advance
    // -----------------------------------------------------------------------

    /// Advance by `dt` picoseconds. Whatever `dt` exceeds the remaining
    /// busy time is recorded as this die's clock-idle remainder. The whole
    /// span also lands in exactly one of the leakage or standby power
    /// accumulators, or neither when the die is actively drawing.
    pub fn update(&mut self, dt: u64) {
        self.current_time += dt;
        if self.next_activate >= dt {
            self.clock_idle_time = 0;
            self.next_activate -= dt;
        } else {
            self.clock_idle_time = dt - self.next_activate;
            self.next_activate = 0;
        }

        if self.leak_dc {
            self.power_time[DcRegion::Leakage.index()] += dt;
        } else if self.standby_dc {
            self.power_time[DcRegion::Standby.index()] += dt;
        }
    }

    // -----------------------------------------------------------------------
    // Stage transitions
    // -----------------------------------------------------------------------

    /// Execute one stage transition and return the stage the die expects
    /// next.
    ///
    /// A die still consuming time answers [`Stage::Busy`] without touching
    /// any state. A poisoned die answers [`Stage::ReadStatus`] and only
    /// accepts the status read and the reset command until reset.
    pub fn transit_stage(&mut self, stage: Stage, packet: &StagePacket) -> Stage {
        let mut next = Stage::NotDetermined;
        self.standby_dc = true;
        self.leak_dc = true;

        let recovering = self.need_reset
            && (stage == Stage::ReadStatus
                || (stage == Stage::Cle && packet.command == Command::Reset));
        if self.next_activate == 0 && (!self.need_reset || recovering) {
            let plane = addr::plane_of(packet.row.unwrap_or(0)) as usize;
            next = match stage {
                Stage::Ale => self.latch_address(plane, packet),
                Stage::Cle => self.latch_command(plane, packet),
                Stage::Tir => self.data_in(plane, packet),
                Stage::Tin | Stage::TinCache | Stage::TinDummy | Stage::TinTail => {
                    self.array_program(stage, plane)
                }
                Stage::Ton => self.array_read(plane),
                Stage::Tor => self.data_out(plane, packet),
                Stage::ReadStatus => self.read_status(packet),
                _ => Stage::NotDetermined,
            };
            self.current_stage = stage;
            self.expected_stage = next;
        } else if stage == Stage::ResetDelta {
            // soft reset executes in delta time regardless of die state
            self.nand_busy = false;
            self.soft_reset();
            next = Stage::Idle;
        } else if self.need_reset {
            // poisoned: only a status read will move things forward
            return Stage::ReadStatus;
        } else {
            return Stage::Busy;
        }

        if self.need_reset {
            tracing::warn!(die = self.id, ?stage, "illegal command order; die needs reset");
        }
        self.trace.borrow_mut().internal_state(
            self.id,
            packet.stage_id,
            &format!("{:?}", packet.command),
            &format!("{stage:?}"),
            self.current_time,
            self.next_activate,
        );
        next
    }

    /// Address latch. Latches column, transfer length, and (when present)
    /// the row into the addressed plane's registers; charges the latch time
    /// for the command's address-cycle count.
    fn latch_address(&mut self, plane: usize, packet: &StagePacket) -> Stage {
        self.leak_dc = false;
        self.nand_busy = false;

        // bus cycles for the whole step are granted at address-latch time
        self.transfer_reg[plane] = packet.random_bytes;

        if let Some(row) = packet.row {
            // a vacant packet row means the command reuses the open row
            if self.command_reg == Command::ReadMultiplane && self.row_reg[plane] != Some(row) {
                self.need_reset = true;
                tracing::warn!(
                    die = self.id,
                    row,
                    "multi-plane read row does not match the plane-selected row"
                );
            }
            self.row_reg[plane] = Some(row);
        }

        if self.command_reg.is_internal_read() {
            // copyback addressing carries column cycles but ignores them
            self.col_reg[plane] = Some(0);
        } else {
            self.col_reg[plane] = Some(packet.col);
        }

        let ale_bytes: u8 = match self.command_reg {
            Command::BlockErase | Command::BlockMultiplaneErase | Command::BlockMultiplaneEraseFin => 3,
            Command::ReadRandom => 2, // random I/O reuses the open row
            _ => 5,
        };
        self.last_ale_bytes = Some(ale_bytes);
        self.next_activate = self.address_latch_time(u64::from(ale_bytes));
        self.fsm_time[FsmState::Ale.index()] += self.next_activate;

        match self.command_reg {
            Command::ProgMultiplaneFinRandom
            | Command::ProgMultiplaneFin
            | Command::ProgMultiplaneCacheFin
            | Command::ProgMultiplane
            | Command::ProgMultiplaneCache
            | Command::ProgMultiplaneRandom
            | Command::ProgPage
            | Command::ProgCache
            | Command::ProgRandom
            | Command::ProgRandomFin
            | Command::ProgMultiplaneRandomDummy => Stage::Tir,
            Command::ProgInternal
            | Command::ProgInternalMultiplane
            | Command::ProgInternalMultiplaneFin => Stage::Cle,
            Command::ReadPage
            | Command::ReadRandom
            | Command::ReadCacheAddrInit
            | Command::ReadMultiplane
            | Command::ReadMultiplaneInit
            | Command::ReadMultiplaneInitFin
            | Command::ReadInternal
            | Command::ReadInternalMultiplaneFin => Stage::Cle,
            // multi-plane copyback needs further addressing commands
            Command::ReadInternalMultiplane => Stage::Idle,
            Command::BlockErase | Command::BlockMultiplaneEraseFin => Stage::Cle,
            Command::BlockMultiplaneErase => Stage::Idle,
            _ => Stage::NotDetermined,
        }
    }

    /// Command latch. Stores the command register and steers the chain;
    /// confirm commands start the array and charge its busy time here.
    fn latch_command(&mut self, plane: usize, packet: &StagePacket) -> Stage {
        self.command_reg = packet.command;
        self.next_activate = self.command_latch_time();
        self.fsm_time[FsmState::Cle.index()] += self.next_activate;
        self.leak_dc = false;
        self.nand_busy = false;

        match self.command_reg {
            Command::ProgMultiplaneFinRandom
            | Command::ProgMultiplaneFin
            | Command::ProgInternalMultiplaneFin => {
                if self.nx_command_count.is_none() {
                    self.need_reset = true;
                    tracing::warn!(
                        die = self.id,
                        "multi-plane FIN issued without a preceding multi-plane command"
                    );
                } else {
                    self.nx_command_count = None;
                }
                Stage::Ale
            }
            Command::ProgMultiplane
            | Command::ProgMultiplaneRandom
            | Command::ProgInternalMultiplane
            | Command::ProgMultiplaneRandomDummy => {
                let count = self.nx_command_count.map_or(1, |c| c.saturating_add(1));
                if u32::from(count) > self.config.planes_per_die {
                    self.need_reset = true;
                    tracing::warn!(
                        die = self.id,
                        count,
                        planes = self.config.planes_per_die,
                        "multi-plane accesses exceed the physical plane count"
                    );
                }
                self.nx_command_count = Some(count);
                Stage::Ale
            }
            // cache sub-commands may repeat without bound
            Command::ProgMultiplaneCache => {
                self.nx_command_count = Some(0);
                Stage::Ale
            }
            Command::ProgCache
            | Command::ProgMultiplaneCacheFin
            | Command::ProgPage
            | Command::ProgRandom
            | Command::ProgRandomFin
            | Command::ProgInternal => Stage::Ale,
            Command::ProgMultiplaneConf
            | Command::ProgMultiplaneRandomDummyConf
            | Command::ProgInternalMultiplaneConf => Stage::TinDummy,
            Command::ProgPageConf
            | Command::ProgRandomFinConf
            | Command::ProgMultiplaneFinConf
            | Command::ProgMultiplaneFinRandomConf
            | Command::ProgInternalConf
            | Command::ProgInternalMultiplaneFinConf => Stage::Tin,
            Command::ProgMultiplaneCacheConf | Command::ProgCacheConf => Stage::TinCache,
            Command::ProgMultiplaneCacheFinConf => Stage::TinTail,

            Command::ReadCacheAddrInit => {
                if self.cache_load_first {
                    self.need_reset = true;
                    tracing::warn!(
                        die = self.id,
                        "redundant cache-read addressing without a cache read between"
                    );
                } else {
                    self.cache_load_first = true; // first cache busy still owed
                }
                Stage::Ale
            }
            Command::ReadPage
            | Command::ReadInternal
            | Command::ReadMultiplane
            | Command::ReadMultiplaneInit
            | Command::ReadMultiplaneInitFin
            | Command::ReadInternalMultiplane
            | Command::ReadInternalMultiplaneFin
            | Command::ReadRandom => Stage::Ale,
            Command::ReadMultiplaneInitConf => Stage::Idle,
            Command::ReadMultiplaneConf | Command::ReadRandomConf => Stage::Tor,
            Command::ReadCacheAddrInitConf => {
                if !self.cache_load_first && !self.cache_no_hide_ton {
                    self.need_reset = true;
                    tracing::warn!(die = self.id, "cache-read confirm without addressing");
                }
                self.cache_no_hide_ton = true; // the coming load pays full tR
                Stage::Ton
            }
            Command::ReadPageConf
            | Command::ReadInternalConf
            | Command::ReadMultiplaneInitFinConf
            | Command::ReadInternalMultiplaneFinConf
            | Command::ReadMultiplaneCacheConf => Stage::Ton,
            Command::ReadCache => {
                if !matches!(self.current_stage, Stage::Tor | Stage::Ton | Stage::Cle) {
                    // cache read must follow a normal page read
                    self.need_reset = true;
                    tracing::warn!(die = self.id, "cache read without a preceding page read");
                } else {
                    assert!(
                        self.row_reg[plane].is_some(),
                        "cache read without an open row"
                    );
                    // continuation carries no address cycles
                    self.col_reg[plane] = Some(0);
                    self.transfer_reg[plane] = Some(self.config.page_size);
                }
                Stage::Ton
            }
            Command::ReadMultiplaneCache => {
                let row = self.row_reg[plane].expect("multi-plane cache read without a row");
                let busy = self.array_time(row, ArrayOp::Dcbsyr1);
                self.next_activate += busy;
                self.fsm_time[FsmState::Cle.index()] += busy;
                Stage::Ton
            }

            Command::BlockErase | Command::BlockMultiplaneErase | Command::BlockMultiplaneEraseFin => {
                Stage::Ale
            }
            Command::BlockMultiplaneEraseFinConf => {
                self.standby_dc = false;
                let row = self.row_reg[plane].expect("erase confirm without a latched row");
                let erase_time = self.array_time(row, ArrayOp::Bers);
                self.next_activate += erase_time;
                self.power_time[DcRegion::Erase.index()] += erase_time;
                self.fsm_time[FsmState::Erase.index()] += erase_time;
                // every plane with a latched row takes part
                for idx in 0..self.planes.len() {
                    if let Some(row) = self.row_reg[idx].take() {
                        self.violations |= self.planes[idx].erase(row);
                    }
                }
                Stage::ReadStatus
            }
            Command::BlockEraseConf => {
                self.standby_dc = false;
                let row = self.row_reg[plane].expect("erase confirm without a latched row");
                let erase_time = self.array_time(row, ArrayOp::Bers);
                self.next_activate += erase_time;
                self.power_time[DcRegion::Erase.index()] += erase_time;
                self.fsm_time[FsmState::Erase.index()] += erase_time;
                self.violations |= self.planes[plane].erase(row);
                Stage::ReadStatus
            }
            Command::Reset => {
                let reset_time = self.params.timing.t_wb + self.params.timing.t_rst;
                self.next_activate += reset_time;
                self.fsm_time[FsmState::Tin.index()] += reset_time;
                Stage::ResetDelta
            }
            _ => Stage::NotDetermined,
        }
    }

    /// Data in: host buffer into the addressed plane's cache register.
    fn data_in(&mut self, plane: usize, packet: &StagePacket) -> Stage {
        self.nand_busy = false;

        if !self.command_reg.is_write_class() {
            self.need_reset = true;
            tracing::warn!(die = self.id, "data-in outside a program chain");
            return Stage::NotDetermined;
        }

        let bytes = self.transfer_reg[plane].expect("data-in without a transfer length");
        if let Some(buffer) = &packet.data {
            if !self.cache.is_empty() {
                let col = self.col_reg[plane].expect("data-in without a latched column") as usize;
                let data = buffer.borrow();
                self.cache[plane][col..col + bytes as usize]
                    .copy_from_slice(&data[col..col + bytes as usize]);
            }
        }

        self.next_activate = self.data_in_time(u64::from(bytes / self.config.io_bytes()));
        self.power_time[DcRegion::Prog.index()] += self.next_activate;
        self.standby_dc = false;

        if matches!(self.command_reg, Command::ProgRandom | Command::ProgRandomFin) {
            // random data-in pays the address-to-data latch gap once
            self.next_activate += self.params.timing.t_adl - self.params.timing.t_wc;
        }
        self.fsm_time[FsmState::Tir.index()] += self.next_activate;

        if matches!(
            self.command_reg,
            Command::ProgRandom | Command::ProgMultiplaneRandom
        ) {
            // another random sub-command follows
            Stage::Idle
        } else {
            Stage::Cle
        }
    }

    /// Array program, in its plain, cache, dummy, and tail flavors.
    fn array_program(&mut self, stage: Stage, plane: usize) -> Stage {
        self.nand_busy = true;

        if !self.command_reg.is_write_class() {
            self.need_reset = true;
            tracing::warn!(die = self.id, "array program outside a program chain");
            return Stage::NotDetermined;
        }

        let col = self.col_reg[plane].expect("array program without a latched column");
        let row = self.row_reg[plane].expect("array program without a latched row");
        let bytes = self.transfer_reg[plane].expect("array program without a transfer length");
        let cache = if self.cache.is_empty() {
            None
        } else {
            Some(&*self.cache[plane])
        };
        self.violations |= self.planes[plane].write(col, row, cache);

        self.power_time[DcRegion::Prog.index()] += self.array_time(row, ArrayOp::Prog);
        self.standby_dc = false;

        let next = match stage {
            Stage::TinCache => {
                // The next page's transfer and latches overlap this program.
                // When the overlap exceeds tPROG the bus is the bottleneck
                // and the stage pays the excess instead.
                let prog = self.array_time(row, ArrayOp::Prog);
                let latch = self.data_in_time(u64::from(bytes / self.config.io_bytes()))
                    + self.command_latch_time()
                    + self.address_latch_time(5);
                self.next_activate = prog.abs_diff(latch);
                Stage::Idle
            }
            Stage::TinDummy => {
                self.next_activate = self.array_time(row, ArrayOp::Dbsy);
                Stage::Idle
            }
            Stage::TinTail => {
                let ale_bytes = self.last_ale_bytes.expect("tail program without a latch record");
                let latch = self.command_latch_time()
                    + self.address_latch_time(u64::from(ale_bytes))
                    + self.data_in_time(u64::from(bytes / self.config.io_bytes()));
                self.next_activate = self.array_time(row, ArrayOp::Prog).saturating_sub(latch);
                self.last_ale_bytes = None;
                Stage::ReadStatus
            }
            _ => {
                self.next_activate = self.array_time(row, ArrayOp::Prog);
                Stage::ReadStatus
            }
        };
        self.fsm_time[FsmState::Tin.index()] += self.next_activate;
        self.transfer_reg[plane] = None;
        next
    }

    /// Array read: page into the cache register.
    fn array_read(&mut self, plane: usize) -> Stage {
        let row = self.row_reg[plane].expect("array read without a latched row");
        assert!(
            self.col_reg[plane].is_some(),
            "array read without a latched column"
        );
        assert!(
            self.transfer_reg[plane].is_some(),
            "array read without a transfer length"
        );
        self.nand_busy = true;

        if u32::from(addr::page_of(row)) >= self.config.pages_per_block {
            // cache reads walk the row register forward; past the last page
            // the state machine stops dead
            self.need_reset = true;
            tracing::warn!(die = self.id, row, "read past the last page of the block");
            return Stage::ReadStatus;
        }

        if self.command_reg == Command::ReadMultiplaneInitFinConf {
            // the FIN confirm loads every plane with a latched row at once
            for idx in 0..self.planes.len() {
                if let Some(row) = self.row_reg[idx] {
                    let cache = Self::cache_slot(&mut self.cache, idx);
                    self.violations |= self.planes[idx].read(0, row, cache);
                }
            }
        } else if self.command_reg != Command::ReadCacheAddrInitConf {
            // cache-read loads happen during the cache busy instead
            let cache = Self::cache_slot(&mut self.cache, plane);
            self.violations |= self.planes[plane].read(0, row, cache);
        }

        // overlapped cache and multi-plane loads draw the same per-plane power
        self.power_time[DcRegion::Read.index()] += self.params.timing.t_r;
        self.standby_dc = false;

        if self.command_reg == Command::ReadCache {
            if self.cache_no_hide_ton {
                self.next_activate = self.params.timing.t_r;
            } else if self.cache_load_first {
                self.next_activate = self.params.typical(ArrayOp::Dcbsyr1) + self.params.timing.t_rr;
                self.cache_load_first = false;
            } else {
                self.next_activate = self.params.typical(ArrayOp::Dcbsyr2) + self.params.timing.t_rr;
            }
            // the register now holds this page; aim the row at the next one
            self.row_reg[plane] = Some(row + 1);
        } else {
            self.next_activate = self.params.timing.t_r;
        }
        self.fsm_time[FsmState::Ton.index()] += self.next_activate;

        if self.cache_no_hide_ton {
            // full tR load done; wait for the data-out command
            self.cache_no_hide_ton = false;
            Stage::Idle
        } else if matches!(
            self.command_reg,
            Command::ReadMultiplaneInitFinConf
                | Command::ReadInternalConf
                | Command::ReadInternalMultiplaneFinConf
        ) {
            // plane selection (or the program half of a copyback) follows
            Stage::Idle
        } else {
            Stage::Tor
        }
    }

    fn cache_slot(cache: &mut [Box<[u8]>], idx: usize) -> Option<&mut [u8]> {
        cache.get_mut(idx).map(|slot| &mut **slot)
    }

    /// Data out: cache register to the host buffer.
    fn data_out(&mut self, plane: usize, packet: &StagePacket) -> Stage {
        self.nand_busy = false;

        if !self.command_reg.is_read_class() {
            self.need_reset = true;
            tracing::warn!(die = self.id, "data-out outside a read chain");
            return Stage::NotDetermined;
        }

        let col = self.col_reg[plane].expect("data-out without a latched column");
        let bytes = self.transfer_reg[plane].expect("data-out without a transfer length");
        assert!(
            u32::from(col) + bytes <= self.config.page_size,
            "data-out runs past the page"
        );
        if let Some(buffer) = &packet.data {
            if !self.cache.is_empty() {
                let col = col as usize;
                let mut data = buffer.borrow_mut();
                data[col..col + bytes as usize]
                    .copy_from_slice(&self.cache[plane][col..col + bytes as usize]);
            }
        }

        self.next_activate = self.data_out_time(u64::from(bytes / self.config.io_bytes()));
        self.fsm_time[FsmState::Tor.index()] += self.next_activate;
        self.power_time[DcRegion::Read.index()] += self.next_activate;
        self.standby_dc = false;
        self.transfer_reg[plane] = None;

        // any command may follow once the bus drains
        Stage::Idle
    }

    /// Status read: compose and deliver the status word.
    fn read_status(&mut self, packet: &StagePacket) -> Stage {
        self.nand_busy = false;
        self.next_activate = self.read_status_time();
        self.fsm_time[FsmState::Tor.index()] += self.next_activate;
        self.power_time[DcRegion::Read.index()] += self.next_activate;
        self.standby_dc = false;

        if let Some(cell) = &packet.status {
            // [17] needs reset, [16] busy, [15:0] the stage being reported on
            let mut word = u32::from(self.current_stage.code());
            if self.need_reset {
                word |= 1 << 17;
            }
            if self.next_activate != 0 {
                word |= 1 << 16;
            }
            cell.set(word);
        }
        Stage::Idle
    }

    // -----------------------------------------------------------------------
    // Reset
    // -----------------------------------------------------------------------

    /// Clear registers, chain state, and mode flags. Accumulators and plane
    /// contents survive.
    pub fn soft_reset(&mut self) {
        self.need_reset = false;
        self.current_stage = Stage::NotDetermined;
        self.expected_stage = Stage::Idle;
        self.next_activate = 0;
        self.last_ale_bytes = None;
        self.nx_command_count = None;
        for idx in 0..self.row_reg.len() {
            self.row_reg[idx] = None;
            self.col_reg[idx] = None;
            self.transfer_reg[idx] = None;
        }
        self.command_reg = Command::NotDetermined;
        self.standby_dc = true;
        self.leak_dc = true;
        self.nand_busy = false;
        self.cache_load_first = false;
        self.cache_no_hide_ton = false;
    }

    /// Reinitialize everything from a (possibly new) configuration.
    pub fn hard_reset(&mut self, start_time: u64, config: &DeviceConfig) {
        self.config = config.clone();
        self.current_time = start_time;
        self.clock_idle_time = 0;
        self.fsm_time = [0; FsmState::COUNT];
        self.power_time = [0; DcRegion::COUNT];
        self.violations = PlaneViolation::empty();
        for plane in &mut self.planes {
            plane.hard_reset(config);
        }
        self.soft_reset();
    }

    // -----------------------------------------------------------------------
    // Timing
    // -----------------------------------------------------------------------

    fn command_latch_time(&self) -> u64 {
        let t = &self.params.timing;
        t.t_wp + t.t_ds + t.t_dh
    }

    fn address_latch_time(&self, accesses: u64) -> u64 {
        let t = &self.params.timing;
        (t.t_cs - t.t_ds) + (t.t_ds + t.t_dh) * accesses
    }

    fn data_out_time(&self, accesses: u64) -> u64 {
        let t = &self.params.timing;
        t.t_rr + t.t_rc * accesses
    }

    fn data_in_time(&self, accesses: u64) -> u64 {
        self.params.timing.t_wc * accesses
    }

    fn read_status_time(&self) -> u64 {
        let t = &self.params.timing;
        t.t_ds + t.t_whr + t.t_rea + t.t_rc
    }

    /// Duration of an array operation for the addressed page, honoring the
    /// configured timing-variation mode.
    fn array_time(&self, row: u32, op: ArrayOp) -> u64 {
        let page = u32::from(addr::page_of(row));
        assert!(
            page < self.config.pages_per_block,
            "page offset beyond the block"
        );
        let typical = match self.env.timing_mode {
            TimingMode::Worst => false,
            TimingMode::Typical => true,
            // fast pages of a charge-multilevel cell pair
            TimingMode::Variation => page < 4 || page % 4 == 0 || page % 4 == 1,
            TimingMode::Cmlc => {
                page < 2 || page >= self.config.pages_per_block - 2 || page % 2 == 0
            }
        };
        if typical {
            self.params.typical(op)
        } else {
            self.params.worst(op)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nand_core::{
        AddressBits, DcParams, TimingParams, TraceSet, TypicalParams, shared_buffer, status_cell,
    };

    fn config() -> DeviceConfig {
        DeviceConfig {
            page_size: 256,
            spare_size: 0,
            pages_per_block: 8,
            blocks_per_plane: 32,
            planes_per_die: 2,
            dies_per_lu: 1,
            luns: 1,
            queue_depth: 1,
            io_pins: 8,
            nop: 1,
            max_erase_count: 100,
            device_id: 0,
            store: StoreMode::Buffered,
            bits: AddressBits::default(),
        }
        .finish()
    }

    fn params() -> Rc<ParamTable> {
        ParamTable {
            timing: TimingParams::default(),
            typical: TypicalParams::default(),
            dc: DcParams::default(),
            clock_period_ps: 1,
        }
        .shared()
    }

    fn die() -> Die {
        Die::new(
            0,
            &config(),
            params(),
            EnvConfig {
                timing_mode: TimingMode::Worst,
                ..EnvConfig::default()
            },
            TraceSet::disabled().shared(),
        )
    }

    fn packet(command: Command, row: u32, bytes: u32) -> StagePacket {
        let mut packet = StagePacket::new(0, 0);
        packet.command = command;
        packet.row = Some(row);
        packet.random_bytes = Some(bytes);
        packet
    }

    /// Walk one stage and drain its busy time.
    fn step(die: &mut Die, stage: Stage, packet: &StagePacket) -> Stage {
        let next = die.transit_stage(stage, packet);
        let busy = die.next_activate();
        die.update(busy);
        next
    }

    #[test]
    fn program_chain_walks_the_expected_stages() {
        let mut die = die();
        let data = shared_buffer(vec![0x5Au8; 256]);
        let mut pkt = packet(Command::ProgPage, addr::compose(0, 0, 0, 0), 256);
        pkt.data = Some(data);

        assert_eq!(step(&mut die, Stage::Cle, &pkt), Stage::Ale);
        assert_eq!(step(&mut die, Stage::Ale, &pkt), Stage::Tir);
        assert_eq!(step(&mut die, Stage::Tir, &pkt), Stage::Cle);
        pkt.command = Command::ProgPageConf;
        assert_eq!(step(&mut die, Stage::Cle, &pkt), Stage::Tin);
        assert_eq!(step(&mut die, Stage::Tin, &pkt), Stage::ReadStatus);
        assert_eq!(step(&mut die, Stage::ReadStatus, &pkt), Stage::Idle);

        assert!(die.is_free());
        assert_eq!(die.plane(0).nop_count(0, 0), 1);
        assert_eq!(die.plane(0).last_programmed_page(0), 0);
        assert!(die.power_time(DcRegion::Prog) > 0);
        assert_eq!(die.fsm_time(FsmState::Tin), die.params.timing.t_prog);
    }

    #[test]
    fn read_chain_returns_written_bytes() {
        let mut die = die();
        let row = addr::compose(0, 0, 1, 0);
        let data = shared_buffer(vec![0xC3u8; 256]);
        let mut pkt = packet(Command::ProgPage, row, 256);
        pkt.data = Some(data);
        step(&mut die, Stage::Cle, &pkt);
        step(&mut die, Stage::Ale, &pkt);
        step(&mut die, Stage::Tir, &pkt);
        pkt.command = Command::ProgPageConf;
        step(&mut die, Stage::Cle, &pkt);
        step(&mut die, Stage::Tin, &pkt);
        step(&mut die, Stage::ReadStatus, &pkt);

        let out = shared_buffer(vec![0u8; 256]);
        let mut pkt = packet(Command::ReadPage, row, 256);
        pkt.data = Some(out.clone());
        assert_eq!(step(&mut die, Stage::Cle, &pkt), Stage::Ale);
        assert_eq!(step(&mut die, Stage::Ale, &pkt), Stage::Cle);
        pkt.command = Command::ReadPageConf;
        assert_eq!(step(&mut die, Stage::Cle, &pkt), Stage::Ton);
        assert_eq!(step(&mut die, Stage::Ton, &pkt), Stage::Tor);
        assert_eq!(step(&mut die, Stage::Tor, &pkt), Stage::Idle);

        assert!(out.borrow().iter().all(|&b| b == 0xC3));
        assert_eq!(die.fsm_time(FsmState::Ton), die.params.timing.t_r);
        assert!(die.power_time(DcRegion::Read) > 0);
    }

    #[test]
    fn busy_die_refuses_transitions() {
        let mut die = die();
        let pkt = packet(Command::ReadPage, 0, 256);
        die.transit_stage(Stage::Cle, &pkt);
        assert!(die.fsm_busy());
        assert_eq!(die.transit_stage(Stage::Ale, &pkt), Stage::Busy);
    }

    #[test]
    fn data_in_outside_a_program_chain_poisons_the_die() {
        let mut die = die();
        let mut pkt = packet(Command::ReadPage, 0, 256);
        step(&mut die, Stage::Cle, &pkt);
        step(&mut die, Stage::Ale, &pkt);
        assert_eq!(die.transit_stage(Stage::Tir, &pkt), Stage::NotDetermined);
        assert!(die.needs_reset());

        // refused until a status read, which reports bit 17
        assert_eq!(die.transit_stage(Stage::Ale, &pkt), Stage::ReadStatus);
        let status = status_cell();
        pkt.status = Some(status.clone());
        step(&mut die, Stage::ReadStatus, &pkt);
        assert_ne!(status.get() & (1 << 17), 0);

        // and the reset command restores the machine
        pkt.command = Command::Reset;
        let next = step(&mut die, Stage::Cle, &pkt);
        assert_eq!(next, Stage::ResetDelta);
        die.transit_stage(Stage::ResetDelta, &pkt);
        assert!(!die.needs_reset());
        assert!(die.is_free());
    }

    #[test]
    fn erase_confirm_erases_every_latched_plane() {
        let mut die = die();
        // address both planes, then confirm
        let mut pkt = packet(Command::BlockMultiplaneErase, addr::compose(0, 0, 2, 0), 0);
        step(&mut die, Stage::Cle, &pkt);
        assert_eq!(step(&mut die, Stage::Ale, &pkt), Stage::Idle);
        pkt.command = Command::BlockMultiplaneEraseFin;
        pkt.row = Some(addr::compose(0, 1, 2, 0));
        step(&mut die, Stage::Cle, &pkt);
        assert_eq!(step(&mut die, Stage::Ale, &pkt), Stage::Cle);
        pkt.command = Command::BlockMultiplaneEraseFinConf;
        assert_eq!(step(&mut die, Stage::Cle, &pkt), Stage::ReadStatus);
        step(&mut die, Stage::ReadStatus, &pkt);

        assert_eq!(die.plane(0).erase_count(2), 1);
        assert_eq!(die.plane(1).erase_count(2), 1);
        assert!(die.fsm_time(FsmState::Erase) >= die.params.timing.t_bers);
        assert!(die.power_time(DcRegion::Erase) > 0);
    }

    #[test]
    fn update_splits_idle_into_leakage() {
        let mut die = die();
        die.update(1_000);
        assert_eq!(die.power_time(DcRegion::Leakage), 1_000);
        assert_eq!(die.clock_idle_time(), 1_000);
    }

    #[test]
    fn surplus_time_is_recorded_as_idle() {
        let mut die = die();
        let pkt = packet(Command::ReadPage, 0, 256);
        die.transit_stage(Stage::Cle, &pkt);
        let busy = die.next_activate();
        die.update(busy + 400);
        assert_eq!(die.next_activate(), 0);
        assert_eq!(die.clock_idle_time(), 400);
    }

    #[test]
    fn typical_timing_shortens_the_program() {
        let make = |mode| {
            Die::new(
                0,
                &config(),
                params(),
                EnvConfig {
                    timing_mode: mode,
                    ..EnvConfig::default()
                },
                TraceSet::disabled().shared(),
            )
        };
        let run = |mut die: Die| {
            let data = shared_buffer(vec![0u8; 256]);
            // page 3 sits below offset 4, a fast page under variation
            let mut pkt = packet(Command::ProgPage, addr::compose(0, 0, 0, 3), 256);
            pkt.data = Some(data);
            step(&mut die, Stage::Cle, &pkt);
            step(&mut die, Stage::Ale, &pkt);
            step(&mut die, Stage::Tir, &pkt);
            pkt.command = Command::ProgPageConf;
            step(&mut die, Stage::Cle, &pkt);
            step(&mut die, Stage::Tin, &pkt);
            die.fsm_time(FsmState::Tin)
        };
        let worst = run(make(TimingMode::Worst));
        let typical = run(make(TimingMode::Typical));
        let variation = run(make(TimingMode::Variation));
        assert!(typical < worst);
        assert_eq!(variation, typical, "page 3 sits in the fast half of its group");
    }

    #[test]
    fn nop_violation_is_reported_but_not_fatal() {
        let mut die = die();
        let row = addr::compose(0, 0, 0, 0);
        for _ in 0..2 {
            let data = shared_buffer(vec![0u8; 256]);
            let mut pkt = packet(Command::ProgPage, row, 256);
            pkt.data = Some(data);
            step(&mut die, Stage::Cle, &pkt);
            step(&mut die, Stage::Ale, &pkt);
            step(&mut die, Stage::Tir, &pkt);
            pkt.command = Command::ProgPageConf;
            step(&mut die, Stage::Cle, &pkt);
            step(&mut die, Stage::Tin, &pkt);
            step(&mut die, Stage::ReadStatus, &pkt);
        }
        assert!(die.take_violations().contains(PlaneViolation::NOP));
        assert!(die.take_violations().is_empty());
        assert!(!die.needs_reset());
    }
}
