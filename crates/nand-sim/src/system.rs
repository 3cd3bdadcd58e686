//! The embedder-facing facade: transaction submission, the cycle-update
//! interfaces, busy inquiries, and completion dispatch.
//!
//! One incoming-transaction slot exists per bus. Single-shot operations
//! occupy the slot until their interrupt fires; multi-part operations
//! (multi-plane, cache) may be re-submitted while the outstanding slot
//! holds the same operation class. The slot does not validate command
//! order — a wrong sequence is caught by the die and surfaced through its
//! status word.

use std::cell::RefCell;
use std::rc::Rc;

use nand_core::{
    DeviceConfig, EnvConfig, IsrType, ParamTable, PlaneViolation, TraceHandle, TraceSet, TransOp,
    Transaction, SubmitError,
};

use crate::controller::Controller;

/// Host completion callback: `(host_trans_id, bus, current_time)`.
pub type HostCompletion = Box<dyn FnMut(u32, u32, u64)>;

/// The whole simulated subsystem behind the submission interfaces.
pub struct NandFlashSystem {
    controller: Controller,
    config: DeviceConfig,
    params: Rc<ParamTable>,
    current_time: u64,
    incoming: Rc<RefCell<Vec<Option<Transaction>>>>,
    trace: TraceHandle,
}

impl NandFlashSystem {
    #[must_use]
    pub fn new(
        start_time: u64,
        config: &DeviceConfig,
        params: Rc<ParamTable>,
        env: EnvConfig,
        trace: TraceSet,
        callback: Option<HostCompletion>,
    ) -> Self {
        let trace = trace.shared();
        let mut controller = Controller::new(start_time, config, &params, env, &trace);
        let incoming: Rc<RefCell<Vec<Option<Transaction>>>> =
            Rc::new(RefCell::new(vec![None; config.buses() as usize]));

        // the interrupt service routine retires the incoming slot and
        // forwards the completion to the host
        let isr_slots = incoming.clone();
        let callback = RefCell::new(callback);
        controller.set_system_isr(Box::new(move |isr, bus, now| match isr {
            IsrType::CompleteTrans => {
                let retired = isr_slots.borrow_mut()[bus as usize].take();
                if let (Some(trans), Some(callback)) = (retired, callback.borrow_mut().as_mut()) {
                    callback(trans.host_id, bus, now);
                }
            }
        }));

        Self {
            controller,
            config: config.clone(),
            params,
            current_time: start_time,
            incoming,
            trace,
        }
    }

    fn bus_of(&self, addr: u32) -> usize {
        let die = self.config.decompose(addr).die;
        self.config.bus_of(0, die) as usize
    }

    /// True when a transaction occupies the bus slot and a new one of
    /// this operation class may not join it.
    fn slot_refuses(&self, bus: usize, op: TransOp) -> bool {
        match &self.incoming.borrow()[bus] {
            None => false,
            // single-shot operations never share the slot; multi-part
            // operations may repeat while the class matches
            Some(pending) => {
                matches!(op, TransOp::Read | TransOp::Prog) || pending.op != op
            }
        }
    }

    /// Submit a fully specified transaction.
    pub fn add_transaction(&mut self, trans: Transaction) -> Result<(), SubmitError> {
        let bus = self.bus_of(trans.addr);
        if self.slot_refuses(bus, trans.op) {
            tracing::warn!(
                bus,
                op = ?trans.op,
                "incompatible transaction outstanding; submission refused"
            );
            return Err(SubmitError::FlashBusy);
        }
        self.controller.build_and_add(&trans)?;
        self.incoming.borrow_mut()[bus] = Some(trans);
        Ok(())
    }

    /// Submit a whole-page operation with defaults.
    ///
    /// Multi-plane cache/random programs need the last-flag form and
    /// internal data movement needs the source/destination form; both are
    /// refused here.
    pub fn add_simple(&mut self, host_id: u32, op: TransOp, addr: u32) -> Result<(), SubmitError> {
        if matches!(
            op,
            TransOp::ProgMultiplaneCache
                | TransOp::ProgMultiplaneRandom
                | TransOp::InternalDataMovement
                | TransOp::InternalDataMovementMultiplane
        ) {
            tracing::warn!(?op, "operation needs its dedicated submission form");
            return Err(SubmitError::Unsupported);
        }
        let mut trans = Transaction::new(host_id, op, addr);
        trans.num_bytes = self.config.page_size;
        self.add_transaction(trans)
    }

    /// Submit a whole-page operation carrying the last-sub-transaction
    /// flag (multi-plane cache and random programs).
    pub fn add_with_last(
        &mut self,
        host_id: u32,
        op: TransOp,
        addr: u32,
        last: bool,
    ) -> Result<(), SubmitError> {
        let mut trans = Transaction::new(host_id, op, addr);
        trans.num_bytes = self.config.page_size;
        trans.last_nx_sub = last;
        self.add_transaction(trans)
    }

    /// Submit an internal data movement from `src` to `dest`.
    pub fn add_move(
        &mut self,
        host_id: u32,
        op: TransOp,
        src: u32,
        dest: u32,
    ) -> Result<(), SubmitError> {
        let mut trans = Transaction::new(host_id, op, src);
        trans.dest_addr = Some(dest);
        trans.num_bytes = self.config.page_size;
        self.add_transaction(trans)
    }

    // -----------------------------------------------------------------------
    // Cycle updates
    // -----------------------------------------------------------------------

    /// Feed a fixed number of clock cycles into the device.
    pub fn update(&mut self, cycles: u64) {
        if cycles != 0 {
            let dt = cycles * self.params.clock_period_ps;
            self.current_time += dt;
            self.controller.update(dt);
        }
    }

    /// Jump straight to the next state change, skipping idle time.
    /// Returns the cycles consumed (zero when nothing is pending).
    pub fn update_without_idle_cycles(&mut self) -> u64 {
        let mut min_time = self.controller.min_next_activity();
        if min_time == 0 {
            return 0;
        }
        let clock = self.params.clock_period_ps;
        if min_time % clock != 0 {
            min_time += clock - (min_time % clock);
        }
        self.current_time += min_time;
        self.controller.update(min_time);
        min_time / clock
    }

    /// Consume a cycle budget in next-activity steps; whatever is left
    /// when the device goes idle ticks over as idle time.
    pub fn update_back_to_back(&mut self, cycles: u64) {
        let clock = self.params.clock_period_ps;
        let mut cycles = cycles;
        let mut min_time = self.controller.min_next_activity();

        if min_time == 0 {
            for bus in 0..self.config.buses() as usize {
                if self.is_busy(bus as u16) {
                    self.controller.update(0);
                    break;
                }
            }
            self.controller.tick_over(cycles * clock);
            return;
        }

        let mut min_cycles = min_time.div_ceil(clock);
        while min_cycles < cycles {
            self.current_time += min_cycles * clock;
            self.controller.update(min_cycles * clock);
            cycles -= min_cycles;

            min_time = self.controller.min_next_activity();
            if min_time == 0 {
                self.controller.tick_over(cycles * clock);
                return;
            }
            min_cycles = min_time.div_ceil(clock);
        }
        if cycles != 0 {
            self.current_time += cycles * clock;
            self.controller.update(cycles * clock);
        }
    }

    /// Stall the host for `cycles`; the bubble is absorbed as idle before
    /// any simulation time advances.
    pub fn delay_update(&mut self, cycles: u64) {
        self.controller
            .delay_update(cycles * self.params.clock_period_ps);
    }

    // -----------------------------------------------------------------------
    // Inquiries
    // -----------------------------------------------------------------------

    /// A transaction is outstanding on this bus.
    #[must_use]
    pub fn is_busy(&self, bus: u16) -> bool {
        self.incoming.borrow()[bus as usize].is_some()
    }

    /// Number of buses with an outstanding transaction.
    #[must_use]
    pub fn busy_die_count(&self) -> u32 {
        self.incoming
            .borrow()
            .iter()
            .filter(|slot| slot.is_some())
            .count() as u32
    }

    /// Any transaction outstanding anywhere.
    #[must_use]
    pub fn is_active_mode(&self) -> bool {
        self.incoming.borrow().iter().any(Option::is_some)
    }

    #[must_use]
    pub fn is_io_bus_active(&self) -> bool {
        self.controller.is_io_bus_active()
    }

    fn cycles_from_time(&self, time: u64) -> u64 {
        if time == 0 {
            0
        } else {
            time.div_ceil(self.params.clock_period_ps)
        }
    }

    /// Cycles until the next state change.
    #[must_use]
    pub fn min_next_activity(&self) -> u64 {
        self.cycles_from_time(self.controller.min_next_activity())
    }

    /// Cycles until the next state change while the bus is held.
    #[must_use]
    pub fn min_io_bus_activity(&self) -> u64 {
        self.cycles_from_time(self.controller.min_io_bus_activity())
    }

    #[must_use]
    pub fn current_time(&self) -> u64 {
        self.controller.current_time()
    }

    #[must_use]
    pub fn tick_over_time(&self) -> u64 {
        self.controller.tick_over_time()
    }

    #[must_use]
    pub fn clock_period(&self) -> u64 {
        self.params.clock_period_ps
    }

    #[must_use]
    pub fn device_config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller {
        &mut self.controller
    }

    #[must_use]
    pub fn nand_clock_idle_time(&self, lun: usize, die: usize) -> u64 {
        self.controller.nand_clock_idle_time(lun, die)
    }

    /// Host idle summed over the LUNs.
    #[must_use]
    pub fn host_clock_idle_time(&self) -> u64 {
        (0..self.config.luns as usize)
            .map(|lun| self.controller.lun_host_idle_time(lun))
            .sum()
    }

    /// Contention summed over every die.
    #[must_use]
    pub fn resource_contention_time(&self) -> u64 {
        let mut total = 0;
        for lun in 0..self.config.luns as usize {
            for die in 0..self.config.dies_per_lu as usize {
                total += self.controller.resource_contention_time(lun, die);
            }
        }
        total
    }

    /// Bus-stage time summed over every die.
    #[must_use]
    pub fn active_bus_time(&self) -> u64 {
        let mut total = 0;
        for lun in 0..self.config.luns as usize {
            for die in 0..self.config.dies_per_lu as usize {
                total += self.controller.active_bus_time(lun, die);
            }
        }
        total
    }

    /// Time the arrays spent outside bus transfers and idle.
    #[must_use]
    pub fn cell_active_time(&self) -> u64 {
        self.controller.current_time() - self.active_bus_time() - self.tick_over_time()
    }

    /// Drain the plane violations a die has accumulated.
    pub fn take_violations(&mut self, lun: usize, die: usize) -> PlaneViolation {
        self.controller.take_violations(lun, die)
    }

    // -----------------------------------------------------------------------
    // Control and reports
    // -----------------------------------------------------------------------

    /// Reinitialize the whole stack from a (possibly new) configuration.
    pub fn hard_reset(&mut self, start_time: u64, config: &DeviceConfig) {
        self.config = config.clone();
        self.current_time = start_time;
        for slot in self.incoming.borrow_mut().iter_mut() {
            *slot = None;
        }
        self.controller.hard_reset(start_time, config);
        self.trace.borrow_mut().markup_hard_reset();
    }

    /// Print the device configuration to stdout.
    pub fn report_configuration(&self) {
        let cfg = &self.config;
        println!("NAND flash device configuration ***********************");
        println!("Device id            : {:#x}", cfg.device_id);
        println!("Page size            : {}", cfg.page_size);
        println!("Pages per block      : {}", cfg.pages_per_block);
        println!("Blocks per plane     : {}", cfg.blocks_per_plane);
        println!("Planes per die       : {}", cfg.planes_per_die);
        println!("Dies per LUN         : {}", cfg.dies_per_lu);
        println!("I/O pins             : {}", cfg.io_pins);
        println!("NOP                  : {}", cfg.nop);
        println!("Max erase count      : {}", cfg.max_erase_count);
        println!("Clock period (ps)    : {}", self.params.clock_period_ps);
        println!();
    }

    /// Print the performance report and emit the statistics streams.
    pub fn report_statistics(&self) {
        self.controller.report_performance();
        self.controller.report_statistics();
        self.trace.borrow_mut().flush();
    }
}
