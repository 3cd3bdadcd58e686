//! Logical unit: the dies sharing one command/data bus, and the
//! arbitration between them.
//!
//! Each die has its own FIFO of stage packets. At most one die owns the
//! bus at any instant; array stages (program, read, erase busy) run off
//! the bus, so several dies can work their arrays while a third drives
//! I/O. The unit steps every die forward whenever its current stage has
//! drained, substituting confirm commands into two-command sequences and
//! firing the completion callback when a packet chain finishes.

use std::collections::VecDeque;
use std::rc::Rc;

use nand_core::{
    Command, DcRegion, DeviceConfig, EnvConfig, FsmState, ParamTable, PlaneViolation, Stage,
    StagePacket, SubmitError, TraceHandle,
};
use nand_die::Die;

/// Per-transaction completion callback: `(trans_id, arrival, now)`.
pub type CompletionFn = Box<dyn FnMut(u32, u64, u64)>;

/// The confirm command of a two-command sequence.
#[must_use]
pub fn confirm_command(command: Command) -> Command {
    match command {
        Command::ReadPage => Command::ReadPageConf,
        Command::ProgPage => Command::ProgPageConf,
        Command::ProgCache => Command::ProgCacheConf,
        Command::ReadCacheAddrInit => Command::ReadCacheAddrInitConf,
        Command::ReadMultiplaneInit => Command::ReadMultiplaneInitConf,
        Command::ReadMultiplaneInitFin => Command::ReadMultiplaneInitFinConf,
        Command::ReadMultiplane => Command::ReadMultiplaneConf,
        Command::ProgMultiplane => Command::ProgMultiplaneConf,
        Command::ProgMultiplaneFin => Command::ProgMultiplaneFinConf,
        Command::ProgMultiplaneCache => Command::ProgMultiplaneCacheConf,
        Command::ProgMultiplaneCacheFin => Command::ProgMultiplaneCacheFinConf,
        Command::ReadInternal => Command::ReadInternalConf,
        Command::ProgInternal => Command::ProgInternalConf,
        Command::ReadInternalMultiplaneFin => Command::ReadInternalMultiplaneFinConf,
        Command::ProgInternalMultiplane => Command::ProgInternalMultiplaneConf,
        Command::ProgInternalMultiplaneFin => Command::ProgInternalMultiplaneFinConf,
        Command::BlockErase => Command::BlockEraseConf,
        Command::BlockMultiplaneEraseFin => Command::BlockMultiplaneEraseFinConf,
        Command::ProgRandomFin => Command::ProgRandomFinConf,
        Command::ReadRandom => Command::ReadRandomConf,
        Command::ProgMultiplaneRandomDummy => Command::ProgMultiplaneRandomDummyConf,
        Command::ProgMultiplaneFinRandom => Command::ProgMultiplaneFinRandomConf,
        _ => Command::NotDetermined,
    }
}

/// Commands that open a multi-command transaction; the transaction's
/// latency is measured from the first of them.
fn is_initial_command(command: Command) -> bool {
    matches!(
        command,
        Command::ReadMultiplaneInit
            | Command::ReadInternal
            | Command::ReadInternalMultiplane
            | Command::ReadInternalMultiplaneFin
            | Command::BlockMultiplaneErase
            | Command::ProgRandom
            | Command::ProgMultiplane
            | Command::ProgMultiplaneRandom
    )
}

/// A set of dies behind one shared command/data bus.
pub struct LogicalUnit {
    id: u32,
    current_time: u64,
    min_next_activate: u64,
    queue_depth: u32,
    dies: Vec<Die>,
    queues: Vec<VecDeque<StagePacket>>,
    request_traffic: Vec<u64>,
    io_completion: Vec<bool>,
    needs_callback: Vec<bool>,
    /// Arrival of the first command of a multi-command transaction.
    first_arrival: Vec<Option<u64>>,
    /// Host-clock idle per die from the most recent update.
    host_idle: Vec<u64>,
    bus_owner: Option<usize>,
    completion: Option<CompletionFn>,
    params: Rc<ParamTable>,
    trace: TraceHandle,
}

impl LogicalUnit {
    #[must_use]
    pub fn new(
        start_time: u64,
        config: &DeviceConfig,
        params: Rc<ParamTable>,
        env: EnvConfig,
        trace: TraceHandle,
    ) -> Self {
        let dies = config.dies_per_lu as usize;
        Self {
            id: 0,
            current_time: start_time,
            min_next_activate: 0,
            queue_depth: config.queue_depth,
            dies: (0..dies)
                .map(|_| Die::new(start_time, config, params.clone(), env, trace.clone()))
                .collect(),
            queues: vec![VecDeque::new(); dies],
            request_traffic: vec![0; dies],
            io_completion: vec![false; dies],
            needs_callback: vec![false; dies],
            first_arrival: vec![None; dies],
            host_idle: vec![0; dies],
            bus_owner: None,
            completion: None,
            params,
            trace,
        }
    }

    pub fn set_completion(&mut self, completion: CompletionFn) {
        self.completion = Some(completion);
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
        let dies = self.dies.len() as u32;
        for (idx, die) in self.dies.iter_mut().enumerate() {
            die.set_id(id * dies + idx as u32);
        }
    }

    /// Queue one stage packet on its die's bus.
    ///
    /// A reset flushes the die's queue before queuing itself. Arriving
    /// transfer bytes count toward the die's request traffic, except for
    /// addressing-only commands.
    pub fn issue(&mut self, packet: StagePacket) -> Result<(), SubmitError> {
        let die = packet.die() as usize;
        if packet.command == Command::Reset {
            self.queues[die].clear();
        } else if self.queues[die].len() >= self.queue_depth as usize {
            tracing::warn!(
                lun = self.id,
                die,
                trans = packet.stage_id,
                "stage queue full; packet refused"
            );
            return Err(SubmitError::DieBusy);
        }
        tracing::debug!(
            lun = self.id,
            die,
            trans = packet.stage_id,
            command = ?packet.command,
            "stage packet queued"
        );

        if let Some(bytes) = packet.random_bytes {
            if !matches!(
                packet.command,
                Command::ReadMultiplaneInit
                    | Command::ReadMultiplaneInitFin
                    | Command::ReadCacheAddrInit
            ) {
                self.request_traffic[die] += u64::from(bytes);
            }
        }
        self.trace.borrow_mut().bus_transaction(
            self.id,
            die as u8,
            packet.stage_id,
            &format!("{:?}", packet.command),
            packet.arrival_cycle,
        );
        self.queues[die].push_back(packet);
        // patch the new head forward in delta time
        self.update(0);
        Ok(())
    }

    /// Push time into every die, fire completions, and sequence the next
    /// stages, retrying once if a bus conflict blocked a die and the bus
    /// freed up during the sweep.
    pub fn update(&mut self, dt: u64) {
        self.current_time += dt;
        let clock = self.params.clock_period_ps;
        let mut transit_failed = false;

        for die_idx in 0..self.dies.len() {
            self.host_idle[die_idx] = 0;
            if dt != 0 {
                // the die consumes at most its remaining busy time, rounded
                // up to a whole clock; the rest is host-side idle
                let mut adjust = self.dies[die_idx].next_activate();
                if adjust % clock != 0 {
                    adjust += clock - (adjust % clock);
                }
                let mut given = dt;
                if given > adjust {
                    self.host_idle[die_idx] = given - adjust;
                    given = adjust;
                }
                self.dies[die_idx].update(given);
            }

            if self.dies[die_idx].is_free() && self.io_completion[die_idx] {
                let packet = self.queues[die_idx]
                    .pop_front()
                    .expect("completed die with an empty queue");
                if self.needs_callback[die_idx] {
                    let arrival = self.first_arrival[die_idx]
                        .take()
                        .unwrap_or(packet.arrival_cycle);
                    self.trace.borrow_mut().io_completion(
                        self.id,
                        packet.stage_id,
                        arrival,
                        self.current_time,
                    );
                    if let Some(completion) = &mut self.completion {
                        completion(packet.stage_id, arrival, self.current_time);
                    }
                    self.needs_callback[die_idx] = false;
                }
                self.io_completion[die_idx] = false;
            }

            // a die working its array, or one with nothing queued, has no
            // claim on the bus
            if self.queues[die_idx].is_empty() || !self.dies[die_idx].rb_ready() {
                self.release_bus(die_idx);
            }

            self.try_advance(die_idx, &mut transit_failed);
        }

        if transit_failed && self.bus_owner.is_none() {
            let mut failed_again = false;
            for die_idx in 0..self.dies.len() {
                if self.try_advance(die_idx, &mut failed_again) {
                    break;
                }
            }
        }

        self.min_next_activate = self
            .dies
            .iter()
            .map(Die::next_activate)
            .filter(|&n| n > 0)
            .min()
            .unwrap_or(0);
    }

    /// Step one die if its current stage has drained. Returns whether a
    /// transition was issued; `failed` records a bus-denied attempt.
    fn try_advance(&mut self, die_idx: usize, failed: &mut bool) -> bool {
        if self.dies[die_idx].fsm_busy() || self.queues[die_idx].is_empty() {
            return false;
        }
        let mut expected = self.dies[die_idx].expected_next_stage();

        // a poisoned die only ever accepts the recovery commands; route a
        // queued status read or reset through the fresh-packet path no
        // matter what the broken chain expected next
        if self.dies[die_idx].needs_reset()
            && expected != Stage::ResetDelta
            && matches!(
                self.queues[die_idx][0].command,
                Command::Reset | Command::ReadStatus
            )
        {
            expected = Stage::Idle;
        }

        if expected == Stage::Idle {
            // a fresh packet starts with a command latch (or goes straight
            // to the status read) and that needs the bus
            if self.bus_owner.is_some() {
                tracing::debug!(
                    lun = self.id,
                    die = die_idx,
                    owner = ?self.bus_owner,
                    "bus held; command latch deferred"
                );
                *failed = true;
                return false;
            }
            self.acquire_bus(die_idx);
            let packet = &self.queues[die_idx][0];
            let stage = if packet.command == Command::ReadStatus {
                Stage::ReadStatus
            } else {
                Stage::Cle
            };
            if is_initial_command(packet.command) && self.first_arrival[die_idx].is_none() {
                self.first_arrival[die_idx] = Some(packet.arrival_cycle);
            }
            if self.dies[die_idx].transit_stage(stage, &self.queues[die_idx][0]) == Stage::Idle {
                // single-stage packets (status read, completed reset)
                // finish right here
                if self.queues[die_idx][0].last_of_transaction {
                    self.needs_callback[die_idx] = true;
                }
                self.io_completion[die_idx] = true;
            }
            return true;
        }

        if expected == Stage::NotDetermined {
            return false;
        }

        // continuing the packet already in flight
        if expected.uses_bus() {
            if self.bus_owner != Some(die_idx) {
                self.acquire_bus(die_idx);
                if self.bus_owner != Some(die_idx) {
                    tracing::debug!(
                        lun = self.id,
                        die = die_idx,
                        owner = ?self.bus_owner,
                        stage = ?expected,
                        "bus held; stage deferred"
                    );
                    *failed = true;
                    return false;
                }
            }
        } else {
            self.release_bus(die_idx);
        }

        if expected == Stage::Cle {
            // the second command of an initial/confirm pair
            let front = &mut self.queues[die_idx][0];
            front.command = confirm_command(front.command);
        }
        if self.dies[die_idx].transit_stage(expected, &self.queues[die_idx][0]) == Stage::Idle {
            if self.queues[die_idx][0].last_of_transaction {
                self.needs_callback[die_idx] = true;
            }
            self.io_completion[die_idx] = true;
        }
        true
    }

    fn acquire_bus(&mut self, die_idx: usize) {
        if self.bus_owner.is_none() {
            self.bus_owner = Some(die_idx);
        }
    }

    fn release_bus(&mut self, die_idx: usize) {
        if self.bus_owner == Some(die_idx) {
            self.bus_owner = None;
        }
    }

    /// Busy state of one die (or any die, with `None`): the state machine
    /// is consuming time or packets are still queued.
    #[must_use]
    pub fn check_busy(&self, die: Option<usize>) -> bool {
        match die {
            Some(die) => self.dies[die].fsm_busy() || !self.queues[die].is_empty(),
            None => (0..self.dies.len()).any(|die| self.check_busy(Some(die))),
        }
    }

    /// True while the die's state machine is not consuming time.
    #[must_use]
    pub fn is_die_idle(&self, die: usize) -> bool {
        die < self.dies.len() && !self.dies[die].fsm_busy()
    }

    /// Least remaining busy time across the dies, zero when all are idle.
    #[must_use]
    pub fn min_next_activity(&self) -> u64 {
        self.min_next_activate
    }

    #[must_use]
    pub fn is_bus_active(&self) -> bool {
        self.bus_owner.is_some()
    }

    #[must_use]
    pub fn current_time(&self, die: usize) -> u64 {
        self.dies[die].current_time()
    }

    /// Sub-cycle idle remainder of one die from the latest update.
    #[must_use]
    pub fn die_clock_idle(&self, die: usize) -> u64 {
        self.dies[die].clock_idle_time()
    }

    /// Host-clock idle of one die from the latest update.
    #[must_use]
    pub fn die_host_idle(&self, die: usize) -> u64 {
        self.host_idle[die]
    }

    #[must_use]
    pub fn request_traffic(&self, die: usize) -> u64 {
        self.request_traffic[die]
    }

    #[must_use]
    pub fn fsm_time(&self, state: FsmState, die: usize) -> u64 {
        self.dies[die].fsm_time(state)
    }

    #[must_use]
    pub fn power_time(&self, region: DcRegion, die: usize) -> u64 {
        self.dies[die].power_time(region)
    }

    #[must_use]
    pub fn die(&self, die: usize) -> &Die {
        &self.dies[die]
    }

    /// Drain the plane violations one die has accumulated.
    pub fn take_violations(&mut self, die: usize) -> PlaneViolation {
        self.dies[die].take_violations()
    }

    /// Request bytes summed over the dies.
    #[must_use]
    pub fn accumulated_traffic(&self) -> u64 {
        self.request_traffic.iter().sum()
    }

    /// Emit each die's per-state accumulators into the trace stream.
    pub fn report_time_per_each_state(&self) {
        let mut trace = self.trace.borrow_mut();
        for die in &self.dies {
            for state in FsmState::ALL {
                trace.state_cycles(self.id, die.id(), &format!("{state:?}"), die.fsm_time(state));
            }
        }
    }

    /// Emit each die's DC power-cycle accumulators, with the derived
    /// current and power, into the trace stream.
    pub fn report_power_time_per_each_dc(&self) {
        let dc = &self.params.dc;
        let mut trace = self.trace.borrow_mut();
        for die in &self.dies {
            for region in DcRegion::ALL {
                let cycles = die.power_time(region);
                let draw = match region {
                    DcRegion::Read => dc.icc1,
                    DcRegion::Prog => dc.icc2,
                    DcRegion::Erase => dc.icc3,
                    DcRegion::Standby => dc.isb1 + dc.isb2,
                    DcRegion::Leakage => dc.ili + dc.ilo,
                };
                let current = cycles as f64 / 1_000.0 * draw as f64;
                let power = current * dc.vcc as f64 / 1_000.0;
                trace.power_cycles(
                    self.id,
                    die.id(),
                    &format!("{region:?}"),
                    cycles,
                    current,
                    power,
                );
            }
        }
    }

    /// Reinitialize from a (possibly new) configuration.
    pub fn hard_reset(&mut self, start_time: u64, config: &DeviceConfig) {
        self.current_time = start_time;
        self.min_next_activate = 0;
        self.bus_owner = None;
        self.queue_depth = config.queue_depth;
        for die in 0..self.dies.len() {
            self.host_idle[die] = 0;
            self.request_traffic[die] = 0;
            self.io_completion[die] = false;
            self.needs_callback[die] = false;
            self.first_arrival[die] = None;
            self.queues[die].clear();
            self.dies[die].hard_reset(start_time, config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nand_core::{AddressBits, StoreMode, TraceSet, addr, status_cell};

    fn config() -> DeviceConfig {
        DeviceConfig {
            page_size: 64,
            spare_size: 0,
            pages_per_block: 4,
            blocks_per_plane: 16,
            planes_per_die: 2,
            dies_per_lu: 2,
            luns: 1,
            queue_depth: 1,
            io_pins: 8,
            nop: 1,
            max_erase_count: 100,
            device_id: 0,
            store: StoreMode::Discard,
            bits: AddressBits::default(),
        }
        .finish()
    }

    fn unit() -> LogicalUnit {
        let config = config();
        LogicalUnit::new(
            0,
            &config,
            ParamTable::default().shared(),
            EnvConfig::default(),
            TraceSet::disabled().shared(),
        )
    }

    fn packet(id: u32, command: Command, die: u8) -> StagePacket {
        let mut packet = StagePacket::new(id, 0);
        packet.command = command;
        packet.row = Some(addr::compose(die, 0, 0, 0));
        packet.random_bytes = Some(64);
        packet
    }

    /// Step until nothing is queued or busy.
    fn drain(unit: &mut LogicalUnit) {
        let mut guard = 0;
        while unit.check_busy(None) {
            match unit.min_next_activity() {
                0 => unit.update(1),
                n => unit.update(n),
            }
            guard += 1;
            assert!(guard < 100_000, "logical unit failed to go idle");
        }
    }

    #[test]
    fn queue_depth_is_enforced() {
        let mut unit = unit();
        unit.issue(packet(0, Command::ProgPage, 0)).expect("first packet");
        assert_eq!(
            unit.issue(packet(1, Command::ProgPage, 0)),
            Err(SubmitError::DieBusy)
        );
        // the other die has its own queue
        unit.issue(packet(2, Command::ProgPage, 1)).expect("other die");
    }

    #[test]
    fn status_read_packet_completes_on_its_own() {
        let mut unit = unit();
        let status = status_cell();
        let mut status_packet = packet(0, Command::ReadStatus, 0);
        status_packet.status = Some(status.clone());
        status_packet.last_of_transaction = true;
        unit.issue(status_packet).expect("status read queues");
        drain(&mut unit);

        assert!(!unit.check_busy(Some(0)));
        // busy bit is composed while the read itself is draining
        assert_ne!(status.get() & (1 << 16), 0);
        assert_eq!(status.get() & (1 << 17), 0);
    }

    #[test]
    fn reset_packet_recovers_a_poisoned_die() {
        let mut unit = unit();
        // a cache read with no preceding page read poisons the chain
        unit.issue(packet(0, Command::ReadCache, 0))
            .expect("bad chain queues");
        for _ in 0..64 {
            unit.update(1_000);
        }
        assert!(unit.die(0).needs_reset());

        let mut reset = packet(1, Command::Reset, 0);
        reset.last_of_transaction = true;
        unit.issue(reset).expect("reset replaces the queue");
        drain(&mut unit);

        assert!(!unit.die(0).needs_reset());
        assert!(unit.die(0).is_free());
    }

    #[test]
    fn request_traffic_skips_addressing_only_commands() {
        let mut lu = unit();
        lu.issue(packet(0, Command::ReadMultiplaneInit, 0))
            .expect("addressing packet");
        assert_eq!(lu.request_traffic(0), 0);
        drain(&mut lu);

        let mut lu = unit();
        lu.issue(packet(0, Command::ReadPage, 0)).expect("read packet");
        assert_eq!(lu.request_traffic(0), 64);
    }
}
