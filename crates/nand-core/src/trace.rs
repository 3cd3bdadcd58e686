//! Append-only trace streams.
//!
//! Each stream is a CSV file under the trace directory, opened lazily the
//! first time an enabled stream is written and prefixed with its header
//! row. Streams the profile leaves off cost a flag test and nothing else.

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::rc::Rc;

use crate::params::TraceSwitches;

/// Stream identifiers, one file each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStream {
    PlaneRead,
    PlaneWrite,
    InternalState,
    BusTransaction,
    IoCompletion,
    CyclesForEachState,
    PowerCyclesForEachDc,
}

const STREAM_COUNT: usize = 7;

impl TraceStream {
    fn index(self) -> usize {
        self as usize
    }

    fn file_name(self) -> &'static str {
        match self {
            TraceStream::PlaneRead => "plane_read.csv",
            TraceStream::PlaneWrite => "plane_write.csv",
            TraceStream::InternalState => "internal_state.csv",
            TraceStream::BusTransaction => "bus_transaction.csv",
            TraceStream::IoCompletion => "io_completion.csv",
            TraceStream::CyclesForEachState => "cycles_for_each_state.csv",
            TraceStream::PowerCyclesForEachDc => "power_cycles_for_each_dc.csv",
        }
    }

    fn header(self) -> &'static str {
        match self {
            TraceStream::PlaneRead | TraceStream::PlaneWrite => {
                "plane_id,block,page"
            }
            TraceStream::InternalState => "die_id,trans_id,command,stage,current_time,busy_time",
            TraceStream::BusTransaction => "lun_id,die_id,trans_id,command,arrival_cycle",
            TraceStream::IoCompletion => {
                "lun_id,trans_id,arrival_cycle,current_cycle,latency"
            }
            TraceStream::CyclesForEachState => "controller_id,die_id,fsm_state,cycles",
            TraceStream::PowerCyclesForEachDc => {
                "controller_id,die_id,dc_param,cycles,current,power"
            }
        }
    }

    fn enabled(self, switches: TraceSwitches) -> bool {
        match self {
            TraceStream::PlaneRead => switches.plane_read,
            TraceStream::PlaneWrite => switches.plane_write,
            TraceStream::InternalState => switches.internal_state,
            TraceStream::BusTransaction => switches.bus_transaction,
            TraceStream::IoCompletion => switches.io_completion,
            TraceStream::CyclesForEachState => switches.cycles_for_each_state,
            TraceStream::PowerCyclesForEachDc => switches.power_cycles_for_each_dc,
        }
    }
}

/// The set of trace streams shared by every simulator layer.
pub struct TraceSet {
    dir: PathBuf,
    switches: TraceSwitches,
    writers: [Option<BufWriter<File>>; STREAM_COUNT],
}

/// Shared handle; the simulator is single-threaded.
pub type TraceHandle = Rc<RefCell<TraceSet>>;

impl TraceSet {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, switches: TraceSwitches) -> Self {
        Self {
            dir: dir.into(),
            switches,
            writers: std::array::from_fn(|_| None),
        }
    }

    /// All streams off; writes are flag tests only.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new("trace", TraceSwitches::default())
    }

    #[must_use]
    pub fn shared(self) -> TraceHandle {
        Rc::new(RefCell::new(self))
    }

    fn writer(&mut self, stream: TraceStream) -> Option<&mut BufWriter<File>> {
        if !stream.enabled(self.switches) {
            return None;
        }
        let slot = &mut self.writers[stream.index()];
        if slot.is_none() {
            if let Err(err) = fs::create_dir_all(&self.dir) {
                tracing::warn!(dir = %self.dir.display(), %err, "cannot create trace directory");
                self.switches = TraceSwitches::default();
                return None;
            }
            let path = self.dir.join(stream.file_name());
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    let mut writer = BufWriter::new(file);
                    let _ = writeln!(writer, "{}", stream.header());
                    *slot = Some(writer);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "cannot open trace stream");
                    return None;
                }
            }
        }
        slot.as_mut()
    }

    fn emit(&mut self, stream: TraceStream, line: std::fmt::Arguments<'_>) {
        if let Some(writer) = self.writer(stream) {
            let _ = writeln!(writer, "{line}");
        }
    }

    pub fn plane_read(&mut self, plane_id: u32, block: u16, page: u8) {
        self.emit(TraceStream::PlaneRead, format_args!("{plane_id},{block},{page}"));
    }

    pub fn plane_write(&mut self, plane_id: u32, block: u16, page: u8) {
        self.emit(TraceStream::PlaneWrite, format_args!("{plane_id},{block},{page}"));
    }

    pub fn internal_state(
        &mut self,
        die_id: u32,
        trans_id: u32,
        command: &str,
        stage: &str,
        current_time: u64,
        busy_time: u64,
    ) {
        self.emit(
            TraceStream::InternalState,
            format_args!("{die_id},{trans_id},{command},{stage},{current_time},{busy_time}"),
        );
    }

    pub fn bus_transaction(&mut self, lun_id: u32, die_id: u8, trans_id: u32, command: &str, arrival: u64) {
        self.emit(
            TraceStream::BusTransaction,
            format_args!("{lun_id},{die_id},{trans_id},{command},{arrival}"),
        );
    }

    pub fn io_completion(&mut self, lun_id: u32, trans_id: u32, arrival: u64, now: u64) {
        self.emit(
            TraceStream::IoCompletion,
            format_args!("{lun_id},{trans_id},{arrival},{now},{}", now - arrival),
        );
    }

    pub fn state_cycles(&mut self, controller_id: u32, die_id: u32, state: &str, cycles: u64) {
        self.emit(
            TraceStream::CyclesForEachState,
            format_args!("{controller_id},{die_id},{state},{cycles}"),
        );
    }

    pub fn power_cycles(
        &mut self,
        controller_id: u32,
        die_id: u32,
        dc: &str,
        cycles: u64,
        current: f64,
        power: f64,
    ) {
        self.emit(
            TraceStream::PowerCyclesForEachDc,
            format_args!("{controller_id},{die_id},{dc},{cycles},{current},{power}"),
        );
    }

    /// Write a reset marker into every open stream.
    pub fn markup_hard_reset(&mut self) {
        for idx in 0..STREAM_COUNT {
            if let Some(writer) = &mut self.writers[idx] {
                let _ = writeln!(writer, "# flash system has been hard reset");
            }
        }
    }

    /// Flush every open stream.
    pub fn flush(&mut self) {
        for writer in self.writers.iter_mut().flatten() {
            let _ = writer.flush();
        }
    }
}

impl Drop for TraceSet {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_streams_write_nothing() {
        let mut set = TraceSet::disabled();
        set.plane_read(0, 0, 0);
        set.markup_hard_reset();
        assert!(set.writers.iter().all(Option::is_none));
    }

    #[test]
    fn enabled_stream_opens_with_header() {
        let dir = std::env::temp_dir().join(format!("nand-trace-{}", std::process::id()));
        let switches = TraceSwitches {
            plane_write: true,
            ..TraceSwitches::default()
        };
        let mut set = TraceSet::new(&dir, switches);
        set.plane_write(3, 7, 1);
        set.flush();
        let text =
            std::fs::read_to_string(dir.join("plane_write.csv")).expect("stream file exists");
        assert!(text.starts_with("plane_id,block,page\n"));
        assert!(text.contains("3,7,1"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
