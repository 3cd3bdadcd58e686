//! The device parameter table: AC timing, DC current, clocking, and the
//! environment switches that select timing variation and trace streams.
//!
//! Timing values are picoseconds. The worst-case table drives bus stages
//! directly; array stages consult the typical table as well, selected per
//! page offset by the active [`TimingMode`]. The table is immutable after
//! construction — components hold a shared reference and never write back.

use std::rc::Rc;

use serde::Deserialize;

/// Array operations that carry both a worst-case and a typical duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayOp {
    /// Page program, `tPROG`.
    Prog,
    /// Block erase, `tBERS`.
    Bers,
    /// First cache-read busy, `tDCBSYR1`.
    Dcbsyr1,
    /// Subsequent cache-read busy, `tDCBSYR2`.
    Dcbsyr2,
    /// Cache program busy, `tCBSY`.
    Cbsy,
    /// Multi-plane dummy busy, `tDBSY`.
    Dbsy,
}

/// Worst-case AC timing, picoseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingParams {
    #[serde(rename = "tADL")]
    pub t_adl: u64,
    #[serde(rename = "tALH")]
    pub t_alh: u64,
    #[serde(rename = "tALS")]
    pub t_als: u64,
    #[serde(rename = "tCH")]
    pub t_ch: u64,
    #[serde(rename = "tCLH")]
    pub t_clh: u64,
    #[serde(rename = "tCLS")]
    pub t_cls: u64,
    #[serde(rename = "tCS")]
    pub t_cs: u64,
    #[serde(rename = "tDH")]
    pub t_dh: u64,
    #[serde(rename = "tDS")]
    pub t_ds: u64,
    #[serde(rename = "tWC")]
    pub t_wc: u64,
    #[serde(rename = "tWH")]
    pub t_wh: u64,
    #[serde(rename = "tWP")]
    pub t_wp: u64,
    #[serde(rename = "tWW")]
    pub t_ww: u64,
    #[serde(rename = "tAR")]
    pub t_ar: u64,
    #[serde(rename = "tCEA")]
    pub t_cea: u64,
    #[serde(rename = "tCHZ")]
    pub t_chz: u64,
    #[serde(rename = "tCOH")]
    pub t_coh: u64,
    #[serde(rename = "tDCBSYR1")]
    pub t_dcbsyr1: u64,
    #[serde(rename = "tDCBSYR2")]
    pub t_dcbsyr2: u64,
    #[serde(rename = "tIR")]
    pub t_ir: u64,
    #[serde(rename = "tR")]
    pub t_r: u64,
    #[serde(rename = "tRC")]
    pub t_rc: u64,
    #[serde(rename = "tREA")]
    pub t_rea: u64,
    #[serde(rename = "tREH")]
    pub t_reh: u64,
    #[serde(rename = "tHOH")]
    pub t_hoh: u64,
    #[serde(rename = "tRHZ")]
    pub t_rhz: u64,
    #[serde(rename = "tRLOH")]
    pub t_rloh: u64,
    #[serde(rename = "tRP")]
    pub t_rp: u64,
    #[serde(rename = "tRR")]
    pub t_rr: u64,
    #[serde(rename = "tRST")]
    pub t_rst: u64,
    #[serde(rename = "tWB")]
    pub t_wb: u64,
    #[serde(rename = "tWHR")]
    pub t_whr: u64,
    #[serde(rename = "tBERS")]
    pub t_bers: u64,
    #[serde(rename = "tCBSY")]
    pub t_cbsy: u64,
    #[serde(rename = "tDBSY")]
    pub t_dbsy: u64,
    #[serde(rename = "tPROG")]
    pub t_prog: u64,
}

impl Default for TimingParams {
    /// Datasheet-typical worst-case values for an asynchronous x8 SLC part.
    fn default() -> Self {
        Self {
            t_adl: 70_000,
            t_alh: 5_000,
            t_als: 10_000,
            t_ch: 5_000,
            t_clh: 5_000,
            t_cls: 10_000,
            t_cs: 20_000,
            t_dh: 5_000,
            t_ds: 12_000,
            t_wc: 25_000,
            t_wh: 10_000,
            t_wp: 12_000,
            t_ww: 100_000,
            t_ar: 10_000,
            t_cea: 25_000,
            t_chz: 30_000,
            t_coh: 15_000,
            t_dcbsyr1: 10_000_000,
            t_dcbsyr2: 10_000_000,
            t_ir: 0,
            t_r: 25_000_000,
            t_rc: 25_000,
            t_rea: 20_000,
            t_reh: 10_000,
            t_hoh: 15_000,
            t_rhz: 100_000,
            t_rloh: 5_000,
            t_rp: 12_000,
            t_rr: 20_000,
            t_rst: 5_000_000,
            t_wb: 100_000,
            t_whr: 60_000,
            t_bers: 700_000_000,
            t_cbsy: 35_000_000,
            t_dbsy: 1_000_000,
            t_prog: 200_000_000,
        }
    }
}

/// Typical-value variants for the array operations, picoseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypicalParams {
    #[serde(rename = "tPROG")]
    pub t_prog: u64,
    #[serde(rename = "tDCBSYR1")]
    pub t_dcbsyr1: u64,
    #[serde(rename = "tDCBSYR2")]
    pub t_dcbsyr2: u64,
    #[serde(rename = "tBERS")]
    pub t_bers: u64,
    #[serde(rename = "tCBSY")]
    pub t_cbsy: u64,
    #[serde(rename = "tDBSY")]
    pub t_dbsy: u64,
}

impl Default for TypicalParams {
    fn default() -> Self {
        Self {
            t_prog: 150_000_000,
            t_dcbsyr1: 3_000_000,
            t_dcbsyr2: 3_000_000,
            t_bers: 500_000_000,
            t_cbsy: 25_000_000,
            t_dbsy: 500_000,
        }
    }
}

/// DC operating parameters: supply in millivolts, currents in microamps.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DcParams {
    #[serde(rename = "VCC")]
    pub vcc: u64,
    #[serde(rename = "ICC1")]
    pub icc1: u64,
    #[serde(rename = "ICC2")]
    pub icc2: u64,
    #[serde(rename = "ICC3")]
    pub icc3: u64,
    #[serde(rename = "ISB1")]
    pub isb1: u64,
    #[serde(rename = "ISB2")]
    pub isb2: u64,
    #[serde(rename = "ILI")]
    pub ili: u64,
    #[serde(rename = "ILO")]
    pub ilo: u64,
}

impl Default for DcParams {
    fn default() -> Self {
        Self {
            vcc: 3_300,
            icc1: 25_000,
            icc2: 25_000,
            icc3: 25_000,
            isb1: 10,
            isb2: 50,
            ili: 10,
            ilo: 10,
        }
    }
}

/// The complete parameter table handed to every component.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ParamTable {
    pub timing: TimingParams,
    pub typical: TypicalParams,
    pub dc: DcParams,
    /// Picoseconds per embedder clock cycle.
    #[serde(rename = "clock_period")]
    pub clock_period_ps: u64,
}

impl ParamTable {
    /// Shared handle for injection into dies and the bus layer.
    #[must_use]
    pub fn shared(self) -> Rc<Self> {
        let mut table = self;
        if table.clock_period_ps == 0 {
            table.clock_period_ps = 1;
        }
        Rc::new(table)
    }

    /// Worst-case duration of an array operation.
    #[must_use]
    pub fn worst(&self, op: ArrayOp) -> u64 {
        match op {
            ArrayOp::Prog => self.timing.t_prog,
            ArrayOp::Bers => self.timing.t_bers,
            ArrayOp::Dcbsyr1 => self.timing.t_dcbsyr1,
            ArrayOp::Dcbsyr2 => self.timing.t_dcbsyr2,
            ArrayOp::Cbsy => self.timing.t_cbsy,
            ArrayOp::Dbsy => self.timing.t_dbsy,
        }
    }

    /// Typical duration of an array operation.
    #[must_use]
    pub fn typical(&self, op: ArrayOp) -> u64 {
        match op {
            ArrayOp::Prog => self.typical.t_prog,
            ArrayOp::Bers => self.typical.t_bers,
            ArrayOp::Dcbsyr1 => self.typical.t_dcbsyr1,
            ArrayOp::Dcbsyr2 => self.typical.t_dcbsyr2,
            ArrayOp::Cbsy => self.typical.t_cbsy,
            ArrayOp::Dbsy => self.typical.t_dbsy,
        }
    }
}

/// Which duration an array stage pays, per page offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    /// Charge-multilevel variation: typical when the page offset is below 4
    /// or falls on the first two offsets of each group of four, worst
    /// otherwise.
    #[default]
    Variation,
    /// Always worst case.
    Worst,
    /// Always typical.
    Typical,
    /// CMLC-style variation: typical for the first two and last two pages
    /// of a block and for even offsets, worst otherwise.
    Cmlc,
}

/// Per-stream trace switches.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TraceSwitches {
    pub plane_read: bool,
    pub plane_write: bool,
    pub internal_state: bool,
    pub bus_transaction: bool,
    pub io_completion: bool,
    pub cycles_for_each_state: bool,
    pub power_cycles_for_each_dc: bool,
}

impl TraceSwitches {
    /// True when any stream is enabled.
    #[must_use]
    pub fn any(self) -> bool {
        self.plane_read
            || self.plane_write
            || self.internal_state
            || self.bus_transaction
            || self.io_completion
            || self.cycles_for_each_state
            || self.power_cycles_for_each_dc
    }
}

/// Environment settings orthogonal to the device itself.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EnvConfig {
    pub timing_mode: TimingMode,
    /// Skip host-idle accounting entirely (fast mode).
    pub no_idle_cycles: bool,
    pub trace: TraceSwitches,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typical_is_not_slower_than_worst() {
        let table = ParamTable::default();
        for op in [
            ArrayOp::Prog,
            ArrayOp::Bers,
            ArrayOp::Dcbsyr1,
            ArrayOp::Dcbsyr2,
            ArrayOp::Cbsy,
            ArrayOp::Dbsy,
        ] {
            assert!(table.typical(op) <= table.worst(op), "{op:?}");
        }
    }

    #[test]
    fn zero_clock_period_is_normalized() {
        let table = ParamTable {
            clock_period_ps: 0,
            ..ParamTable::default()
        }
        .shared();
        assert_eq!(table.clock_period_ps, 1);
    }
}
