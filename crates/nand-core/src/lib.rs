//! Core vocabulary for the NAND flash subsystem timing simulator.
//!
//! Everything timed in this workspace is expressed in picoseconds; the
//! embedder advances time in clock cycles and the parameter table's clock
//! period converts between the two. This crate holds no simulation state:
//! it defines the device geometry, the packed row-register layout, the
//! AC/DC parameter tables, the transaction/command/stage alphabets, and the
//! error types shared by the die model and the bus-level machinery.

pub mod addr;
mod config;
mod error;
mod params;
mod trace;
mod types;

pub use config::{AddressBits, DeviceConfig, PageLocation, StoreMode};
pub use error::{PlaneViolation, SubmitError};
pub use params::{
    ArrayOp, DcParams, EnvConfig, ParamTable, TimingMode, TimingParams, TraceSwitches,
    TypicalParams,
};
pub use trace::{TraceHandle, TraceSet, TraceStream};
pub use types::{
    Command, DataBuffer, DcRegion, FsmState, IsrType, Stage, StagePacket, StatusCell, TransOp,
    Transaction, shared_buffer, status_cell,
};
