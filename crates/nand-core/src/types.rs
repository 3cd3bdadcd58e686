//! Transaction, command, and stage alphabets, plus the stage packet that
//! carries one protocol step across the bus layer.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Host-visible transaction operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransOp {
    Read,
    ReadRandom,
    ReadCache,
    ReadMultiplane,
    ReadMultiplaneRandom,
    Prog,
    ProgRandom,
    ProgCache,
    ProgMultiplane,
    ProgMultiplaneRandom,
    ProgMultiplaneCache,
    InternalDataMovement,
    InternalDataMovementMultiplane,
    BlockErase,
    BlockEraseMultiplane,
}

/// The NAND command alphabet.
///
/// Two-command sequences pair a base command with its `*Conf` confirm; the
/// bus layer substitutes the confirm when the die asks for the second CLE.
/// Multi-plane chains end in a `*Fin` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ReadPage,
    ReadPageConf,
    ReadMultiplaneInit,
    ReadMultiplaneInitConf,
    ReadMultiplaneInitFin,
    ReadMultiplaneInitFinConf,
    ReadMultiplane,
    ReadMultiplaneConf,
    ReadCacheAddrInit,
    ReadCacheAddrInitConf,
    ReadCache,
    ReadMultiplaneCache,
    ReadMultiplaneCacheDummy,
    ReadMultiplaneCacheConf,
    ReadInternal,
    ReadInternalConf,
    ReadInternalMultiplane,
    ReadInternalMultiplaneFin,
    ReadInternalMultiplaneFinConf,
    ReadRandom,
    ReadRandomConf,
    ReadStatus,
    ProgPage,
    ProgPageConf,
    ProgMultiplane,
    ProgMultiplaneConf,
    ProgMultiplaneRandom,
    ProgMultiplaneRandomDummy,
    ProgMultiplaneRandomDummyConf,
    ProgMultiplaneFin,
    ProgMultiplaneFinConf,
    ProgMultiplaneFinRandom,
    ProgMultiplaneFinRandomConf,
    ProgMultiplaneCache,
    ProgMultiplaneCacheConf,
    ProgMultiplaneCacheFin,
    ProgMultiplaneCacheFinConf,
    ProgCache,
    ProgCacheConf,
    ProgRandom,
    ProgRandomFin,
    ProgRandomFinConf,
    ProgInternal,
    ProgInternalConf,
    ProgInternalMultiplane,
    ProgInternalMultiplaneConf,
    ProgInternalMultiplaneFin,
    ProgInternalMultiplaneFinConf,
    BlockErase,
    BlockEraseConf,
    BlockMultiplaneErase,
    BlockMultiplaneEraseFin,
    BlockMultiplaneEraseFinConf,
    Reset,
    NotDetermined,
}

impl Command {
    /// Read-family commands, status read included. Data-out stages require
    /// one of these in the command register.
    #[must_use]
    pub fn is_read_class(self) -> bool {
        matches!(
            self,
            Self::ReadPage
                | Self::ReadPageConf
                | Self::ReadMultiplaneInit
                | Self::ReadMultiplaneInitConf
                | Self::ReadMultiplaneInitFin
                | Self::ReadMultiplaneInitFinConf
                | Self::ReadMultiplane
                | Self::ReadMultiplaneConf
                | Self::ReadCacheAddrInit
                | Self::ReadCacheAddrInitConf
                | Self::ReadCache
                | Self::ReadMultiplaneCache
                | Self::ReadMultiplaneCacheDummy
                | Self::ReadMultiplaneCacheConf
                | Self::ReadInternal
                | Self::ReadInternalConf
                | Self::ReadInternalMultiplane
                | Self::ReadInternalMultiplaneFin
                | Self::ReadInternalMultiplaneFinConf
                | Self::ReadRandom
                | Self::ReadRandomConf
                | Self::ReadStatus
        )
    }

    /// Program, erase, and reset commands. Data-in and array-program stages
    /// require one of these in the command register.
    #[must_use]
    pub fn is_write_class(self) -> bool {
        !self.is_read_class() && self != Command::NotDetermined
    }

    /// Copyback reads ignore the issued column and address whole pages.
    #[must_use]
    pub fn is_internal_read(self) -> bool {
        matches!(
            self,
            Command::ReadInternal
                | Command::ReadInternalMultiplane
                | Command::ReadInternalMultiplaneFin
        )
    }
}

/// Stages of the per-die protocol state machine.
///
/// `Ton` and the `Tin*` variants run inside the array; every other stage
/// occupies the shared I/O bus. The discriminant doubles as the stage code
/// in the low 16 bits of the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Stage {
    /// Address latch.
    Ale = 0,
    /// Command latch.
    Cle = 1,
    /// Transfer out of register: data out to the host.
    Tor = 2,
    /// Transfer into register: data in from the host.
    Tir = 3,
    ReadStatus = 4,
    /// Soft reset executing in delta time.
    ResetDelta = 5,
    Idle = 6,
    Busy = 7,
    /// Transfer out of the array: page read into the cache register.
    Ton = 8,
    /// Transfer into the array: page program.
    Tin = 9,
    /// Cache-mode program, overlapped with the next transfer.
    TinCache = 10,
    /// Multi-plane dummy busy.
    TinDummy = 11,
    /// Final cache-mode program of a sequence.
    TinTail = 12,
    NotDetermined = 13,
}

impl Stage {
    /// Status-word stage code.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Stages that run in the array and leave the bus free.
    #[must_use]
    pub fn is_array_task(self) -> bool {
        matches!(
            self,
            Stage::Ton | Stage::Tin | Stage::TinCache | Stage::TinDummy | Stage::TinTail
        )
    }

    /// Stages that occupy the shared I/O bus.
    #[must_use]
    pub fn uses_bus(self) -> bool {
        !self.is_array_task()
    }
}

/// Accumulator index for per-stage FSM time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Ale,
    Cle,
    Tir,
    Tor,
    Tin,
    Ton,
    Erase,
}

impl FsmState {
    pub const COUNT: usize = 7;
    pub const ALL: [FsmState; Self::COUNT] = [
        FsmState::Ale,
        FsmState::Cle,
        FsmState::Tir,
        FsmState::Tor,
        FsmState::Tin,
        FsmState::Ton,
        FsmState::Erase,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Accumulator index for per-region DC power time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcRegion {
    Read,
    Prog,
    Erase,
    Standby,
    Leakage,
}

impl DcRegion {
    pub const COUNT: usize = 5;
    pub const ALL: [DcRegion; Self::COUNT] = [
        DcRegion::Read,
        DcRegion::Prog,
        DcRegion::Erase,
        DcRegion::Standby,
        DcRegion::Leakage,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Interrupt classes raised by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrType {
    CompleteTrans,
}

/// Host data buffer shared between the embedder and the die. The simulator
/// is single-threaded; `Rc<RefCell>` is only shared ownership, never
/// concurrent access.
pub type DataBuffer = Rc<RefCell<Vec<u8>>>;

/// Status word destination, written on `READ_STATUS`.
pub type StatusCell = Rc<Cell<u32>>;

/// Wrap a byte vector for submission.
#[must_use]
pub fn shared_buffer(bytes: Vec<u8>) -> DataBuffer {
    Rc::new(RefCell::new(bytes))
}

/// Fresh status word destination.
#[must_use]
pub fn status_cell() -> StatusCell {
    Rc::new(Cell::new(0))
}

/// One protocol step in flight: the command, its addressing, and the host
/// buffers it moves data between.
///
/// A transaction expands into one or more packets; each packet walks its
/// stage chain at the head of its die's queue and is popped when the die
/// returns to idle with the step complete.
#[derive(Clone)]
pub struct StagePacket {
    /// Fine-grain transaction id assigned by the controller.
    pub stage_id: u32,
    pub command: Command,
    pub data: Option<DataBuffer>,
    pub status: Option<StatusCell>,
    /// Packed row register value, when the step carries row addressing.
    pub row: Option<u32>,
    pub col: u16,
    /// Data cycles this step will move, in bytes.
    pub random_bytes: Option<u32>,
    pub arrival_cycle: u64,
    /// Set on the packet whose completion fires the host callback.
    pub last_of_transaction: bool,
}

impl StagePacket {
    #[must_use]
    pub fn new(stage_id: u32, arrival_cycle: u64) -> Self {
        Self {
            stage_id,
            command: Command::NotDetermined,
            data: None,
            status: None,
            row: None,
            col: 0,
            random_bytes: None,
            arrival_cycle,
            last_of_transaction: false,
        }
    }

    /// Die the packet addresses, from the row register's die field.
    #[must_use]
    pub fn die(&self) -> u8 {
        crate::addr::die_of(self.row.unwrap_or(0))
    }
}

/// A host I/O transaction before expansion into stage packets.
#[derive(Clone)]
pub struct Transaction {
    pub host_id: u32,
    pub op: TransOp,
    pub data: Option<DataBuffer>,
    pub status: Option<StatusCell>,
    /// Semi-physical linear page address.
    pub addr: u32,
    /// Destination for internal data movement.
    pub dest_addr: Option<u32>,
    pub byte_off: u32,
    pub num_bytes: u32,
    /// Let the controller assign plane addresses round-robin.
    pub auto_plane_addressing: bool,
    /// Last sub-transaction of a cache or random multi-plane sequence.
    pub last_nx_sub: bool,
    /// Last plane of a manually addressed multi-plane sequence.
    pub last_plane: bool,
}

impl Transaction {
    #[must_use]
    pub fn new(host_id: u32, op: TransOp, addr: u32) -> Self {
        Self {
            host_id,
            op,
            data: None,
            status: None,
            addr,
            dest_addr: None,
            byte_off: 0,
            num_bytes: 0,
            auto_plane_addressing: true,
            last_nx_sub: false,
            last_plane: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_classes_partition_the_alphabet() {
        assert!(Command::ReadPage.is_read_class());
        assert!(Command::ReadStatus.is_read_class());
        assert!(!Command::ReadPage.is_write_class());
        assert!(Command::ProgPage.is_write_class());
        assert!(Command::BlockEraseConf.is_write_class());
        assert!(Command::Reset.is_write_class());
        assert!(!Command::NotDetermined.is_read_class());
        assert!(!Command::NotDetermined.is_write_class());
    }

    #[test]
    fn array_tasks_do_not_use_the_bus() {
        for stage in [
            Stage::Ton,
            Stage::Tin,
            Stage::TinCache,
            Stage::TinDummy,
            Stage::TinTail,
        ] {
            assert!(stage.is_array_task());
            assert!(!stage.uses_bus());
        }
        for stage in [Stage::Ale, Stage::Cle, Stage::Tir, Stage::Tor, Stage::ReadStatus] {
            assert!(stage.uses_bus());
        }
    }

    #[test]
    fn stage_codes_are_stable() {
        assert_eq!(Stage::Ale.code(), 0);
        assert_eq!(Stage::Idle.code(), 6);
        assert_eq!(Stage::Ton.code(), 8);
        assert_eq!(Stage::TinTail.code(), 12);
    }
}
