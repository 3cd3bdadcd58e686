//! Error types.
//!
//! Two distinct failure shapes exist. Submission-time failures abort the
//! request and come back as a [`SubmitError`]. Device-level constraint
//! violations happen mid-simulation, OR-accumulate into a
//! [`PlaneViolation`] set, and never stop time from advancing; the embedder
//! drains them and decides what to do.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Constraint violations raised by a plane, combinable because one
    /// access can trip several at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PlaneViolation: u32 {
        /// Vacant or out-of-range address register.
        const ADDRESS = 1 << 0;
        /// More writes to a page than NOP allows since the last erase.
        const NOP = 1 << 1;
        /// Block erased (or written) past its endurance.
        const WEAROUT = 1 << 2;
        /// Pages of a block written out of ascending order.
        const IN_ORDER = 1 << 3;
    }
}

/// Why a transaction or stage packet was refused at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("stage queue for the target die is full")]
    DieBusy,
    #[error("an incompatible transaction is outstanding for the target die")]
    FlashBusy,
    #[error("operation is not supported through this submission interface")]
    Unsupported,
    #[error("command sequence violates the device ordering rules")]
    UndefinedOrder,
    #[error("requested byte count exceeds the remaining bytes in the page")]
    IoLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violations_accumulate() {
        let mut set = PlaneViolation::empty();
        set |= PlaneViolation::NOP;
        set |= PlaneViolation::WEAROUT;
        assert!(set.contains(PlaneViolation::NOP));
        assert!(set.contains(PlaneViolation::WEAROUT));
        assert!(!set.contains(PlaneViolation::IN_ORDER));
    }
}
