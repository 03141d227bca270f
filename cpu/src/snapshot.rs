//! Saved state of the translation and trap machinery.
//!
//! A snapshot holds everything a guest could have changed in the
//! memory management unit, the trap unit and the interrupt fabric,
//! plus the processor status word and stack pointers.  Memory
//! contents and device state are not included; device interrupt
//! requests are, so a restored machine sees the same pending
//! interrupts.
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::mmu::{FaultRecord, PageDescriptor};
use crate::state::ProcessorState;
use crate::trap::TrapMask;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub descriptors: Vec<PageDescriptor>,
    pub translation_enabled: bool,
    pub sr3: u16,
    pub fault: FaultRecord,
    pub register_changes: u16,
    pub instruction_pc: u16,
    pub pending_traps: TrapMask,
    /// Pending device requests, one mask per priority level.
    pub interrupt_requests: Vec<u64>,
    pub pirq: u16,
    pub processor: ProcessorState,
    pub cpu_error: u16,
}

/// A snapshot taken from a differently-configured machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMismatch {
    pub what: &'static str,
    pub expected: usize,
    pub found: usize,
}

impl Display for SnapshotMismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "snapshot has {} {}, but this machine has {}",
            self.found, self.what, self.expected
        )
    }
}

impl Error for SnapshotMismatch {}
