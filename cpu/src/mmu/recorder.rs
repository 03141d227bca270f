//! The fault recorder holds the contents of status registers SR0 to
//! SR2 which describe a refused translation.
//!
//! Once a fault has been latched the recorder is frozen: further
//! faults, register changes and instruction starts are not recorded
//! until the guest clears the abort bits of SR0.  This keeps the
//! details of the first fault for the trap handler.
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use crate::fault::{FaultReason, SlotIndex};

const SR0_NON_RESIDENT: u16 = 1 << 15;
const SR0_PAGE_LENGTH: u16 = 1 << 14;
const SR0_READ_ONLY: u16 = 1 << 13;
pub(crate) const SR0_ABORT_BITS: u16 = SR0_NON_RESIDENT | SR0_PAGE_LENGTH | SR0_READ_ONLY;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub reason: Option<FaultReason>,
    pub slot: SlotIndex,
}

impl FaultRecord {
    /// Mode and space bits of the offending slot, positioned as they
    /// are in SR0 (bits 6:4).
    pub fn mode_space_bits(&self) -> u16 {
        u16::from(self.slot.bits() & 0o70) << 1
    }

    /// The SR0 bits describing this record (everything except the
    /// translation enable).
    pub fn sr0_bits(&self) -> u16 {
        let reason = match self.reason {
            None => 0,
            Some(FaultReason::NonResident) => SR0_NON_RESIDENT,
            Some(FaultReason::PageLength) => SR0_PAGE_LENGTH,
            Some(FaultReason::ReadOnly) => SR0_READ_ONLY,
        };
        reason | (u16::from(self.slot.bits()) << 1)
    }
}

#[derive(Debug, Default)]
pub struct FaultRecorder {
    record: FaultRecord,
    /// SR1: up to two register-change records, first in the low byte.
    register_changes: u16,
    /// SR2: virtual address of the start of the current instruction.
    instruction_pc: u16,
}

impl FaultRecorder {
    pub fn new() -> FaultRecorder {
        FaultRecorder::default()
    }

    pub fn is_frozen(&self) -> bool {
        self.record.reason.is_some()
    }

    /// Record a refused translation, unless a fault is already
    /// latched.  Returns whether the fault was recorded.
    pub fn latch(&mut self, reason: FaultReason, slot: SlotIndex) -> bool {
        if self.is_frozen() {
            event!(
                Level::DEBUG,
                "{reason} fault in {slot} not recorded, {} already latched",
                self.record.slot
            );
            return false;
        }
        event!(Level::INFO, "latched {reason} fault in {slot}");
        self.record = FaultRecord {
            reason: Some(reason),
            slot,
        };
        true
    }

    /// Unfreeze.  The register-change log and saved PC resume
    /// tracking at the next instruction.
    pub fn clear(&mut self) {
        if self.is_frozen() {
            event!(Level::DEBUG, "fault record cleared");
        }
        self.record = FaultRecord::default();
        self.register_changes = 0;
    }

    pub fn snapshot(&self) -> FaultRecord {
        self.record
    }

    pub fn register_changes(&self) -> u16 {
        self.register_changes
    }

    pub fn instruction_pc(&self) -> u16 {
        self.instruction_pc
    }

    /// Note the start of an instruction at `pc`.
    pub fn begin_instruction(&mut self, pc: u16) {
        if !self.is_frozen() {
            self.instruction_pc = pc;
            self.register_changes = 0;
        }
    }

    /// Log an autoincrement or autodecrement of general register
    /// `register` by `delta` so that a trap handler can back it out.
    /// Only two changes per instruction are recorded.
    pub fn record_register_change(&mut self, register: u8, delta: i8) {
        if self.is_frozen() {
            return;
        }
        let entry = (((delta as u8) & 0o37) << 3) | (register & 7);
        if self.register_changes & 0o377 == 0 {
            self.register_changes = u16::from(entry);
        } else if self.register_changes >> 8 == 0 {
            self.register_changes |= u16::from(entry) << 8;
        }
    }

    /// A guest write to the abort bits of SR0.  Writing them as zero
    /// clears the record; setting one latches that reason against the
    /// currently recorded slot.
    pub(crate) fn write_abort_bits(&mut self, value: u16) {
        let reason = if value & SR0_NON_RESIDENT != 0 {
            Some(FaultReason::NonResident)
        } else if value & SR0_PAGE_LENGTH != 0 {
            Some(FaultReason::PageLength)
        } else if value & SR0_READ_ONLY != 0 {
            Some(FaultReason::ReadOnly)
        } else {
            None
        };
        match reason {
            None => self.clear(),
            Some(reason) => self.record.reason = Some(reason),
        }
    }

    pub(crate) fn restore(&mut self, record: FaultRecord, register_changes: u16, instruction_pc: u16) {
        self.record = record;
        self.register_changes = register_changes;
        self.instruction_pc = instruction_pc;
    }

    pub fn reset(&mut self) {
        *self = FaultRecorder::default();
    }
}
