//! Traps are the processor's response to exceptional conditions.
//!
//! Each kind of trap has a fixed slot in a 16-bit mask.  The slot
//! number is also the trap's priority: slot 0 (red stack) is the most
//! urgent.  Several traps may be pending at once; they are serviced
//! one per dispatch, always the highest-priority one first.
//!
//! The lowest-priority slot does not represent a single condition.
//! It says "some device interrupt is above the processor priority"
//! and is kept in step with the interrupt fabric rather than being
//! set and cleared directly.
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::{event, Level};

/// How a pending trap slot is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clearing {
    /// Servicing the trap clears it.
    OnDispatch,
    /// The slot stays pending until the guest writes the CPU error
    /// register.
    BySoftware,
    /// The slot mirrors state held elsewhere (the interrupt fabric).
    Synchronized,
}

#[cfg_attr(test, derive(test_strategy::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrapSlot {
    RedStack = 0,
    OddAddress = 1,
    MemoryManagement = 2,
    NonExistentMemory = 3,
    Parity = 4,
    PrivilegedInstruction = 5,
    IllegalInstruction = 6,
    Breakpoint = 7,
    IoTrap = 8,
    Emulator = 9,
    Trap = 10,
    Trace = 11,
    YellowStack = 12,
    PowerFail = 13,
    FloatingPoint = 14,
    Interrupt = 15,
}

/// Vector and clearing policy of each slot, in priority order.
const TRAP_TABLE: [(TrapSlot, u16, Clearing); 16] = [
    (TrapSlot::RedStack, 0o004, Clearing::OnDispatch),
    (TrapSlot::OddAddress, 0o004, Clearing::OnDispatch),
    (TrapSlot::MemoryManagement, 0o250, Clearing::OnDispatch),
    (TrapSlot::NonExistentMemory, 0o004, Clearing::OnDispatch),
    (TrapSlot::Parity, 0o114, Clearing::BySoftware),
    (TrapSlot::PrivilegedInstruction, 0o004, Clearing::OnDispatch),
    (TrapSlot::IllegalInstruction, 0o010, Clearing::OnDispatch),
    (TrapSlot::Breakpoint, 0o014, Clearing::OnDispatch),
    (TrapSlot::IoTrap, 0o020, Clearing::OnDispatch),
    (TrapSlot::Emulator, 0o030, Clearing::OnDispatch),
    (TrapSlot::Trap, 0o034, Clearing::OnDispatch),
    (TrapSlot::Trace, 0o014, Clearing::OnDispatch),
    (TrapSlot::YellowStack, 0o004, Clearing::OnDispatch),
    (TrapSlot::PowerFail, 0o024, Clearing::OnDispatch),
    (TrapSlot::FloatingPoint, 0o244, Clearing::OnDispatch),
    // The vector is supplied by whichever device is acknowledged.
    (TrapSlot::Interrupt, 0, Clearing::Synchronized),
];

impl TrapSlot {
    pub const ALL: [TrapSlot; 16] = [
        TrapSlot::RedStack,
        TrapSlot::OddAddress,
        TrapSlot::MemoryManagement,
        TrapSlot::NonExistentMemory,
        TrapSlot::Parity,
        TrapSlot::PrivilegedInstruction,
        TrapSlot::IllegalInstruction,
        TrapSlot::Breakpoint,
        TrapSlot::IoTrap,
        TrapSlot::Emulator,
        TrapSlot::Trap,
        TrapSlot::Trace,
        TrapSlot::YellowStack,
        TrapSlot::PowerFail,
        TrapSlot::FloatingPoint,
        TrapSlot::Interrupt,
    ];

    /// Priority of the slot; 0 is the highest.
    pub const fn priority(&self) -> u8 {
        *self as u8
    }

    const fn bit(&self) -> u16 {
        1 << (*self as u16)
    }

    /// The fixed vector of this trap.  Device interrupts have no
    /// fixed vector.
    pub fn vector(&self) -> Option<u16> {
        match self {
            TrapSlot::Interrupt => None,
            slot => Some(TRAP_TABLE[slot.priority() as usize].1),
        }
    }

    pub fn clearing(&self) -> Clearing {
        TRAP_TABLE[self.priority() as usize].2
    }
}

impl Display for TrapSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            TrapSlot::RedStack => "red stack",
            TrapSlot::OddAddress => "odd address",
            TrapSlot::MemoryManagement => "memory management",
            TrapSlot::NonExistentMemory => "non-existent memory",
            TrapSlot::Parity => "parity",
            TrapSlot::PrivilegedInstruction => "privileged instruction",
            TrapSlot::IllegalInstruction => "illegal instruction",
            TrapSlot::Breakpoint => "breakpoint",
            TrapSlot::IoTrap => "IOT",
            TrapSlot::Emulator => "EMT",
            TrapSlot::Trap => "TRAP",
            TrapSlot::Trace => "trace",
            TrapSlot::YellowStack => "yellow stack",
            TrapSlot::PowerFail => "power fail",
            TrapSlot::FloatingPoint => "floating point",
            TrapSlot::Interrupt => "device interrupt",
        })
    }
}

/// The set of pending trap slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrapMask(u16);

impl TrapMask {
    pub const EMPTY: TrapMask = TrapMask(0);

    pub const fn from_bits(bits: u16) -> TrapMask {
        TrapMask(bits)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, slot: TrapSlot) -> bool {
        self.0 & slot.bit() != 0
    }

    fn insert(&mut self, slot: TrapSlot) {
        self.0 |= slot.bit();
    }

    fn remove(&mut self, slot: TrapSlot) {
        self.0 &= !slot.bit();
    }

    /// The highest-priority member.
    pub fn first(&self) -> Option<TrapSlot> {
        if self.0 == 0 {
            None
        } else {
            Some(TrapSlot::ALL[self.0.trailing_zeros() as usize])
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapUnitState {
    Idle,
    Pending,
}

#[derive(Debug, Default)]
pub struct TrapUnit {
    pending: TrapMask,
}

impl TrapUnit {
    pub fn new() -> TrapUnit {
        TrapUnit::default()
    }

    pub fn state(&self) -> TrapUnitState {
        if self.pending.is_empty() {
            TrapUnitState::Idle
        } else {
            TrapUnitState::Pending
        }
    }

    pub fn pending(&self) -> TrapMask {
        self.pending
    }

    pub fn is_pending(&self, slot: TrapSlot) -> bool {
        self.pending.contains(slot)
    }

    /// Post a trap.  Posting an already-pending trap has no further
    /// effect; the trap is still serviced only once.
    pub fn post(&mut self, slot: TrapSlot) {
        if !self.pending.contains(slot) {
            event!(Level::DEBUG, "posting {slot} trap");
        }
        self.pending.insert(slot);
    }

    pub fn clear(&mut self, slot: TrapSlot) {
        self.pending.remove(slot);
    }

    /// Record whether any device interrupt (or software interrupt)
    /// is above the processor priority.  Only the interrupt fabric
    /// calls this.
    pub(crate) fn set_interrupt_pending(&mut self, pending: bool) {
        if pending {
            self.pending.insert(TrapSlot::Interrupt);
        } else {
            self.pending.remove(TrapSlot::Interrupt);
        }
    }

    pub fn highest_pending(&self) -> Option<TrapSlot> {
        self.pending.first()
    }

    /// Begin servicing `slot`.  Slots which are cleared by dispatch
    /// are cleared here; no other slot is affected.  Returns the
    /// fixed vector of the slot, if it has one.
    pub fn begin_dispatch(&mut self, slot: TrapSlot) -> Option<u16> {
        if slot.clearing() == Clearing::OnDispatch {
            self.pending.remove(slot);
        }
        event!(
            Level::DEBUG,
            "dispatching {slot} trap, still pending: {:#06x}",
            self.pending.bits()
        );
        slot.vector()
    }

    /// Clear the slots which only the guest can clear.
    pub fn clear_by_software(&mut self) {
        for slot in TrapSlot::ALL {
            if slot.clearing() == Clearing::BySoftware {
                self.pending.remove(slot);
            }
        }
    }

    pub(crate) fn restore(&mut self, mask: TrapMask) {
        self.pending = mask;
    }

    pub fn reset(&mut self) {
        self.pending = TrapMask::EMPTY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    #[test]
    fn test_table_matches_enumeration_order() {
        for (i, (slot, _, _)) in TRAP_TABLE.iter().enumerate() {
            assert_eq!(slot.priority() as usize, i);
            assert_eq!(TrapSlot::ALL[i], *slot);
        }
        assert_eq!(TrapSlot::MemoryManagement.vector(), Some(0o250));
        assert_eq!(TrapSlot::FloatingPoint.vector(), Some(0o244));
        assert_eq!(TrapSlot::Interrupt.vector(), None);
    }

    #[test]
    fn test_idle_until_posted() {
        let mut unit = TrapUnit::new();
        assert_eq!(unit.state(), TrapUnitState::Idle);
        assert_eq!(unit.highest_pending(), None);
        unit.post(TrapSlot::Trace);
        assert_eq!(unit.state(), TrapUnitState::Pending);
    }

    #[test]
    fn test_pending_traps_are_serviced_in_priority_order() {
        let mut unit = TrapUnit::new();
        unit.post(TrapSlot::Trap);
        unit.post(TrapSlot::NonExistentMemory);
        unit.post(TrapSlot::MemoryManagement);
        let mut order = Vec::new();
        while let Some(slot) = unit.highest_pending() {
            assert_eq!(unit.begin_dispatch(slot), slot.vector());
            order.push(slot);
        }
        assert_eq!(
            order,
            vec![
                TrapSlot::MemoryManagement,
                TrapSlot::NonExistentMemory,
                TrapSlot::Trap
            ]
        );
        assert_eq!(unit.state(), TrapUnitState::Idle);
    }

    #[test]
    fn test_software_cleared_slot_survives_dispatch() {
        let mut unit = TrapUnit::new();
        unit.post(TrapSlot::Parity);
        assert_eq!(unit.begin_dispatch(TrapSlot::Parity), Some(0o114));
        assert!(unit.is_pending(TrapSlot::Parity));
        unit.clear_by_software();
        assert!(!unit.is_pending(TrapSlot::Parity));
    }

    #[test]
    fn test_interrupt_slot_follows_fabric() {
        let mut unit = TrapUnit::new();
        unit.set_interrupt_pending(true);
        assert_eq!(unit.highest_pending(), Some(TrapSlot::Interrupt));
        assert_eq!(unit.begin_dispatch(TrapSlot::Interrupt), None);
        // Only the fabric clears it.
        assert!(unit.is_pending(TrapSlot::Interrupt));
        unit.set_interrupt_pending(false);
        assert_eq!(unit.state(), TrapUnitState::Idle);
    }

    #[proptest]
    fn highest_pending_is_never_outranked(posted: Vec<TrapSlot>, serviced: TrapSlot) {
        let mut unit = TrapUnit::new();
        for slot in posted.iter() {
            unit.post(*slot);
        }
        if let Some(top) = unit.highest_pending() {
            for slot in TrapSlot::ALL {
                if unit.is_pending(slot) {
                    assert!(slot.priority() >= top.priority());
                }
            }
        }
        // Servicing one slot never hides a higher-priority one.
        let before = unit.pending();
        unit.begin_dispatch(serviced);
        for slot in TrapSlot::ALL {
            if slot != serviced {
                assert_eq!(unit.is_pending(slot), before.contains(slot));
            }
        }
        if let Some(top) = unit.highest_pending() {
            assert!(TrapSlot::ALL
                .iter()
                .filter(|s| unit.is_pending(**s))
                .all(|s| s.priority() >= top.priority()));
        }
    }
}
