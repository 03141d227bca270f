//! Faults raised by memory references.
//!
//! None of these is fatal to the emulator.  Each one is converted by
//! the [`Machine`](crate::Machine) into a posted trap (see
//! [`MemoryFault::trap_slot`]) and the reference that caused it has no
//! effect.  The guest's trap handler then decides what to do.
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use base::prelude::*;

use crate::trap::TrapSlot;

/// The index of a page descriptor: bits 5:4 are the mode, bit 3 is
/// the address space (1 for data space) and bits 2:0 are the page
/// number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(u8);

impl SlotIndex {
    pub const COUNT: usize = 64;

    pub const fn new(mode: Mode, space: Space, page: u8) -> SlotIndex {
        SlotIndex(((mode as u8) << 4) | ((space as u8) << 3) | (page & 7))
    }

    /// Decode the bottom six bits of `bits`.
    pub const fn from_bits(bits: u8) -> SlotIndex {
        SlotIndex(bits & 0o77)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    pub const fn mode(&self) -> Mode {
        Mode::from_bits((self.0 >> 4) as u16)
    }

    pub const fn space(&self) -> Space {
        if self.0 & 0o10 != 0 {
            Space::Data
        } else {
            Space::Instruction
        }
    }

    pub const fn page(&self) -> u8 {
        self.0 & 7
    }
}

impl Display for SlotIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{} {}-space page {}", self.mode(), self.space(), self.page())
    }
}

/// Why a translation was refused.  The order of the enumerators is
/// the order in which the checks are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultReason {
    /// The descriptor does not permit any access.
    NonResident,
    /// The block number lies outside the valid part of the page.
    PageLength,
    /// A write was attempted to a page which only permits reading.
    ReadOnly,
}

impl Display for FaultReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            FaultReason::NonResident => "non-resident",
            FaultReason::PageLength => "page length",
            FaultReason::ReadOnly => "read-only",
        })
    }
}

/// A refused translation: the reason plus the descriptor which
/// refused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationFault {
    pub reason: FaultReason,
    pub slot: SlotIndex,
}

impl Display for TranslationFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{} fault in {}", self.reason, self.slot)
    }
}

impl Error for TranslationFault {}

/// A physical address matched nothing on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFault {
    NonExistentResource(PhysicalAddress),
}

impl BusFault {
    pub fn address(&self) -> PhysicalAddress {
        match self {
            BusFault::NonExistentResource(pa) => *pa,
        }
    }
}

impl Display for BusFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            BusFault::NonExistentResource(pa) => {
                write!(f, "nothing responds at physical address {pa}")
            }
        }
    }
}

impl Error for BusFault {}

/// Any failure of a processor memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    /// A word reference to an odd address (only on models which
    /// check for this).
    OddAddress(VirtualAddress),
    Translation(TranslationFault),
    Bus(BusFault),
}

impl MemoryFault {
    /// The trap slot which reports this fault to the guest.
    pub fn trap_slot(&self) -> TrapSlot {
        match self {
            MemoryFault::OddAddress(_) => TrapSlot::OddAddress,
            MemoryFault::Translation(_) => TrapSlot::MemoryManagement,
            MemoryFault::Bus(_) => TrapSlot::NonExistentMemory,
        }
    }
}

impl From<TranslationFault> for MemoryFault {
    fn from(f: TranslationFault) -> MemoryFault {
        MemoryFault::Translation(f)
    }
}

impl From<BusFault> for MemoryFault {
    fn from(f: BusFault) -> MemoryFault {
        MemoryFault::Bus(f)
    }
}

impl Display for MemoryFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            MemoryFault::OddAddress(va) => write!(f, "word reference to odd address {va}"),
            MemoryFault::Translation(t) => write!(f, "memory management: {t}"),
            MemoryFault::Bus(b) => write!(f, "bus error: {b}"),
        }
    }
}

impl Error for MemoryFault {}

/// A device register refused an access.  The bus reports this to the
/// processor in the same way as an address to which nothing
/// responds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    NoSuchRegister,
    WidthNotSupported,
}

impl Display for RegisterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            RegisterError::NoSuchRegister => "no register at this offset",
            RegisterError::WidthNotSupported => "register does not support this access width",
        })
    }
}

impl Error for RegisterError {}

#[test]
fn test_slot_index_layout() {
    let s = SlotIndex::new(Mode::User, Space::Data, 5);
    assert_eq!(s.bits(), 0o75);
    assert_eq!(s.mode(), Mode::User);
    assert_eq!(s.space(), Space::Data);
    assert_eq!(s.page(), 5);
    assert_eq!(SlotIndex::new(Mode::Kernel, Space::Instruction, 2).index(), 2);
    assert_eq!(SlotIndex::from_bits(0o377).bits(), 0o77);
}

#[test]
fn test_faults_map_to_trap_slots() {
    let slot = SlotIndex::new(Mode::Kernel, Space::Data, 0);
    assert_eq!(
        MemoryFault::from(TranslationFault {
            reason: FaultReason::ReadOnly,
            slot
        })
        .trap_slot(),
        TrapSlot::MemoryManagement
    );
    assert_eq!(
        MemoryFault::OddAddress(VirtualAddress::new(1)).trap_slot(),
        TrapSlot::OddAddress
    );
    assert_eq!(
        MemoryFault::from(BusFault::NonExistentResource(PhysicalAddress::MAX)).trap_slot(),
        TrapSlot::NonExistentMemory
    );
}
