//! Value types for addresses, processor modes and access widths.
//!
//! The processor forms 16-bit virtual addresses.  The memory
//! management unit relocates these into a physical address space of
//! either 18 bits (legacy models) or 22 bits (extended models).  In
//! both cases the emulator represents physical addresses as 22-bit
//! quantities; legacy addresses are simply aliased into the 22-bit
//! space, with the top 8KiB of any physical space being the I/O page.
//!
//! Addresses are conventionally written in octal, and so all the
//! `Display` implementations in this module use octal.
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter, Octal};

use serde::{Deserialize, Serialize};
#[cfg(test)]
use test_strategy::Arbitrary;

/// The highest address which can be formed in 22 bits.
pub const PHYSICAL_ADDRESS_MASK: u32 = 0o17777777;

/// The highest address which can be formed in 18 bits.
pub const LEGACY_ADDRESS_MASK: u32 = 0o777777;

/// The start of the I/O page within the 22-bit physical address
/// space.  Everything from here to [`PHYSICAL_ADDRESS_MASK`] is
/// register space, not memory.
pub const IO_PAGE_BASE: u32 = 0o17760000;

/// The start of the I/O page as seen within an 18-bit physical
/// address.
pub const LEGACY_IO_PAGE_BASE: u32 = 0o760000;

/// The start of the I/O page as seen within a 16-bit virtual address
/// when memory management is disabled.
pub const UNMAPPED_IO_PAGE_BASE: u32 = 0o160000;

/// Represents a failure to convert a number into one of the address
/// types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionFailed {
    TooLarge,
}

impl Error for ConversionFailed {}

impl Display for ConversionFailed {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            ConversionFailed::TooLarge => f.write_str("value is too large"),
        }
    }
}

/// A 16-bit virtual address, as formed by the processor.
///
/// A virtual address splits into a 3-bit page number (bits 15:13) and
/// a 13-bit offset within the page.  The offset in turn splits into a
/// 7-bit block number (bits 12:6) and a 6-bit displacement within a
/// 64-byte block.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtualAddress(u16);

impl VirtualAddress {
    pub const ZERO: VirtualAddress = VirtualAddress(0);

    /// Mask selecting the offset within an 8KiB page.
    pub const IN_PAGE_MASK: u16 = 0o17777;

    pub const fn new(a: u16) -> VirtualAddress {
        VirtualAddress(a)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// The page number, 0 to 7.
    pub const fn page(&self) -> u8 {
        (self.0 >> 13) as u8
    }

    /// The offset of this address within its page.
    pub const fn offset_in_page(&self) -> u16 {
        self.0 & Self::IN_PAGE_MASK
    }

    /// The number of the 64-byte block (within the page) containing
    /// this address.
    pub const fn block(&self) -> u8 {
        ((self.0 >> 6) & 0o177) as u8
    }

    pub const fn is_odd(&self) -> bool {
        self.0 & 1 != 0
    }

    /// The address `delta` bytes further on, wrapping at 16 bits.
    pub const fn wrapping_add(&self, delta: u16) -> VirtualAddress {
        VirtualAddress(self.0.wrapping_add(delta))
    }

    pub const fn wrapping_sub(&self, delta: u16) -> VirtualAddress {
        VirtualAddress(self.0.wrapping_sub(delta))
    }
}

impl From<u16> for VirtualAddress {
    fn from(a: u16) -> VirtualAddress {
        VirtualAddress(a)
    }
}

impl From<VirtualAddress> for u16 {
    fn from(a: VirtualAddress) -> u16 {
        a.0
    }
}

impl Debug for VirtualAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "VirtualAddress({:06o})", self.0)
    }
}

impl Display for VirtualAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{:06o}", self.0)
    }
}

impl Octal for VirtualAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        Octal::fmt(&self.0, f)
    }
}

/// A 22-bit physical address.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysicalAddress(u32);

impl PhysicalAddress {
    pub const ZERO: PhysicalAddress = PhysicalAddress(0);
    pub const MAX: PhysicalAddress = PhysicalAddress(PHYSICAL_ADDRESS_MASK);
    pub const IO_PAGE: PhysicalAddress = PhysicalAddress(IO_PAGE_BASE);

    /// Form a physical address from a constant.  Out-of-range
    /// constants are rejected at compile time.  Normally this is
    /// used through the [`pa!`](crate::pa) macro.
    pub const fn new<const N: u32>() -> PhysicalAddress {
        struct Helper<const M: u32>;
        impl<const M: u32> Helper<M> {
            const A: PhysicalAddress = {
                if M > PHYSICAL_ADDRESS_MASK {
                    panic!("physical address is out of range")
                } else {
                    PhysicalAddress(M)
                }
            };
        }
        Helper::<N>::A
    }

    /// Form a physical address by discarding any bits above bit 21.
    pub const fn masked(a: u32) -> PhysicalAddress {
        PhysicalAddress(a & PHYSICAL_ADDRESS_MASK)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn is_in_io_page(&self) -> bool {
        self.0 >= IO_PAGE_BASE
    }

    /// Clear the low bit, giving the address of the word containing
    /// this byte address.
    pub const fn word_aligned(&self) -> PhysicalAddress {
        PhysicalAddress(self.0 & !1)
    }

    pub const fn is_odd(&self) -> bool {
        self.0 & 1 != 0
    }

    /// Offset `delta` bytes forward, or None if that would leave the
    /// physical address space.
    pub fn checked_add(&self, delta: u32) -> Option<PhysicalAddress> {
        self.0
            .checked_add(delta)
            .filter(|a| *a <= PHYSICAL_ADDRESS_MASK)
            .map(PhysicalAddress)
    }

    /// The distance from `base` to this address, if this address is
    /// not below `base`.
    pub fn offset_from(&self, base: PhysicalAddress) -> Option<u32> {
        self.0.checked_sub(base.0)
    }
}

impl TryFrom<u32> for PhysicalAddress {
    type Error = ConversionFailed;
    fn try_from(a: u32) -> Result<PhysicalAddress, ConversionFailed> {
        if a > PHYSICAL_ADDRESS_MASK {
            Err(ConversionFailed::TooLarge)
        } else {
            Ok(PhysicalAddress(a))
        }
    }
}

impl From<PhysicalAddress> for u32 {
    fn from(a: PhysicalAddress) -> u32 {
        a.0
    }
}

impl Debug for PhysicalAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "PhysicalAddress({:08o})", self.0)
    }
}

impl Display for PhysicalAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{:08o}", self.0)
    }
}

impl Octal for PhysicalAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        Octal::fmt(&self.0, f)
    }
}

/// Processor mode.  The numeric values are the encoding used in the
/// current-mode and previous-mode fields of the processor status
/// word.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Mode {
    Kernel = 0,
    Supervisor = 1,
    /// Mode 2 is not a valid mode.  It still selects a (permanently
    /// inaccessible) block of page descriptors.
    Illegal = 2,
    User = 3,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Kernel, Mode::Supervisor, Mode::Illegal, Mode::User];

    /// Decode a mode from the bottom two bits of `bits`.
    pub const fn from_bits(bits: u16) -> Mode {
        match bits & 3 {
            0 => Mode::Kernel,
            1 => Mode::Supervisor,
            2 => Mode::Illegal,
            _ => Mode::User,
        }
    }

    pub const fn bits(&self) -> u16 {
        *self as u16
    }

    pub const fn index(&self) -> usize {
        *self as usize
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            Mode::Kernel => "kernel",
            Mode::Supervisor => "supervisor",
            Mode::Illegal => "illegal",
            Mode::User => "user",
        })
    }
}

/// Address space.  Instruction fetches always use instruction space;
/// operand references use data space when it is enabled for the
/// current mode.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Space {
    Instruction = 0,
    Data = 1,
}

impl Display for Space {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            Space::Instruction => "I",
            Space::Data => "D",
        })
    }
}

/// Whether a memory reference reads or modifies its target.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
}

/// The width of a bus transfer.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    /// Select the byte addressed by `odd` from `word` (for byte
    /// reads) or return `word` unchanged (for word reads).
    pub const fn extract(&self, odd: bool, word: u16) -> u16 {
        match self {
            Width::Word => word,
            Width::Byte if odd => word >> 8,
            Width::Byte => word & 0o377,
        }
    }

    /// Merge a written value into `old`.  A byte write replaces only
    /// the byte addressed by `odd`, using the bottom 8 bits of
    /// `value`.
    pub const fn merge(&self, odd: bool, old: u16, value: u16) -> u16 {
        match self {
            Width::Word => value,
            Width::Byte if odd => (old & 0o377) | ((value & 0o377) << 8),
            Width::Byte => (old & 0o177400) | (value & 0o377),
        }
    }
}

/// A processor or interrupt priority level, 0 to 7.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PriorityLevel(u8);

impl PriorityLevel {
    pub const ZERO: PriorityLevel = PriorityLevel(0);
    pub const MAX: PriorityLevel = PriorityLevel(7);

    /// Decode a level from the bottom three bits of `bits`.
    pub const fn from_bits(bits: u16) -> PriorityLevel {
        PriorityLevel((bits & 7) as u8)
    }

    pub const fn value(&self) -> u8 {
        self.0
    }

    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u8> for PriorityLevel {
    type Error = ConversionFailed;
    fn try_from(n: u8) -> Result<PriorityLevel, ConversionFailed> {
        if n > 7 {
            Err(ConversionFailed::TooLarge)
        } else {
            Ok(PriorityLevel(n))
        }
    }
}

impl From<PriorityLevel> for u8 {
    fn from(level: PriorityLevel) -> u8 {
        level.0
    }
}

impl Display for PriorityLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", self.0)
    }
}

#[test]
fn test_virtual_address_fields() {
    let va = VirtualAddress::new(0o147_302);
    assert_eq!(va.page(), 6);
    assert_eq!(va.offset_in_page(), 0o7302);
    assert_eq!(va.block(), 0o73);
    assert!(!va.is_odd());
    assert!(va.wrapping_add(1).is_odd());
    assert_eq!(VirtualAddress::new(0o177_776).wrapping_add(4).bits(), 2);
}

#[test]
fn test_physical_address_range() {
    assert!(PhysicalAddress::try_from(0o17777777_u32).is_ok());
    assert_eq!(
        PhysicalAddress::try_from(0o20000000_u32),
        Err(ConversionFailed::TooLarge)
    );
    assert_eq!(PhysicalAddress::masked(0o37777777), PhysicalAddress::MAX);
    assert!(!PhysicalAddress::masked(IO_PAGE_BASE - 2).is_in_io_page());
    assert_eq!(PhysicalAddress::MAX.checked_add(1), None);
    assert_eq!(
        PhysicalAddress::IO_PAGE.checked_add(0o17572),
        Some(PhysicalAddress::masked(0o17777572))
    );
}

#[test]
fn test_mode_encoding() {
    for mode in Mode::ALL {
        assert_eq!(Mode::from_bits(mode.bits()), mode);
    }
    assert_eq!(Mode::from_bits(0o177777), Mode::User);
}

#[test]
fn test_width_byte_lanes() {
    assert_eq!(Width::Byte.extract(false, 0o123456), 0o056);
    assert_eq!(Width::Byte.extract(true, 0o123456), 0o247);
    assert_eq!(Width::Word.extract(true, 0o123456), 0o123456);
    assert_eq!(Width::Byte.merge(true, 0o000377, 0o001), 0o000777);
    assert_eq!(Width::Byte.merge(false, 0o177400, 0o777), 0o177777);
}

#[test]
fn test_priority_level_range() {
    assert_eq!(PriorityLevel::try_from(7_u8), Ok(PriorityLevel::MAX));
    assert!(PriorityLevel::try_from(8_u8).is_err());
    assert_eq!(PriorityLevel::from_bits(0o345 >> 5), PriorityLevel::MAX);
}
