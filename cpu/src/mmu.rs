//! The memory management unit relocates 16-bit virtual addresses into
//! the physical address space.
//!
//! There are 64 page descriptors: for each of the four processor
//! modes, eight pages of instruction space and eight pages of data
//! space.  Each descriptor gives a relocation (the physical address of
//! the start of the page, in 64-byte units), a length (in 64-byte
//! blocks), a direction of expansion and access permissions.
//!
//! Translation of a reference is refused if the page is not
//! resident, if the reference lies outside the valid part of the page,
//! or if it is a write to a read-only page.  Refusals are reported to
//! the [`FaultRecorder`], which keeps the details of the first of them
//! for the guest's trap handler.
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use base::prelude::*;

use crate::config::PhysicalWidth;
use crate::fault::{FaultReason, SlotIndex, TranslationFault};

mod recorder;

pub(crate) use recorder::SR0_ABORT_BITS;
pub use recorder::{FaultRecord, FaultRecorder};

/// Bits of the descriptor control word.
const PDR_LENGTH_SHIFT: u16 = 8;
const PDR_LENGTH_MASK: u16 = 0o177;
const PDR_WRITTEN: u16 = 1 << 6;
const PDR_EXPAND_DOWNWARD: u16 = 1 << 3;
const PDR_WRITABLE: u16 = 1 << 2;
const PDR_READABLE: u16 = 1 << 1;

/// Bits of SR3.
const SR3_EXTENDED: u16 = 1 << 5;
const SR3_BUS_MAP: u16 = 1 << 4;
const SR3_KERNEL_DATA: u16 = 1 << 2;
const SR3_SUPERVISOR_DATA: u16 = 1 << 1;
const SR3_USER_DATA: u16 = 1;

/// One page descriptor: the contents of a page address register
/// (`relocation`) and a page descriptor register (everything else).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDescriptor {
    /// Physical address of the start of the page, in 64-byte units.
    pub relocation: u16,
    /// Page boundary, in 64-byte blocks.
    pub length_field: u8,
    pub expand_downward: bool,
    pub readable: bool,
    pub writable: bool,
    /// Set by the first successful write through this descriptor.
    pub written: bool,
}

impl PageDescriptor {
    /// Encode the descriptor as a page descriptor register.
    pub fn control_word(&self) -> u16 {
        let mut word = u16::from(self.length_field & 0o177) << PDR_LENGTH_SHIFT;
        if self.written {
            word |= PDR_WRITTEN;
        }
        if self.expand_downward {
            word |= PDR_EXPAND_DOWNWARD;
        }
        if self.writable {
            word |= PDR_WRITABLE;
        }
        if self.readable {
            word |= PDR_READABLE;
        }
        word
    }

    /// Load the descriptor register.  The written bit cannot be set
    /// this way; any load clears it.
    fn load_control_word(&mut self, word: u16) {
        self.length_field = ((word >> PDR_LENGTH_SHIFT) & PDR_LENGTH_MASK) as u8;
        self.expand_downward = word & PDR_EXPAND_DOWNWARD != 0;
        self.writable = word & PDR_WRITABLE != 0;
        self.readable = word & PDR_READABLE != 0;
        self.written = false;
    }

    /// Whether `block` lies outside the valid part of the page.
    /// Upward-expanding pages are valid from block 0 to the length
    /// field inclusive; downward-expanding pages from the length field
    /// to block 127.
    pub fn length_violation(&self, block: u8) -> bool {
        if self.expand_downward {
            block < self.length_field
        } else {
            block > self.length_field
        }
    }
}

/// Which word of a descriptor a register address selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorWord {
    /// The page descriptor register.
    Control,
    /// The page address register.
    Relocation,
}

/// Decode a byte offset within one mode's 64-byte block of
/// descriptor registers.  The block holds I-space control words, then
/// D-space control words, then I-space relocations, then D-space
/// relocations, eight words of each.
pub fn decode_descriptor_register(mode: Mode, offset: u32) -> Option<(SlotIndex, DescriptorWord)> {
    if offset >= 0o100 {
        return None;
    }
    let page = ((offset >> 1) & 7) as u8;
    let space = if offset & 0o20 != 0 {
        Space::Data
    } else {
        Space::Instruction
    };
    let word = if offset & 0o40 != 0 {
        DescriptorWord::Relocation
    } else {
        DescriptorWord::Control
    };
    Some((SlotIndex::new(mode, space, page), word))
}

/// Form the physical address of a virtual address when translation
/// is off.  The top 8KiB of the virtual space reaches the I/O page.
pub const fn unmapped_address(va: VirtualAddress) -> PhysicalAddress {
    let a = va.bits() as u32;
    if a >= UNMAPPED_IO_PAGE_BASE {
        PhysicalAddress::masked(a | (IO_PAGE_BASE - UNMAPPED_IO_PAGE_BASE))
    } else {
        PhysicalAddress::masked(a)
    }
}

/// Alias an 18-bit address into the 22-bit space: the top 8KiB of
/// the 18-bit space is the I/O page.
const fn legacy_address(a: u32) -> PhysicalAddress {
    let a = a & LEGACY_ADDRESS_MASK;
    if a >= LEGACY_IO_PAGE_BASE {
        PhysicalAddress::masked(a | (IO_PAGE_BASE - LEGACY_IO_PAGE_BASE))
    } else {
        PhysicalAddress::masked(a)
    }
}

#[derive(Debug)]
pub struct PageTable {
    descriptors: Vec<PageDescriptor>,
    physical_width: PhysicalWidth,
    /// SR0 bit 0.
    enabled: bool,
    /// SR3 bit 5; always clear on 18-bit processors.
    extended: bool,
    /// SR3 bit 4.  Nothing on this bus uses it, but software can
    /// read back what it wrote.
    bus_map: bool,
    /// SR3 bits 2:0, indexed by mode.
    data_space: [bool; 4],
}

impl PageTable {
    pub fn new(physical_width: PhysicalWidth) -> PageTable {
        PageTable {
            descriptors: vec![PageDescriptor::default(); SlotIndex::COUNT],
            physical_width,
            enabled: false,
            extended: false,
            bus_map: false,
            data_space: [false; 4],
        }
    }

    /// Return to the power-on state: everything inaccessible and
    /// translation off.
    pub fn reset(&mut self) {
        self.descriptors.fill(PageDescriptor::default());
        self.reset_enables();
    }

    /// Clear the enables only, as a bus reset does.  Descriptors
    /// survive a bus reset.
    pub fn reset_enables(&mut self) {
        self.enabled = false;
        self.extended = false;
        self.bus_map = false;
        self.data_space = [false; 4];
    }

    pub fn physical_width(&self) -> PhysicalWidth {
        self.physical_width
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            event!(
                Level::DEBUG,
                "memory management {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        self.enabled = enabled;
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn data_space_enabled(&self, mode: Mode) -> bool {
        self.data_space[mode.index()]
    }

    pub fn descriptor(&self, slot: SlotIndex) -> &PageDescriptor {
        &self.descriptors[slot.index()]
    }

    pub fn descriptors(&self) -> &[PageDescriptor] {
        &self.descriptors
    }

    pub fn read_descriptor_word(&self, slot: SlotIndex, word: DescriptorWord) -> u16 {
        let d = self.descriptor(slot);
        match word {
            DescriptorWord::Control => d.control_word(),
            DescriptorWord::Relocation => d.relocation,
        }
    }

    /// A software write to either word of a descriptor.  This is the
    /// only way the written bit is ever cleared.
    pub fn write_descriptor_word(&mut self, slot: SlotIndex, word: DescriptorWord, value: u16) {
        let mask = self.physical_width.relocation_mask();
        let d = &mut self.descriptors[slot.index()];
        match word {
            DescriptorWord::Control => d.load_control_word(value),
            DescriptorWord::Relocation => {
                d.relocation = value & mask;
                d.written = false;
            }
        }
        event!(Level::TRACE, "descriptor {slot} is now {:?}", d);
    }

    /// Replace a descriptor wholesale.  Used when restoring a
    /// snapshot and by hosts which set up mappings directly.
    pub fn set_descriptor(&mut self, slot: SlotIndex, mut descriptor: PageDescriptor) {
        descriptor.relocation &= self.physical_width.relocation_mask();
        descriptor.length_field &= 0o177;
        self.descriptors[slot.index()] = descriptor;
    }

    pub fn sr3(&self) -> u16 {
        let mut value = 0;
        if self.extended {
            value |= SR3_EXTENDED;
        }
        if self.bus_map {
            value |= SR3_BUS_MAP;
        }
        if self.data_space[Mode::Kernel.index()] {
            value |= SR3_KERNEL_DATA;
        }
        if self.data_space[Mode::Supervisor.index()] {
            value |= SR3_SUPERVISOR_DATA;
        }
        if self.data_space[Mode::User.index()] {
            value |= SR3_USER_DATA;
        }
        value
    }

    pub fn write_sr3(&mut self, value: u16) {
        let wide = self.physical_width == PhysicalWidth::Extended22;
        self.extended = wide && value & SR3_EXTENDED != 0;
        self.bus_map = wide && value & SR3_BUS_MAP != 0;
        self.data_space[Mode::Kernel.index()] = value & SR3_KERNEL_DATA != 0;
        self.data_space[Mode::Supervisor.index()] = value & SR3_SUPERVISOR_DATA != 0;
        self.data_space[Mode::User.index()] = value & SR3_USER_DATA != 0;
        event!(Level::DEBUG, "SR3 set to {:o}", self.sr3());
    }

    /// The descriptor used for a reference.  Data references use
    /// instruction-space descriptors unless data space is enabled for
    /// the mode.
    pub fn slot_for(&self, va: VirtualAddress, mode: Mode, space: Space) -> SlotIndex {
        let space = match space {
            Space::Data if self.data_space_enabled(mode) => Space::Data,
            _ => Space::Instruction,
        };
        SlotIndex::new(mode, space, va.page())
    }

    /// Translate a virtual address.  On success the written bit of
    /// the descriptor is set for writes.  On failure nothing in the
    /// page table changes, and the fault is offered to `recorder`.
    pub fn translate(
        &mut self,
        va: VirtualAddress,
        mode: Mode,
        space: Space,
        access: AccessKind,
        recorder: &mut FaultRecorder,
    ) -> Result<PhysicalAddress, TranslationFault> {
        if !self.enabled {
            return Ok(unmapped_address(va));
        }
        let slot = self.slot_for(va, mode, space);
        let d = &mut self.descriptors[slot.index()];
        let refusal = if !d.readable {
            Some(FaultReason::NonResident)
        } else if d.length_violation(va.block()) {
            Some(FaultReason::PageLength)
        } else if access == AccessKind::Write && !d.writable {
            Some(FaultReason::ReadOnly)
        } else {
            None
        };
        if let Some(reason) = refusal {
            event!(
                Level::DEBUG,
                "{access:?} reference to {va} refused by {slot}: {reason}"
            );
            recorder.latch(reason, slot);
            return Err(TranslationFault { reason, slot });
        }
        if access == AccessKind::Write {
            d.written = true;
        }
        let a = (u32::from(va.offset_in_page()) + (u32::from(d.relocation) << 6))
            & PHYSICAL_ADDRESS_MASK;
        let pa = if self.extended {
            PhysicalAddress::masked(a)
        } else {
            legacy_address(a)
        };
        event!(Level::TRACE, "{access:?} {va} via {slot} -> {pa}");
        Ok(pa)
    }
}
