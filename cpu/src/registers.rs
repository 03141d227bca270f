//! The processor's own registers in the I/O page.
//!
//! | Address              | Register                            |
//! | -------------------- | ----------------------------------- |
//! | 17772200-17772276    | supervisor page descriptors         |
//! | 17772300-17772376    | kernel page descriptors             |
//! | 17772516             | SR3                                 |
//! | 17777572-17777576    | SR0, SR1, SR2                       |
//! | 17777600-17777676    | user page descriptors               |
//! | 17777766             | CPU error register                  |
//! | 17777772             | program interrupt request (PIRQ)    |
//! | 17777776             | processor status word               |
//!
//! These windows are reserved in the device registry when the
//! machine is built, so no device can be attached over them.
use base::prelude::*;

use crate::bus::Window;
use crate::fault::RegisterError;
use crate::interrupt::InterruptFabric;
use crate::mmu::{decode_descriptor_register, SR0_ABORT_BITS};
use crate::processor::Processor;

/// CPU error register bits.
pub const CPUERR_ILLEGAL_HALT: u16 = 1 << 7;
pub const CPUERR_ODD_ADDRESS: u16 = 1 << 6;
pub const CPUERR_NON_EXISTENT_MEMORY: u16 = 1 << 5;
pub const CPUERR_TIMEOUT: u16 = 1 << 4;
pub const CPUERR_YELLOW_STACK: u16 = 1 << 3;
pub const CPUERR_RED_STACK: u16 = 1 << 2;

const SR0_ENABLE: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorRegister {
    /// SR0, SR1 and SR2.
    StatusRegisters,
    StatusRegister3,
    Descriptors(Mode),
    CpuError,
    ProgramInterruptRequest,
    StatusWord,
}

impl ProcessorRegister {
    pub const ALL: [ProcessorRegister; 8] = [
        ProcessorRegister::Descriptors(Mode::Supervisor),
        ProcessorRegister::Descriptors(Mode::Kernel),
        ProcessorRegister::StatusRegister3,
        ProcessorRegister::StatusRegisters,
        ProcessorRegister::Descriptors(Mode::User),
        ProcessorRegister::CpuError,
        ProcessorRegister::ProgramInterruptRequest,
        ProcessorRegister::StatusWord,
    ];

    pub fn window(&self) -> Window {
        match self {
            ProcessorRegister::StatusRegisters => Window::new(pa!(0o17777572), 6),
            ProcessorRegister::StatusRegister3 => Window::new(pa!(0o17772516), 2),
            ProcessorRegister::Descriptors(Mode::Kernel) => Window::new(pa!(0o17772300), 0o100),
            ProcessorRegister::Descriptors(Mode::Supervisor) => {
                Window::new(pa!(0o17772200), 0o100)
            }
            // There are no registers for the illegal mode; its
            // descriptors stay inaccessible.
            ProcessorRegister::Descriptors(Mode::User | Mode::Illegal) => {
                Window::new(pa!(0o17777600), 0o100)
            }
            ProcessorRegister::CpuError => Window::new(pa!(0o17777766), 2),
            ProcessorRegister::ProgramInterruptRequest => Window::new(pa!(0o17777772), 2),
            ProcessorRegister::StatusWord => Window::new(pa!(0o17777776), 2),
        }
    }
}

/// The full word at `offset`, without side effects.
fn read_word(
    register: ProcessorRegister,
    offset: u32,
    cpu: &Processor,
    fabric: &InterruptFabric,
) -> Result<u16, RegisterError> {
    let offset = offset & !1;
    match register {
        ProcessorRegister::StatusRegisters => match offset {
            0 => {
                let enable = if cpu.page_table.is_enabled() {
                    SR0_ENABLE
                } else {
                    0
                };
                Ok(cpu.recorder.snapshot().sr0_bits() | enable)
            }
            2 => Ok(cpu.recorder.register_changes()),
            4 => Ok(cpu.recorder.instruction_pc()),
            _ => Err(RegisterError::NoSuchRegister),
        },
        ProcessorRegister::StatusRegister3 => Ok(cpu.page_table.sr3()),
        ProcessorRegister::Descriptors(mode) => decode_descriptor_register(mode, offset)
            .map(|(slot, word)| cpu.page_table.read_descriptor_word(slot, word))
            .ok_or(RegisterError::NoSuchRegister),
        ProcessorRegister::CpuError => Ok(cpu.cpu_error),
        ProcessorRegister::ProgramInterruptRequest => Ok(fabric.pirq()),
        ProcessorRegister::StatusWord => Ok(cpu.state.psw.bits()),
    }
}

pub(crate) fn read(
    register: ProcessorRegister,
    offset: u32,
    width: Width,
    cpu: &Processor,
    fabric: &InterruptFabric,
) -> Result<u16, RegisterError> {
    let word = read_word(register, offset, cpu, fabric)?;
    Ok(width.extract(offset & 1 != 0, word))
}

/// Write a processor register.  A byte write changes only the
/// addressed byte of the register.  The caller must re-evaluate
/// interrupts afterwards, since PIRQ and PSW writes affect them.
pub(crate) fn write(
    register: ProcessorRegister,
    offset: u32,
    width: Width,
    value: u16,
    cpu: &mut Processor,
    fabric: &mut InterruptFabric,
) -> Result<(), RegisterError> {
    let current = read_word(register, offset, cpu, fabric)?;
    let value = width.merge(offset & 1 != 0, current, value);
    match register {
        ProcessorRegister::StatusRegisters => {
            // SR1 and SR2 are read-only.
            if offset & !1 == 0 {
                cpu.recorder.write_abort_bits(value & SR0_ABORT_BITS);
                cpu.page_table.set_enabled(value & SR0_ENABLE != 0);
            }
        }
        ProcessorRegister::StatusRegister3 => cpu.page_table.write_sr3(value),
        ProcessorRegister::Descriptors(mode) => {
            if let Some((slot, word)) = decode_descriptor_register(mode, offset & !1) {
                cpu.page_table.write_descriptor_word(slot, word, value);
            }
        }
        ProcessorRegister::CpuError => {
            cpu.cpu_error = 0;
            cpu.traps.clear_by_software();
        }
        ProcessorRegister::ProgramInterruptRequest => fabric.write_pirq(value),
        ProcessorRegister::StatusWord => {
            cpu.state.psw = cpu.state.psw.written_by_software(value);
        }
    }
    Ok(())
}
