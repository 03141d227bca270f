//! Programmer-visible processor state which the trap and interrupt
//! machinery reads and replaces.
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use base::prelude::*;

/// The processor status word.
///
/// | 15:14        | 13:12         | 11:8   | 7:5      | 4     | 3:0  |
/// | ------------ | ------------- | ------ | -------- | ----- | ---- |
/// | current mode | previous mode | unused | priority | trace | NZVC |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Psw(u16);

const PSW_TRACE: u16 = 1 << 4;

impl Psw {
    pub const fn from_bits(bits: u16) -> Psw {
        Psw(bits)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn current_mode(&self) -> Mode {
        Mode::from_bits(self.0 >> 14)
    }

    pub const fn previous_mode(&self) -> Mode {
        Mode::from_bits(self.0 >> 12)
    }

    pub const fn priority(&self) -> PriorityLevel {
        PriorityLevel::from_bits(self.0 >> 5)
    }

    pub const fn trace(&self) -> bool {
        self.0 & PSW_TRACE != 0
    }

    pub const fn condition_codes(&self) -> u16 {
        self.0 & 0o17
    }

    #[must_use]
    pub const fn with_current_mode(self, mode: Mode) -> Psw {
        Psw((self.0 & 0o037777) | (mode.bits() << 14))
    }

    #[must_use]
    pub const fn with_previous_mode(self, mode: Mode) -> Psw {
        Psw((self.0 & 0o147777) | (mode.bits() << 12))
    }

    #[must_use]
    pub const fn with_priority(self, level: PriorityLevel) -> Psw {
        Psw((self.0 & !0o340) | ((level.value() as u16) << 5))
    }

    /// The value after a software write of `value` through the PSW
    /// register address.  Only an instruction can change the trace
    /// bit.
    #[must_use]
    pub const fn written_by_software(self, value: u16) -> Psw {
        Psw((value & !PSW_TRACE) | (self.0 & PSW_TRACE))
    }
}

impl Display for Psw {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "{:06o} ({} mode, previous {}, priority {})",
            self.0,
            self.current_mode(),
            self.previous_mode(),
            self.priority()
        )
    }
}

/// The registers the trap machinery uses.  Only the stack pointer
/// is banked by mode; the other general registers belong to the
/// instruction engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorState {
    pub psw: Psw,
    pub pc: u16,
    /// Stack pointers, indexed by mode.
    pub stack_pointers: [u16; 4],
}

impl ProcessorState {
    pub fn mode(&self) -> Mode {
        self.psw.current_mode()
    }

    pub fn stack_pointer(&self, mode: Mode) -> u16 {
        self.stack_pointers[mode.index()]
    }

    pub fn set_stack_pointer(&mut self, mode: Mode, value: u16) {
        self.stack_pointers[mode.index()] = value;
    }
}

#[test]
fn test_psw_fields() {
    let psw = Psw::from_bits(0o170344);
    assert_eq!(psw.current_mode(), Mode::User);
    assert_eq!(psw.previous_mode(), Mode::User);
    assert_eq!(psw.priority(), PriorityLevel::MAX);
    assert!(!psw.trace());
    assert_eq!(psw.condition_codes(), 0o4);
    let kernel = psw
        .with_current_mode(Mode::Kernel)
        .with_previous_mode(Mode::Supervisor)
        .with_priority(PriorityLevel::ZERO);
    assert_eq!(kernel.bits(), 0o010004);
}

#[test]
fn test_software_cannot_change_trace_bit() {
    let traced = Psw::from_bits(PSW_TRACE);
    assert_eq!(traced.written_by_software(0o340).bits(), 0o340 | PSW_TRACE);
    assert_eq!(Psw::default().written_by_software(0o377).bits(), 0o357);
    assert_eq!(traced.written_by_software(0o357).bits(), 0o377);
}
