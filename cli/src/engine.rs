//! A stand-in for an instruction engine.
//!
//! There is no instruction set here.  Instead every trap and
//! interrupt vector points at a "handler" whose behaviour is built
//! in: the clock handler acknowledges the tick, the console receiver
//! handler echoes the character it was given, and every other
//! handler does nothing.  Each handler ends with a return from
//! interrupt.  This is enough to exercise translation, dispatch,
//! device registers and the event queue end to end.
use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{event, span, Level};

use base::prelude::*;
use cpu::{
    Dispatch, DispatchFailure, Machine, Psw, CLOCK_REGISTER, CLOCK_VECTOR, CONSOLE_RECEIVE_VECTOR,
    CONSOLE_REGISTERS,
};

use crate::clock::SimulatedClock;

/// Handlers live at this address plus the vector.
const HANDLER_BASE: u16 = 0o2000;
/// Vectors from 4 up to (but not including) this get a handler.
const VECTOR_LIMIT: u16 = 0o400;
const KERNEL_STACK_TOP: u16 = 0o1000;
/// Handlers run at priority 7.
const HANDLER_PSW: u16 = 0o340;
/// Guard against a condition which re-posts itself forever.
const MAX_DISPATCHES_PER_STEP: usize = 64;

/// The console registers, as seen from kernel virtual addresses
/// while translation is off.
const fn unmapped_register(pa: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new((pa.bits() - IO_PAGE_BASE + UNMAPPED_IO_PAGE_BASE) as u16)
}
const RCSR: VirtualAddress = unmapped_register(CONSOLE_REGISTERS);
const RBUF: VirtualAddress = RCSR.wrapping_add(2);
const XBUF: VirtualAddress = RCSR.wrapping_add(6);
const LKS: VirtualAddress = unmapped_register(CLOCK_REGISTER);

const INTERRUPT_ENABLE: u16 = 0o100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    ClockTick,
    ConsoleReceive,
    Ignore,
}

#[derive(Debug, Default)]
pub struct Activity {
    /// How many times each vector was taken, and what for.
    pub dispatches: BTreeMap<u16, (String, u64)>,
    /// Dispatches abandoned because the kernel stack was unusable.
    pub abandoned: u64,
    pub echoed: u64,
}

pub struct StubEngine {
    activity: Activity,
}

impl StubEngine {
    pub fn new() -> StubEngine {
        StubEngine {
            activity: Activity::default(),
        }
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Fill the vector area, set up the kernel stack and enable
    /// interrupts from the clock and the console receiver.
    pub fn install(&self, machine: &mut Machine) -> Result<(), Box<dyn std::error::Error>> {
        for vector in (4..VECTOR_LIMIT).step_by(4) {
            let v = PhysicalAddress::masked(u32::from(vector));
            machine.physical_write(v, Width::Word, HANDLER_BASE + vector)?;
            machine.physical_write(
                PhysicalAddress::masked(u32::from(vector) + 2),
                Width::Word,
                HANDLER_PSW,
            )?;
        }
        machine.set_stack_pointer(Mode::Kernel, KERNEL_STACK_TOP);
        machine.set_psw(Psw::default());
        machine.physical_write(CLOCK_REGISTER, Width::Word, INTERRUPT_ENABLE)?;
        machine.physical_write(CONSOLE_REGISTERS, Width::Word, INTERRUPT_ENABLE)?;
        Ok(())
    }

    fn handler_at(pc: u16) -> Handler {
        match pc.checked_sub(HANDLER_BASE) {
            Some(CLOCK_VECTOR) => Handler::ClockTick,
            Some(CONSOLE_RECEIVE_VECTOR) => Handler::ConsoleReceive,
            _ => Handler::Ignore,
        }
    }

    fn note(&mut self, dispatch: &Dispatch) {
        if !dispatch.entered {
            self.activity.abandoned += 1;
            return;
        }
        let label = match &dispatch.interrupt {
            Some(ack) => format!("level {} interrupt", ack.level),
            None => format!("{} trap", dispatch.slot),
        };
        self.activity
            .dispatches
            .entry(dispatch.vector)
            .or_insert((label, 0))
            .1 += 1;
    }

    /// Run the handler the machine has just entered, then return
    /// from it.  A failed reference posts a trap, which is taken
    /// after the return like any other.
    fn run_handler(&mut self, machine: &mut Machine) {
        let pc = machine.pc();
        machine.begin_instruction(pc);
        let outcome = match StubEngine::handler_at(pc) {
            Handler::ClockTick => machine.write(LKS, Space::Data, Width::Word, INTERRUPT_ENABLE),
            Handler::ConsoleReceive => machine
                .read(RBUF, Space::Data, Width::Word)
                .and_then(|ch| machine.write(XBUF, Space::Data, Width::Word, ch))
                .map(|()| self.activity.echoed += 1),
            Handler::Ignore => Ok(()),
        };
        if let Err(e) = outcome {
            event!(Level::WARN, "handler at {pc:o} failed: {e}");
        }
        if let Err(e) = machine.return_from_trap() {
            event!(Level::WARN, "return from handler at {pc:o} failed: {e}");
        }
    }

    /// Take everything that is pending.
    fn service(&mut self, machine: &mut Machine) -> Result<(), DispatchFailure> {
        for _ in 0..MAX_DISPATCHES_PER_STEP {
            match machine.service_pending()? {
                None => return Ok(()),
                Some(dispatch) => {
                    self.note(&dispatch);
                    if dispatch.entered {
                        self.run_handler(machine);
                    }
                }
            }
        }
        event!(
            Level::WARN,
            "still dispatching after {MAX_DISPATCHES_PER_STEP} traps, moving on"
        );
        Ok(())
    }

    /// Run until simulated time reaches `limit` or nothing more is
    /// scheduled.
    pub fn run(
        &mut self,
        machine: &mut Machine,
        clock: &mut SimulatedClock,
        limit: Duration,
    ) -> Result<(), DispatchFailure> {
        let span = span!(Level::INFO, "run", limit=?limit);
        let _enter = span.enter();
        loop {
            self.service(machine)?;
            let next = match machine.next_event_due() {
                Some(due) if due <= limit => due,
                _ => break,
            };
            clock.advance_to_simulated_time(next);
            machine.advance(&clock.make_fresh_context());
        }
        clock.advance_to_simulated_time(limit);
        machine.advance(&clock.make_fresh_context());
        self.service(machine)
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpu::{
        Context, CpuModel, InputEvent, LineClock, OutputEvent, SerialConsole,
        CONSOLE_WINDOW_BYTES,
    };

    #[test]
    fn test_register_addresses() {
        assert_eq!(RCSR.bits(), 0o177560);
        assert_eq!(XBUF.bits(), 0o177566);
        assert_eq!(LKS.bits(), 0o177546);
    }

    #[test]
    fn test_echoes_console_input_and_counts_ticks() {
        let mut machine = Machine::new(&Context::power_on(), CpuModel::Pdp11_70.configuration())
            .expect("valid configuration");
        machine
            .attach(
                CLOCK_REGISTER,
                2,
                Box::new(LineClock::new()),
                Some(LineClock::interrupt_request()),
            )
            .expect("clock attaches");
        let console = machine
            .attach(
                CONSOLE_REGISTERS,
                CONSOLE_WINDOW_BYTES,
                Box::new(SerialConsole::new()),
                Some(SerialConsole::interrupt_request()),
            )
            .expect("console attaches");
        let mut engine = StubEngine::new();
        engine.install(&mut machine).expect("vectors are in memory");
        machine
            .input(
                console,
                InputEvent::ConsoleKeyboardInput {
                    data: b"hi".to_vec(),
                },
            )
            .expect("console accepts input");

        let mut clock = SimulatedClock::new();
        engine
            .run(&mut machine, &mut clock, Duration::from_millis(100))
            .expect("no dispatch fails");

        let printed: Vec<u8> = machine
            .drain_output()
            .into_iter()
            .map(|OutputEvent::ConsolePrint { byte, .. }| byte)
            .collect();
        assert_eq!(printed, b"hi".to_vec());
        assert_eq!(engine.activity().echoed, 2);
        let ticks = engine
            .activity()
            .dispatches
            .get(&CLOCK_VECTOR)
            .map(|(_, n)| *n);
        assert_eq!(ticks, Some(6));
    }
}
