//! The `Machine` joins the processor's memory management and trap
//! machinery to the bus, the interrupt fabric and the attached
//! devices.
//!
//! An instruction engine drives it: it calls
//! [`Machine::begin_instruction`] at the start of each instruction,
//! makes its operand references with [`Machine::read`] and
//! [`Machine::write`], and at each instruction boundary calls
//! [`Machine::service_pending`] to take the most urgent pending trap or
//! interrupt.  A failed reference has no effect except to post a trap,
//! and the engine abandons the instruction when it sees the error.
//!
//! Between instructions the host calls [`Machine::advance`] to let
//! scheduled device activity happen.
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use tracing::{event, span, Level};

use base::prelude::*;

use crate::bus::{BusHost, BusOp, BusRouter, DeviceId, RegistrationError, Window};
use crate::config::{ConfigurationError, CpuConfiguration};
use crate::context::Context;
use crate::event::{InputEvent, InputEventError, OutputEvent};
use crate::fault::{BusFault, MemoryFault};
use crate::interrupt::{Acknowledged, InterruptFabric, InterruptRequest};
use crate::io::{Device, EventQueue};
use crate::memory::MemoryUnit;
use crate::processor::Processor;
use crate::registers::{ProcessorRegister, CPUERR_RED_STACK, CPUERR_YELLOW_STACK};
use crate::snapshot::{MachineSnapshot, SnapshotMismatch};
use crate::state::Psw;
use crate::trap::{TrapSlot, TrapUnitState};

#[cfg(test)]
mod tests;

/// Kernel stack pointer values below this are in the yellow zone.
const STACK_LIMIT: u16 = 0o400;

/// Where the kernel stack pointer is put after a red stack violation.
const RED_STACK_POINTER: u16 = 4;

/// A trap or interrupt could not be taken because its vector could
/// not be read.  The machine stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchFailure {
    pub slot: TrapSlot,
    pub vector: u16,
    pub fault: MemoryFault,
}

impl Display for DispatchFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "cannot take {} trap: vector at {:o} is unreadable ({})",
            self.slot, self.vector, self.fault
        )
    }
}

impl Error for DispatchFailure {}

/// The record of one trap or interrupt taken by
/// [`Machine::service_pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub slot: TrapSlot,
    pub vector: u16,
    /// Set for device and program interrupts.
    pub interrupt: Option<Acknowledged>,
    /// False when the old PC and PSW could not be saved on the kernel
    /// stack.  In that case the processor state is unchanged and a
    /// red stack trap is pending instead.
    pub entered: bool,
}

#[derive(Debug)]
pub struct Machine {
    cpu: Processor,
    interrupts: InterruptFabric,
    bus: BusRouter,
    events: EventQueue,
    now: Duration,
    output: Vec<OutputEvent>,
    halted: Option<DispatchFailure>,
}

impl Machine {
    pub fn new(ctx: &Context, config: CpuConfiguration) -> Result<Machine, ConfigurationError> {
        config.validate()?;
        let span = span!(Level::INFO, "machine", width=%config.physical_width);
        let _enter = span.enter();
        let memory = MemoryUnit::new(config.memory_bytes).map_err(|_| {
            ConfigurationError::MemorySize {
                bytes: config.memory_bytes,
                width: config.physical_width,
            }
        })?;
        let mut bus = BusRouter::new(memory);
        for register in ProcessorRegister::ALL {
            bus.registry
                .reserve_processor(register.window(), register)
                .map_err(ConfigurationError::RegisterSpace)?;
        }
        event!(Level::DEBUG, "configuration is {:?}", &config);
        Ok(Machine {
            interrupts: InterruptFabric::new(&config),
            cpu: Processor::new(config),
            bus,
            events: EventQueue::new(),
            now: ctx.simulated_time,
            output: Vec::new(),
            halted: None,
        })
    }

    pub fn processor(&self) -> &Processor {
        &self.cpu
    }

    pub fn processor_mut(&mut self) -> &mut Processor {
        &mut self.cpu
    }

    pub fn interrupts(&self) -> &InterruptFabric {
        &self.interrupts
    }

    pub fn bus(&self) -> &BusRouter {
        &self.bus
    }

    pub fn memory_mut(&mut self) -> &mut MemoryUnit {
        self.bus.memory_mut()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Set when a dispatch failed; the machine can no longer run.
    pub fn halted(&self) -> Option<&DispatchFailure> {
        self.halted.as_ref()
    }

    /// Bring the interrupt slot of the trap unit up to date.  Done
    /// after every change which could affect it, before control
    /// returns to the instruction engine.
    fn sync_interrupts(&mut self) {
        self.interrupts
            .reevaluate(self.cpu.state.psw.priority(), &mut self.cpu.traps);
    }

    fn host(&mut self) -> (&mut BusRouter, BusHost<'_>) {
        (
            &mut self.bus,
            BusHost {
                cpu: &mut self.cpu,
                interrupts: &mut self.interrupts,
                events: &mut self.events,
                now: self.now,
                output: &mut self.output,
            },
        )
    }

    fn with_device<R, F>(&mut self, id: DeviceId, f: F) -> Option<R>
    where
        F: FnOnce(&mut dyn Device, &mut crate::io::DeviceContext) -> R,
    {
        let (bus, mut host) = self.host();
        let result = bus.with_device(id, &mut host, f);
        self.sync_interrupts();
        result
    }

    /// Attach a device whose registers occupy `len` bytes at `base`
    /// in the I/O page.  The device is reset once attached.
    pub fn attach(
        &mut self,
        base: PhysicalAddress,
        len: u32,
        device: Box<dyn Device>,
        interrupt: Option<InterruptRequest>,
    ) -> Result<DeviceId, RegistrationError> {
        let window = Window::new(base, len);
        let inside = base.is_in_io_page()
            && len > 0
            && base.checked_add(len - 1).is_some_and(|last| last.is_in_io_page());
        if !inside {
            event!(Level::WARN, "refusing {}: {window} is outside the I/O page", device.name());
            return Err(RegistrationError::OutsideRegisterSpace(window));
        }
        let id = self
            .bus
            .registry
            .register(window, device, interrupt, &mut self.interrupts)?;
        self.with_device(id, |device, ctx| device.reset(ctx));
        Ok(id)
    }

    pub fn detach(&mut self, id: DeviceId) -> Option<Box<dyn Device>> {
        self.events.cancel_device(id);
        let device = self.bus.registry.remove(id, &mut self.interrupts);
        self.sync_interrupts();
        device
    }

    /// Deliver input from the host to a device.
    pub fn input(&mut self, id: DeviceId, input: InputEvent) -> Result<(), InputEventError> {
        self.with_device(id, |device, ctx| device.on_input(ctx, input))
            .unwrap_or(Err(InputEventError::InputOnUnattachedDevice(id)))
    }

    /// Output produced by devices since the last call.
    pub fn drain_output(&mut self) -> Vec<OutputEvent> {
        std::mem::take(&mut self.output)
    }

    pub fn next_event_due(&self) -> Option<Duration> {
        self.events.next_due()
    }

    /// Let simulated time reach `ctx.simulated_time`, running all the
    /// device activity which falls due on the way, in order.
    pub fn advance(&mut self, ctx: &Context) {
        let span = span!(Level::TRACE, "advance", t=?ctx.simulated_time);
        let _enter = span.enter();
        if ctx.simulated_time < self.now {
            event!(
                Level::WARN,
                "simulated time went backward from {:?} to {:?}",
                self.now,
                ctx.simulated_time
            );
            return;
        }
        while let Some((key, due)) = self.events.pop_due(ctx.simulated_time) {
            self.now = self.now.max(due);
            if self
                .with_device(key.device, |device, dctx| device.on_event(dctx, key.tag))
                .is_none()
            {
                event!(Level::WARN, "activity due for {}, which is not attached", key.device);
            }
        }
        self.now = ctx.simulated_time;
    }

    pub fn psw(&self) -> Psw {
        self.cpu.state.psw
    }

    /// Replace the processor status word, as an instruction (RTI, SPL
    /// and so on) does.
    pub fn set_psw(&mut self, psw: Psw) {
        self.cpu.state.psw = psw;
        self.sync_interrupts();
    }

    pub fn pc(&self) -> u16 {
        self.cpu.state.pc
    }

    pub fn set_pc(&mut self, pc: u16) {
        self.cpu.state.pc = pc;
    }

    pub fn stack_pointer(&self, mode: Mode) -> u16 {
        self.cpu.state.stack_pointer(mode)
    }

    pub fn set_stack_pointer(&mut self, mode: Mode, value: u16) {
        self.cpu.state.set_stack_pointer(mode, value);
    }

    /// Note the start of the instruction at `pc`.
    pub fn begin_instruction(&mut self, pc: u16) {
        self.cpu.state.pc = pc;
        self.cpu.recorder.begin_instruction(pc);
    }

    /// Log an autoincrement or autodecrement for SR1.
    pub fn record_register_change(&mut self, register: u8, delta: i8) {
        self.cpu.recorder.record_register_change(register, delta);
    }

    /// Post a trap raised by the instruction engine (EMT, TRAP,
    /// illegal instruction and so on).
    pub fn post_trap(&mut self, slot: TrapSlot) {
        if slot == TrapSlot::Interrupt {
            event!(Level::WARN, "the interrupt slot cannot be posted directly");
            return;
        }
        self.cpu.traps.post(slot);
    }

    pub fn trap_state(&self) -> TrapUnitState {
        self.cpu.traps.state()
    }

    /// Translate and perform a reference, without posting any trap on
    /// failure.
    fn reference(
        &mut self,
        va: VirtualAddress,
        mode: Mode,
        space: Space,
        op: BusOp,
    ) -> Result<u16, MemoryFault> {
        let (access, width) = match op {
            BusOp::Read(width) => (AccessKind::Read, width),
            BusOp::Write(width, _) => (AccessKind::Write, width),
        };
        let pa = self.cpu.translate(va, mode, space, access, width)?;
        let (bus, mut host) = self.host();
        let result = bus.route(pa, op, &mut host);
        if pa.is_in_io_page() {
            self.sync_interrupts();
        }
        Ok(result?)
    }

    /// A processor read in the given mode.  On failure the matching
    /// trap is posted and nothing else happens.
    pub fn read_in_mode(
        &mut self,
        va: VirtualAddress,
        mode: Mode,
        space: Space,
        width: Width,
    ) -> Result<u16, MemoryFault> {
        self.reference(va, mode, space, BusOp::Read(width))
            .inspect_err(|fault| self.cpu.post_fault(*fault))
    }

    pub fn write_in_mode(
        &mut self,
        va: VirtualAddress,
        mode: Mode,
        space: Space,
        width: Width,
        value: u16,
    ) -> Result<(), MemoryFault> {
        self.reference(va, mode, space, BusOp::Write(width, value))
            .map(|_| ())
            .inspect_err(|fault| self.cpu.post_fault(*fault))
    }

    /// A read in the current mode.
    pub fn read(&mut self, va: VirtualAddress, space: Space, width: Width) -> Result<u16, MemoryFault> {
        let mode = self.cpu.state.mode();
        self.read_in_mode(va, mode, space, width)
    }

    pub fn write(
        &mut self,
        va: VirtualAddress,
        space: Space,
        width: Width,
        value: u16,
    ) -> Result<(), MemoryFault> {
        let mode = self.cpu.state.mode();
        self.write_in_mode(va, mode, space, width, value)
    }

    /// A read of a physical address, bypassing translation, as a
    /// loader or debugger would make.  No trap is posted on failure.
    pub fn physical_read(&mut self, pa: PhysicalAddress, width: Width) -> Result<u16, BusFault> {
        let (bus, mut host) = self.host();
        let result = bus.route(pa, BusOp::Read(width), &mut host);
        self.sync_interrupts();
        result
    }

    pub fn physical_write(
        &mut self,
        pa: PhysicalAddress,
        width: Width,
        value: u16,
    ) -> Result<(), BusFault> {
        let (bus, mut host) = self.host();
        let result = bus.route(pa, BusOp::Write(width, value), &mut host);
        self.sync_interrupts();
        result.map(|_| ())
    }

    fn kernel_data_read(&mut self, va: u16) -> Result<u16, MemoryFault> {
        self.reference(
            VirtualAddress::new(va),
            Mode::Kernel,
            Space::Data,
            BusOp::Read(Width::Word),
        )
    }

    fn kernel_data_write(&mut self, va: u16, value: u16) -> Result<(), MemoryFault> {
        self.reference(
            VirtualAddress::new(va),
            Mode::Kernel,
            Space::Data,
            BusOp::Write(Width::Word, value),
        )
        .map(|_| ())
    }

    /// Take the most urgent pending trap or interrupt, if any.
    ///
    /// The new PC and PSW are read from the vector through kernel
    /// data space.  The new PSW always selects kernel mode, with the
    /// interrupted mode as the previous mode.  The old PSW and then
    /// the old PC are pushed on the kernel stack.
    pub fn service_pending(&mut self) -> Result<Option<Dispatch>, DispatchFailure> {
        if let Some(failure) = self.halted {
            return Err(failure);
        }
        let Some(slot) = self.cpu.traps.highest_pending() else {
            return Ok(None);
        };
        let span = span!(Level::DEBUG, "dispatch", %slot);
        let _enter = span.enter();
        let (vector, interrupt) = if slot == TrapSlot::Interrupt {
            match self.interrupts.acknowledge(self.cpu.state.psw.priority()) {
                Some(ack) => (ack.vector, Some(ack)),
                None => {
                    // Nothing is above the processor priority after all.
                    self.sync_interrupts();
                    return Ok(None);
                }
            }
        } else {
            (self.cpu.traps.begin_dispatch(slot).unwrap_or(0), None)
        };
        let vectors = self
            .kernel_data_read(vector)
            .and_then(|pc| Ok((pc, self.kernel_data_read(vector.wrapping_add(2))?)));
        let (new_pc, new_psw) = match vectors {
            Ok(v) => v,
            Err(fault) => {
                let failure = DispatchFailure {
                    slot,
                    vector,
                    fault,
                };
                event!(Level::ERROR, "machine halted: {failure}");
                self.halted = Some(failure);
                return Err(failure);
            }
        };
        let old_psw = self.cpu.state.psw;
        let old_pc = self.cpu.state.pc;
        let sp = self.cpu.state.stack_pointer(Mode::Kernel);
        let pushed = self
            .kernel_data_write(sp.wrapping_sub(2), old_psw.bits())
            .and_then(|()| self.kernel_data_write(sp.wrapping_sub(4), old_pc));
        if let Err(fault) = pushed {
            event!(
                Level::WARN,
                "red stack: cannot save state for {slot} at kernel SP {sp:o}: {fault}"
            );
            self.cpu.cpu_error |= CPUERR_RED_STACK;
            self.cpu
                .state
                .set_stack_pointer(Mode::Kernel, RED_STACK_POINTER);
            self.cpu.traps.post(TrapSlot::RedStack);
            self.sync_interrupts();
            return Ok(Some(Dispatch {
                slot,
                vector,
                interrupt,
                entered: false,
            }));
        }
        let new_sp = sp.wrapping_sub(4);
        self.cpu.state.set_stack_pointer(Mode::Kernel, new_sp);
        if new_sp < STACK_LIMIT && slot != TrapSlot::RedStack && slot != TrapSlot::YellowStack {
            event!(Level::WARN, "yellow stack: kernel SP is {new_sp:o}");
            self.cpu.cpu_error |= CPUERR_YELLOW_STACK;
            self.cpu.traps.post(TrapSlot::YellowStack);
        }
        self.cpu.state.pc = new_pc;
        self.cpu.state.psw = Psw::from_bits(new_psw)
            .with_current_mode(Mode::Kernel)
            .with_previous_mode(old_psw.current_mode());
        event!(
            Level::INFO,
            "took {slot} trap via {vector:o}: PC {old_pc:o} -> {new_pc:o}, PSW {}",
            self.cpu.state.psw
        );
        self.sync_interrupts();
        Ok(Some(Dispatch {
            slot,
            vector,
            interrupt,
            entered: true,
        }))
    }

    /// Return from a trap or interrupt: pop the PC and then the PSW
    /// from the stack of the current mode.  An engine's RTI
    /// instruction does this.
    pub fn return_from_trap(&mut self) -> Result<(), MemoryFault> {
        let mode = self.cpu.state.mode();
        let sp = self.cpu.state.stack_pointer(mode);
        let pc = self.read_in_mode(VirtualAddress::new(sp), mode, Space::Data, Width::Word)?;
        let psw = self.read_in_mode(
            VirtualAddress::new(sp.wrapping_add(2)),
            mode,
            Space::Data,
            Width::Word,
        )?;
        self.cpu.state.set_stack_pointer(mode, sp.wrapping_add(4));
        self.cpu.state.pc = pc;
        // Only kernel mode can restore a more privileged mode.
        let psw = match mode {
            Mode::Kernel => Psw::from_bits(psw),
            _ => Psw::from_bits(
                (psw & !0o340)
                    | (self.cpu.state.psw.bits() & 0o340)
                    | (self.cpu.state.psw.bits() & 0o174000),
            ),
        };
        self.set_psw(psw);
        Ok(())
    }

    /// The effect of the RESET instruction: every device is reset,
    /// every interrupt request withdrawn and memory management turned
    /// off.  Page descriptors are kept.
    pub fn bus_reset(&mut self) {
        event!(Level::INFO, "bus reset");
        self.interrupts.reset();
        self.cpu.page_table.reset_enables();
        self.cpu.recorder.clear();
        for id in self.bus.registry.device_ids() {
            self.with_device(id, |device, ctx| device.reset(ctx));
        }
        self.sync_interrupts();
    }

    /// Return to the power-on state.  Attached devices stay attached.
    pub fn reset(&mut self, ctx: &Context) {
        self.now = ctx.simulated_time;
        self.cpu.reset();
        self.halted = None;
        for id in self.bus.registry.device_ids() {
            self.events.cancel_device(id);
        }
        self.bus_reset();
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        let table = &self.cpu.page_table;
        MachineSnapshot {
            descriptors: table.descriptors().to_vec(),
            translation_enabled: table.is_enabled(),
            sr3: table.sr3(),
            fault: self.cpu.recorder.snapshot(),
            register_changes: self.cpu.recorder.register_changes(),
            instruction_pc: self.cpu.recorder.instruction_pc(),
            pending_traps: self.cpu.traps.pending(),
            interrupt_requests: self.interrupts.pending_masks(),
            pirq: self.interrupts.pirq(),
            processor: self.cpu.state.clone(),
            cpu_error: self.cpu.cpu_error,
        }
    }

    /// Restore a snapshot taken from a machine with the same
    /// configuration.  Nothing is changed if the shapes differ.
    pub fn restore(&mut self, snapshot: &MachineSnapshot) -> Result<(), SnapshotMismatch> {
        let descriptors = self.cpu.page_table.descriptors().len();
        if snapshot.descriptors.len() != descriptors {
            return Err(SnapshotMismatch {
                what: "page descriptors",
                expected: descriptors,
                found: snapshot.descriptors.len(),
            });
        }
        let levels = self.interrupts.level_count();
        if snapshot.interrupt_requests.len() != levels {
            return Err(SnapshotMismatch {
                what: "priority levels",
                expected: levels,
                found: snapshot.interrupt_requests.len(),
            });
        }
        let table = &mut self.cpu.page_table;
        for (i, d) in snapshot.descriptors.iter().enumerate() {
            // i < 64, checked above.
            table.set_descriptor(crate::fault::SlotIndex::from_bits(i as u8), *d);
        }
        table.set_enabled(snapshot.translation_enabled);
        table.write_sr3(snapshot.sr3);
        self.cpu.recorder.restore(
            snapshot.fault,
            snapshot.register_changes,
            snapshot.instruction_pc,
        );
        self.cpu.traps.restore(snapshot.pending_traps);
        self.interrupts
            .restore(&snapshot.interrupt_requests, snapshot.pirq);
        self.cpu.state = snapshot.processor.clone();
        self.cpu.cpu_error = snapshot.cpu_error;
        self.halted = None;
        self.sync_interrupts();
        event!(Level::INFO, "restored snapshot");
        Ok(())
    }
}
