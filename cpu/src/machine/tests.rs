use std::time::Duration;

use base::prelude::*;

use super::*;
use crate::config::CpuModel;
use crate::fault::{FaultReason, RegisterError, SlotIndex, TranslationFault};
use crate::interrupt::InterruptSource;
use crate::io::{
    DeviceContext, DeviceKind, LineClock, SerialConsole, CLOCK_REGISTER, CLOCK_VECTOR,
    CONSOLE_RECEIVE_VECTOR, CONSOLE_REGISTERS, CONSOLE_WINDOW_BYTES,
};
use crate::mmu::PageDescriptor;
use crate::registers::{CPUERR_NON_EXISTENT_MEMORY, CPUERR_ODD_ADDRESS, CPUERR_TIMEOUT};

const SR0: PhysicalAddress = pa!(0o17777572);
const KERNEL_PDR0: PhysicalAddress = pa!(0o17772300);
const CPUERR: PhysicalAddress = pa!(0o17777766);
const PIRQ: PhysicalAddress = pa!(0o17777772);
const PSW: PhysicalAddress = pa!(0o17777776);

fn machine() -> Machine {
    Machine::new(&Context::power_on(), CpuModel::Pdp11_70.configuration())
        .expect("standard configuration is valid")
}

/// A machine with only 32KiB of memory, so that low virtual
/// addresses can reach non-existent memory.
fn small_machine() -> Machine {
    let config = CpuConfiguration {
        memory_bytes: 0o100000,
        ..CpuModel::Pdp11_70.configuration()
    };
    Machine::new(&Context::power_on(), config).expect("small configuration is valid")
}

fn poke(m: &mut Machine, pa: PhysicalAddress, value: u16) {
    m.physical_write(pa, Width::Word, value)
        .expect("test address should respond");
}

fn peek(m: &mut Machine, pa: PhysicalAddress) -> u16 {
    m.physical_read(pa, Width::Word)
        .expect("test address should respond")
}

fn set_vector(m: &mut Machine, vector: u16, pc: u16, psw: u16) {
    let v = PhysicalAddress::masked(u32::from(vector));
    poke(m, v, pc);
    poke(m, PhysicalAddress::masked(u32::from(vector) + 2), psw);
}

/// A device with one register; writing 1 raises its interrupt
/// request and writing 0 withdraws it.
#[derive(Debug, Default)]
struct Doorbell {
    rung: bool,
}

impl Device for Doorbell {
    fn name(&self) -> String {
        "doorbell".to_string()
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Other
    }

    fn read(
        &mut self,
        _ctx: &mut DeviceContext,
        offset: u32,
        _width: Width,
    ) -> Result<u16, RegisterError> {
        match offset {
            0 => Ok(u16::from(self.rung)),
            _ => Err(RegisterError::NoSuchRegister),
        }
    }

    fn write(
        &mut self,
        ctx: &mut DeviceContext,
        offset: u32,
        _width: Width,
        value: u16,
    ) -> Result<(), RegisterError> {
        if offset != 0 {
            return Err(RegisterError::NoSuchRegister);
        }
        self.rung = value & 1 != 0;
        ctx.interrupts.set(0, self.rung);
        Ok(())
    }

    fn reset(&mut self, ctx: &mut DeviceContext) {
        self.rung = false;
        ctx.interrupts.cancel(0);
    }
}

fn doorbell_request(level: u16, vector: u16) -> Option<InterruptRequest> {
    Some(InterruptRequest {
        level: PriorityLevel::from_bits(level),
        first_vector: vector,
        count: 1,
    })
}

#[test]
fn test_trap_dispatch_saves_state_on_kernel_stack() {
    let mut m = machine();
    set_vector(&mut m, 0o34, 0o1000, 0o340);
    m.set_stack_pointer(Mode::Kernel, 0o1000);
    m.set_psw(Psw::from_bits(0o140000 | 0o17));
    m.begin_instruction(0o2000);
    m.post_trap(TrapSlot::Trap);

    let dispatch = m.service_pending().expect("vector is readable");
    assert_eq!(
        dispatch,
        Some(Dispatch {
            slot: TrapSlot::Trap,
            vector: 0o34,
            interrupt: None,
            entered: true,
        })
    );
    assert_eq!(m.pc(), 0o1000);
    assert_eq!(m.psw().current_mode(), Mode::Kernel);
    assert_eq!(m.psw().previous_mode(), Mode::User);
    assert_eq!(m.psw().priority(), PriorityLevel::from_bits(7));
    assert_eq!(m.stack_pointer(Mode::Kernel), 0o774);
    assert_eq!(peek(&mut m, pa!(0o776)), 0o140017);
    assert_eq!(peek(&mut m, pa!(0o774)), 0o2000);
    assert_eq!(m.trap_state(), TrapUnitState::Idle);
    assert_eq!(m.service_pending(), Ok(None));
}

#[test]
fn test_return_from_trap_restores_interrupted_state() {
    let mut m = machine();
    set_vector(&mut m, 0o30, 0o1000, 0);
    m.set_stack_pointer(Mode::Kernel, 0o1000);
    m.set_psw(Psw::from_bits(0o140000));
    m.begin_instruction(0o2000);
    m.post_trap(TrapSlot::Emulator);
    m.service_pending().expect("vector is readable");

    m.return_from_trap().expect("kernel stack is readable");
    assert_eq!(m.pc(), 0o2000);
    assert_eq!(m.psw().bits(), 0o140000);
    assert_eq!(m.stack_pointer(Mode::Kernel), 0o1000);
}

#[test]
fn test_traps_are_taken_most_urgent_first() {
    let mut m = machine();
    set_vector(&mut m, 0o4, 0o1100, 0o340);
    set_vector(&mut m, 0o14, 0o1200, 0o340);
    m.set_stack_pointer(Mode::Kernel, 0o1000);
    m.post_trap(TrapSlot::Trace);
    m.post_trap(TrapSlot::OddAddress);

    let first = m.service_pending().expect("vector is readable");
    assert_eq!(first.map(|d| d.slot), Some(TrapSlot::OddAddress));
    let second = m.service_pending().expect("vector is readable");
    assert_eq!(second.map(|d| d.slot), Some(TrapSlot::Trace));
    assert_eq!(m.pc(), 0o1200);
}

#[test]
fn test_odd_address_traps_without_latching_a_fault() {
    let mut m = machine();
    let va = VirtualAddress::new(0o1001);
    assert_eq!(
        m.read(va, Space::Data, Width::Word),
        Err(MemoryFault::OddAddress(va))
    );
    assert!(m.processor().traps().is_pending(TrapSlot::OddAddress));
    assert_ne!(m.processor().cpu_error() & CPUERR_ODD_ADDRESS, 0);
    assert!(!m.processor().fault_recorder().is_frozen());
    // Byte references may be odd.
    assert_eq!(m.read(va, Space::Data, Width::Byte), Ok(0));
}

#[test]
fn test_odd_address_check_can_be_disabled() {
    let config = CpuConfiguration {
        odd_address_traps: false,
        ..CpuModel::Pdp11_34.configuration()
    };
    let mut m = Machine::new(&Context::power_on(), config).expect("valid configuration");
    assert!(m
        .read(VirtualAddress::new(0o1001), Space::Data, Width::Word)
        .is_ok());
    assert_eq!(m.trap_state(), TrapUnitState::Idle);
}

#[test]
fn test_missing_memory_and_missing_registers() {
    let mut m = small_machine();
    let va = VirtualAddress::new(0o120000);
    assert_eq!(
        m.read(va, Space::Data, Width::Word),
        Err(MemoryFault::Bus(BusFault::NonExistentResource(pa!(0o120000))))
    );
    assert!(m.processor().traps().is_pending(TrapSlot::NonExistentMemory));
    assert_eq!(m.processor().cpu_error(), CPUERR_NON_EXISTENT_MEMORY);

    // An I/O page address with no register behind it times out.
    assert!(m
        .write(VirtualAddress::new(0o160000), Space::Data, Width::Word, 1)
        .is_err());
    assert_ne!(m.processor().cpu_error() & CPUERR_TIMEOUT, 0);
}

#[test]
fn test_physical_references_post_no_traps() {
    let mut m = small_machine();
    assert_eq!(
        m.physical_read(pa!(0o200000), Width::Word),
        Err(BusFault::NonExistentResource(pa!(0o200000)))
    );
    assert_eq!(m.trap_state(), TrapUnitState::Idle);
    assert_eq!(m.processor().cpu_error(), 0);
}

#[test]
fn test_translation_fault_is_visible_in_sr0() {
    let mut m = machine();
    poke(&mut m, SR0, 1);
    assert!(m.processor().page_table().is_enabled());
    m.set_psw(Psw::from_bits(0o140000));

    let va = VirtualAddress::new(0o100);
    let result = m.read(va, Space::Data, Width::Word);
    assert!(matches!(
        result,
        Err(MemoryFault::Translation(TranslationFault {
            reason: FaultReason::NonResident,
            ..
        }))
    ));
    assert!(m.processor().traps().is_pending(TrapSlot::MemoryManagement));
    // Non-resident, user mode, I space, page 0, translation enabled.
    assert_eq!(peek(&mut m, SR0), 0o100000 | 0o140 | 1);

    // Clearing the abort bits unfreezes the recorder.
    poke(&mut m, SR0, 1);
    assert!(!m.processor().fault_recorder().is_frozen());
    assert_eq!(peek(&mut m, SR0), 1);
}

#[test]
fn test_descriptor_register_write_clears_written_bit() {
    let mut m = machine();
    let slot = SlotIndex::new(Mode::Kernel, Space::Instruction, 0);
    m.processor_mut().page_table_mut().set_descriptor(
        slot,
        PageDescriptor {
            relocation: 0,
            length_field: 0o177,
            readable: true,
            writable: true,
            ..PageDescriptor::default()
        },
    );
    poke(&mut m, SR0, 1);
    m.write(VirtualAddress::new(0o100), Space::Data, Width::Word, 0o123)
        .expect("page is writable");
    assert!(m.processor().page_table().descriptor(slot).written);
    assert_eq!(peek(&mut m, KERNEL_PDR0), 0o77506);

    poke(&mut m, KERNEL_PDR0, 0o77506);
    assert!(!m.processor().page_table().descriptor(slot).written);
    assert_eq!(peek(&mut m, KERNEL_PDR0), 0o77406);
}

#[test]
fn test_program_interrupt_request() {
    let mut m = machine();
    set_vector(&mut m, 0o240, 0o3000, 0o340);
    m.set_stack_pointer(Mode::Kernel, 0o1000);
    m.set_psw(Psw::from_bits(0o140));
    assert_eq!(m.trap_state(), TrapUnitState::Idle);

    // Level 3 is not above priority 3.
    poke(&mut m, PIRQ, 1 << 11);
    assert_eq!(m.trap_state(), TrapUnitState::Idle);
    // Level 5 is.
    poke(&mut m, PIRQ, (1 << 11) | (1 << 13));
    assert!(m.processor().traps().is_pending(TrapSlot::Interrupt));
    assert_eq!(peek(&mut m, PIRQ), (1 << 11) | (1 << 13) | (5 << 5) | (5 << 1));

    let dispatch = m
        .service_pending()
        .expect("vector is readable")
        .expect("an interrupt is pending");
    assert_eq!(dispatch.vector, 0o240);
    let ack = dispatch.interrupt.expect("an interrupt was taken");
    assert_eq!(ack.source, InterruptSource::Program);
    assert_eq!(ack.level, PriorityLevel::from_bits(5));
    assert_eq!(m.pc(), 0o3000);
    // The request stays until the handler clears it.
    assert_ne!(m.interrupts().pirq() & (1 << 13), 0);
    assert_eq!(m.trap_state(), TrapUnitState::Idle);
}

#[test]
fn test_cpu_error_write_clears_parity_trap() {
    let mut m = machine();
    set_vector(&mut m, 0o114, 0o1000, 0o340);
    m.set_stack_pointer(Mode::Kernel, 0o1000);
    m.post_trap(TrapSlot::Parity);
    let dispatch = m
        .service_pending()
        .expect("vector is readable")
        .expect("parity is pending");
    assert_eq!(dispatch.slot, TrapSlot::Parity);
    // Neither dispatch nor a return nor other register writes clear it.
    assert!(m.processor().traps().is_pending(TrapSlot::Parity));
    m.return_from_trap().expect("kernel stack is mapped");
    poke(&mut m, PSW, 0);
    poke(&mut m, SR0, 0);
    assert!(m.processor().traps().is_pending(TrapSlot::Parity));
    let again = m
        .service_pending()
        .expect("vector is readable")
        .expect("parity is still pending");
    assert_eq!(again.slot, TrapSlot::Parity);

    poke(&mut m, CPUERR, 0);
    assert!(!m.processor().traps().is_pending(TrapSlot::Parity));
}

#[test]
fn test_refused_write_leaves_memory_alone() {
    let mut m = machine();
    let slot = SlotIndex::new(Mode::Kernel, Space::Instruction, 0);
    m.processor_mut().page_table_mut().set_descriptor(
        slot,
        PageDescriptor {
            relocation: 0,
            length_field: 0o177,
            readable: true,
            writable: false,
            ..PageDescriptor::default()
        },
    );
    poke(&mut m, SR0, 1);
    poke(&mut m, pa!(0o100), 0o52525);

    let result = m.write(VirtualAddress::new(0o100), Space::Data, Width::Word, 0o123);
    assert!(matches!(
        result,
        Err(MemoryFault::Translation(TranslationFault {
            reason: FaultReason::ReadOnly,
            ..
        }))
    ));
    assert_eq!(peek(&mut m, pa!(0o100)), 0o52525);
    assert!(!m.processor().page_table().descriptor(slot).written);
    assert!(m.processor().traps().is_pending(TrapSlot::MemoryManagement));
    // Reads through the same page still work.
    assert_eq!(
        m.read(VirtualAddress::new(0o100), Space::Data, Width::Word),
        Ok(0o52525)
    );
}

#[test]
fn test_psw_written_through_bus_keeps_trace_bit() {
    let mut m = machine();
    m.set_psw(Psw::from_bits(0o20));
    poke(&mut m, PSW, 0o340);
    assert_eq!(m.psw().bits(), 0o360);
}

#[test]
fn test_device_interrupts_tie_break_on_slot_order() {
    let mut m = machine();
    let first = m
        .attach(pa!(0o17770000), 2, Box::new(Doorbell::default()), doorbell_request(5, 0o300))
        .expect("window is free");
    let second = m
        .attach(pa!(0o17770002), 2, Box::new(Doorbell::default()), doorbell_request(5, 0o310))
        .expect("window is free");
    set_vector(&mut m, 0o300, 0o4000, 0o340);
    set_vector(&mut m, 0o310, 0o5000, 0o340);
    m.set_stack_pointer(Mode::Kernel, 0o1000);
    m.set_psw(Psw::from_bits(4 << 5));

    poke(&mut m, pa!(0o17770002), 1);
    poke(&mut m, pa!(0o17770000), 1);
    let dispatch = m
        .service_pending()
        .expect("vector is readable")
        .expect("an interrupt is pending");
    assert_eq!(dispatch.vector, 0o300);
    assert_eq!(
        dispatch.interrupt.map(|a| a.source),
        Some(InterruptSource::Device {
            owner: first,
            slot: 0
        })
    );

    // The handler runs at priority 7; returning to 4 lets the other
    // request in.
    assert_eq!(m.trap_state(), TrapUnitState::Idle);
    m.set_psw(Psw::from_bits(4 << 5));
    let dispatch = m
        .service_pending()
        .expect("vector is readable")
        .expect("an interrupt is pending");
    assert_eq!(dispatch.vector, 0o310);
    assert_eq!(
        dispatch.interrupt.map(|a| a.source),
        Some(InterruptSource::Device {
            owner: second,
            slot: 1
        })
    );
}

#[test]
fn test_processor_priority_masks_device_interrupts() {
    let mut m = machine();
    m.attach(pa!(0o17770000), 2, Box::new(Doorbell::default()), doorbell_request(5, 0o300))
        .expect("window is free");
    m.set_psw(Psw::from_bits(5 << 5));
    poke(&mut m, pa!(0o17770000), 1);
    assert_eq!(m.trap_state(), TrapUnitState::Idle);

    m.set_psw(Psw::from_bits(4 << 5));
    assert!(m.processor().traps().is_pending(TrapSlot::Interrupt));

    // Withdrawing the request withdraws the interrupt.
    poke(&mut m, pa!(0o17770000), 0);
    assert_eq!(m.trap_state(), TrapUnitState::Idle);
}

#[test]
fn test_devices_cannot_cover_processor_registers() {
    let mut m = machine();
    let result = m.attach(pa!(0o17777570), 4, Box::new(Doorbell::default()), None);
    assert!(matches!(result, Err(RegistrationError::Overlap { .. })));
    // SR0 is still the processor's.
    poke(&mut m, SR0, 1);
    assert!(m.processor().page_table().is_enabled());
}

#[test]
fn test_devices_must_live_in_the_io_page() {
    let mut m = machine();
    assert_eq!(
        m.attach(pa!(0o1000), 2, Box::new(Doorbell::default()), None),
        Err(RegistrationError::OutsideRegisterSpace(Window::new(pa!(0o1000), 2)))
    );
    assert!(matches!(
        m.attach(pa!(0o17777776), 4, Box::new(Doorbell::default()), None),
        Err(RegistrationError::OutsideRegisterSpace(_))
    ));
}

#[test]
fn test_oversized_window_is_refused_with_a_diagnostic() {
    let mut m = machine();
    let err = m
        .attach(
            CONSOLE_REGISTERS,
            u32::MAX,
            Box::new(SerialConsole::new()),
            Some(SerialConsole::interrupt_request()),
        )
        .expect_err("the window runs off the end of the I/O page");
    assert_eq!(
        err,
        RegistrationError::OutsideRegisterSpace(Window::new(CONSOLE_REGISTERS, u32::MAX))
    );
    assert!(err.to_string().contains("17777560"));
    // Nothing was claimed, so the console can still be attached.
    m.attach(
        CONSOLE_REGISTERS,
        CONSOLE_WINDOW_BYTES,
        Box::new(SerialConsole::new()),
        Some(SerialConsole::interrupt_request()),
    )
    .expect("console window is free");
}

#[test]
fn test_detached_device_stops_responding() {
    let mut m = machine();
    let id = m
        .attach(pa!(0o17770000), 2, Box::new(Doorbell::default()), doorbell_request(5, 0o300))
        .expect("window is free");
    poke(&mut m, pa!(0o17770000), 1);
    assert!(m.processor().traps().is_pending(TrapSlot::Interrupt));

    assert!(m.detach(id).is_some());
    assert_eq!(m.trap_state(), TrapUnitState::Idle);
    assert_eq!(
        m.physical_read(pa!(0o17770000), Width::Word),
        Err(BusFault::NonExistentResource(pa!(0o17770000)))
    );
    assert!(m.detach(id).is_none());
    // The window and the vector slot can be reused.
    m.attach(pa!(0o17770000), 2, Box::new(Doorbell::default()), doorbell_request(5, 0o300))
        .expect("window is free again");
}

#[test]
fn test_red_stack_abandons_dispatch() {
    let mut m = small_machine();
    set_vector(&mut m, 0o34, 0o1000, 0o340);
    set_vector(&mut m, 0o4, 0o6000, 0o340);
    // Pushes would land beyond the installed memory.
    m.set_stack_pointer(Mode::Kernel, 0o120004);
    m.begin_instruction(0o2000);
    m.post_trap(TrapSlot::Trap);

    let dispatch = m
        .service_pending()
        .expect("vector is readable")
        .expect("a trap is pending");
    assert!(!dispatch.entered);
    assert_eq!(m.pc(), 0o2000);
    assert_eq!(m.stack_pointer(Mode::Kernel), 4);
    assert!(m.processor().traps().is_pending(TrapSlot::RedStack));
    assert_ne!(m.processor().cpu_error() & CPUERR_RED_STACK, 0);

    let dispatch = m
        .service_pending()
        .expect("vector is readable")
        .expect("a red stack trap is pending");
    assert_eq!(dispatch.slot, TrapSlot::RedStack);
    assert!(dispatch.entered);
    assert_eq!(m.pc(), 0o6000);
    assert_eq!(m.stack_pointer(Mode::Kernel), 0);
    assert!(!m.processor().traps().is_pending(TrapSlot::YellowStack));
}

#[test]
fn test_yellow_stack_warning() {
    let mut m = machine();
    set_vector(&mut m, 0o34, 0o1000, 0o340);
    m.set_stack_pointer(Mode::Kernel, 0o402);
    m.post_trap(TrapSlot::Trap);
    m.service_pending().expect("vector is readable");
    assert_eq!(m.stack_pointer(Mode::Kernel), 0o376);
    assert!(m.processor().traps().is_pending(TrapSlot::YellowStack));
    assert_ne!(m.processor().cpu_error() & CPUERR_YELLOW_STACK, 0);
}

#[test]
fn test_unreadable_vector_halts_the_machine() {
    let mut m = machine();
    // Translation on, with every descriptor inaccessible.
    poke(&mut m, SR0, 1);
    m.post_trap(TrapSlot::Breakpoint);
    let failure = m.service_pending().expect_err("vector cannot be read");
    assert_eq!(failure.slot, TrapSlot::Breakpoint);
    assert_eq!(failure.vector, 0o14);
    assert_eq!(m.halted(), Some(&failure));
    assert_eq!(m.service_pending(), Err(failure));
}

#[test]
fn test_line_clock_interrupts() {
    let mut m = machine();
    m.attach(CLOCK_REGISTER, 2, Box::new(LineClock::new()), Some(LineClock::interrupt_request()))
        .expect("clock window is free");
    set_vector(&mut m, CLOCK_VECTOR, 0o7000, 0o340);
    m.set_stack_pointer(Mode::Kernel, 0o1000);

    // Acknowledge the power-on monitor bit and enable interrupts.
    poke(&mut m, CLOCK_REGISTER, 0o100);
    assert_eq!(m.trap_state(), TrapUnitState::Idle);
    let due = m.next_event_due().expect("the clock is ticking");
    assert!(due <= Duration::from_millis(17));

    m.advance(&Context::new(Duration::from_millis(20), Duration::ZERO));
    assert_eq!(peek(&mut m, CLOCK_REGISTER), 0o300);
    let dispatch = m
        .service_pending()
        .expect("vector is readable")
        .expect("the clock is interrupting");
    assert_eq!(dispatch.vector, CLOCK_VECTOR);
    assert_eq!(m.pc(), 0o7000);
}

#[test]
fn test_console_echo() {
    let mut m = machine();
    let id = m
        .attach(
            CONSOLE_REGISTERS,
            CONSOLE_WINDOW_BYTES,
            Box::new(SerialConsole::new()),
            Some(SerialConsole::interrupt_request()),
        )
        .expect("console window is free");
    let rcsr = CONSOLE_REGISTERS;
    let rbuf = pa!(0o17777562);
    let xbuf = pa!(0o17777566);

    m.input(
        id,
        InputEvent::ConsoleKeyboardInput {
            data: b"A".to_vec(),
        },
    )
    .expect("console accepts input");
    poke(&mut m, rcsr, 0o100);
    m.advance(&Context::new(Duration::from_millis(5), Duration::ZERO));
    assert_eq!(peek(&mut m, rcsr), 0o300);
    let receiver = PriorityLevel::from_bits(4);
    assert!(m.interrupts().is_requesting(receiver, 0));
    set_vector(&mut m, CONSOLE_RECEIVE_VECTOR, 0o7100, 0o340);
    m.set_stack_pointer(Mode::Kernel, 0o1000);
    let dispatch = m
        .service_pending()
        .expect("vector is readable")
        .expect("the receiver is interrupting");
    assert_eq!(dispatch.vector, CONSOLE_RECEIVE_VECTOR);
    // The grant consumes the request.
    assert!(!m.interrupts().is_requesting(receiver, 0));

    assert_eq!(peek(&mut m, rbuf), u16::from(b'A'));
    assert_eq!(peek(&mut m, rcsr), 0o100);
    assert!(!m.interrupts().is_requesting(receiver, 0));

    poke(&mut m, xbuf, u16::from(b'A'));
    m.advance(&Context::new(Duration::from_millis(10), Duration::ZERO));
    assert_eq!(
        m.drain_output(),
        vec![OutputEvent::ConsolePrint {
            device: id,
            byte: b'A'
        }]
    );
    assert!(m.drain_output().is_empty());
}

#[test]
fn test_input_for_missing_device() {
    let mut m = machine();
    let id = DeviceId::new(42);
    assert_eq!(
        m.input(id, InputEvent::ConsoleKeyboardInput { data: vec![] }),
        Err(InputEventError::InputOnUnattachedDevice(id))
    );
}

#[test]
fn test_bus_reset() {
    let mut m = machine();
    let slot = SlotIndex::new(Mode::Kernel, Space::Instruction, 0);
    poke(&mut m, KERNEL_PDR0, 0o77406);
    poke(&mut m, SR0, 1);
    poke(&mut m, PIRQ, 1 << 15);
    let id = m
        .attach(pa!(0o17770000), 2, Box::new(Doorbell::default()), doorbell_request(5, 0o300))
        .expect("window is free");
    poke(&mut m, pa!(0o17770000), 1);

    m.bus_reset();
    assert!(!m.processor().page_table().is_enabled());
    assert_eq!(m.interrupts().pirq(), 0);
    assert_eq!(m.trap_state(), TrapUnitState::Idle);
    assert_eq!(peek(&mut m, pa!(0o17770000)), 0);
    // Descriptors survive.
    assert_eq!(m.processor().page_table().descriptor(slot).length_field, 0o177);
    assert!(m.bus().registry().device(id).is_some());
}

#[test]
fn test_snapshot_round_trip() {
    let mut m = machine();
    poke(&mut m, KERNEL_PDR0, 0o77406);
    poke(&mut m, pa!(0o17772340), 0o1234);
    poke(&mut m, pa!(0o17772516), 0o25);
    poke(&mut m, PIRQ, 1 << 10);
    m.set_psw(Psw::from_bits(0o140000 | (7 << 5)));
    m.set_stack_pointer(Mode::User, 0o700);
    m.begin_instruction(0o4000);
    m.record_register_change(2, 2);
    m.post_trap(TrapSlot::Emulator);
    let snapshot = m.snapshot();

    let mut other = machine();
    other.restore(&snapshot).expect("same configuration");
    assert_eq!(other.snapshot(), snapshot);
    assert!(other.processor().traps().is_pending(TrapSlot::Emulator));
    assert_eq!(peek(&mut other, pa!(0o17772340)), 0o1234);
    assert_eq!(other.psw().current_mode(), Mode::User);
}

#[test]
fn test_snapshot_from_different_machine_is_refused() {
    let mut m = machine();
    let mut snapshot = m.snapshot();
    snapshot.descriptors.pop();
    assert_eq!(
        m.restore(&snapshot),
        Err(SnapshotMismatch {
            what: "page descriptors",
            expected: 64,
            found: 63,
        })
    );
}

#[test]
fn test_attach_resets_device() {
    let mut m = machine();
    let id = m
        .attach(pa!(0o17770000), 2, Box::new(Doorbell::default()), None)
        .expect("window is free");
    assert_eq!(m.bus().registry().window_of(id), Some(Window::new(pa!(0o17770000), 2)));
    // A device without vectors cannot interrupt.
    poke(&mut m, pa!(0o17770000), 1);
    assert_eq!(m.trap_state(), TrapUnitState::Idle);
}
