//! This crate emulates the memory management unit of a PDP-11 class
//! processor together with its trap and interrupt machinery, the bus
//! which connects the processor to memory and device registers, and
//! a small set of devices.
//!
//! Instruction decoding and execution are not here; an instruction
//! engine drives a [`Machine`] through its memory reference, trap
//! and dispatch operations.
#![crate_name = "cpu"]

mod bus;
mod config;
mod context;
mod event;
mod fault;
mod interrupt;
mod io;
mod machine;
mod memory;
mod mmu;
mod processor;
mod registers;
mod snapshot;
mod state;
mod trap;

pub use bus::{BusOp, BusRouter, DeviceId, DeviceRegistry, RegistrationError, Window, WindowOwner};
pub use config::{ConfigurationError, CpuConfiguration, CpuModel, PhysicalWidth, UnknownModelName};
pub use context::Context;
pub use event::*;
pub use fault::{BusFault, FaultReason, MemoryFault, RegisterError, SlotIndex, TranslationFault};
pub use interrupt::{
    Acknowledged, InterruptFabric, InterruptRequest, InterruptSource, VectorTable, PIRQ_VECTOR,
};
pub use io::{
    extract_register_read, merge_register_write, Device, DeviceContext, DeviceKind,
    EventScheduler, InterruptLines, LineClock, SerialConsole, CLOCK_REGISTER, CLOCK_VECTOR,
    CONSOLE_RECEIVE_VECTOR, CONSOLE_REGISTERS, CONSOLE_WINDOW_BYTES,
};
pub use machine::{Dispatch, DispatchFailure, Machine};
pub use memory::MemoryUnit;
pub use mmu::{
    decode_descriptor_register, unmapped_address, DescriptorWord, FaultRecord, FaultRecorder,
    PageDescriptor, PageTable,
};
pub use processor::Processor;
pub use registers::{
    ProcessorRegister, CPUERR_ILLEGAL_HALT, CPUERR_NON_EXISTENT_MEMORY, CPUERR_ODD_ADDRESS,
    CPUERR_RED_STACK, CPUERR_TIMEOUT, CPUERR_YELLOW_STACK,
};
pub use snapshot::{MachineSnapshot, SnapshotMismatch};
pub use state::{ProcessorState, Psw};
pub use trap::{Clearing, TrapMask, TrapSlot, TrapUnit, TrapUnitState};
