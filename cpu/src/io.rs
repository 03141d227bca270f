//! Peripheral devices.
//!
//! A device is attached to the bus with a window of register
//! addresses in the I/O page and (optionally) some interrupt vector
//! slots.  The bus forwards each reference to one of its registers to
//! the device's [`Device::read`] or [`Device::write`] method, with the
//! byte offset of the register within the window.  Whether a register
//! accepts byte references, or references to odd addresses, is up to
//! the device.
//!
//! Devices never see the processor.  Everything they may do to the
//! rest of the machine is reachable from the [`DeviceContext`] they
//! are handed: raise or withdraw their own interrupt requests, schedule
//! future activity for themselves, move data to or from memory, and
//! produce output for the host.
use std::fmt::{self, Debug, Display, Formatter};
use std::time::Duration;

use base::prelude::*;

use crate::bus::DeviceId;
use crate::event::{InputEvent, InputEventError, OutputEvent};
use crate::fault::RegisterError;
use crate::interrupt::{InterruptFabric, VectorTable};
use crate::memory::MemoryUnit;

mod dev_clock;
mod dev_console;
mod eventq;

pub use dev_clock::{LineClock, CLOCK_REGISTER, CLOCK_VECTOR};
pub use dev_console::{
    SerialConsole, CONSOLE_RECEIVE_VECTOR, CONSOLE_REGISTERS, CONSOLE_WINDOW_BYTES,
};
pub use eventq::{EventKey, EventQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    StorageController,
    Clock,
    Console,
    Other,
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            DeviceKind::StorageController => "storage controller",
            DeviceKind::Clock => "clock",
            DeviceKind::Console => "console",
            DeviceKind::Other => "device",
        })
    }
}

/// A device's own interrupt request lines.  Index `i` is the `i`th
/// vector the device asked for when it was attached.
pub struct InterruptLines<'a> {
    fabric: &'a mut InterruptFabric,
    table: Option<&'a VectorTable>,
}

impl<'a> InterruptLines<'a> {
    pub(crate) fn new(
        fabric: &'a mut InterruptFabric,
        table: Option<&'a VectorTable>,
    ) -> InterruptLines<'a> {
        InterruptLines { fabric, table }
    }

    fn locate(&self, index: usize) -> Option<(PriorityLevel, u8)> {
        let table = self.table?;
        table.slot(index).map(|slot| (table.level, slot))
    }

    pub fn request(&mut self, index: usize) {
        if let Some((level, slot)) = self.locate(index) {
            self.fabric.request(level, slot);
        }
    }

    pub fn cancel(&mut self, index: usize) {
        if let Some((level, slot)) = self.locate(index) {
            self.fabric.cancel(level, slot);
        }
    }

    /// Raise the request if `active`, otherwise withdraw it.
    pub fn set(&mut self, index: usize, active: bool) {
        if active {
            self.request(index);
        } else {
            self.cancel(index);
        }
    }

    pub fn is_requesting(&self, index: usize) -> bool {
        self.locate(index)
            .is_some_and(|(level, slot)| self.fabric.is_requesting(level, slot))
    }
}

/// Schedules future activity for one device.  Activities are
/// identified by a tag which the device chooses.
pub struct EventScheduler<'a> {
    queue: &'a mut EventQueue,
    device: DeviceId,
    now: Duration,
}

impl<'a> EventScheduler<'a> {
    pub(crate) fn new(queue: &'a mut EventQueue, device: DeviceId, now: Duration) -> EventScheduler<'a> {
        EventScheduler { queue, device, now }
    }

    fn key(&self, tag: u32) -> EventKey {
        EventKey {
            device: self.device,
            tag,
        }
    }

    /// Arrange for [`Device::on_event`] to be called with `tag`
    /// after `delay`.  This replaces any pending activity with the
    /// same tag.
    pub fn schedule_after(&mut self, delay: Duration, tag: u32) {
        let key = self.key(tag);
        self.queue.schedule(key, self.now + delay);
    }

    pub fn cancel(&mut self, tag: u32) {
        let key = self.key(tag);
        self.queue.cancel(&key);
    }

    pub fn is_scheduled(&self, tag: u32) -> bool {
        self.queue.is_scheduled(&self.key(tag))
    }
}

/// Everything a device may touch outside itself.
pub struct DeviceContext<'a> {
    pub id: DeviceId,
    /// The current simulated time.
    pub now: Duration,
    pub interrupts: InterruptLines<'a>,
    pub events: EventScheduler<'a>,
    /// Memory, for direct memory access.  References beyond the
    /// installed memory fail just as they do for the processor.
    pub memory: &'a mut MemoryUnit,
    pub output: &'a mut Vec<OutputEvent>,
}

pub trait Device {
    fn name(&self) -> String;

    fn kind(&self) -> DeviceKind;

    /// Read the register at byte `offset` within the device's window.
    fn read(
        &mut self,
        ctx: &mut DeviceContext,
        offset: u32,
        width: Width,
    ) -> Result<u16, RegisterError>;

    /// Write the register at byte `offset`.  For byte writes only the
    /// bottom 8 bits of `value` are meaningful.
    fn write(
        &mut self,
        ctx: &mut DeviceContext,
        offset: u32,
        width: Width,
        value: u16,
    ) -> Result<(), RegisterError>;

    /// Scheduled activity identified by `tag` has fallen due.
    fn on_event(&mut self, _ctx: &mut DeviceContext, _tag: u32) {}

    /// Bus reset (and power-on): return to the initial state.
    fn reset(&mut self, ctx: &mut DeviceContext);

    fn on_input(
        &mut self,
        _ctx: &mut DeviceContext,
        _event: InputEvent,
    ) -> Result<(), InputEventError> {
        Err(InputEventError::InputEventNotValidForDevice)
    }
}

impl Debug for dyn Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "<{}: {}>", self.kind(), self.name())
    }
}

/// Helper for word-wide registers: merge a (possibly byte) write into
/// the current register value.  The device sees the complete new
/// word.
pub fn merge_register_write(offset: u32, width: Width, current: u16, value: u16) -> u16 {
    width.merge(offset & 1 != 0, current, value)
}

/// Helper for word-wide registers: extract what a (possibly byte)
/// read returns.
pub fn extract_register_read(offset: u32, width: Width, word: u16) -> u16 {
    width.extract(offset & 1 != 0, word)
}

#[cfg(test)]
pub(crate) mod testing {
    //! A context for exercising a device on its own.
    use super::*;
    use crate::config::CpuConfiguration;
    use crate::interrupt::InterruptRequest;

    pub(crate) struct Rig {
        pub fabric: InterruptFabric,
        pub table: VectorTable,
        pub queue: EventQueue,
        pub memory: MemoryUnit,
        pub output: Vec<OutputEvent>,
        pub now: Duration,
    }

    pub(crate) const ID: DeviceId = DeviceId::new(1);

    impl Rig {
        pub(crate) fn new(request: InterruptRequest) -> Rig {
            let mut fabric = InterruptFabric::new(&CpuConfiguration::default());
            let table = fabric.reserve(ID, request).expect("free slots");
            Rig {
                fabric,
                table,
                queue: EventQueue::new(),
                memory: MemoryUnit::new(0o10000).expect("memory fits"),
                output: Vec::new(),
                now: Duration::ZERO,
            }
        }

        pub(crate) fn context(&mut self) -> DeviceContext<'_> {
            DeviceContext {
                id: ID,
                now: self.now,
                interrupts: InterruptLines::new(&mut self.fabric, Some(&self.table)),
                events: EventScheduler::new(&mut self.queue, ID, self.now),
                memory: &mut self.memory,
                output: &mut self.output,
            }
        }

        pub(crate) fn requesting(&self, index: usize) -> bool {
            match self.table.slot(index) {
                Some(slot) => self.fabric.is_requesting(self.table.level, slot),
                None => false,
            }
        }

        /// Advance time to the next scheduled activity and deliver it.
        pub(crate) fn run_next(&mut self, device: &mut dyn Device) -> Option<u32> {
            let due = self.queue.next_due()?;
            self.now = self.now.max(due);
            let (key, _) = self.queue.pop_due(self.now)?;
            let mut ctx = self.context();
            device.on_event(&mut ctx, key.tag);
            Some(key.tag)
        }
    }
}
