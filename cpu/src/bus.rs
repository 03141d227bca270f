//! Physical address decoding.
//!
//! Memory answers for addresses from zero up to the amount installed.
//! Within the I/O page, the device registry says which window (if
//! any) contains the address, and the reference goes to the
//! processor's own registers or to the device which owns the window.
//! Anything else is a non-existent resource.
use std::time::Duration;

use tracing::{event, Level};

use base::prelude::*;

use crate::event::OutputEvent;
use crate::fault::BusFault;
use crate::interrupt::InterruptFabric;
use crate::io::{DeviceContext, EventQueue, EventScheduler, InterruptLines};
use crate::memory::MemoryUnit;
use crate::processor::Processor;
use crate::registers;

mod registry;

pub use registry::{DeviceId, DeviceRegistry, RegistrationError, Window, WindowOwner};

/// A single bus transfer.  For byte writes only the bottom 8 bits of
/// the value are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    Read(Width),
    Write(Width, u16),
}

/// The parts of the machine outside the bus which a transfer may
/// reach: processor registers, the interrupt fabric (for the PIRQ
/// register and device requests), and what devices need for their
/// own activity.
pub struct BusHost<'a> {
    pub cpu: &'a mut Processor,
    pub interrupts: &'a mut InterruptFabric,
    pub events: &'a mut EventQueue,
    pub now: Duration,
    pub output: &'a mut Vec<OutputEvent>,
}

#[derive(Debug)]
pub struct BusRouter {
    pub(crate) memory: MemoryUnit,
    pub(crate) registry: DeviceRegistry,
}

impl BusRouter {
    pub fn new(memory: MemoryUnit) -> BusRouter {
        BusRouter {
            memory,
            registry: DeviceRegistry::new(),
        }
    }

    pub fn memory(&self) -> &MemoryUnit {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryUnit {
        &mut self.memory
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Perform a transfer.  Reads return the value read; writes
    /// return 0.
    pub fn route(
        &mut self,
        pa: PhysicalAddress,
        op: BusOp,
        host: &mut BusHost,
    ) -> Result<u16, BusFault> {
        if self.memory.contains(pa) {
            return match op {
                BusOp::Read(width) => self.memory.read(pa, width),
                BusOp::Write(width, value) => self.memory.write(pa, width, value).map(|()| 0),
            };
        }
        if !pa.is_in_io_page() {
            event!(Level::DEBUG, "{op:?} at {pa}: no memory there");
            return Err(BusFault::NonExistentResource(pa));
        }
        let outcome = match self.registry.lookup(pa) {
            None => {
                event!(Level::DEBUG, "{op:?} at {pa}: no register there");
                return Err(BusFault::NonExistentResource(pa));
            }
            Some((WindowOwner::Processor(register), offset)) => match op {
                BusOp::Read(width) => {
                    registers::read(register, offset, width, host.cpu, host.interrupts)
                }
                BusOp::Write(width, value) => {
                    registers::write(register, offset, width, value, host.cpu, host.interrupts)
                        .map(|()| 0)
                }
            },
            Some((WindowOwner::Device(id), offset)) => {
                let result = self.with_device(id, host, |device, ctx| match op {
                    BusOp::Read(width) => device.read(ctx, offset, width),
                    BusOp::Write(width, value) => {
                        device.write(ctx, offset, width, value).map(|()| 0)
                    }
                });
                match result {
                    Some(r) => r,
                    None => return Err(BusFault::NonExistentResource(pa)),
                }
            }
        };
        outcome.map_err(|e| {
            event!(Level::DEBUG, "{op:?} at {pa} refused: {e}");
            BusFault::NonExistentResource(pa)
        })
    }

    /// Run `f` on an attached device, with a context built from
    /// `host`.  Returns `None` if the device is not attached.
    pub(crate) fn with_device<R, F>(&mut self, id: DeviceId, host: &mut BusHost, f: F) -> Option<R>
    where
        F: FnOnce(&mut dyn crate::io::Device, &mut DeviceContext) -> R,
    {
        let attached = self.registry.attached_mut(id)?;
        let mut ctx = DeviceContext {
            id,
            now: host.now,
            interrupts: InterruptLines::new(&mut *host.interrupts, attached.vectors.as_ref()),
            events: EventScheduler::new(&mut *host.events, id, host.now),
            memory: &mut self.memory,
            output: &mut *host.output,
        };
        Some(f(attached.device.as_mut(), &mut ctx))
    }
}
