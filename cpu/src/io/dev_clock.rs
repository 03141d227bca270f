//! A line-frequency clock (KW11-L).
//!
//! The clock has a single status register.  Bit 7 (monitor) is set
//! at every tick of the power line; software clears it by writing a
//! zero to it.  Bit 6 enables an interrupt at each tick.
use std::time::Duration;

use tracing::{event, Level};

use base::prelude::*;

use super::{extract_register_read, merge_register_write, Device, DeviceContext, DeviceKind};
use crate::fault::RegisterError;
use crate::interrupt::InterruptRequest;

pub const CLOCK_REGISTER: PhysicalAddress = pa!(0o17777546);
pub const CLOCK_VECTOR: u16 = 0o100;

const MONITOR: u16 = 1 << 7;
const INTERRUPT_ENABLE: u16 = 1 << 6;

/// The tick tag.
const TICK: u32 = 0;

#[derive(Debug)]
pub struct LineClock {
    csr: u16,
    period: Duration,
    ticks: u64,
}

impl LineClock {
    /// A clock running from a 60Hz supply.
    pub fn new() -> LineClock {
        LineClock::with_frequency(60)
    }

    pub fn with_frequency(hz: u32) -> LineClock {
        LineClock {
            csr: MONITOR,
            period: Duration::from_secs(1) / hz.max(1),
            ticks: 0,
        }
    }

    pub fn interrupt_request() -> InterruptRequest {
        InterruptRequest {
            level: PriorityLevel::from_bits(6),
            first_vector: CLOCK_VECTOR,
            count: 1,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    fn update_request(&self, ctx: &mut DeviceContext) {
        ctx.interrupts
            .set(0, self.csr & MONITOR != 0 && self.csr & INTERRUPT_ENABLE != 0);
    }
}

impl Default for LineClock {
    fn default() -> LineClock {
        LineClock::new()
    }
}

impl Device for LineClock {
    fn name(&self) -> String {
        "KW11-L line clock".to_string()
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Clock
    }

    fn read(
        &mut self,
        _ctx: &mut DeviceContext,
        offset: u32,
        width: Width,
    ) -> Result<u16, RegisterError> {
        match offset {
            0 | 1 => Ok(extract_register_read(offset, width, self.csr)),
            _ => Err(RegisterError::NoSuchRegister),
        }
    }

    fn write(
        &mut self,
        ctx: &mut DeviceContext,
        offset: u32,
        width: Width,
        value: u16,
    ) -> Result<(), RegisterError> {
        if offset > 1 {
            return Err(RegisterError::NoSuchRegister);
        }
        let value = merge_register_write(offset, width, self.csr, value);
        // The monitor bit can be cleared but not set by software.
        self.csr = (self.csr & MONITOR & value) | (value & INTERRUPT_ENABLE);
        self.update_request(ctx);
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut DeviceContext, tag: u32) {
        if tag != TICK {
            event!(Level::WARN, "clock ignoring unexpected activity {tag}");
            return;
        }
        self.ticks += 1;
        self.csr |= MONITOR;
        self.update_request(ctx);
        ctx.events.schedule_after(self.period, TICK);
    }

    fn reset(&mut self, ctx: &mut DeviceContext) {
        self.csr = MONITOR;
        self.update_request(ctx);
        ctx.events.schedule_after(self.period, TICK);
    }
}
