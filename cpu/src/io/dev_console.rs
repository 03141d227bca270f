//! A serial console interface (DL11).
//!
//! There are four registers: receiver status, receiver buffer,
//! transmitter status and transmitter buffer.  Each direction has
//! its own interrupt vector: the receiver uses the first, the
//! transmitter the second.
//!
//! Characters typed on the host are queued here and delivered to the
//! receiver one at a time, at the line rate.  A character written to
//! the transmitter buffer is handed to the host as an
//! [`OutputEvent`] once the line has had time to send it.
use std::collections::VecDeque;
use std::time::Duration;

use tracing::{event, Level};

use base::prelude::*;

use super::{extract_register_read, merge_register_write, Device, DeviceContext, DeviceKind};
use crate::event::{InputEvent, InputEventError, OutputEvent};
use crate::fault::RegisterError;
use crate::interrupt::InterruptRequest;

pub const CONSOLE_REGISTERS: PhysicalAddress = pa!(0o17777560);
pub const CONSOLE_WINDOW_BYTES: u32 = 8;
pub const CONSOLE_RECEIVE_VECTOR: u16 = 0o060;

const RCSR: u32 = 0;
const RBUF: u32 = 2;
const XCSR: u32 = 4;
const XBUF: u32 = 6;

const DONE: u16 = 1 << 7;
const INTERRUPT_ENABLE: u16 = 1 << 6;

/// Interrupt line indexes.
const RECEIVER: usize = 0;
const TRANSMITTER: usize = 1;

/// Activity tags.
const RECEIVE: u32 = 0;
const TRANSMIT: u32 = 1;

/// How much typed-ahead input is held before further input is
/// refused.
const INPUT_LIMIT: usize = 4096;

#[derive(Debug)]
pub struct SerialConsole {
    rcsr: u16,
    rbuf: u16,
    xcsr: u16,
    xbuf: u16,
    /// Time to send or receive one character.
    character_time: Duration,
    input: VecDeque<u8>,
}

impl SerialConsole {
    /// A console on a 9600 baud line.
    pub fn new() -> SerialConsole {
        SerialConsole::with_baud_rate(9600)
    }

    pub fn with_baud_rate(baud: u32) -> SerialConsole {
        SerialConsole {
            rcsr: 0,
            rbuf: 0,
            xcsr: DONE,
            xbuf: 0,
            // Ten bits per character: start, eight data, stop.
            character_time: Duration::from_secs(10) / baud.max(1),
            input: VecDeque::new(),
        }
    }

    pub fn interrupt_request() -> InterruptRequest {
        InterruptRequest {
            level: PriorityLevel::from_bits(4),
            first_vector: CONSOLE_RECEIVE_VECTOR,
            count: 2,
        }
    }

    pub fn pending_input(&self) -> usize {
        self.input.len()
    }

    fn update_requests(&self, ctx: &mut DeviceContext) {
        let active = |csr: u16| csr & DONE != 0 && csr & INTERRUPT_ENABLE != 0;
        ctx.interrupts.set(RECEIVER, active(self.rcsr));
        ctx.interrupts.set(TRANSMITTER, active(self.xcsr));
    }

    /// Make sure the next queued character will arrive.
    fn start_receiver(&self, ctx: &mut DeviceContext) {
        if self.rcsr & DONE == 0 && !self.input.is_empty() && !ctx.events.is_scheduled(RECEIVE)
        {
            ctx.events.schedule_after(self.character_time, RECEIVE);
        }
    }

    fn register(&self, offset: u32) -> Result<u16, RegisterError> {
        match offset & !1 {
            RCSR => Ok(self.rcsr),
            RBUF => Ok(self.rbuf),
            XCSR => Ok(self.xcsr),
            XBUF => Ok(self.xbuf),
            _ => Err(RegisterError::NoSuchRegister),
        }
    }
}

impl Default for SerialConsole {
    fn default() -> SerialConsole {
        SerialConsole::new()
    }
}

impl Device for SerialConsole {
    fn name(&self) -> String {
        "DL11 console".to_string()
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Console
    }

    fn read(
        &mut self,
        ctx: &mut DeviceContext,
        offset: u32,
        width: Width,
    ) -> Result<u16, RegisterError> {
        let word = self.register(offset)?;
        if offset & !1 == RBUF {
            // Taking the character frees the receiver for the next.
            self.rcsr &= !DONE;
            self.update_requests(ctx);
            self.start_receiver(ctx);
        }
        Ok(extract_register_read(offset, width, word))
    }

    fn write(
        &mut self,
        ctx: &mut DeviceContext,
        offset: u32,
        width: Width,
        value: u16,
    ) -> Result<(), RegisterError> {
        let value = merge_register_write(offset, width, self.register(offset)?, value);
        match offset & !1 {
            RCSR => {
                self.rcsr = (self.rcsr & DONE) | (value & INTERRUPT_ENABLE);
            }
            XCSR => {
                self.xcsr = (self.xcsr & DONE) | (value & INTERRUPT_ENABLE);
            }
            XBUF => {
                self.xbuf = value & 0o377;
                if self.xcsr & DONE == 0 {
                    event!(Level::DEBUG, "console transmitter overrun");
                }
                self.xcsr &= !DONE;
                ctx.events.schedule_after(self.character_time, TRANSMIT);
            }
            // The receiver buffer is read-only.
            _ => (),
        }
        self.update_requests(ctx);
        Ok(())
    }

    fn on_event(&mut self, ctx: &mut DeviceContext, tag: u32) {
        match tag {
            RECEIVE => {
                if self.rcsr & DONE == 0 {
                    if let Some(byte) = self.input.pop_front() {
                        self.rbuf = u16::from(byte);
                        self.rcsr |= DONE;
                    }
                }
            }
            TRANSMIT => {
                // xbuf is masked to 8 bits when written.
                let byte = (self.xbuf & 0o377) as u8;
                ctx.output.push(OutputEvent::ConsolePrint {
                    device: ctx.id,
                    byte,
                });
                self.xcsr |= DONE;
            }
            _ => {
                event!(Level::WARN, "console ignoring unexpected activity {tag}");
            }
        }
        self.update_requests(ctx);
    }

    fn reset(&mut self, ctx: &mut DeviceContext) {
        self.rcsr = 0;
        self.rbuf = 0;
        self.xcsr = DONE;
        ctx.events.cancel(TRANSMIT);
        self.update_requests(ctx);
        self.start_receiver(ctx);
    }

    fn on_input(
        &mut self,
        ctx: &mut DeviceContext,
        input: InputEvent,
    ) -> Result<(), InputEventError> {
        match input {
            InputEvent::ConsoleKeyboardInput { data } => {
                if self.input.len() + data.len() > INPUT_LIMIT {
                    return Err(InputEventError::BufferUnavailable);
                }
                self.input.extend(data);
                self.start_receiver(ctx);
                Ok(())
            }
        }
    }
}
