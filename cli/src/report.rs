//! Console output and the end-of-run summary.
use std::io::{stdout, Write};

use termcolor::{self, ColorChoice, ColorSpec, StandardStream, WriteColor};
use tracing::{event, Level};

use cpu::{Machine, TrapSlot, CPUERR_RED_STACK, CPUERR_YELLOW_STACK};

use crate::engine::Activity;

fn get_colour_choice() -> termcolor::ColorChoice {
    if atty::is(atty::Stream::Stdout) {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    }
}

/// Writes what the guest prints on its console.
pub struct ConsoleWriter {
    column: usize,
}

impl ConsoleWriter {
    pub fn new() -> ConsoleWriter {
        ConsoleWriter { column: 0 }
    }

    pub fn write(&mut self, byte: u8) -> Result<(), std::io::Error> {
        // Parity is not our business.
        let byte = byte & 0o177;
        let to_emit: char = match byte {
            b'\r' => {
                self.column = 0;
                '\n'
            }
            b'\n' => return Ok(()),
            0x20..=0x7e => {
                self.column += 1;
                char::from(byte)
            }
            _ => return Ok(()),
        };
        let stdout = stdout();
        let mut handle = stdout.lock();
        write!(handle, "{to_emit}").and_then(|()| handle.flush())
    }

    /// Finish any partial line.
    pub fn finish(&mut self) -> Result<(), std::io::Error> {
        if self.column > 0 {
            self.column = 0;
            writeln!(stdout())?;
        }
        Ok(())
    }
}

impl Default for ConsoleWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Summary {
    stream: StandardStream,
}

impl Summary {
    pub fn new() -> Summary {
        Summary {
            stream: StandardStream::stdout(get_colour_choice()),
        }
    }

    fn set_colour(&mut self, colour: Option<termcolor::Color>, bold: bool) {
        let mut spec = ColorSpec::new();
        spec.set_fg(colour).set_bold(bold);
        if let Err(e) = self.stream.set_color(&spec) {
            event!(Level::ERROR, "Failed to select colour {:?}: {}", spec, e);
        }
    }

    fn heading(&mut self, text: &str) -> Result<(), std::io::Error> {
        self.set_colour(None, true);
        writeln!(self.stream, "{text}")?;
        self.set_colour(None, false);
        Ok(())
    }

    pub fn print(&mut self, machine: &Machine, activity: &Activity) -> Result<(), std::io::Error> {
        self.heading("Dispatches")?;
        if activity.dispatches.is_empty() {
            writeln!(self.stream, "  none")?;
        }
        for (vector, (label, count)) in activity.dispatches.iter() {
            let colour = if label.ends_with("interrupt") {
                termcolor::Color::Green
            } else {
                termcolor::Color::Yellow
            };
            self.set_colour(Some(colour), false);
            write!(self.stream, "  {vector:>4o}")?;
            self.set_colour(None, false);
            writeln!(self.stream, "  {label:<40} {count:>8}")?;
        }
        if activity.abandoned > 0 {
            self.set_colour(Some(termcolor::Color::Red), true);
            writeln!(
                self.stream,
                "  {} dispatches abandoned for lack of kernel stack",
                activity.abandoned
            )?;
            self.set_colour(None, false);
        }
        writeln!(self.stream, "  {} characters echoed", activity.echoed)?;

        self.heading("Processor")?;
        let cpu = machine.processor();
        writeln!(self.stream, "  PSW     {}", machine.psw())?;
        writeln!(self.stream, "  PC      {:06o}", machine.pc())?;
        let cpu_error = cpu.cpu_error();
        if cpu_error & (CPUERR_RED_STACK | CPUERR_YELLOW_STACK) != 0 {
            self.set_colour(Some(termcolor::Color::Red), true);
        }
        writeln!(self.stream, "  CPUERR  {cpu_error:06o}")?;
        self.set_colour(None, false);
        let pending: Vec<String> = TrapSlot::ALL
            .iter()
            .filter(|slot| cpu.traps().is_pending(**slot))
            .map(|slot| slot.to_string())
            .collect();
        if !pending.is_empty() {
            self.set_colour(Some(termcolor::Color::Yellow), false);
            writeln!(self.stream, "  pending: {}", pending.join(", "))?;
            self.set_colour(None, false);
        }
        let record = cpu.fault_recorder().snapshot();
        if let Some(reason) = record.reason {
            self.set_colour(Some(termcolor::Color::Red), false);
            writeln!(self.stream, "  latched {reason} fault in {}", record.slot)?;
            self.set_colour(None, false);
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Err(e) = self.stream.reset() {
            event!(Level::ERROR, "Failed to reset terminal: {}", e);
        }
    }
}

impl Default for Summary {
    fn default() -> Self {
        Self::new()
    }
}
