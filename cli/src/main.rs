use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{event, Level};
use tracing_subscriber::prelude::*;

use cpu::{
    CpuModel, InputEvent, LineClock, Machine, OutputEvent, SerialConsole, CLOCK_REGISTER,
    CONSOLE_REGISTERS, CONSOLE_WINDOW_BYTES,
};

mod clock;
mod engine;
mod report;

use clock::SimulatedClock;
use engine::StubEngine;
use report::{ConsoleWriter, Summary};

/// Exercise the memory management, trap and interrupt machinery of a
/// PDP-11 class processor.
#[derive(Parser, Debug)]
#[command(name = "pdp11", version)]
struct Args {
    /// Processor model: 11/34, 11/45 or 11/70.
    #[arg(long, default_value = "11/70")]
    model: CpuModel,

    /// Installed memory in KiB (default: the model's usual amount).
    #[arg(long)]
    memory_kib: Option<u32>,

    /// Do not trap word references to odd addresses.
    #[arg(long)]
    no_odd_address_traps: bool,

    /// Simulated time to run for, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    run_for_ms: u64,

    /// Text to type on the console.  It is echoed back.
    #[arg(long)]
    console_input: Option<String>,

    /// Write a JSON snapshot of the machine here at the end of the run.
    #[arg(long)]
    save_state: Option<PathBuf>,
}

fn run_simulator() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // See
    // https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html
    // for how to select which trace messages get printed.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    let filter_layer = match tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
    {
        Err(e) => {
            return Err(Box::new(e));
        }
        Ok(layer) => layer,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let mut config = args.model.configuration();
    config.odd_address_traps = !args.no_odd_address_traps;
    if let Some(kib) = args.memory_kib {
        config.memory_bytes = kib.saturating_mul(1024);
    }
    event!(Level::INFO, "simulating a PDP-{}", args.model);

    let mut clock = SimulatedClock::new();
    let mut machine = Machine::new(&clock.make_fresh_context(), config)?;
    machine.attach(
        CLOCK_REGISTER,
        2,
        Box::new(LineClock::new()),
        Some(LineClock::interrupt_request()),
    )?;
    let console = machine.attach(
        CONSOLE_REGISTERS,
        CONSOLE_WINDOW_BYTES,
        Box::new(SerialConsole::new()),
        Some(SerialConsole::interrupt_request()),
    )?;

    let mut engine = StubEngine::new();
    engine.install(&mut machine)?;
    if let Some(text) = args.console_input {
        machine.input(
            console,
            InputEvent::ConsoleKeyboardInput {
                data: text.into_bytes(),
            },
        )?;
    }

    let limit = Duration::from_millis(args.run_for_ms);
    let outcome = engine.run(&mut machine, &mut clock, limit);

    let mut writer = ConsoleWriter::new();
    for output in machine.drain_output() {
        match output {
            OutputEvent::ConsolePrint { byte, .. } => writer.write(byte)?,
        }
    }
    writer.finish()?;

    let mut summary = Summary::new();
    summary.print(&machine, engine.activity())?;
    summary.disconnect();

    if let Some(path) = args.save_state {
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(file, &machine.snapshot())?;
        event!(Level::INFO, "saved machine state to {}", path.display());
    }

    outcome.map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
}

fn main() {
    match run_simulator() {
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
        Ok(()) => {
            std::process::exit(0);
        }
    }
}
