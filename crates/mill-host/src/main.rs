//! # mill-host
//!
//! Command-line front end for the motion core. `run` drives a G-code
//! program through the full pipeline (parser, planner, executor, DDA)
//! against a virtual clock and reports what the machine did; `batch` does
//! the same but prints a machine-readable JSON summary for toolchain use.
//!
//! Hardware transports are out of scope here: the step output is a
//! pulse-counting recorder, standing in for the platform GPIO layer. When
//! reading stdin, a transport thread streams lines over a channel so the
//! pipeline plans and executes while input is still arriving, the same shape
//! a serial byte source has.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver, TryRecvError};
use mill_host::{Controller, MachineConfig, MachineState};
use motion::{CommandSink, MachineCommand};
use serde::Serialize;
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use stepper::{LoaderEvent, RunState, StepOutput, DDA_FREQUENCY, MOTORS};
use tracing::info;

/// Motion-control host: plan and execute G-code programs.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a G-code program through the full motion pipeline.
    Run(RunArgs),
    /// Execute a program and emit a JSON summary of the result.
    Batch(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Machine configuration file (INI). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// G-code program; reads stdin when omitted.
    gcode: Option<PathBuf>,

    /// Abort if the simulated program exceeds this many seconds.
    #[arg(long, default_value_t = 3600.0)]
    time_limit: f64,
}

/// Counts emitted pulses per motor, standing in for the GPIO step port.
#[derive(Debug, Default)]
struct PulseCounter {
    steps: [i64; MOTORS],
    pulses: u64,
}

impl StepOutput for PulseCounter {
    fn step(&mut self, motor: usize, forward: bool) {
        self.steps[motor] += if forward { 1 } else { -1 };
        self.pulses += 1;
    }
    fn set_enable(&mut self, _motor: usize, _enabled: bool) {}
}

/// Logs queued commands as they execute.
#[derive(Debug, Default)]
struct LoggingSink {
    executed: Vec<MachineCommand>,
}

impl CommandSink for LoggingSink {
    fn execute(&mut self, command: &MachineCommand) {
        info!(?command, "command");
        self.executed.push(command.clone());
    }
}

#[derive(Debug, Serialize)]
struct RunSummary {
    state: MachineState,
    simulated_seconds: f64,
    final_position: [f64; motion::AXES],
    motor_steps: [i64; MOTORS],
    pulses: u64,
    commands_executed: usize,
    errors: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let summary = run_program(&args)?;
            println!(
                "done: {:?} in {:.3}s, {} pulses, position {:?}",
                summary.state,
                summary.simulated_seconds,
                summary.pulses,
                &summary.final_position[..3]
            );
            for error in &summary.errors {
                eprintln!("error: {error}");
            }
            Ok(())
        }
        Commands::Batch(args) => {
            let summary = run_program(&args)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

fn run_program(args: &RunArgs) -> Result<RunSummary> {
    let config = match &args.config {
        Some(path) => MachineConfig::load(path)?,
        None => MachineConfig::default(),
    };

    let mut controller = Controller::new(config);
    let line_rx = match &args.gcode {
        Some(path) => {
            let program = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read program {path:?}"))?;
            for line in program.lines() {
                controller.push_line(line);
            }
            None
        }
        None => Some(spawn_stdin_reader()),
    };

    let mut out = PulseCounter::default();
    let mut sink = LoggingSink::default();
    let elapsed =
        drive_to_completion(&mut controller, &mut out, &mut sink, args.time_limit, line_rx)?;

    let mut errors = controller.take_errors();
    errors.dedup();
    Ok(RunSummary {
        state: controller.machine.state(),
        simulated_seconds: elapsed,
        final_position: controller.runtime.position(),
        motor_steps: out.steps,
        pulses: out.pulses,
        commands_executed: sink.executed.len(),
        errors,
    })
}

/// Streams stdin lines from a dedicated reader thread. The channel
/// disconnects at end of input.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Drives the controller with a virtual clock until everything drains and
/// the input channel (if any) has closed.
fn drive_to_completion(
    controller: &mut Controller,
    out: &mut PulseCounter,
    sink: &mut LoggingSink,
    time_limit: f64,
    mut line_rx: Option<Receiver<String>>,
) -> Result<f64> {
    let dda_dt = 1.0 / DDA_FREQUENCY;
    let systick_every = (DDA_FREQUENCY / 1000.0) as u64;
    let mut now = 0.0_f64;
    let mut dda_ticks = 0u64;

    loop {
        if now > time_limit {
            bail!("program exceeded the {time_limit}s simulation limit");
        }

        // Drain whatever the transport thread has delivered so far.
        let mut disconnected = false;
        if let Some(rx) = &line_rx {
            loop {
                match rx.try_recv() {
                    Ok(line) => controller.push_line(&line),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
        }
        if disconnected {
            line_rx = None;
        }

        controller.set_now(now);
        controller.main_tick();
        // Exec/plan contexts run until quiescent; the prep slot holds one
        // segment, so this settles fast. Bounded in case planning is behind.
        for _ in 0..64 {
            controller.plan_tick();
            if !controller.exec_tick(out, None, sink) {
                break;
            }
        }

        match controller.engine.state() {
            RunState::Aline => {
                let event = controller.dda_tick(out);
                now += dda_dt;
                dda_ticks += 1;
                if dda_ticks % systick_every == 0 {
                    controller.sys_tick(out);
                }
                if event == LoaderEvent::RequestExec {
                    controller.set_now(now);
                    controller.plan_tick();
                    controller.exec_tick(out, None, sink);
                }
            }
            RunState::Dwell => {
                controller.sys_tick(out);
                now += 0.001;
            }
            RunState::Idle => {
                if controller.is_idle() {
                    if line_rx.is_none() {
                        return Ok(now);
                    }
                    // Waiting on the transport: let wall time carry the
                    // virtual clock instead of spinning it forward.
                    std::thread::sleep(Duration::from_millis(1));
                }
                // Idle time still flows (block timeout, power management).
                controller.sys_tick(out);
                now += 0.001;
            }
        }
    }
}
