//! The virtual-clock driver.
//!
//! Advances the controller exactly the way firmware interrupts would: the
//! DDA clock preempts everything, the loader request re-enters the executor
//! immediately, the 1 kHz system tick interleaves, and the cooperative main
//! loop runs in the gaps. All scheduling decisions are functions of the
//! virtual clock, so runs are reproducible.

use crate::hal::{RecordingOutput, RecordingSink, SimProbe};
use anyhow::{bail, Result};
use mill_host::{Controller, MachineConfig};
use motion::AXES;
use serde::Serialize;
use std::path::Path;
use stepper::{LoaderEvent, RunState, DDA_FREQUENCY, MOTORS};
use tracing::info;

/// Externally scheduled stimuli.
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// Raw transport bytes (lines, `!`, `~`, Ctrl-X).
    Bytes(Vec<u8>),
    FeedHold,
    CycleStart,
}

/// One velocity/position sample, taken every system tick.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Sample {
    pub t: f64,
    pub position: [f64; AXES],
    pub velocity: f64,
}

type ProbeRule = Box<dyn Fn(&[i64; MOTORS]) -> bool>;

pub struct Simulator {
    pub controller: Controller,
    pub out: RecordingOutput,
    pub sink: RecordingSink,
    pub probe: SimProbe,
    /// Trips the probe when the rule returns true for the encoder counts.
    probe_rule: Option<ProbeRule>,
    events: Vec<(f64, SimEvent)>,
    pub samples: Vec<Sample>,
    pub dwell_ticks: u64,
    now: f64,
    dda_ticks: u64,
}

impl Simulator {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            controller: Controller::new(config),
            out: RecordingOutput::default(),
            sink: RecordingSink::default(),
            probe: SimProbe::default(),
            probe_rule: None,
            events: Vec::new(),
            samples: Vec::new(),
            dwell_ticks: 0,
            now: 0.0,
            dda_ticks: 0,
        }
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    /// Queues a whole program up front.
    pub fn load_program(&mut self, program: &str) {
        for line in program.lines() {
            self.controller.push_line(line);
        }
    }

    /// Schedules an event at an absolute virtual time.
    pub fn at(&mut self, t: f64, event: SimEvent) {
        self.events.push((t, event));
        self.events
            .sort_by(|a, b| a.0.partial_cmp(&b.0).expect("event times are finite"));
    }

    /// Trips the probe input when the encoder counts satisfy `rule`.
    pub fn probe_when(&mut self, rule: impl Fn(&[i64; MOTORS]) -> bool + 'static) {
        self.probe_rule = Some(Box::new(rule));
    }

    /// Runs until the pipeline drains or the virtual time limit expires.
    pub fn run(&mut self, time_limit: f64) -> Result<()> {
        let dda_dt = 1.0 / DDA_FREQUENCY;
        let systick_every = (DDA_FREQUENCY / 1000.0) as u64;

        loop {
            if self.now > time_limit {
                bail!("simulation exceeded {time_limit}s of virtual time");
            }
            self.dispatch_events();
            if let Some(rule) = &self.probe_rule {
                if rule(&self.controller.engine.encoders()) {
                    self.probe.set(true);
                }
            }

            self.controller.set_now(self.now);
            self.controller.main_tick();
            let probe = self.probe.clone();
            for _ in 0..64 {
                self.controller.plan_tick();
                if !self
                    .controller
                    .exec_tick(&mut self.out, Some(&probe), &mut self.sink)
                {
                    break;
                }
            }

            match self.controller.engine.state() {
                RunState::Aline => {
                    self.out.tick = self.dda_ticks;
                    let event = self.controller.dda_tick(&mut self.out);
                    self.now += dda_dt;
                    self.dda_ticks += 1;
                    if self.dda_ticks % systick_every == 0 {
                        self.sample();
                        self.controller.sys_tick(&mut self.out);
                    }
                    if event == LoaderEvent::RequestExec {
                        self.controller.set_now(self.now);
                        self.controller.plan_tick();
                        self.controller
                            .exec_tick(&mut self.out, Some(&probe), &mut self.sink);
                    }
                }
                RunState::Dwell => {
                    self.controller.sys_tick(&mut self.out);
                    self.now += 0.001;
                    self.dwell_ticks += 1;
                    self.sample();
                }
                RunState::Idle => {
                    if self.controller.is_idle() && self.events.is_empty() {
                        return Ok(());
                    }
                    self.controller.sys_tick(&mut self.out);
                    self.now += 0.001;
                    self.sample();
                }
            }
        }
    }

    fn dispatch_events(&mut self) {
        while let Some((t, _)) = self.events.first() {
            if *t > self.now {
                break;
            }
            let (_, event) = self.events.remove(0);
            match event {
                SimEvent::Bytes(bytes) => self.controller.push_bytes(&bytes),
                SimEvent::FeedHold => self.controller.push_bytes(b"!"),
                SimEvent::CycleStart => self.controller.push_bytes(b"~"),
            }
        }
    }

    fn sample(&mut self) {
        self.samples.push(Sample {
            t: self.now,
            position: self.controller.runtime.position(),
            velocity: self.controller.runtime.velocity(),
        });
    }

    /// Net step counts from the recorded pulse train.
    pub fn net_steps(&self) -> [i64; MOTORS] {
        self.out.steps
    }

    /// Highest sampled path velocity.
    pub fn peak_velocity(&self) -> f64 {
        self.samples.iter().map(|s| s.velocity).fold(0.0, f64::max)
    }

    /// Writes the captured pulse train and motion samples as JSON, for
    /// offline analysis and CI artifact diffing.
    pub fn dump_trace(&self, path: &Path) -> Result<()> {
        #[derive(Serialize)]
        struct Trace<'a> {
            pulses: &'a [crate::hal::Pulse],
            samples: &'a [Sample],
            net_steps: [i64; MOTORS],
        }
        let trace = Trace {
            pulses: &self.out.pulses,
            samples: &self.samples,
            net_steps: self.net_steps(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&trace)?)?;
        info!(path = %path.display(), pulses = self.out.pulses.len(), "trace written");
        Ok(())
    }
}
