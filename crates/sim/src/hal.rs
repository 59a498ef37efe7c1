//! Recording hardware seams.

use motion::{CommandSink, MachineCommand};
use serde::Serialize;
use std::cell::Cell;
use std::rc::Rc;
use stepper::{ProbeInput, StepOutput, MOTORS};

/// One emitted step edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pulse {
    /// DDA tick index at which the edge fired.
    pub tick: u64,
    pub motor: u8,
    pub forward: bool,
}

/// Step output that records every pulse and tracks net motor positions.
#[derive(Debug, Default)]
pub struct RecordingOutput {
    pub steps: [i64; MOTORS],
    pub pulses: Vec<Pulse>,
    pub enables: Vec<(usize, bool)>,
    /// Maintained by the harness so pulses are timestamped.
    pub tick: u64,
}

impl StepOutput for RecordingOutput {
    fn step(&mut self, motor: usize, forward: bool) {
        self.steps[motor] += if forward { 1 } else { -1 };
        self.pulses.push(Pulse {
            tick: self.tick,
            motor: motor as u8,
            forward,
        });
    }

    fn set_enable(&mut self, motor: usize, enabled: bool) {
        self.enables.push((motor, enabled));
    }
}

/// Command sink that records executed payloads in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub commands: Vec<MachineCommand>,
}

impl CommandSink for RecordingSink {
    fn execute(&mut self, command: &MachineCommand) {
        self.commands.push(command.clone());
    }
}

/// Probe/limit input backed by a shared flag the harness flips.
#[derive(Debug, Clone, Default)]
pub struct SimProbe {
    state: Rc<Cell<bool>>,
}

impl SimProbe {
    pub fn handle(&self) -> Rc<Cell<bool>> {
        self.state.clone()
    }

    pub fn set(&self, triggered: bool) {
        self.state.set(triggered);
    }
}

impl ProbeInput for SimProbe {
    fn triggered(&self) -> bool {
        self.state.get()
    }
}
