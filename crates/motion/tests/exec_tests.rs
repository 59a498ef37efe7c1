//! End-to-end tests for the planner/executor/stepper pipeline.
//!
//! A miniature dispatch loop stands in for the controller: it runs planning
//! callbacks, invokes the executor whenever the prep slot is free, and drives
//! the DDA and system-tick clocks deterministically.

use motion::block::ProbeSpec;
use motion::plan;
use motion::zoid::jerk_time_factor;
use motion::{
    BlockType, CartesianKinematics, CommandSink, ExecStatus, MachineCommand, PlannerQueue, Runtime,
    StopKind, AXES,
};
use std::cell::Cell;
use std::rc::Rc;
use stepper::{
    LoaderEvent, PrepSlot, ProbeInput, RunState, StepOutput, StepperEngine, DDA_FREQUENCY, MOTORS,
};

const JERK: f64 = 100_000.0; // mm/s^3
const STEPS_PER_MM: f64 = 80.0;

#[derive(Debug, Default)]
struct PulseRecorder {
    steps: [i64; MOTORS],
    pulses: Vec<(usize, bool)>,
}

impl StepOutput for PulseRecorder {
    fn step(&mut self, motor: usize, forward: bool) {
        self.steps[motor] += if forward { 1 } else { -1 };
        self.pulses.push((motor, forward));
    }
    fn set_enable(&mut self, _motor: usize, _enabled: bool) {}
}

#[derive(Debug, Default)]
struct CommandRecorder {
    commands: Vec<MachineCommand>,
}

impl CommandSink for CommandRecorder {
    fn execute(&mut self, command: &MachineCommand) {
        self.commands.push(command.clone());
    }
}

#[derive(Debug, Clone, Default)]
struct SharedProbe {
    triggered: Rc<Cell<bool>>,
}

impl ProbeInput for SharedProbe {
    fn triggered(&self) -> bool {
        self.triggered.get()
    }
}

struct Harness {
    queue: PlannerQueue,
    runtime: Runtime,
    prep: PrepSlot,
    engine: StepperEngine,
    out: PulseRecorder,
    sink: CommandRecorder,
    probe: SharedProbe,
    position: [f64; AXES],
    /// DDA ticks elapsed, for timing assertions.
    dda_ticks: u64,
    /// System ticks spent dwelling.
    dwell_ticks: u64,
    /// Segment velocities observed, for continuity checks.
    velocities: Vec<f64>,
    statuses: Vec<ExecStatus>,
}

impl Harness {
    fn new() -> Self {
        Self {
            queue: PlannerQueue::new(),
            runtime: Runtime::new(Box::new(CartesianKinematics {
                steps_per_unit: [STEPS_PER_MM; MOTORS],
                motor_axis: [0, 1, 2, 3],
            })),
            prep: PrepSlot::new(),
            engine: StepperEngine::new(),
            out: PulseRecorder::default(),
            sink: CommandRecorder::default(),
            probe: SharedProbe::default(),
            position: [0.0; AXES],
            dda_ticks: 0,
            dwell_ticks: 0,
            velocities: Vec::new(),
            statuses: Vec::new(),
        }
    }

    fn push_aline(&mut self, delta: [f64; AXES], cruise: f64) {
        let mut target = self.position;
        let mut length_sq = 0.0;
        for axis in 0..AXES {
            target[axis] += delta[axis];
            length_sq += delta[axis] * delta[axis];
        }
        let length = length_sq.sqrt();
        assert!(length > 0.0);
        let mut unit = [0.0; AXES];
        for axis in 0..AXES {
            unit[axis] = delta[axis] / length;
        }

        let block = self.queue.allocate().expect("queue full");
        block.set_aline_geometry(length, unit);
        block.target = target;
        block.set_jerk(JERK);
        block.cruise_vset = cruise;
        block.cruise_vmax = cruise;
        block.absolute_vmax = cruise;
        block.junction_vmax = f64::MAX;
        self.queue.commit(0.0);
        self.position = target;
    }

    fn push_probe(&mut self, delta: [f64; AXES], feed: f64, spec: ProbeSpec) {
        self.push_aline(delta, feed);
        let idx = self.queue.newest_index().unwrap();
        self.queue.block_mut(idx).probe = Some(spec);
    }

    fn push_dwell(&mut self, seconds: f64) {
        let block = self.queue.allocate().expect("queue full");
        block.block_type = BlockType::Dwell;
        block.dwell_seconds = seconds;
        self.queue.commit(0.0);
    }

    fn push_command(&mut self, command: MachineCommand) {
        let block = self.queue.allocate().expect("queue full");
        block.block_type = BlockType::Command;
        block.command = Some(command);
        self.queue.commit(0.0);
    }

    fn exec_once(&mut self) -> ExecStatus {
        plan::backplan(&mut self.queue);
        plan::plan_forward(&mut self.queue, self.runtime.planning_entry_velocity());
        let status = self
            .runtime
            .exec_move(
                &mut self.queue,
                &mut self.prep,
                &self.engine.encoders(),
                Some(&self.probe),
                &mut self.sink,
            )
            .expect("exec failed");
        if matches!(status, ExecStatus::Segment) {
            self.velocities.push(self.runtime.velocity());
        }
        self.statuses.push(status);
        status
    }

    /// Runs the whole pipeline until everything drains or `hold_at` DDA ticks
    /// elapse (at which point a feed hold is requested).
    fn run(&mut self, hold_at: Option<u64>) {
        let mut guard: u64 = 0;
        let mut held = false;
        loop {
            guard += 1;
            assert!(guard < 200_000_000, "pipeline did not drain");

            let status = self.exec_once();
            self.engine.request_load(&mut self.prep, &mut self.out);

            match self.engine.state() {
                RunState::Aline => {
                    self.engine.dda_tick(&mut self.prep, &mut self.out);
                    self.dda_ticks += 1;
                    // 1 kHz system tick alongside the DDA clock.
                    if self.dda_ticks % (DDA_FREQUENCY as u64 / 1000) == 0 {
                        self.engine.sys_tick(&mut self.prep, &mut self.out);
                    }
                }
                RunState::Dwell => {
                    self.engine.sys_tick(&mut self.prep, &mut self.out);
                    self.dwell_ticks += 1;
                }
                RunState::Idle => {
                    self.runtime.notify_steppers_idle();
                    if matches!(status, ExecStatus::Idle)
                        && self.prep.ready_for_exec()
                        && !self.runtime.is_active()
                    {
                        break;
                    }
                    if let LoaderEvent::RequestExec =
                        self.engine.request_load(&mut self.prep, &mut self.out)
                    {
                        continue;
                    }
                }
            }

            if let Some(at) = hold_at {
                if !held && self.dda_ticks >= at {
                    self.runtime.request_feedhold();
                    held = true;
                }
            }
        }
    }
}

#[test]
fn single_move_runs_to_length_and_time() {
    let mut h = Harness::new();
    let mut delta = [0.0; AXES];
    delta[0] = 100.0;
    h.push_aline(delta, 100.0);
    h.run(None);

    // Position: exactly the programmed target.
    assert!((h.runtime.position()[0] - 100.0).abs() < 1e-9);
    // Steps: 100 mm * 80 steps/mm, conserved within a step.
    assert!((h.out.steps[0] - 8000).abs() <= 1, "steps {}", h.out.steps[0]);
    assert_eq!(h.out.steps[1], 0);

    // Time: cruise time plus two jerk-limited ramps.
    let k = jerk_time_factor(JERK);
    let ramp_time = k * 100.0_f64.sqrt();
    let expected = 100.0 / 100.0 + ramp_time; // body shortened by ramps: L/v + T_ramp
    let elapsed = h.dda_ticks as f64 / DDA_FREQUENCY;
    assert!(
        (elapsed - expected).abs() < 0.02,
        "elapsed {elapsed}, expected {expected}"
    );
    // And strictly longer than the pure-cruise lower bound.
    assert!(elapsed > 1.0);
}

#[test]
fn diagonal_move_steps_both_motors() {
    let mut h = Harness::new();
    let mut delta = [0.0; AXES];
    delta[0] = 30.0;
    delta[1] = -40.0; // 50 mm hypotenuse
    h.push_aline(delta, 50.0);
    h.run(None);
    assert!((h.out.steps[0] - 2400).abs() <= 1);
    assert!((h.out.steps[1] + 3200).abs() <= 1);
}

#[test]
fn colinear_chain_keeps_velocity_continuous() {
    let mut h = Harness::new();
    let mut delta = [0.0; AXES];
    delta[0] = 0.5;
    for _ in 0..20 {
        h.push_aline(delta, 200.0);
    }
    h.run(None);

    assert!((h.runtime.position()[0] - 10.0).abs() < 1e-9);
    assert!((h.out.steps[0] - 800).abs() <= 1);

    // No boundary may jump velocity: adjacent segment samples stay close.
    let mut peak: f64 = 0.0;
    for pair in h.velocities.windows(2) {
        peak = peak.max((pair[1] - pair[0]).abs());
    }
    assert!(peak < 15.0, "velocity discontinuity of {peak} mm/s");
    // The chain actually gets up to speed.
    let vmax = h.velocities.iter().cloned().fold(0.0, f64::max);
    assert!(vmax > 100.0, "chain never sped up: {vmax}");
}

#[test]
fn feed_hold_stops_and_cycle_start_finishes_the_move() {
    let mut h = Harness::new();
    let mut delta = [0.0; AXES];
    delta[0] = 100.0;
    h.push_aline(delta, 100.0);

    // Hold 0.3 s in: mid-body.
    h.run(Some((0.3 * DDA_FREQUENCY) as u64));

    assert_eq!(h.runtime.hold_state(), motion::HoldState::MotionStopped);
    let held_at = h.runtime.position()[0];
    assert!(held_at > 20.0 && held_at < 90.0, "held at {held_at}");
    // Encoder agrees with the commanded stop within a step.
    assert!(((h.engine.encoders()[0] as f64) - held_at * STEPS_PER_MM).abs() <= 1.0);

    // Resume: the remainder replans from a standing start.
    assert!(h.runtime.cycle_start());
    h.run(None);
    assert!((h.runtime.position()[0] - 100.0).abs() < 1e-9);
    assert!((h.out.steps[0] - 8000).abs() <= 1, "steps {}", h.out.steps[0]);
}

#[test]
fn dwell_stops_the_dda_and_resumes() {
    let mut h = Harness::new();
    let mut delta = [0.0; AXES];
    delta[0] = 5.0;
    h.push_aline(delta, 50.0);
    h.push_dwell(0.5);
    h.push_aline(delta, 50.0);
    h.run(None);

    assert!((499..=501).contains(&h.dwell_ticks), "dwelled {} ticks", h.dwell_ticks);
    assert!((h.runtime.position()[0] - 10.0).abs() < 1e-9);
    assert!((h.out.steps[0] - 800).abs() <= 1);
}

#[test]
fn commands_execute_in_queue_order() {
    let mut h = Harness::new();
    let mut delta = [0.0; AXES];
    delta[0] = 2.0;
    h.push_command(MachineCommand::SpindleOn {
        clockwise: true,
        rpm: 12_000.0,
    });
    h.push_aline(delta, 50.0);
    h.push_command(MachineCommand::SpindleOff);
    h.run(None);

    assert_eq!(h.sink.commands.len(), 2);
    assert!(matches!(
        h.sink.commands[0],
        MachineCommand::SpindleOn { clockwise: true, .. }
    ));
    assert_eq!(h.sink.commands[1], MachineCommand::SpindleOff);
}

#[test]
fn probe_contact_stops_and_reports_position() {
    let mut h = Harness::new();
    let mut delta = [0.0; AXES];
    delta[2] = -10.0;
    h.push_probe(
        delta,
        5.0,
        ProbeSpec {
            away: false,
            alarm_on_miss: true,
        },
    );

    // Trip the probe once Z has traveled 3 mm (240 steps down).
    let trip = h.probe.triggered.clone();
    let mut guard = 0u64;
    loop {
        guard += 1;
        assert!(guard < 100_000_000);
        if h.engine.encoders()[2] <= -240 {
            trip.set(true);
        }
        let status = h.exec_once();
        h.engine.request_load(&mut h.prep, &mut h.out);
        if h.engine.state() == RunState::Aline {
            h.engine.dda_tick(&mut h.prep, &mut h.out);
        }
        if let ExecStatus::ProbeDone {
            tripped, contact, ..
        } = status
        {
            assert!(tripped);
            assert!(contact[2] < -2.9 && contact[2] > -4.0, "contact {}", contact[2]);
            break;
        }
    }
}

#[test]
fn probe_miss_reports_untripped() {
    let mut h = Harness::new();
    let mut delta = [0.0; AXES];
    delta[2] = -2.0;
    h.push_probe(
        delta,
        5.0,
        ProbeSpec {
            away: false,
            alarm_on_miss: false,
        },
    );
    h.run(None);
    assert!(h.statuses.iter().any(|s| matches!(
        s,
        ExecStatus::ProbeDone {
            tripped: false,
            alarm_on_miss: false,
            ..
        }
    )));
}

#[test]
fn program_stop_block_surfaces_flow_event() {
    let mut h = Harness::new();
    let mut delta = [0.0; AXES];
    delta[0] = 1.0;
    h.push_aline(delta, 50.0);
    let block = h.queue.allocate().unwrap();
    block.block_type = BlockType::End;
    block.stop = Some(StopKind::EndRewind);
    h.queue.commit(0.0);
    h.run(None);
    assert!(h
        .statuses
        .iter()
        .any(|s| matches!(s, ExecStatus::Flow(StopKind::EndRewind))));
}
