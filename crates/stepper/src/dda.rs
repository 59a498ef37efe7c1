//! The DDA run state and loader.
//!
//! `dda_tick` is the highest-priority context in the system: it only steps
//! accumulators, emits edges, and (on the last tick of a segment) runs the
//! loader. The loader copies the prep slot into the run state and hands the
//! slot back to the executor.

use crate::prep::{PrepOwner, PrepPayload, PrepSlot};
use crate::{StepOutput, MOTORS, MOTOR_IDLE_TIMEOUT, SYSTICK_FREQUENCY};

/// What the run side is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// DDA timer stopped, nothing loaded.
    #[default]
    Idle,
    /// Stepping a segment at the DDA rate.
    Aline,
    /// Counting system ticks with the DDA timer stopped.
    Dwell,
}

/// Signals from the loader back to the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderEvent {
    None,
    /// A segment was consumed; the executor should prepare the next one.
    RequestExec,
}

#[derive(Debug, Clone, Copy, Default)]
struct MotorRun {
    substep_increment: i32,
    substep_accumulator: i32,
    forward: bool,
}

/// The step pulse engine: per-motor DDA state plus dwell and power handling.
#[derive(Debug, Default)]
pub struct StepperEngine {
    state: RunState,
    ticks_remaining: u32,
    dwell_remaining: u32,
    dda_ticks_x_substeps: i32,
    motors: [MotorRun; MOTORS],
    encoder: [i64; MOTORS],
    energized: bool,
    idle_ticks: u32,
}

impl StepperEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// True while the DDA timer should be ticking.
    pub fn is_stepping(&self) -> bool {
        self.state == RunState::Aline
    }

    /// Emitted-step counts per motor (the encoder model: signed steps since
    /// reset).
    pub fn encoders(&self) -> [i64; MOTORS] {
        self.encoder
    }

    pub fn set_encoders(&mut self, counts: [i64; MOTORS]) {
        self.encoder = counts;
    }

    /// One DDA tick. Integrates every motor accumulator, emits step edges on
    /// positive zero-crossings, and on the final tick of the segment runs the
    /// loader.
    pub fn dda_tick(&mut self, prep: &mut PrepSlot, out: &mut dyn StepOutput) -> LoaderEvent {
        if self.state != RunState::Aline {
            return LoaderEvent::None;
        }
        for (m, motor) in self.motors.iter_mut().enumerate() {
            if motor.substep_increment == 0 {
                continue;
            }
            motor.substep_accumulator += motor.substep_increment;
            if motor.substep_accumulator > 0 {
                motor.substep_accumulator -= self.dda_ticks_x_substeps;
                out.step(m, motor.forward);
                self.encoder[m] += if motor.forward { 1 } else { -1 };
            }
        }
        self.ticks_remaining -= 1;
        if self.ticks_remaining == 0 {
            return self.load_move(prep, out);
        }
        LoaderEvent::None
    }

    /// One system tick (1 kHz): dwell countdown and motor power management.
    pub fn sys_tick(&mut self, prep: &mut PrepSlot, out: &mut dyn StepOutput) -> LoaderEvent {
        match self.state {
            RunState::Dwell => {
                if self.dwell_remaining > 0 {
                    self.dwell_remaining -= 1;
                }
                if self.dwell_remaining == 0 {
                    return self.load_move(prep, out);
                }
                LoaderEvent::None
            }
            RunState::Idle => {
                self.idle_ticks = self.idle_ticks.saturating_add(1);
                let timeout = (MOTOR_IDLE_TIMEOUT * SYSTICK_FREQUENCY) as u32;
                if self.energized && self.idle_ticks > timeout {
                    self.set_energized(false, out);
                }
                LoaderEvent::None
            }
            RunState::Aline => LoaderEvent::None,
        }
    }

    /// Kick the loader when the run side is not mid-segment. Called after the
    /// executor prepares a segment into an idle engine.
    pub fn request_load(&mut self, prep: &mut PrepSlot, out: &mut dyn StepOutput) -> LoaderEvent {
        match self.state {
            RunState::Idle => self.load_move(prep, out),
            _ => LoaderEvent::None,
        }
    }

    /// The loader proper. Runs at DDA priority on segment completion (or on
    /// dwell expiry / explicit request). Copies the prep slot into the run
    /// state, applies the accumulator correction and direction-change
    /// reflection, and releases the slot back to the executor.
    fn load_move(&mut self, prep: &mut PrepSlot, out: &mut dyn StepOutput) -> LoaderEvent {
        if prep.owner() != PrepOwner::Loader {
            // Starved: nothing prepared. Stop the DDA timer; motors stay
            // energized until the idle timeout runs out.
            self.state = RunState::Idle;
            self.idle_ticks = 0;
            return LoaderEvent::None;
        }

        match prep.payload {
            PrepPayload::Aline => {
                let fresh = self.state != RunState::Aline;
                let new_ticks_x_substeps = prep.dda_ticks_x_substeps;
                for (run, line) in self.motors.iter_mut().zip(prep.motors.iter()) {
                    if fresh {
                        // Phase-neutral start: half a step period to the
                        // first pulse.
                        run.substep_accumulator = -(new_ticks_x_substeps / 2);
                        run.forward = line.forward;
                    } else {
                        if prep.correction_pending {
                            run.substep_accumulator = (run.substep_accumulator as f64
                                * prep.accumulator_correction)
                                as i32;
                        }
                        if line.substep_increment != 0 && line.forward != run.forward {
                            // Reflect through the midpoint to preserve the
                            // partial step.
                            run.substep_accumulator =
                                -(new_ticks_x_substeps + run.substep_accumulator);
                            run.forward = line.forward;
                        }
                    }
                    run.substep_increment = line.substep_increment;
                }
                self.dda_ticks_x_substeps = new_ticks_x_substeps;
                self.ticks_remaining = prep.dda_ticks;
                self.state = RunState::Aline;
                self.idle_ticks = 0;
                if !self.energized {
                    self.set_energized(true, out);
                }
            }
            PrepPayload::Dwell { ticks } => {
                self.state = RunState::Dwell;
                self.dwell_remaining = ticks.max(1);
                self.idle_ticks = 0;
            }
            PrepPayload::Null => {
                self.state = RunState::Idle;
                self.idle_ticks = 0;
            }
        }
        prep.release_to_exec();
        LoaderEvent::RequestExec
    }

    /// Emergency halt: stop the DDA timer mid-segment. Motors stay energized
    /// (holding torque); accumulator phase is preserved for diagnostics.
    pub fn halt(&mut self) {
        self.state = RunState::Idle;
        self.ticks_remaining = 0;
        self.dwell_remaining = 0;
        self.idle_ticks = 0;
        for motor in &mut self.motors {
            motor.substep_increment = 0;
        }
    }

    fn set_energized(&mut self, on: bool, out: &mut dyn StepOutput) {
        self.energized = on;
        for m in 0..MOTORS {
            out.set_enable(m, on);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prep::Segment;

    #[derive(Debug, Default)]
    struct Recorder {
        steps: [i64; MOTORS],
        enables: Vec<(usize, bool)>,
    }

    impl StepOutput for Recorder {
        fn step(&mut self, motor: usize, forward: bool) {
            self.steps[motor] += if forward { 1 } else { -1 };
        }
        fn set_enable(&mut self, motor: usize, enabled: bool) {
            self.enables.push((motor, enabled));
        }
    }

    /// Chains a list of segments through the prep slot the way the executor
    /// does: the next segment is prepared while the current one is stepping,
    /// so the loader never fresh-starts mid-run.
    fn drive(
        engine: &mut StepperEngine,
        prep: &mut PrepSlot,
        out: &mut Recorder,
        segments: &[([f64; MOTORS], f64)],
    ) {
        let mut pending = segments.iter();
        let mut next = pending.next();
        loop {
            if prep.ready_for_exec() {
                if let Some((travel, time)) = next {
                    prep.prep_line(&Segment {
                        travel_steps: *travel,
                        following_error: [0.0; MOTORS],
                        time: *time,
                    })
                    .unwrap();
                    next = pending.next();
                }
            }
            if engine.is_stepping() {
                engine.dda_tick(prep, out);
            } else if prep.owner() == PrepOwner::Loader {
                engine.request_load(prep, out);
            } else {
                break;
            }
        }
    }

    #[test]
    fn segment_emits_expected_step_count() {
        let mut engine = StepperEngine::new();
        let mut prep = PrepSlot::new();
        let mut out = Recorder::default();
        drive(&mut engine, &mut prep, &mut out, &[([10.0, -7.0, 0.0, 0.0], 0.001)]);
        assert_eq!(out.steps[0], 10);
        assert_eq!(out.steps[1], -7);
        assert_eq!(out.steps[2], 0);
        assert_eq!(engine.encoders()[0], 10);
        assert_eq!(engine.encoders()[1], -7);
    }

    #[test]
    fn consecutive_segments_conserve_steps() {
        let mut engine = StepperEngine::new();
        let mut prep = PrepSlot::new();
        let mut out = Recorder::default();
        // 40 chained segments of 2.5 steps each: the carried accumulator must
        // bring the total out at 100 ± 1.
        let segments = vec![([2.5, 0.0, 0.0, 0.0], 0.00075); 40];
        drive(&mut engine, &mut prep, &mut out, &segments);
        assert!((out.steps[0] - 100).abs() <= 1, "got {}", out.steps[0]);
    }

    #[test]
    fn direction_flip_preserves_phase() {
        let mut engine = StepperEngine::new();
        let mut prep = PrepSlot::new();
        let mut out = Recorder::default();
        // Forward then immediately reverse, chained without a gap. The
        // midpoint reflection keeps net travel within a step of zero.
        drive(
            &mut engine,
            &mut prep,
            &mut out,
            &[([12.5, 0.0, 0.0, 0.0], 0.001), ([-12.5, 0.0, 0.0, 0.0], 0.001)],
        );
        assert!(out.steps[0].abs() <= 1, "got {}", out.steps[0]);
    }

    #[test]
    fn dwell_counts_system_ticks() {
        let mut engine = StepperEngine::new();
        let mut prep = PrepSlot::new();
        let mut out = Recorder::default();
        prep.prep_dwell(0.5).unwrap();
        engine.request_load(&mut prep, &mut out);
        assert_eq!(engine.state(), RunState::Dwell);
        let mut ticks = 0u32;
        while engine.state() == RunState::Dwell {
            engine.sys_tick(&mut prep, &mut out);
            ticks += 1;
            assert!(ticks < 1000, "dwell never completed");
        }
        assert!((499..=501).contains(&ticks), "took {ticks} ticks");
    }

    #[test]
    fn starved_loader_goes_idle() {
        let mut engine = StepperEngine::new();
        let mut prep = PrepSlot::new();
        let mut out = Recorder::default();
        drive(&mut engine, &mut prep, &mut out, &[([4.0, 0.0, 0.0, 0.0], 0.001)]);
        // Segment ended with nothing prepared: engine must be idle.
        assert_eq!(engine.state(), RunState::Idle);
    }

    #[test]
    fn idle_timeout_deenergizes() {
        let mut engine = StepperEngine::new();
        let mut prep = PrepSlot::new();
        let mut out = Recorder::default();
        drive(&mut engine, &mut prep, &mut out, &[([1.0, 0.0, 0.0, 0.0], 0.001)]);
        assert!(out.enables.iter().any(|&(_, on)| on));
        for _ in 0..(MOTOR_IDLE_TIMEOUT * SYSTICK_FREQUENCY) as u32 + 2 {
            engine.sys_tick(&mut prep, &mut out);
        }
        assert_eq!(out.enables.last(), Some(&(MOTORS - 1, false)));
    }
}
