//! The runtime executor.
//!
//! `exec_move` runs in the EXEC (low-priority interrupt) context and produces
//! at most one prepared segment per invocation. For the active block it walks
//! the HEAD/BODY/TAIL sections, samples the quintic-Bézier velocity curve per
//! segment, interpolates axis targets (snapping to pre-computed waypoints at
//! section boundaries to cancel float drift), converts to motor steps through
//! the kinematic model, and hands the result to the stepper prep slot.
//!
//! The executor is the only writer of the run cursor and of the running
//! block's state; the forward planner never touches a block once it is
//! `Running`.

use crate::bezier::ForwardDiffs;
use crate::block::{BlockState, BlockType, BufferState, MachineCommand, ProbeSpec, StopKind};
use crate::error::MotionError;
use crate::hold::HoldState;
use crate::kinematics::Kinematics;
use crate::plan;
use crate::queue::PlannerQueue;
use crate::zoid::{braking_length, decel_velocity};
use crate::{
    AXES, LENGTH_EPSILON, MIN_SEGMENT_TIME, NOM_SEGMENT_TIME, TRAVEL_TRUNCATION_STEPS,
    VELOCITY_EPSILON,
};
use stepper::{PrepSlot, ProbeInput, Segment, MOTORS};
use tracing::{debug, warn};

/// Sink for queued command payloads. Supplied by the host; implementations
/// must not block.
pub trait CommandSink {
    fn execute(&mut self, command: &MachineCommand);
}

/// Outcome of one executor invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecStatus {
    /// Nothing to do: no block, the prep slot is still full, or holding.
    Idle,
    /// One segment was prepared.
    Segment,
    /// The active move finished; its final segment has been prepared.
    BlockDone,
    /// A command or dwell block was consumed.
    CommandDone,
    /// A program-flow block was consumed; the host changes cycle state.
    Flow(StopKind),
    /// The run cursor reached an unplanned block: a null segment was loaded,
    /// planning must catch up.
    Starved,
    /// A probing move ended, by contact or by running out of travel.
    ProbeDone {
        tripped: bool,
        contact: [f64; AXES],
        alarm_on_miss: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Head,
    Body,
    Tail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionState {
    New,
    Running,
}

/// Ramp copy the executor walks. Two of these alternate: one executes while
/// the other receives the next block's plan; they swap identity only at
/// block entry.
#[derive(Debug, Clone, Copy, Default)]
struct RuntimeBlock {
    entry_velocity: f64,
    cruise_velocity: f64,
    exit_velocity: f64,
    head_length: f64,
    body_length: f64,
    tail_length: f64,
    head_time: f64,
    body_time: f64,
    tail_time: f64,
    jerk_time_k: f64,
}

impl RuntimeBlock {
    /// Folds sections shorter than [`MIN_SEGMENT_TIME`] into a neighbour so
    /// the segment iteration always advances. Head and tail keep their
    /// endpoints; the body absorbs short heads/tails; a short body splits
    /// into the surviving head/tail halves.
    fn normalize(&mut self) {
        if self.head_time > 0.0 && self.head_time < MIN_SEGMENT_TIME {
            if self.body_length > LENGTH_EPSILON {
                self.body_length += self.head_length;
                self.body_time += self.head_time;
            } else {
                self.tail_length += self.head_length;
                self.tail_time += self.head_time;
            }
            self.head_length = 0.0;
            self.head_time = 0.0;
        }
        if self.tail_time > 0.0 && self.tail_time < MIN_SEGMENT_TIME {
            if self.body_length > LENGTH_EPSILON {
                self.body_length += self.tail_length;
                self.body_time += self.tail_time;
            } else {
                self.head_length += self.tail_length;
                self.head_time += self.tail_time;
            }
            self.tail_length = 0.0;
            self.tail_time = 0.0;
        }
        if self.body_time > 0.0 && self.body_time < MIN_SEGMENT_TIME {
            let has_head = self.head_length > LENGTH_EPSILON;
            let has_tail = self.tail_length > LENGTH_EPSILON;
            match (has_head, has_tail) {
                (true, true) => {
                    self.head_length += 0.5 * self.body_length;
                    self.head_time += 0.5 * self.body_time;
                    self.tail_length += 0.5 * self.body_length;
                    self.tail_time += 0.5 * self.body_time;
                }
                (true, false) => {
                    self.head_length += self.body_length;
                    self.head_time += self.body_time;
                }
                (false, true) => {
                    self.tail_length += self.body_length;
                    self.tail_time += self.body_time;
                }
                (false, false) => {
                    // The body is the whole block: stretch it to the floor.
                    self.body_time = MIN_SEGMENT_TIME;
                    return;
                }
            }
            self.body_length = 0.0;
            self.body_time = 0.0;
        }
    }
}

/// The runtime executor state. One per machine.
pub struct Runtime {
    kinematics: Box<dyn Kinematics>,

    pair: [RuntimeBlock; 2],
    run: usize,
    active: bool,

    /// Commanded position, machine coordinates.
    position: [f64; AXES],
    kahan: [f64; AXES],
    target: [f64; AXES],
    unit: [f64; AXES],
    /// End-of-section targets: [end of head, end of body, block end].
    waypoints: [[f64; AXES]; 3],

    section: Section,
    section_state: SectionState,
    segment_count: u32,
    segment_index: u32,
    segment_time: f64,
    segment_velocity: f64,
    diffs: ForwardDiffs,

    /// Motor step position at the last segment boundary.
    steps_position: [f64; MOTORS],
    /// One segment older; time-aligned with encoder sampling.
    steps_delayed: [f64; MOTORS],

    /// Velocity carried into the next block (the last exit velocity).
    entry_velocity: f64,

    hold: HoldState,
    /// Out-of-band dwell armed at feed-hold exit; consumed at the next
    /// loader cycle while idle.
    exit_dwell: Option<f64>,

    probe: Option<ProbeSpec>,
}

impl Runtime {
    pub fn new(kinematics: Box<dyn Kinematics>) -> Self {
        let position = [0.0; AXES];
        let steps = kinematics.inverse(&position);
        Self {
            kinematics,
            pair: [RuntimeBlock::default(); 2],
            run: 0,
            active: false,
            position,
            kahan: [0.0; AXES],
            target: [0.0; AXES],
            unit: [0.0; AXES],
            waypoints: [[0.0; AXES]; 3],
            section: Section::Head,
            section_state: SectionState::New,
            segment_count: 0,
            segment_index: 0,
            segment_time: 0.0,
            segment_velocity: 0.0,
            diffs: ForwardDiffs::default(),
            steps_position: steps,
            steps_delayed: steps,
            entry_velocity: 0.0,
            hold: HoldState::Off,
            exit_dwell: None,
            probe: None,
        }
    }

    pub fn position(&self) -> [f64; AXES] {
        self.position
    }

    /// Velocity of the segment currently being generated (mm/s).
    pub fn velocity(&self) -> f64 {
        if self.active {
            self.segment_velocity
        } else {
            0.0
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn hold_state(&self) -> HoldState {
        self.hold
    }

    /// Velocity the next block will start at.
    pub fn planning_entry_velocity(&self) -> f64 {
        self.entry_velocity
    }

    /// Overwrites the commanded position (homing, G28.3, G92-free resets).
    /// Only legal while no block is active.
    pub fn set_position(&mut self, position: [f64; AXES]) {
        debug_assert!(!self.active);
        self.position = position;
        self.kahan = [0.0; AXES];
        let steps = self.kinematics.inverse(&position);
        self.steps_position = steps;
        self.steps_delayed = steps;
    }

    pub fn kinematics(&self) -> &dyn Kinematics {
        self.kinematics.as_ref()
    }

    /// Requests a feed hold. Takes effect at the next segment boundary.
    pub fn request_feedhold(&mut self) {
        if self.hold == HoldState::Off {
            self.hold = HoldState::Sync;
        }
    }

    /// Cycle start: leaves a completed hold. Returns true if motion may
    /// resume (the suspended remainder has been handed back to the planner).
    pub fn cycle_start(&mut self) -> bool {
        match self.hold {
            HoldState::MotionStopped => {
                self.hold = HoldState::Off;
                true
            }
            HoldState::Sync if !self.active => {
                self.hold = HoldState::Off;
                true
            }
            _ => false,
        }
    }

    /// Arms the out-of-band dwell consumed at the next idle loader cycle.
    pub fn arm_exit_dwell(&mut self, seconds: f64) {
        if !self.active {
            self.exit_dwell = Some(seconds);
        }
    }

    /// Host notification that the stepper engine has drained.
    pub fn notify_steppers_idle(&mut self) {
        if self.hold == HoldState::MotionStopping {
            self.hold = HoldState::MotionStopped;
        }
    }

    /// Abandons all runtime state (alarm path). The caller flushes the queue.
    pub fn abort(&mut self) {
        self.active = false;
        self.hold = HoldState::Off;
        self.entry_velocity = 0.0;
        self.exit_dwell = None;
        self.probe = None;
        self.kahan = [0.0; AXES];
    }

    /// One executor invocation: produce at most one prepared segment (or
    /// consume one non-move block).
    pub fn exec_move(
        &mut self,
        queue: &mut PlannerQueue,
        prep: &mut PrepSlot,
        encoders: &[i64; MOTORS],
        probe: Option<&dyn ProbeInput>,
        sink: &mut dyn CommandSink,
    ) -> Result<ExecStatus, MotionError> {
        if !prep.ready_for_exec() {
            return Ok(ExecStatus::Idle);
        }
        if self.hold.is_stopped() {
            if self.hold == HoldState::DecelComplete {
                self.hold = HoldState::MotionStopping;
            }
            return Ok(ExecStatus::Idle);
        }

        if !self.active {
            if matches!(self.hold, HoldState::Sync | HoldState::DecelContinue) {
                // A hold between blocks completes unless a move is up next
                // that the deceleration must carry into.
                let next_is_move = queue.running().map(|b| b.is_move()).unwrap_or(false);
                if self.entry_velocity < VELOCITY_EPSILON || !next_is_move {
                    self.entry_velocity = 0.0;
                    self.hold = HoldState::MotionStopped;
                    return Ok(ExecStatus::Idle);
                }
            }
            if let Some(seconds) = self.exit_dwell.take() {
                prep.prep_dwell(seconds)?;
                return Ok(ExecStatus::CommandDone);
            }

            let Some(block) = queue.running() else {
                return Ok(ExecStatus::Idle);
            };
            let block_type = block.block_type;
            let buffer_state = block.buffer_state;

            match block_type {
                BlockType::Aline => {
                    if buffer_state < BufferState::BackPlanned {
                        warn!("executor reached an unplanned block; requesting planning");
                        prep.prep_null();
                        return Ok(ExecStatus::Starved);
                    }
                    if buffer_state < BufferState::FullyPlanned {
                        // Just-in-time ramp; normally the forward-plan
                        // context has already done this.
                        plan::plan_forward(queue, self.entry_velocity);
                        if queue
                            .running()
                            .is_some_and(|b| b.buffer_state < BufferState::FullyPlanned)
                        {
                            warn!("forward planning could not ready the run block");
                            prep.prep_null();
                            return Ok(ExecStatus::Starved);
                        }
                    }
                    self.enter_block(queue);
                }
                BlockType::Command | BlockType::Tool | BlockType::SpindleSpeed
                | BlockType::JsonWait => {
                    if self.hold.is_holding() {
                        return Ok(ExecStatus::Idle);
                    }
                    let block = queue.running_mut().expect("running block");
                    if let Some(command) = block.command.take() {
                        sink.execute(&command);
                    }
                    queue.free_running();
                    return Ok(ExecStatus::CommandDone);
                }
                BlockType::Dwell => {
                    if self.hold.is_holding() {
                        return Ok(ExecStatus::Idle);
                    }
                    let seconds = block.dwell_seconds;
                    prep.prep_dwell(seconds)?;
                    queue.free_running();
                    self.entry_velocity = 0.0;
                    return Ok(ExecStatus::CommandDone);
                }
                BlockType::Stop | BlockType::End => {
                    let kind = block.stop.unwrap_or(StopKind::Stop);
                    queue.free_running();
                    self.entry_velocity = 0.0;
                    return Ok(ExecStatus::Flow(kind));
                }
                BlockType::Null => {
                    queue.free_running();
                    return Ok(ExecStatus::Idle);
                }
            }
        }

        self.exec_segment(queue, prep, encoders, probe)
    }

    /// Block entry: swap the runtime pair, copy the plan, normalize short
    /// sections, and lay out the waypoints.
    fn enter_block(&mut self, queue: &mut PlannerQueue) {
        let idx = queue.running_index();
        let block = queue.block_mut(idx);
        block.buffer_state = BufferState::Running;
        block.block_state = BlockState::InitialAction;
        block.plannable = false;

        self.run ^= 1;
        let mut rb = RuntimeBlock {
            entry_velocity: self.entry_velocity,
            cruise_velocity: block.cruise_velocity,
            exit_velocity: block.exit_velocity,
            head_length: block.head_length,
            body_length: block.body_length,
            tail_length: block.tail_length,
            head_time: block.head_time,
            body_time: block.body_time,
            tail_time: block.tail_time,
            jerk_time_k: block.jerk_time_k,
        };
        rb.normalize();

        self.unit = block.unit;
        self.target = block.target;
        self.probe = block.probe;

        let mut head_end = self.position;
        for (axis, wp) in head_end.iter_mut().enumerate() {
            *wp += self.unit[axis] * rb.head_length;
        }
        let mut body_end = head_end;
        for (axis, wp) in body_end.iter_mut().enumerate() {
            *wp += self.unit[axis] * rb.body_length;
        }
        self.waypoints = [head_end, body_end, self.target];

        self.pair[self.run] = rb;
        self.section = Section::Head;
        self.section_state = SectionState::New;
        self.segment_count = 0;
        self.segment_index = 0;
        self.active = true;

        debug!(
            line = ?block.gm.line_number,
            entry = rb.entry_velocity,
            cruise = rb.cruise_velocity,
            exit = rb.exit_velocity,
            "block entered"
        );
    }

    /// Computes segment count, duration, and the first velocity sample for
    /// the current section. Returns false for an empty section.
    fn setup_section(&mut self) -> bool {
        let rb = self.pair[self.run];
        let (length, time, v0, v1) = match self.section {
            Section::Head => (
                rb.head_length,
                rb.head_time,
                rb.entry_velocity,
                rb.cruise_velocity,
            ),
            Section::Body => (
                rb.body_length,
                rb.body_time,
                rb.cruise_velocity,
                rb.cruise_velocity,
            ),
            Section::Tail => (
                rb.tail_length,
                rb.tail_time,
                rb.cruise_velocity,
                rb.exit_velocity,
            ),
        };
        if time <= 0.0 || length <= LENGTH_EPSILON {
            return false;
        }
        let count = (time / NOM_SEGMENT_TIME).ceil().max(1.0) as u32;
        self.segment_count = count;
        self.segment_index = 0;
        self.segment_time = time / count as f64;
        self.segment_velocity = if count == 1 {
            // Single-segment sections bypass the curve.
            length / time
        } else {
            self.diffs = ForwardDiffs::init(v0, v1, count);
            self.diffs.first()
        };
        true
    }

    /// Produces one segment of the active block.
    fn exec_segment(
        &mut self,
        queue: &mut PlannerQueue,
        prep: &mut PrepSlot,
        encoders: &[i64; MOTORS],
        probe: Option<&dyn ProbeInput>,
    ) -> Result<ExecStatus, MotionError> {
        self.process_hold();

        if let Some(spec) = self.probe {
            let input = probe.map(|p| p.triggered()).unwrap_or(false);
            let fired = if spec.away { !input } else { input };
            if fired {
                return Ok(self.finish_probe(queue, spec));
            }
        }

        // Find a section with content; empty sections are skipped.
        loop {
            if self.section_state == SectionState::New {
                if self.setup_section() {
                    break;
                }
                match self.section {
                    Section::Head => self.section = Section::Body,
                    Section::Body => self.section = Section::Tail,
                    Section::Tail => return Ok(self.finish_block(queue)),
                }
                continue;
            }
            break;
        }

        let velocity = self.segment_velocity.max(0.0);
        let dt = self.segment_time;
        let last_of_section = self.segment_index + 1 == self.segment_count;

        if last_of_section && !self.hold.is_holding() {
            // Snap to the waypoint: float drift cannot outlive a section.
            self.position = self.waypoints[self.section as usize];
            self.kahan = [0.0; AXES];
        } else {
            for axis in 0..AXES {
                let delta = self.unit[axis] * velocity * dt;
                kahan_add(&mut self.position[axis], &mut self.kahan[axis], delta);
            }
        }

        let steps_target = self.kinematics.inverse(&self.position);
        let mut travel = [0.0; MOTORS];
        let mut following_error = [0.0; MOTORS];
        for m in 0..MOTORS {
            let t = steps_target[m] - self.steps_position[m];
            travel[m] = if t.abs() < TRAVEL_TRUNCATION_STEPS { 0.0 } else { t };
            following_error[m] = encoders[m] as f64 - self.steps_delayed[m];
        }

        prep.prep_line(&Segment {
            travel_steps: travel,
            following_error,
            time: dt,
        })?;

        self.steps_delayed = self.steps_position;
        for m in 0..MOTORS {
            self.steps_position[m] += travel[m];
        }
        if let Some(block) = queue.running_mut() {
            block.block_state = BlockState::Active;
        }
        self.section_state = SectionState::Running;

        self.segment_index += 1;
        if self.segment_index < self.segment_count {
            if self.segment_count > 1 {
                self.segment_velocity = self.diffs.next();
            }
            return Ok(ExecStatus::Segment);
        }

        // Section complete.
        match self.section {
            Section::Head => {
                self.section = Section::Body;
                self.section_state = SectionState::New;
                Ok(ExecStatus::Segment)
            }
            Section::Body => {
                self.section = Section::Tail;
                self.section_state = SectionState::New;
                Ok(ExecStatus::Segment)
            }
            Section::Tail => Ok(self.finish_block(queue)),
        }
    }

    /// Feed-hold planning at a segment boundary.
    fn process_hold(&mut self) {
        match self.hold {
            HoldState::Sync => match (self.section, self.section_state) {
                (Section::Head, SectionState::New) => {
                    // Nothing of the head has run: treat it as a body at the
                    // entry velocity.
                    self.plan_hold_decel(self.pair[self.run].entry_velocity);
                }
                (Section::Head, SectionState::Running) => {
                    // Mid-acceleration: the jerk is committed; wait for the
                    // section boundary.
                }
                (Section::Body, SectionState::New) => {
                    self.plan_hold_decel(self.pair[self.run].cruise_velocity);
                }
                (Section::Body, SectionState::Running) => {
                    self.plan_hold_decel(self.segment_velocity);
                }
                (Section::Tail, _) => {
                    // Already decelerating; ride the tail down.
                    self.hold = if self.pair[self.run].exit_velocity < VELOCITY_EPSILON {
                        HoldState::DecelToZero
                    } else {
                        HoldState::DecelContinue
                    };
                }
            },
            HoldState::DecelContinue => {
                if self.section == Section::Head && self.section_state == SectionState::New {
                    // Carried into a fresh block: keep braking from its
                    // entry velocity.
                    self.plan_hold_decel(self.pair[self.run].entry_velocity);
                }
            }
            _ => {}
        }
    }

    /// Replaces the remainder of the active block with a deceleration tail
    /// from `velocity`, stopping inside the block when braking distance
    /// allows and carrying into the next block otherwise.
    fn plan_hold_decel(&mut self, velocity: f64) {
        let remaining = self.remaining_length();
        let rb = &mut self.pair[self.run];
        let k = rb.jerk_time_k;

        if remaining <= LENGTH_EPSILON {
            self.hold = if rb.exit_velocity < VELOCITY_EPSILON {
                HoldState::DecelToZero
            } else {
                HoldState::DecelContinue
            };
            return;
        }

        rb.head_length = 0.0;
        rb.head_time = 0.0;
        rb.body_length = 0.0;
        rb.body_time = 0.0;

        if velocity < VELOCITY_EPSILON {
            // Nothing moving: stop right here.
            rb.tail_length = 0.0;
            rb.tail_time = 0.0;
            rb.cruise_velocity = 0.0;
            rb.exit_velocity = 0.0;
            self.hold = HoldState::DecelToZero;
        } else {
            let brake = braking_length(velocity, k);
            if brake <= remaining - LENGTH_EPSILON {
                rb.tail_length = brake;
                rb.tail_time = 2.0 * brake / velocity;
                rb.cruise_velocity = velocity;
                rb.exit_velocity = 0.0;
                self.hold = HoldState::DecelToZero;
            } else {
                let exit = decel_velocity(velocity, remaining, k);
                rb.tail_length = remaining;
                rb.tail_time = 2.0 * remaining / (velocity + exit);
                rb.cruise_velocity = velocity;
                rb.exit_velocity = exit;
                self.hold = if exit < VELOCITY_EPSILON {
                    HoldState::DecelToZero
                } else {
                    HoldState::DecelContinue
                };
            }
        }

        self.section = Section::Tail;
        self.section_state = SectionState::New;
        self.segment_count = 0;
        self.segment_index = 0;
        debug!(hold = ?self.hold, from = velocity, "hold deceleration planned");
    }

    /// Along-track distance still to travel in the active block.
    fn remaining_length(&self) -> f64 {
        let mut d = 0.0;
        for axis in 0..AXES {
            d += (self.target[axis] - self.position[axis]) * self.unit[axis];
        }
        d.max(0.0)
    }

    fn finish_block(&mut self, queue: &mut PlannerQueue) -> ExecStatus {
        if self.hold == HoldState::DecelToZero {
            // Stopped inside the block: hand the remainder back to the
            // planner and freeze until cycle start.
            self.active = false;
            self.hold = HoldState::DecelComplete;
            self.entry_velocity = 0.0;
            let remaining = self.remaining_length();
            let idx = queue.running_index();
            let block = queue.block_mut(idx);
            if remaining > LENGTH_EPSILON {
                // The exit constraint planned against the following queue is
                // still valid for the shortened block; only the ramp must be
                // recomputed from a standing start.
                block.length = remaining;
                block.buffer_state = BufferState::BackPlanned;
                block.block_state = BlockState::Inactive;
                block.plannable = true;
                block.hint = Default::default();
            } else {
                queue.free_running();
            }
            debug!(remaining, "hold stop inside block");
            return ExecStatus::BlockDone;
        }

        self.active = false;
        self.entry_velocity = self.pair[self.run].exit_velocity;
        let probe = self.probe.take();
        queue.free_running();

        if let Some(spec) = probe {
            // Ran out of travel without contact.
            self.entry_velocity = 0.0;
            return ExecStatus::ProbeDone {
                tripped: false,
                contact: self.position,
                alarm_on_miss: spec.alarm_on_miss,
            };
        }
        ExecStatus::BlockDone
    }

    /// Contact seen: stop producing segments immediately and publish the
    /// contact position.
    fn finish_probe(&mut self, queue: &mut PlannerQueue, spec: ProbeSpec) -> ExecStatus {
        self.active = false;
        self.probe = None;
        self.entry_velocity = 0.0;
        queue.free_running();
        debug!(position = ?self.position, "probe contact");
        ExecStatus::ProbeDone {
            tripped: true,
            contact: self.position,
            alarm_on_miss: spec.alarm_on_miss,
        }
    }
}

#[inline]
fn kahan_add(sum: &mut f64, compensation: &mut f64, delta: f64) {
    let y = delta - *compensation;
    let t = *sum + y;
    *compensation = (t - *sum) - y;
    *sum = t;
}
