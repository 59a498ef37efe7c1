//! The cooperative controller loop.
//!
//! One [`Controller`] owns the whole pipeline: serial line assembly, the
//! canonical machine, the planner queue, the runtime executor and the
//! stepper engine. The driver (binary or simulator) supplies the clocks and
//! calls the tick methods in strict priority order:
//!
//! 1. [`Controller::dda_tick`]: the high-rate pulse clock,
//! 2. [`Controller::exec_tick`]: segment production (EXEC context),
//! 3. [`Controller::plan_tick`]: one-shot forward planning,
//! 4. [`Controller::sys_tick`]: 1 kHz dwell/power clock,
//! 5. [`Controller::main_tick`]: the cooperative background tasks
//!    (parsing, arc streaming, homing, back-planning, reports).
//!
//! Each background task yields quickly; a task that cannot make progress
//! (planner back-pressure, arc waiting for room) simply leaves its work
//! pending for the next pass.

use crate::config::MachineConfig;
use crate::machine::{Machine, MachineError, MachineState};
use crate::report::{Reporter, StatusReport};
use crate::serial::{LineAssembler, RealtimeEvent, SerialOut};
use gcode::{parse_line, ParsedBlock};
use motion::{
    plan, CommandSink, ExecStatus, HoldState, PlannerQueue, Runtime, StopKind, BLOCK_TIMEOUT,
    PLANNER_QUEUE_SIZE,
};
use std::collections::VecDeque;
use stepper::{LoaderEvent, PrepSlot, ProbeInput, RunState, StepOutput, StepperEngine};
use tracing::{info, warn};

/// What a cooperative pass accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Acted,
    Noop,
}

pub struct Controller {
    pub machine: Machine,
    pub queue: PlannerQueue,
    pub runtime: Runtime,
    pub prep: PrepSlot,
    pub engine: StepperEngine,

    assembler: LineAssembler,
    lines: VecDeque<String>,
    /// Parsed block waiting for planner admission.
    pending: Option<ParsedBlock>,

    homing_queue: VecDeque<usize>,
    homing_active: Option<usize>,

    reporter: Reporter,
    reports: Vec<StatusReport>,
    errors: Vec<String>,

    now: f64,
}

impl Controller {
    pub fn new(config: MachineConfig) -> Self {
        let runtime = Runtime::new(config.build_kinematics());
        let reporter = Reporter::new(config.report_interval);
        Self {
            machine: Machine::new(config),
            queue: PlannerQueue::new(),
            runtime,
            prep: PrepSlot::new(),
            engine: StepperEngine::new(),
            assembler: LineAssembler::new(),
            lines: VecDeque::new(),
            pending: None,
            homing_queue: VecDeque::new(),
            homing_active: None,
            reporter,
            reports: Vec::new(),
            errors: Vec::new(),
            now: 0.0,
        }
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    /// The driver owns time; every tick method reads this.
    pub fn set_now(&mut self, now: f64) {
        self.now = now;
    }

    // ----- input ---------------------------------------------------------

    /// Feeds raw transport bytes through line assembly. Real-time characters
    /// act immediately.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match self.assembler.push(byte) {
                SerialOut::Line(line) => self.lines.push_back(line),
                SerialOut::Event(event) => self.realtime_event(event),
                SerialOut::Overflow => self.errors.push("input line overflow".to_string()),
                SerialOut::None => {}
            }
        }
    }

    /// Queues one already-assembled line.
    pub fn push_line(&mut self, line: &str) {
        self.lines.push_back(line.trim_end().to_string());
    }

    pub fn realtime_event(&mut self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::FeedHold => {
                self.runtime.request_feedhold();
            }
            RealtimeEvent::CycleStart => {
                if self.runtime.cycle_start() {
                    let settle = self.machine.config.hold_exit_dwell;
                    if settle > 0.0 {
                        self.runtime.arm_exit_dwell(settle);
                    }
                    self.machine.set_state(MachineState::Ready);
                }
                if self.machine.state() == MachineState::ProgramStop {
                    self.machine.set_state(MachineState::Ready);
                }
            }
            RealtimeEvent::Reset => self.reset(),
        }
    }

    /// Full reset: halt stepping, drop all queued work, clear alarm.
    pub fn reset(&mut self) {
        self.engine.halt();
        self.prep.clear();
        self.queue.flush();
        self.runtime.abort();
        self.machine.sync_position(self.runtime.position());
        self.machine.clear_alarm();
        self.machine.set_state(MachineState::Ready);
        self.lines.clear();
        self.pending = None;
        self.homing_queue.clear();
        self.homing_active = None;
    }

    // ----- interrupt-context ticks --------------------------------------

    /// High-priority DDA tick.
    pub fn dda_tick(&mut self, out: &mut dyn StepOutput) -> LoaderEvent {
        self.engine.dda_tick(&mut self.prep, out)
    }

    /// 1 kHz system tick: dwell countdown and motor power management.
    pub fn sys_tick(&mut self, out: &mut dyn StepOutput) -> LoaderEvent {
        self.engine.sys_tick(&mut self.prep, out)
    }

    /// EXEC context: produce at most one segment (or consume one command
    /// block), then offer the prep slot to an idle loader.
    ///
    /// Returns true when any progress was made.
    pub fn exec_tick(
        &mut self,
        out: &mut dyn StepOutput,
        probe: Option<&dyn ProbeInput>,
        sink: &mut dyn CommandSink,
    ) -> bool {
        if !self.runtime.is_active() && !self.should_start() {
            return false;
        }
        let encoders = self.engine.encoders();
        let status = match self
            .runtime
            .exec_move(&mut self.queue, &mut self.prep, &encoders, probe, sink)
        {
            Ok(status) => status,
            Err(e) => {
                self.fault(&format!("runtime fault: {e}"));
                return true;
            }
        };
        self.handle_exec_status(status);
        let loaded = self.engine.request_load(&mut self.prep, out) == LoaderEvent::RequestExec;
        status != ExecStatus::Idle || loaded
    }

    /// FWD_PLAN context: one-shot ramp computation.
    pub fn plan_tick(&mut self) {
        plan::plan_forward(&mut self.queue, self.runtime.planning_entry_velocity());
    }

    // ----- cooperative background tasks ---------------------------------

    /// One pass of the cooperative main loop.
    pub fn main_tick(&mut self) -> ControllerStatus {
        let mut acted = false;

        // Parser: move one line into the canonical machine.
        if self.pending.is_none() {
            while let Some(line) = self.lines.pop_front() {
                #[cfg(feature = "marlin")]
                let line = crate::marlin::translate(&line);
                match parse_line(&line) {
                    Ok(block) if block.is_empty() => {
                        acted = true;
                    }
                    Ok(block) => {
                        self.pending = Some(block);
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, line, "line rejected");
                        self.errors.push(format!("{line}: {e}"));
                        acted = true;
                    }
                }
            }
        }
        if let Some(block) = self.pending.take() {
            match self
                .machine
                .execute(&block, &mut self.queue, &mut self.runtime, self.now)
            {
                Ok(()) => {
                    let axes = self.machine.take_homing_request();
                    self.homing_queue.extend(axes);
                    acted = true;
                }
                Err(MachineError::Busy) => {
                    // Admission back-pressure: retry on a later pass.
                    self.pending = Some(block);
                }
                Err(e) => {
                    warn!(error = %e, "block rejected");
                    self.errors.push(e.to_string());
                    acted = true;
                }
            }
        }

        // Arc continuation: stream chords while there is room.
        if self.machine.arc_pending() {
            if let Err(e) = self.machine.arc_callback(&mut self.queue, self.now) {
                if e != MachineError::Busy {
                    self.errors.push(e.to_string());
                }
            }
            acted = true;
        }

        // Homing: one axis at a time, machine quiescent between seeks.
        if self.homing_active.is_none() {
            if let Some(axis) = self.homing_queue.front().copied() {
                if !self.runtime.is_active()
                    && self.queue.is_empty()
                    && self.engine.state() == RunState::Idle
                {
                    match self.machine.emit_homing_seek(&mut self.queue, axis, self.now) {
                        Ok(()) => {
                            self.homing_queue.pop_front();
                            self.homing_active = Some(axis);
                        }
                        Err(MachineError::Busy) => {}
                        Err(e) => self.fault(&format!("homing failed: {e}")),
                    }
                    acted = true;
                }
            }
        }

        // Back-planning callback.
        plan::backplan(&mut self.queue);

        // Hold bookkeeping: notice a drained stepper and surface the state.
        if self.engine.state() == RunState::Idle {
            self.runtime.notify_steppers_idle();
        }
        match self.runtime.hold_state() {
            HoldState::MotionStopped => self.machine.set_state(MachineState::FeedHold),
            HoldState::Off => self.update_cycle_state(),
            _ => {}
        }

        // Rate-limited status report.
        if self.reporter.due(self.now) {
            let report = StatusReport::build(&self.machine, &self.runtime, &self.queue);
            info!(target: "report", "{}", report.to_json());
            self.reports.push(report);
            acted = true;
        }

        if acted {
            ControllerStatus::Acted
        } else {
            ControllerStatus::Noop
        }
    }

    // ----- results -------------------------------------------------------

    pub fn take_reports(&mut self) -> Vec<StatusReport> {
        std::mem::take(&mut self.reports)
    }

    pub fn take_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }

    /// True when every queue, buffer and clock consumer has drained.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
            && self.lines.is_empty()
            && !self.machine.arc_pending()
            && self.homing_queue.is_empty()
            && self.homing_active.is_none()
            && self.queue.is_empty()
            && !self.runtime.is_active()
            && self.engine.state() == RunState::Idle
            && self.prep.ready_for_exec()
    }

    // ----- internals -----------------------------------------------------

    /// Commit-to-motion decision: begin executing once look-ahead cannot
    /// improve. Either the queue is deep, the arrival timeout expired, or
    /// the input source has drained.
    fn should_start(&self) -> bool {
        if self.queue.is_empty() {
            return false;
        }
        if self.queue.queued() >= PLANNER_QUEUE_SIZE / 2 {
            return true;
        }
        if self.now - self.queue.last_arrival() >= BLOCK_TIMEOUT {
            return true;
        }
        // No more input on the way: nothing to wait for.
        self.pending.is_none() && self.lines.is_empty() && !self.machine.arc_pending()
    }

    fn handle_exec_status(&mut self, status: ExecStatus) {
        match status {
            ExecStatus::Flow(kind) => match kind {
                StopKind::End | StopKind::EndRewind => {
                    self.machine.program_end_reset();
                    self.machine.set_state(MachineState::ProgramEnd);
                }
                StopKind::Stop | StopKind::OptionalStop | StopKind::PalletChange => {
                    self.machine.set_state(MachineState::ProgramStop);
                }
            },
            ExecStatus::ProbeDone {
                tripped,
                contact,
                alarm_on_miss,
            } => {
                self.machine.sync_position(contact);
                if let Some(axis) = self.homing_active.take() {
                    if tripped {
                        let mut position = contact;
                        position[axis] = self.machine.config.axes[axis].home_position;
                        self.runtime.set_position(position);
                        self.machine.sync_position(position);
                        info!(axis, "axis homed");
                    } else {
                        self.fault("homing seek found no switch");
                    }
                } else {
                    self.machine.set_probe_result(tripped, contact);
                    if !tripped && alarm_on_miss {
                        self.fault("probe did not make contact");
                    }
                }
            }
            ExecStatus::Starved => {
                // Back-planning runs on the next cooperative pass.
            }
            _ => {}
        }
    }

    fn update_cycle_state(&mut self) {
        let moving = self.runtime.is_active() || self.engine.state() != RunState::Idle;
        match self.machine.state() {
            MachineState::Ready | MachineState::Cycle | MachineState::FeedHold => {
                self.machine.set_state(if moving {
                    MachineState::Cycle
                } else {
                    MachineState::Ready
                });
            }
            _ => {}
        }
    }

    /// Latches alarm and abandons everything in flight.
    fn fault(&mut self, reason: &str) {
        self.errors.push(reason.to_string());
        self.machine.alarm(reason);
        self.engine.halt();
        self.prep.clear();
        self.queue.flush();
        self.runtime.abort();
        self.machine.sync_position(self.runtime.position());
    }
}
