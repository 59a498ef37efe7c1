//! The canonical machine.
//!
//! Holds all G-code-level state (modal modes, offsets, coordinate systems,
//! tool table) and translates parsed blocks into planner entries. Execution
//! follows the RS-274/NGC order of operations, so a single line carrying
//! `G21 G90 G0 X10 M3 S9000` settles units, distance mode, spindle and the
//! move in the prescribed sequence regardless of word order.
//!
//! The canonical machine never touches the stepper layer; everything it does
//! goes through the planner queue, so commands and moves interleave exactly
//! in program order.

use crate::arc::ArcGenerator;
use crate::config::{MachineConfig, JUNCTION_INTEGRATION_MAX, JUNCTION_INTEGRATION_MIN};
use gcode::{
    CoordSystem, DistanceMode, FeedRateMode, MotionMode, NonModal, ParsedBlock, PathControlMode,
    Plane, ProgramFlow, SpindleMode, ToolLengthMode, Units,
};
use motion::{
    Block, BlockType, GcodeSnapshot, MachineCommand, MotionError, PlannerQueue, ProbeSpec, Runtime,
    StopKind, AXES, AXIS_X, AXIS_Y, AXIS_Z, LENGTH_EPSILON,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub const MM_PER_INCH: f64 = 25.4;

/// Tool table slots.
pub const TOOLS: usize = 32;

/// Free planner slots a line must see before it executes; one line can fan
/// out into several queue entries (commands plus a move).
const LINE_ADMISSION_SLOTS: usize = 8;

/// Machine-level errors. `Busy` is not a failure: the controller retries the
/// same line on a later pass.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MachineError {
    /// No admission room, or an arc is still streaming chords.
    #[error("planner busy")]
    Busy,

    /// Alarm state gates all new motion.
    #[error("machine is in alarm state")]
    MachineAlarmed,

    /// A feed move was programmed without a usable feed rate.
    #[error("feed rate undefined for feed move")]
    NoFeedRate,

    /// Programmed target violates a travel limit.
    #[error("target exceeds soft limit on axis {0}")]
    SoftLimit(usize),

    /// Structurally valid G-code that cannot be honored here.
    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),

    #[error(transparent)]
    Motion(#[from] MotionError),
}

/// Top-level machine state; drives reports and the LED blink code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MachineState {
    Initializing,
    Ready,
    Cycle,
    FeedHold,
    ProgramStop,
    ProgramEnd,
    Alarm,
    Shutdown,
    Panic,
}

impl MachineState {
    /// Status LED blink period, milliseconds.
    pub fn led_blink_ms(self) -> u32 {
        match self {
            MachineState::Alarm => 750,
            MachineState::Shutdown => 300,
            MachineState::Panic => 100,
            _ => 3000,
        }
    }
}

/// Feed/traverse/spindle override factors (M48..M51).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Overrides {
    pub enabled: bool,
    pub feed: f64,
    pub traverse: f64,
    pub spindle: f64,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            enabled: true,
            feed: 1.0,
            traverse: 1.0,
            spindle: 1.0,
        }
    }
}

/// Modal G-code state.
#[derive(Debug, Clone, Serialize)]
pub struct GcodeState {
    pub line_number: Option<u32>,
    pub motion: MotionMode,
    pub plane: Plane,
    pub units: Units,
    pub distance: DistanceMode,
    pub arc_distance: DistanceMode,
    pub feed_mode: FeedRateMode,
    pub coord_system: CoordSystem,
    pub path_control: PathControlMode,
    /// mm/s in units-per-minute mode; raw inverse number in G93.
    pub feed_rate: f64,
    pub spindle_speed: f64,
    pub spindle: SpindleMode,
    pub coolant_mist: bool,
    pub coolant_flood: bool,
    pub tool: u8,
    pub tool_pending: u8,
    pub overrides: Overrides,
}

impl Default for GcodeState {
    fn default() -> Self {
        Self {
            line_number: None,
            motion: MotionMode::Traverse,
            plane: Plane::Xy,
            units: Units::Millimeters,
            distance: DistanceMode::Absolute,
            // NIST default: arc centers are incremental.
            arc_distance: DistanceMode::Incremental,
            feed_mode: FeedRateMode::UnitsPerMinute,
            coord_system: CoordSystem::G54,
            path_control: PathControlMode::Continuous,
            feed_rate: 0.0,
            spindle_speed: 0.0,
            spindle: SpindleMode::Off,
            coolant_mist: false,
            coolant_flood: false,
            tool: 0,
            tool_pending: 0,
            overrides: Overrides::default(),
        }
    }
}

/// Result of the last probing move.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProbeResult {
    pub tripped: bool,
    pub position: [f64; AXES],
}

/// Offsets and tool data worth keeping across power cycles, keyed by their
/// stable numeric identifiers (coordinate-system index, tool slot). Storage
/// itself is the host platform's concern; this is the exchange format.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct PersistentState {
    pub coord_offsets: Vec<(usize, [f64; AXES])>,
    pub g28_position: [f64; AXES],
    pub g30_position: [f64; AXES],
    pub tool_table: Vec<(usize, [f64; AXES])>,
}

pub struct Machine {
    pub config: MachineConfig,
    pub gm: GcodeState,

    coord_offsets: [[f64; AXES]; 6],
    g92_offset: [f64; AXES],
    g92_active: bool,
    g28_position: [f64; AXES],
    g30_position: [f64; AXES],
    tool_table: [[f64; AXES]; TOOLS],
    tool_offset: [f64; AXES],

    /// Model position: machine coordinates at the end of the last queued
    /// move (not where the steppers are right now).
    position: [f64; AXES],
    /// Unit vector of the last queued move, for corner computation.
    last_unit: Option<[f64; AXES]>,

    state: MachineState,
    arc: Option<ArcGenerator>,
    homing_request: Vec<usize>,
    probe_result: Option<ProbeResult>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            gm: GcodeState::default(),
            coord_offsets: [[0.0; AXES]; 6],
            g92_offset: [0.0; AXES],
            g92_active: false,
            g28_position: [0.0; AXES],
            g30_position: [0.0; AXES],
            tool_table: [[0.0; AXES]; TOOLS],
            tool_offset: [0.0; AXES],
            position: [0.0; AXES],
            last_unit: None,
            state: MachineState::Ready,
            arc: None,
            homing_request: Vec::new(),
            probe_result: None,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn set_state(&mut self, state: MachineState) {
        if self.state != state {
            debug!(?state, "machine state");
            self.state = state;
        }
    }

    /// Latches the alarm; all new motion is refused until cleared.
    pub fn alarm(&mut self, reason: &str) {
        info!(reason, "ALARM");
        self.state = MachineState::Alarm;
        self.arc = None;
        self.homing_request.clear();
    }

    pub fn clear_alarm(&mut self) {
        if matches!(self.state, MachineState::Alarm | MachineState::Shutdown) {
            self.state = MachineState::Ready;
        }
    }

    /// Model position, machine coordinates.
    pub fn position(&self) -> [f64; AXES] {
        self.position
    }

    /// Position in the active work coordinate system (for reports).
    pub fn work_position(&self) -> [f64; AXES] {
        let offset = self.work_offset();
        core::array::from_fn(|i| self.position[i] - offset[i])
    }

    /// Re-synchronizes the model position with the runtime (after probe
    /// contact, feed-hold stop, or alarm).
    pub fn sync_position(&mut self, position: [f64; AXES]) {
        self.position = position;
        self.last_unit = None;
    }

    pub fn set_axis_position(&mut self, axis: usize, value: f64) {
        self.position[axis] = value;
        self.last_unit = None;
    }

    pub fn probe_result(&self) -> Option<&ProbeResult> {
        self.probe_result.as_ref()
    }

    pub fn set_probe_result(&mut self, tripped: bool, position: [f64; AXES]) {
        self.probe_result = Some(ProbeResult { tripped, position });
    }

    /// Pending homing axes requested by G28.2, in execution order.
    pub fn take_homing_request(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.homing_request)
    }

    /// True while an arc is still streaming chords into the planner.
    pub fn arc_pending(&self) -> bool {
        self.arc.is_some()
    }

    /// Streams pending arc chords while the queue has admission room.
    /// Called from the controller's cooperative loop.
    pub fn arc_callback(&mut self, queue: &mut PlannerQueue, now: f64) -> Result<(), MachineError> {
        while let Some(generator) = self.arc.as_mut() {
            if !queue.has_room() {
                return Ok(());
            }
            match generator.next_target() {
                Some(target) => {
                    let feed = generator.feed();
                    self.emit_aline(queue, target, feed, None, now)?;
                }
                None => {
                    self.arc = None;
                }
            }
        }
        Ok(())
    }

    /// Executes one parsed block in RS-274/NGC order.
    ///
    /// Returns `Err(Busy)` without side effects when the planner lacks
    /// admission room; the controller retries the same block later.
    pub fn execute(
        &mut self,
        parsed: &ParsedBlock,
        queue: &mut PlannerQueue,
        runtime: &mut Runtime,
        now: f64,
    ) -> Result<(), MachineError> {
        if matches!(
            self.state,
            MachineState::Alarm | MachineState::Shutdown | MachineState::Panic
        ) {
            return Err(MachineError::MachineAlarmed);
        }
        if parsed.block_delete && self.config.block_delete {
            return Ok(());
        }
        if self.arc.is_some() || queue.available() < LINE_ADMISSION_SLOTS {
            return Err(MachineError::Busy);
        }

        // 1. Line number.
        if let Some(n) = parsed.line_number {
            self.gm.line_number = Some(n);
        }

        // Active-comment payload, in queue order ahead of this line's
        // actions: messages go to the operator, everything else is
        // acknowledged over the JSON channel once the queue reaches it.
        if let Some(payload) = &parsed.payload {
            if let Some(msg) = payload.get("msg").and_then(|v| v.as_str()) {
                self.enqueue_command(
                    queue,
                    BlockType::Command,
                    MachineCommand::Message(msg.to_string()),
                    now,
                )?;
            }
            if let Some(object) = payload.as_object() {
                let synced: serde_json::Map<String, serde_json::Value> = object
                    .iter()
                    .filter(|(key, _)| key.as_str() != "msg")
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                if !synced.is_empty() {
                    self.enqueue_command(
                        queue,
                        BlockType::JsonWait,
                        MachineCommand::JsonAck(serde_json::Value::Object(synced).to_string()),
                        now,
                    )?;
                }
            }
        }

        // 2. Override enables and factors.
        if let Some(enable) = parsed.override_enable {
            self.gm.overrides.enabled = enable;
        }
        if let Some(req) = parsed.feed_override {
            self.gm.overrides.feed = override_factor(req.parameter);
        }
        if let Some(req) = parsed.traverse_override {
            self.gm.overrides.traverse = override_factor(req.parameter);
        }
        if let Some(req) = parsed.spindle_override {
            self.gm.overrides.spindle = override_factor(req.parameter);
        }

        // 3/4. Feed rate mode, then feed rate.
        if let Some(mode) = parsed.feed_mode {
            if mode != self.gm.feed_mode {
                self.gm.feed_rate = 0.0;
            }
            self.gm.feed_mode = mode;
        }
        if let Some(feed) = parsed.feed_rate {
            self.gm.feed_rate = match self.gm.feed_mode {
                // F is units/min; keep mm/s internally.
                FeedRateMode::UnitsPerMinute => self.to_linear_mm(feed) / 60.0,
                // Inverse time: keep the raw per-minute inverse.
                FeedRateMode::InverseTime => feed,
            };
        }

        // 5. Spindle speed.
        if let Some(speed) = parsed.spindle_speed {
            self.gm.spindle_speed = speed;
            let effective = speed * self.spindle_factor();
            self.enqueue_command(
                queue,
                BlockType::SpindleSpeed,
                MachineCommand::SpindleSpeed(effective),
                now,
            )?;
        }

        // 6. Tool select, 7. tool change.
        if let Some(tool) = parsed.tool {
            if (tool as usize) >= TOOLS {
                return Err(MachineError::InvalidCommand("tool slot out of range"));
            }
            self.gm.tool_pending = tool;
            self.enqueue_command(queue, BlockType::Tool, MachineCommand::ToolSelect(tool), now)?;
        }
        if parsed.tool_change {
            self.gm.tool = self.gm.tool_pending;
            self.enqueue_command(
                queue,
                BlockType::Tool,
                MachineCommand::ToolChange(self.gm.tool),
                now,
            )?;
        }

        // 8. Spindle control.
        if let Some(mode) = parsed.spindle {
            self.gm.spindle = mode;
            let command = match mode {
                SpindleMode::Cw => MachineCommand::SpindleOn {
                    clockwise: true,
                    rpm: self.gm.spindle_speed * self.spindle_factor(),
                },
                SpindleMode::Ccw => MachineCommand::SpindleOn {
                    clockwise: false,
                    rpm: self.gm.spindle_speed * self.spindle_factor(),
                },
                SpindleMode::Off => MachineCommand::SpindleOff,
            };
            self.enqueue_command(queue, BlockType::Command, command, now)?;
        }

        // 9. Coolant.
        if parsed.coolant_mist {
            self.gm.coolant_mist = true;
            self.enqueue_command(queue, BlockType::Command, MachineCommand::CoolantMist(true), now)?;
        }
        if parsed.coolant_flood {
            self.gm.coolant_flood = true;
            self.enqueue_command(
                queue,
                BlockType::Command,
                MachineCommand::CoolantFlood(true),
                now,
            )?;
        }
        if parsed.coolant_off {
            self.gm.coolant_mist = false;
            self.gm.coolant_flood = false;
            self.enqueue_command(queue, BlockType::Command, MachineCommand::CoolantOff, now)?;
        }

        // User M-codes pass straight through to the host sink.
        if let Some(code) = parsed.user_mcode {
            self.enqueue_command(queue, BlockType::Command, MachineCommand::UserCode(code), now)?;
        }

        // 10. Dwell.
        if parsed.non_modal == Some(NonModal::Dwell) {
            let seconds = parsed
                .p_word
                .ok_or(MachineError::InvalidCommand("G4 requires P"))?;
            if !(0.0..=3600.0).contains(&seconds) {
                return Err(MachineError::InvalidCommand("G4 P out of range"));
            }
            let block = queue.allocate().ok_or(MachineError::Busy)?;
            block.block_type = BlockType::Dwell;
            block.dwell_seconds = seconds;
            block.gm = self.snapshot();
            queue.commit(now);
        }

        // 11..17. Modal settings.
        if let Some(plane) = parsed.plane {
            self.gm.plane = plane;
        }
        if let Some(units) = parsed.units {
            self.gm.units = units;
        }
        if let Some(tlo) = parsed.tool_length {
            self.apply_tool_length(tlo, parsed.h_word)?;
        }
        if let Some(cs) = parsed.coord_system {
            self.gm.coord_system = cs;
        }
        if let Some(pc) = parsed.path_control {
            self.gm.path_control = pc;
        }
        if let Some(distance) = parsed.distance {
            self.gm.distance = distance;
        }
        if let Some(arc_distance) = parsed.arc_distance {
            self.gm.arc_distance = arc_distance;
        }

        // 18. Non-modal codes (G10, G28.x, G30.x, G92.x, G53 handled with
        // motion below). An axis-consuming non-modal suspends the motion
        // word for this block.
        let mut motion_suspended = false;
        if let Some(non_modal) = parsed.non_modal {
            motion_suspended = self.apply_non_modal(non_modal, parsed, queue, runtime, now)?;
        }

        // 19. Motion.
        if let Some(mode) = parsed.motion {
            self.gm.motion = mode;
        }
        let absolute_override = parsed.non_modal == Some(NonModal::AbsoluteOverride);
        if parsed.has_axis_words() && !motion_suspended {
            self.run_motion(parsed, queue, absolute_override, now)?;
        }

        // 20. Program flow.
        if let Some(flow) = parsed.program_flow {
            let (block_type, kind) = match flow {
                ProgramFlow::Stop => (BlockType::Stop, StopKind::Stop),
                ProgramFlow::OptionalStop => (BlockType::Stop, StopKind::OptionalStop),
                ProgramFlow::PalletChangeStop => (BlockType::Stop, StopKind::PalletChange),
                ProgramFlow::End => (BlockType::End, StopKind::End),
                ProgramFlow::EndRewind => (BlockType::End, StopKind::EndRewind),
            };
            let block = queue.allocate().ok_or(MachineError::Busy)?;
            block.block_type = block_type;
            block.stop = Some(kind);
            block.gm = self.snapshot();
            queue.commit(now);
        }

        Ok(())
    }

    /// NIST end-of-program reset (M2/M30): offsets to G54, plane XY,
    /// absolute distance, per-minute feed, spindle and coolant off,
    /// overrides re-enabled.
    pub fn program_end_reset(&mut self) {
        self.gm.coord_system = CoordSystem::G54;
        self.gm.plane = Plane::Xy;
        self.gm.distance = DistanceMode::Absolute;
        self.gm.feed_mode = FeedRateMode::UnitsPerMinute;
        self.gm.spindle = SpindleMode::Off;
        self.gm.coolant_mist = false;
        self.gm.coolant_flood = false;
        self.gm.overrides = Overrides::default();
        self.gm.motion = MotionMode::Feed;
    }

    // ----- non-modal handling -------------------------------------------

    /// Returns true when the code consumed this block's axis words.
    fn apply_non_modal(
        &mut self,
        code: NonModal,
        parsed: &ParsedBlock,
        queue: &mut PlannerQueue,
        runtime: &mut Runtime,
        now: f64,
    ) -> Result<bool, MachineError> {
        match code {
            NonModal::Dwell | NonModal::AbsoluteOverride => Ok(false),
            NonModal::SetCoordData => {
                self.set_coord_data(parsed)?;
                Ok(true)
            }
            NonModal::GoHome => {
                self.go_stored_position(parsed, queue, self.g28_position, now)?;
                Ok(true)
            }
            NonModal::SetHome => {
                self.g28_position = self.position;
                Ok(true)
            }
            NonModal::GoHomeAlt => {
                self.go_stored_position(parsed, queue, self.g30_position, now)?;
                Ok(true)
            }
            NonModal::SetHomeAlt => {
                self.g30_position = self.position;
                Ok(true)
            }
            NonModal::HomingCycle => {
                let axes: Vec<usize> =
                    (0..AXES).filter(|&a| parsed.axis[a].is_some()).collect();
                if axes.is_empty() {
                    return Err(MachineError::InvalidCommand("G28.2 requires axis words"));
                }
                self.homing_request = axes;
                Ok(true)
            }
            NonModal::SetAbsolutePosition => {
                if runtime.is_active() {
                    return Err(MachineError::Busy);
                }
                for axis in 0..AXES {
                    if let Some(value) = parsed.axis[axis] {
                        self.position[axis] = self.to_axis_mm(axis, value);
                    }
                }
                runtime.set_position(self.position);
                self.last_unit = None;
                Ok(true)
            }
            NonModal::HomingCycleNoSwitch => {
                if runtime.is_active() {
                    return Err(MachineError::Busy);
                }
                // Switchless homing: declare the current location home.
                for axis in 0..AXES {
                    if parsed.axis[axis].is_some() {
                        self.position[axis] = self.config.axes[axis].home_position;
                    }
                }
                runtime.set_position(self.position);
                self.last_unit = None;
                Ok(true)
            }
            NonModal::SetOriginOffsets => {
                for axis in 0..AXES {
                    if let Some(value) = parsed.axis[axis] {
                        let value = self.to_axis_mm(axis, value);
                        self.g92_offset[axis] = self.position[axis]
                            - self.coord_offsets[self.gm.coord_system.index()][axis]
                            - self.tool_offset[axis]
                            - value;
                    }
                }
                self.g92_active = true;
                Ok(true)
            }
            NonModal::ResetOriginOffsets => {
                self.g92_offset = [0.0; AXES];
                self.g92_active = false;
                Ok(false)
            }
            NonModal::SuspendOriginOffsets => {
                self.g92_active = false;
                Ok(false)
            }
            NonModal::ResumeOriginOffsets => {
                self.g92_active = true;
                Ok(false)
            }
        }
    }

    fn set_coord_data(&mut self, parsed: &ParsedBlock) -> Result<(), MachineError> {
        let l = parsed
            .l_word
            .ok_or(MachineError::InvalidCommand("G10 requires L"))?;
        let p = parsed
            .p_word
            .ok_or(MachineError::InvalidCommand("G10 requires P"))? as usize;
        if !(1..=6).contains(&p) {
            return Err(MachineError::InvalidCommand("G10 P out of range"));
        }
        let system = p - 1;
        match l {
            2 => {
                for axis in 0..AXES {
                    if let Some(value) = parsed.axis[axis] {
                        self.coord_offsets[system][axis] = self.to_axis_mm(axis, value);
                    }
                }
            }
            20 => {
                // Make the current position read as the given value in the
                // target system.
                for axis in 0..AXES {
                    if let Some(value) = parsed.axis[axis] {
                        let value = self.to_axis_mm(axis, value);
                        self.coord_offsets[system][axis] = self.position[axis]
                            - self.tool_offset[axis]
                            - if self.g92_active { self.g92_offset[axis] } else { 0.0 }
                            - value;
                    }
                }
            }
            _ => return Err(MachineError::InvalidCommand("G10 L must be 2 or 20")),
        }
        Ok(())
    }

    /// G28/G30: optional via-point from the axis words, then a traverse to
    /// the stored machine position.
    fn go_stored_position(
        &mut self,
        parsed: &ParsedBlock,
        queue: &mut PlannerQueue,
        stored: [f64; AXES],
        now: f64,
    ) -> Result<(), MachineError> {
        if parsed.has_axis_words() {
            let via = self.compute_target(parsed, false);
            self.check_soft_limits(&via)?;
            let rapid = self.traverse_vset();
            self.emit_aline(queue, via, rapid, None, now)?;
        }
        let rapid = self.traverse_vset();
        self.emit_aline(queue, stored, rapid, None, now)?;
        Ok(())
    }

    // ----- motion --------------------------------------------------------

    fn run_motion(
        &mut self,
        parsed: &ParsedBlock,
        queue: &mut PlannerQueue,
        absolute_override: bool,
        now: f64,
    ) -> Result<(), MachineError> {
        match self.gm.motion {
            MotionMode::CancelMotion => Ok(()),
            MotionMode::Traverse => {
                let target = self.compute_target(parsed, absolute_override);
                self.check_soft_limits(&target)?;
                let vset = self.traverse_vset();
                self.emit_aline(queue, target, vset, None, now)
            }
            MotionMode::Feed => {
                let target = self.compute_target(parsed, absolute_override);
                self.check_soft_limits(&target)?;
                let vset = self.feed_vset_for(&target)?;
                self.emit_aline(queue, target, vset, None, now)
            }
            MotionMode::CwArc | MotionMode::CcwArc => {
                let target = self.compute_target(parsed, absolute_override);
                self.check_soft_limits(&target)?;
                let feed = self.feed_vset_for(&target)?;
                let generator = ArcGenerator::new(
                    self.position,
                    target,
                    parsed,
                    self.gm.plane,
                    self.gm.arc_distance,
                    self.gm.motion == MotionMode::CwArc,
                    self.config.chordal_tolerance,
                    self.units_scale(),
                    self.work_offset(),
                    feed,
                )
                .map_err(MachineError::InvalidCommand)?;
                self.arc = Some(generator);
                // Chords stream from the controller's arc callback.
                self.arc_callback(queue, now)
            }
            MotionMode::ProbeTowardErr
            | MotionMode::ProbeToward
            | MotionMode::ProbeAwayErr
            | MotionMode::ProbeAway => {
                let target = self.compute_target(parsed, absolute_override);
                self.check_soft_limits(&target)?;
                let vset = self.feed_vset_for(&target)?;
                let spec = ProbeSpec {
                    away: matches!(
                        self.gm.motion,
                        MotionMode::ProbeAwayErr | MotionMode::ProbeAway
                    ),
                    alarm_on_miss: matches!(
                        self.gm.motion,
                        MotionMode::ProbeTowardErr | MotionMode::ProbeAwayErr
                    ),
                };
                self.probe_result = None;
                self.emit_aline(queue, target, vset, Some(spec), now)
            }
        }
    }

    /// Homing seek for one axis: a probe-flagged move toward the minimum
    /// switch at the homing feed. Travel limits do not apply.
    pub fn emit_homing_seek(
        &mut self,
        queue: &mut PlannerQueue,
        axis: usize,
        now: f64,
    ) -> Result<(), MachineError> {
        let mut target = self.position;
        let span = self.config.axes[axis].travel_max - self.config.axes[axis].travel_min;
        target[axis] = self.config.axes[axis].travel_min - 0.025 * span.abs().max(1.0);
        let feed = self.config.axes[axis].homing_feed;
        let spec = ProbeSpec {
            away: false,
            alarm_on_miss: true,
        };
        self.emit_aline(queue, target, feed, Some(spec), now)
    }

    /// Builds and enqueues one acceleration-managed line. Computes length,
    /// unit vector, the velocity envelope and the corner limit.
    fn emit_aline(
        &mut self,
        queue: &mut PlannerQueue,
        target: [f64; AXES],
        cruise_vset: f64,
        probe: Option<ProbeSpec>,
        now: f64,
    ) -> Result<(), MachineError> {
        let mut delta = [0.0; AXES];
        let mut length_sq = 0.0;
        for axis in 0..AXES {
            delta[axis] = target[axis] - self.position[axis];
            length_sq += delta[axis] * delta[axis];
        }
        let length = length_sq.sqrt();
        if length <= LENGTH_EPSILON {
            // Zero-length moves collapse silently.
            self.position = target;
            return Ok(());
        }
        if cruise_vset <= 0.0 {
            return Err(MachineError::NoFeedRate);
        }

        let mut unit = [0.0; AXES];
        for axis in 0..AXES {
            unit[axis] = delta[axis] / length;
        }

        // Envelope: the slowest participating axis governs, projected
        // through the unit vector; jerk is the most conservative axis jerk.
        let mut absolute_vmax = f64::MAX;
        let mut jerk = f64::MAX;
        for axis in 0..AXES {
            let component = unit[axis].abs();
            if component > 1e-9 {
                absolute_vmax = absolute_vmax.min(self.config.axes[axis].velocity_max / component);
                jerk = jerk.min(self.config.axes[axis].jerk_max);
            }
        }

        let junction_vmax = match self.gm.path_control {
            PathControlMode::Continuous => match self.last_unit {
                Some(prev) => junction_velocity(
                    &prev,
                    &unit,
                    jerk,
                    self.config
                        .junction_integration_time
                        .clamp(JUNCTION_INTEGRATION_MIN, JUNCTION_INTEGRATION_MAX),
                ),
                None => 0.0,
            },
            // Exact path/stop modes corner at zero.
            PathControlMode::ExactPath | PathControlMode::ExactStop => 0.0,
        };

        let block: &mut Block = queue.allocate().ok_or(MachineError::Busy)?;
        block.set_aline_geometry(length, unit);
        block.target = target;
        block.set_jerk(jerk);
        block.cruise_vset = cruise_vset;
        block.cruise_vmax = cruise_vset.min(absolute_vmax);
        block.absolute_vmax = absolute_vmax;
        block.junction_vmax = junction_vmax;
        block.probe = probe;
        block.gm = self.snapshot();
        queue.commit(now);

        self.position = target;
        self.last_unit = Some(unit);
        Ok(())
    }

    // ----- coordinate plumbing ------------------------------------------

    /// Programmed coordinates to machine coordinates, honoring distance
    /// mode, units, work offsets and the G53 absolute override.
    fn compute_target(&self, parsed: &ParsedBlock, absolute_override: bool) -> [f64; AXES] {
        let offset = self.work_offset();
        let mut target = self.position;
        for axis in 0..AXES {
            let Some(value) = parsed.axis[axis] else {
                continue;
            };
            let value = self.to_axis_mm(axis, value);
            target[axis] = if absolute_override {
                value
            } else if self.gm.distance == DistanceMode::Incremental {
                self.position[axis] + value
            } else {
                value + offset[axis]
            };
        }
        target
    }

    /// The sum of all active offsets: work coordinate system, G92 (when
    /// enabled) and tool length.
    pub fn work_offset(&self) -> [f64; AXES] {
        let system = self.gm.coord_system.index();
        core::array::from_fn(|axis| {
            self.coord_offsets[system][axis]
                + if self.g92_active { self.g92_offset[axis] } else { 0.0 }
                + self.tool_offset[axis]
        })
    }

    fn apply_tool_length(
        &mut self,
        mode: ToolLengthMode,
        h_word: Option<u8>,
    ) -> Result<(), MachineError> {
        match mode {
            ToolLengthMode::Cancel => {
                self.tool_offset = [0.0; AXES];
            }
            ToolLengthMode::Apply | ToolLengthMode::ApplyAdditive => {
                let slot = h_word.unwrap_or(self.gm.tool) as usize;
                if slot >= TOOLS {
                    return Err(MachineError::InvalidCommand("H slot out of range"));
                }
                for axis in 0..AXES {
                    if mode == ToolLengthMode::Apply {
                        self.tool_offset[axis] = self.tool_table[slot][axis];
                    } else {
                        self.tool_offset[axis] += self.tool_table[slot][axis];
                    }
                }
            }
        }
        Ok(())
    }

    /// Tool-table editing (persistence surface).
    pub fn set_tool_offset(&mut self, slot: usize, offset: [f64; AXES]) {
        if slot < TOOLS {
            self.tool_table[slot] = offset;
        }
    }

    pub fn coord_offset(&self, system: usize) -> [f64; AXES] {
        self.coord_offsets[system]
    }

    /// Snapshot of everything the host should persist.
    pub fn export_persistent(&self) -> PersistentState {
        PersistentState {
            coord_offsets: self
                .coord_offsets
                .iter()
                .enumerate()
                .map(|(i, o)| (i, *o))
                .collect(),
            g28_position: self.g28_position,
            g30_position: self.g30_position,
            tool_table: self
                .tool_table
                .iter()
                .enumerate()
                .filter(|(_, o)| o.iter().any(|v| *v != 0.0))
                .map(|(i, o)| (i, *o))
                .collect(),
        }
    }

    /// Restores a persisted snapshot. Unknown keys are ignored.
    pub fn restore_persistent(&mut self, state: &PersistentState) {
        for (system, offset) in &state.coord_offsets {
            if *system < self.coord_offsets.len() {
                self.coord_offsets[*system] = *offset;
            }
        }
        self.g28_position = state.g28_position;
        self.g30_position = state.g30_position;
        for (slot, offset) in &state.tool_table {
            if *slot < TOOLS {
                self.tool_table[*slot] = *offset;
            }
        }
    }

    fn check_soft_limits(&self, target: &[f64; AXES]) -> Result<(), MachineError> {
        if !self.config.soft_limits {
            return Ok(());
        }
        for axis in 0..AXES {
            let limits = &self.config.axes[axis];
            if target[axis] < limits.travel_min - 1e-9 || target[axis] > limits.travel_max + 1e-9 {
                return Err(MachineError::SoftLimit(axis));
            }
        }
        Ok(())
    }

    // ----- velocities ----------------------------------------------------

    fn traverse_vset(&self) -> f64 {
        // Rapids request an unbounded cruise; the per-axis envelope caps the
        // block. The traverse override only scales downward.
        let factor = if self.gm.overrides.enabled {
            self.gm.overrides.traverse.min(1.0)
        } else {
            1.0
        };
        1.0e9 * factor
    }

    fn feed_vset_for(&self, target: &[f64; AXES]) -> Result<f64, MachineError> {
        let factor = if self.gm.overrides.enabled {
            self.gm.overrides.feed
        } else {
            1.0
        };
        match self.gm.feed_mode {
            FeedRateMode::UnitsPerMinute => {
                if self.gm.feed_rate <= 0.0 {
                    return Err(MachineError::NoFeedRate);
                }
                Ok(self.gm.feed_rate * factor)
            }
            FeedRateMode::InverseTime => {
                // The move must complete in 1/F minutes.
                if self.gm.feed_rate <= 0.0 {
                    return Err(MachineError::NoFeedRate);
                }
                let mut length_sq = 0.0;
                for axis in 0..AXES {
                    let d = target[axis] - self.position[axis];
                    length_sq += d * d;
                }
                let length = length_sq.sqrt();
                Ok(length * self.gm.feed_rate / 60.0 * factor)
            }
        }
    }

    fn spindle_factor(&self) -> f64 {
        if self.gm.overrides.enabled {
            self.gm.overrides.spindle
        } else {
            1.0
        }
    }

    // ----- helpers -------------------------------------------------------

    fn units_scale(&self) -> f64 {
        match self.gm.units {
            Units::Millimeters => 1.0,
            Units::Inches => MM_PER_INCH,
        }
    }

    /// Unit conversion for one axis: linear axes honor G20/G21, rotary axes
    /// are always degrees.
    fn to_axis_mm(&self, axis: usize, value: f64) -> f64 {
        if matches!(axis, AXIS_X | AXIS_Y | AXIS_Z) {
            value * self.units_scale()
        } else {
            value
        }
    }

    fn to_linear_mm(&self, value: f64) -> f64 {
        value * self.units_scale()
    }

    fn snapshot(&self) -> GcodeSnapshot {
        GcodeSnapshot {
            line_number: self.gm.line_number,
            feed_rate: self.gm.feed_rate,
            tool: self.gm.tool,
            coord_system: self.gm.coord_system.index() as u8,
            work_offset: self.work_offset(),
            spindle_speed: self.gm.spindle_speed,
        }
    }

    fn enqueue_command(
        &mut self,
        queue: &mut PlannerQueue,
        block_type: BlockType,
        command: MachineCommand,
        now: f64,
    ) -> Result<(), MachineError> {
        let block = queue.allocate().ok_or(MachineError::Busy)?;
        block.block_type = block_type;
        block.command = Some(command);
        block.gm = self.snapshot();
        queue.commit(now);
        Ok(())
    }
}

/// Centripetal cornering limit: how fast the machine may pass through the
/// corner between two unit vectors. Straight-through corners are unlimited,
/// full reversals force a stop, and everything between scales with the
/// effective jerk and the junction-integration time.
pub fn junction_velocity(prev: &[f64; AXES], next: &[f64; AXES], jerk: f64, jt: f64) -> f64 {
    let mut dot = 0.0;
    for axis in 0..AXES {
        dot += prev[axis] * next[axis];
    }
    let costheta = -dot;
    if costheta < -0.9999 {
        return f64::MAX; // colinear
    }
    if costheta > 0.9999 {
        return 0.0; // about-face
    }
    let sin_half = ((1.0 - costheta) * 0.5).sqrt();
    let factor = sin_half / (1.0 - sin_half);
    jt * (jerk * factor).sqrt()
}

fn override_factor(parameter: Option<f64>) -> f64 {
    match parameter {
        None => 1.0,
        Some(p) if p <= 0.0 => 1.0,
        Some(p) => p.clamp(0.05, 2.0),
    }
}
