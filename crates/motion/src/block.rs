//! Planner block records.
//!
//! A [`Block`] is one slot of the planner ring: a linear move with its
//! kinematic envelope, or a queued command, dwell, or program-flow event.
//! Slots are never allocated or freed; they cycle through
//! [`BufferState::Empty`] and back.

use crate::zoid::jerk_time_factor;
use crate::AXES;
use serde::Serialize;

/// What a queue slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum BlockType {
    #[default]
    Null,
    /// Acceleration-managed linear move.
    Aline,
    /// A command callback executed in queue order.
    Command,
    Dwell,
    /// Drains the queue, then acknowledges over the JSON channel.
    JsonWait,
    /// Tool select/change, executed in queue order.
    Tool,
    /// Spindle speed change, executed in queue order.
    SpindleSpeed,
    /// Program stop (M0/M1/M60).
    Stop,
    /// Program end (M2/M30).
    End,
}

/// Monotone life cycle of a queue slot. Transitions only move forward until
/// the executor releases the block back to `Empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub enum BufferState {
    #[default]
    Empty,
    /// Being filled by the canonical machine; not yet visible to planning.
    Initializing,
    /// Committed, awaiting a back-planning pass.
    NotPlanned,
    /// Exit velocity settled by back-planning.
    BackPlanned,
    /// Ramp computed; ready to execute.
    FullyPlanned,
    /// Owned by the executor.
    Running,
}

/// Execution progress of the running block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum BlockState {
    #[default]
    Inactive,
    /// Entered but no segment produced yet.
    InitialAction,
    Active,
}

/// What shape the ramp computation settled on. Lets the executor skip
/// sections without re-deriving them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PlanHint {
    #[default]
    NoHint,
    PerfectAcceleration,
    PerfectDeceleration,
    PerfectCruise,
    MixedAcceleration,
    MixedDeceleration,
    /// Head+tail with a peak at the midpoint (equal boundary velocities).
    SymmetricBump,
    /// Head+tail with unequal boundary velocities.
    AsymmetricBump,
    CommandBlock,
    ZeroBlock,
}

/// Program-flow events carried by `Stop`/`End` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopKind {
    Stop,
    OptionalStop,
    PalletChange,
    End,
    EndRewind,
}

/// Typed command payloads executed by the runtime in queue order. The host
/// supplies the sinks; no heap activity happens on the exec path beyond
/// reading these.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MachineCommand {
    SpindleOn { clockwise: bool, rpm: f64 },
    SpindleOff,
    SpindleSpeed(f64),
    CoolantMist(bool),
    CoolantFlood(bool),
    CoolantOff,
    ToolSelect(u8),
    ToolChange(u8),
    Message(String),
    JsonAck(String),
    /// User-defined M-code (M100 family), code x10 to keep the sub-code.
    UserCode(u16),
}

/// End-condition configuration for probing (and homing-seek) moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeSpec {
    /// Probe away from the workpiece: the move ends when the input releases
    /// rather than when it closes.
    pub away: bool,
    /// Missing contact is an alarm (G38.2/G38.4) rather than a no-op.
    pub alarm_on_miss: bool,
}

/// G-code model snapshot carried with each block for reporting and replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GcodeSnapshot {
    pub line_number: Option<u32>,
    /// Programmed feed, mm/s.
    pub feed_rate: f64,
    pub tool: u8,
    /// Active coordinate system index (0 = G54).
    pub coord_system: u8,
    pub work_offset: [f64; AXES],
    pub spindle_speed: f64,
}

/// One planner queue entry.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub block_type: BlockType,
    pub buffer_state: BufferState,
    pub block_state: BlockState,

    // Geometry (moves only)
    pub length: f64,
    pub unit: [f64; AXES],
    pub axis_flags: [bool; AXES],
    /// Machine-coordinate endpoint.
    pub target: [f64; AXES],

    // Kinematic envelope
    pub absolute_vmax: f64,
    /// Corner limit at the boundary with the previous block.
    pub junction_vmax: f64,
    /// Requested cruise (feed after overrides), before limiting.
    pub cruise_vset: f64,
    /// `min(cruise_vset, absolute_vmax)`.
    pub cruise_vmax: f64,
    /// Bound applied to the exit by back-planning (diagnostic).
    pub exit_vmax: f64,
    pub jerk: f64,
    pub recip_jerk: f64,
    /// Cached `sqrt(10 / (sqrt(3) * jerk))`; see [`crate::zoid`].
    pub jerk_time_k: f64,

    // Plan result
    pub cruise_velocity: f64,
    /// Exit velocity; the entry velocity of the following block.
    pub exit_velocity: f64,
    pub head_length: f64,
    pub body_length: f64,
    pub tail_length: f64,
    pub head_time: f64,
    pub body_time: f64,
    pub tail_time: f64,
    pub hint: PlanHint,

    /// Cleared once the block is running or its tail has been entered;
    /// blocks with this false are never replanned.
    pub plannable: bool,

    // Non-move payloads
    pub command: Option<MachineCommand>,
    pub dwell_seconds: f64,
    pub stop: Option<StopKind>,

    /// Present on probing/homing-seek moves.
    pub probe: Option<ProbeSpec>,

    pub gm: GcodeSnapshot,
}

impl Block {
    /// Returns the slot to `Empty`, dropping any payload.
    pub fn reset(&mut self) {
        *self = Block::default();
    }

    /// True for block types that move the machine.
    pub fn is_move(&self) -> bool {
        self.block_type == BlockType::Aline
    }

    /// True for block types that force velocity to zero at their boundary.
    pub fn forces_stop(&self) -> bool {
        matches!(
            self.block_type,
            BlockType::Dwell | BlockType::Stop | BlockType::End | BlockType::JsonWait
        )
    }

    /// True for payload-carrying blocks the executor runs between moves.
    pub fn is_command(&self) -> bool {
        matches!(
            self.block_type,
            BlockType::Command | BlockType::Tool | BlockType::SpindleSpeed
        )
    }

    /// Installs move geometry: length, unit vector and participating axes.
    pub fn set_aline_geometry(&mut self, length: f64, unit: [f64; AXES]) {
        self.block_type = BlockType::Aline;
        self.length = length;
        self.unit = unit;
        for (flag, u) in self.axis_flags.iter_mut().zip(unit.iter()) {
            *flag = u.abs() > f64::EPSILON;
        }
    }

    /// Installs the jerk limit and its cached derived factors.
    pub fn set_jerk(&mut self, jerk: f64) {
        self.jerk = jerk;
        self.recip_jerk = 1.0 / jerk;
        self.jerk_time_k = jerk_time_factor(jerk);
    }
}
