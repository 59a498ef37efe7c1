//! # Motion Core
//!
//! The middle of the pipeline: a ring of planned blocks with rearward
//! velocity smoothing and just-in-time ramp computation, and the runtime
//! executor that slices the active block into fixed-duration segments along a
//! quintic-Bézier velocity curve.
//!
//! Data flows in one direction:
//!
//! ```text
//! canonical machine ──> PlannerQueue ──> Runtime ──> stepper::PrepSlot
//!        (aline)        (back/forward        (segments)
//!                        planning)
//! ```
//!
//! Three contexts touch this state: the main loop appends blocks and runs
//! [`plan::backplan`]; a low-priority context runs [`plan::plan_forward`];
//! the exec context runs [`exec::Runtime::exec_move`]. The write disciplines
//! that make that safe are documented on [`queue::PlannerQueue`].

pub mod bezier;
pub mod block;
pub mod error;
pub mod exec;
pub mod hold;
pub mod kinematics;
pub mod plan;
pub mod queue;
pub mod zoid;

pub use block::{
    Block, BlockType, BufferState, GcodeSnapshot, MachineCommand, PlanHint, ProbeSpec, StopKind,
};
pub use error::MotionError;
pub use exec::{CommandSink, ExecStatus, Runtime};
pub use hold::HoldState;
pub use kinematics::{CartesianKinematics, CoreXyKinematics, Kinematics};
pub use queue::PlannerQueue;

/// Number of logical axes (X, Y, Z, A, B, C).
pub const AXES: usize = 6;

pub const AXIS_X: usize = 0;
pub const AXIS_Y: usize = 1;
pub const AXIS_Z: usize = 2;
pub const AXIS_A: usize = 3;
pub const AXIS_B: usize = 4;
pub const AXIS_C: usize = 5;

/// Number of planner queue slots.
pub const PLANNER_QUEUE_SIZE: usize = 48;

/// Admission refuses new blocks when this few slots remain, preserving
/// look-ahead depth for the back-planner.
pub const PLANNER_HEADROOM: usize = 4;

/// Nominal segment duration, seconds.
pub const NOM_SEGMENT_TIME: f64 = 750.0e-6;

/// Shortest section the executor will run; shorter sections are folded into a
/// neighbour before the block starts.
pub const MIN_SEGMENT_TIME: f64 = 250.0e-6;

/// Seconds of arrival silence after which the planner stops waiting for more
/// look-ahead and commits the queue to motion.
pub const BLOCK_TIMEOUT: f64 = 0.030;

/// Velocities below this are treated as zero, mm/s.
pub const VELOCITY_EPSILON: f64 = 1.0e-6;

/// Lengths below this are treated as zero, mm.
pub const LENGTH_EPSILON: f64 = 1.0e-9;

/// Per-motor travel below this many steps is truncated to zero in a segment.
pub const TRAVEL_TRUNCATION_STEPS: f64 = 0.01;
