//! Step Pulse Engine
//!
//! The bottom of the motion pipeline: a fixed-rate DDA that turns prepared
//! segments into step edges, plus the one-slot prep/loader handoff that feeds
//! it. The executor above prepares one [`Segment`] at a time into the
//! [`PrepSlot`]; when the running segment drains, the loader copies the slot
//! into the run state and requests the next exec cycle.
//!
//! ## Ownership discipline
//!
//! The prep slot is single-producer single-consumer: the executor writes it
//! only while it is [`PrepOwner::Exec`], the loader reads it only while it is
//! [`PrepOwner::Loader`]. The owner field is the release/acquire flag; no
//! other synchronization is required.
//!
//! ## Substep accumulators
//!
//! Each motor integrates `substep_increment` once per DDA tick into a signed
//! accumulator. A positive zero-crossing emits a step edge and subtracts the
//! segment's `dda_ticks_x_substeps`. Substeps are a fixed ×32 multiplier of
//! steps so that per-segment rounding never accumulates into lost motion.

pub mod dda;
pub mod hal;
pub mod prep;

pub use dda::{LoaderEvent, RunState, StepperEngine};
pub use hal::{ProbeInput, StepOutput};
pub use prep::{PrepOwner, PrepPayload, PrepSlot, Segment};

use thiserror::Error;

/// Number of physical motors driven by the engine.
pub const MOTORS: usize = 4;

/// DDA interrupt rate, Hz.
pub const DDA_FREQUENCY: f64 = 200_000.0;

/// System tick rate, Hz (dwell scheduling, power management).
pub const SYSTICK_FREQUENCY: f64 = 1_000.0;

/// Substeps per step: the DDA accumulator works in units of 1/32 step.
pub const DDA_SUBSTEPS: f64 = 32.0;

/// Following-error magnitude (steps) above which a nudge correction is
/// injected into the next prepared segment.
pub const STEP_CORRECTION_THRESHOLD: f64 = 2.0;

/// Largest correction (steps) injected into a single segment.
pub const STEP_CORRECTION_MAX: f64 = 0.6;

/// Segments to wait between corrections, letting one take effect before the
/// error is sampled again.
pub const STEP_CORRECTION_HOLDOFF: u8 = 5;

/// Seconds of idle before motors are de-energized.
pub const MOTOR_IDLE_TIMEOUT: f64 = 2.0;

/// Errors surfaced by the prep/load path. These latch the machine into alarm
/// upstream; the engine itself stays inert after reporting one.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum StepperError {
    /// The executor tried to prepare a segment while the loader owned the slot.
    #[error("prep slot is owned by the loader")]
    PrepSlotBusy,

    /// Segment time was NaN, infinite, or not positive.
    #[error("invalid segment time: {0}")]
    InvalidSegmentTime(f64),

    /// A per-motor travel magnitude overflowed the substep accumulator range.
    #[error("travel steps out of range on motor {motor}: {steps}")]
    TravelOutOfRange { motor: usize, steps: f64 },
}
