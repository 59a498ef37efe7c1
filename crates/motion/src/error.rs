//! Error types for the motion core.

use thiserror::Error;

/// Errors that can occur while queueing or executing motion.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MotionError {
    /// The requested move has no length in the active axis subspace.
    #[error("zero length move")]
    ZeroLengthMove,

    /// The planner ring has no admissible slot. Back-pressure upstream should
    /// have prevented this; callers treat it as "retry later".
    #[error("planner queue full")]
    QueueFull,

    /// A block carried a non-positive or non-finite jerk or velocity limit.
    #[error("invalid kinematic limit: {0}")]
    InvalidLimit(&'static str),

    /// Internal consistency failure in the planner or executor. Latches the
    /// machine into alarm upstream.
    #[error("planner fault: {0}")]
    PlannerFault(&'static str),

    /// The stepper prep path rejected a segment.
    #[error(transparent)]
    Stepper(#[from] stepper::StepperError),
}
