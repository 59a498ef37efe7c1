//! Feed-hold state machine.
//!
//! A feed hold is a cooperative pause: the current segment always completes,
//! then the executor re-plans the remainder of the active block as a
//! deceleration. The states below are observed across contexts, so every
//! transition happens at a segment boundary or when the steppers have
//! drained; there are no mid-segment changes.

use serde::Serialize;

/// Hold progression. See [`crate::exec::Runtime::request_feedhold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum HoldState {
    /// Not holding.
    #[default]
    Off,
    /// Hold requested; waiting for a segment boundary where deceleration can
    /// be planned.
    Sync,
    /// Decelerating, but the stop point lies beyond the current block; the
    /// hold carries into the next block's entry.
    DecelContinue,
    /// Decelerating to zero inside the current block.
    DecelToZero,
    /// The final deceleration segment has been handed to the stepper.
    DecelComplete,
    /// Waiting for the stepper engine to drain the last segment.
    MotionStopping,
    /// Motion is fully stopped; the remainder of the suspended block has been
    /// returned to the planner. Cleared by cycle start.
    MotionStopped,
}

impl HoldState {
    /// True in any state other than `Off`.
    pub fn is_holding(self) -> bool {
        self != HoldState::Off
    }

    /// True once no further segments will be produced until cycle start.
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            HoldState::DecelComplete | HoldState::MotionStopping | HoldState::MotionStopped
        )
    }
}
