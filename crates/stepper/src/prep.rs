//! Segment preparation and the exec→loader handoff slot.

use crate::{
    StepperError, DDA_FREQUENCY, DDA_SUBSTEPS, MOTORS, STEP_CORRECTION_HOLDOFF,
    STEP_CORRECTION_MAX, STEP_CORRECTION_THRESHOLD, SYSTICK_FREQUENCY,
};

/// One fixed-duration slice of a move, as produced by the runtime executor.
///
/// Travel is in fractional motor steps; the prep stage converts it to substep
/// increments. Following error is the encoder-minus-commanded delta used for
/// nudge correction.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Segment {
    pub travel_steps: [f64; MOTORS],
    pub following_error: [f64; MOTORS],
    /// Segment duration, seconds.
    pub time: f64,
}

/// Who may touch the prep slot right now. This is the SPSC release/acquire
/// flag: `Exec` means empty (executor may fill), `Loader` means full (loader
/// may consume).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepOwner {
    #[default]
    Exec,
    Loader,
}

/// What the slot currently carries.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PrepPayload {
    /// Nothing to execute; keeps motors energized (starvation placeholder).
    #[default]
    Null,
    /// A stepping segment.
    Aline,
    /// A dwell measured in system ticks; the DDA timer stops.
    Dwell { ticks: u32 },
}

/// Per-motor prepared values.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotorPrep {
    /// Substeps added to the accumulator per DDA tick.
    pub substep_increment: i32,
    /// True = forward.
    pub forward: bool,
}

/// The one-slot handoff between the executor and the loader.
#[derive(Debug)]
pub struct PrepSlot {
    owner: PrepOwner,
    pub(crate) payload: PrepPayload,
    pub(crate) dda_ticks: u32,
    pub(crate) dda_ticks_x_substeps: i32,
    pub(crate) motors: [MotorPrep; MOTORS],
    /// Accumulator scale factor when the segment time changed; preserves
    /// substep phase across the boundary.
    pub(crate) accumulator_correction: f64,
    pub(crate) correction_pending: bool,
    prev_dda_ticks: u32,
    correction_holdoff: [u8; MOTORS],
}

impl Default for PrepSlot {
    fn default() -> Self {
        Self {
            owner: PrepOwner::Exec,
            payload: PrepPayload::Null,
            dda_ticks: 0,
            dda_ticks_x_substeps: 0,
            motors: [MotorPrep::default(); MOTORS],
            accumulator_correction: 1.0,
            correction_pending: false,
            prev_dda_ticks: 0,
            correction_holdoff: [0; MOTORS],
        }
    }
}

impl PrepSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> PrepOwner {
        self.owner
    }

    /// True when the executor may prepare the next segment.
    pub fn ready_for_exec(&self) -> bool {
        self.owner == PrepOwner::Exec
    }

    /// Prepares a stepping segment: computes DDA tick count, per-motor
    /// direction and substep increments, the accumulator correction for a
    /// segment-time change, and injects bounded step-error nudges.
    pub fn prep_line(&mut self, segment: &Segment) -> Result<(), StepperError> {
        if self.owner != PrepOwner::Exec {
            return Err(StepperError::PrepSlotBusy);
        }
        if !segment.time.is_finite() || segment.time <= 0.0 {
            return Err(StepperError::InvalidSegmentTime(segment.time));
        }

        let dda_ticks = (segment.time * DDA_FREQUENCY).round() as i64;
        if dda_ticks < 1 || dda_ticks > u32::MAX as i64 {
            return Err(StepperError::InvalidSegmentTime(segment.time));
        }
        let dda_ticks = dda_ticks as u32;
        let ticks_x_substeps = dda_ticks as i64 * DDA_SUBSTEPS as i64;
        if ticks_x_substeps > i32::MAX as i64 {
            return Err(StepperError::InvalidSegmentTime(segment.time));
        }

        for (m, prep) in self.motors.iter_mut().enumerate() {
            let mut travel = segment.travel_steps[m];

            // Step-error nudge: bounded, and rate-limited by a holdoff so a
            // correction settles before the error is sampled again.
            if self.correction_holdoff[m] > 0 {
                self.correction_holdoff[m] -= 1;
            } else {
                let error = segment.following_error[m];
                if error.abs() > STEP_CORRECTION_THRESHOLD {
                    travel -= error.clamp(-STEP_CORRECTION_MAX, STEP_CORRECTION_MAX);
                    self.correction_holdoff[m] = STEP_CORRECTION_HOLDOFF;
                }
            }

            let increment = (travel.abs() * DDA_SUBSTEPS).round() as i64;
            // A motor may not be asked to step faster than once per DDA tick.
            if increment > ticks_x_substeps {
                return Err(StepperError::TravelOutOfRange {
                    motor: m,
                    steps: segment.travel_steps[m],
                });
            }
            prep.substep_increment = increment as i32;
            prep.forward = travel >= 0.0;
        }

        self.correction_pending = self.prev_dda_ticks != 0 && self.prev_dda_ticks != dda_ticks;
        self.accumulator_correction = if self.correction_pending {
            dda_ticks as f64 / self.prev_dda_ticks as f64
        } else {
            1.0
        };
        self.prev_dda_ticks = dda_ticks;

        self.dda_ticks = dda_ticks;
        self.dda_ticks_x_substeps = ticks_x_substeps as i32;
        self.payload = PrepPayload::Aline;
        self.owner = PrepOwner::Loader;
        Ok(())
    }

    /// Prepares a null segment: consumed by the loader without stepping.
    /// Used on starvation so the loader keeps cycling and motors stay
    /// energized.
    pub fn prep_null(&mut self) {
        if self.owner != PrepOwner::Exec {
            return;
        }
        self.payload = PrepPayload::Null;
        self.owner = PrepOwner::Loader;
    }

    /// Prepares a dwell; the loader will stop the DDA and count system ticks.
    pub fn prep_dwell(&mut self, seconds: f64) -> Result<(), StepperError> {
        if self.owner != PrepOwner::Exec {
            return Err(StepperError::PrepSlotBusy);
        }
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(StepperError::InvalidSegmentTime(seconds));
        }
        let ticks = (seconds * SYSTICK_FREQUENCY).round() as u32;
        self.payload = PrepPayload::Dwell { ticks };
        self.owner = PrepOwner::Loader;
        Ok(())
    }

    /// Loader-side release: the slot contents have been copied to the run
    /// state and the executor may prepare the next segment.
    pub(crate) fn release_to_exec(&mut self) {
        self.owner = PrepOwner::Exec;
    }

    /// Discards any prepared-but-unloaded segment (alarm/reset path).
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(travel: [f64; MOTORS], time: f64) -> Segment {
        Segment {
            travel_steps: travel,
            following_error: [0.0; MOTORS],
            time,
        }
    }

    #[test]
    fn prep_computes_ticks_and_increments() {
        let mut slot = PrepSlot::new();
        slot.prep_line(&segment([10.0, -5.0, 0.0, 0.0], 0.00075)).unwrap();
        assert_eq!(slot.owner(), PrepOwner::Loader);
        assert_eq!(slot.dda_ticks, 150);
        assert_eq!(slot.dda_ticks_x_substeps, 150 * 32);
        assert_eq!(slot.motors[0].substep_increment, 320);
        assert!(slot.motors[0].forward);
        assert_eq!(slot.motors[1].substep_increment, 160);
        assert!(!slot.motors[1].forward);
        assert_eq!(slot.motors[2].substep_increment, 0);
    }

    #[test]
    fn busy_slot_rejected() {
        let mut slot = PrepSlot::new();
        slot.prep_line(&segment([1.0, 0.0, 0.0, 0.0], 0.001)).unwrap();
        assert_eq!(
            slot.prep_line(&segment([1.0, 0.0, 0.0, 0.0], 0.001)),
            Err(StepperError::PrepSlotBusy)
        );
    }

    #[test]
    fn invalid_time_rejected() {
        let mut slot = PrepSlot::new();
        assert!(slot.prep_line(&segment([1.0; MOTORS], f64::NAN)).is_err());
        assert!(slot.prep_line(&segment([1.0; MOTORS], 0.0)).is_err());
        assert!(slot.prep_line(&segment([1.0; MOTORS], -1.0)).is_err());
    }

    #[test]
    fn time_change_sets_correction() {
        let mut slot = PrepSlot::new();
        slot.prep_line(&segment([1.0, 0.0, 0.0, 0.0], 0.00075)).unwrap();
        slot.release_to_exec();
        slot.prep_line(&segment([1.0, 0.0, 0.0, 0.0], 0.00050)).unwrap();
        assert!(slot.correction_pending);
        assert!((slot.accumulator_correction - 100.0 / 150.0).abs() < 1e-12);
    }

    #[test]
    fn nudge_applied_above_threshold_then_held_off() {
        let mut slot = PrepSlot::new();
        let mut seg = segment([10.0, 0.0, 0.0, 0.0], 0.00075);
        seg.following_error[0] = 3.0; // encoder ahead by 3 steps
        slot.prep_line(&seg).unwrap();
        // 10 - 0.6 = 9.4 steps -> 301 substeps
        assert_eq!(slot.motors[0].substep_increment, (9.4f64 * 32.0).round() as i32);

        // Holdoff: the same error is ignored for the next segments.
        slot.release_to_exec();
        slot.prep_line(&seg).unwrap();
        assert_eq!(slot.motors[0].substep_increment, 320);
    }

    #[test]
    fn overspeed_travel_rejected() {
        let mut slot = PrepSlot::new();
        // 200 ticks, 201 steps: more than one step per tick.
        let res = slot.prep_line(&segment([201.0, 0.0, 0.0, 0.0], 0.001));
        assert!(matches!(res, Err(StepperError::TravelOutOfRange { motor: 0, .. })));
    }
}
