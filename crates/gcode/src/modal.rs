//! Modal-group bookkeeping.
//!
//! NIST RS-274/NGC partitions codes into modal groups; a block may carry at
//! most one code from each group. The parser registers every G/M word here
//! and fails the block on the first collision.

use crate::error::ParseError;

/// The modal groups tracked per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModalGroup {
    GNonModal,
    GMotion,
    GPlane,
    GDistance,
    GArcDistance,
    GFeedRateMode,
    GUnits,
    GCutterComp,
    GToolLength,
    GCoordSystem,
    GPathControl,
    MStopping,
    MToolChange,
    MSpindle,
    MCoolant,
    MOverride,
}

impl ModalGroup {
    const COUNT: usize = 16;

    fn name(self) -> &'static str {
        match self {
            ModalGroup::GNonModal => "G group 0 (non-modal)",
            ModalGroup::GMotion => "G group 1 (motion)",
            ModalGroup::GPlane => "G group 2 (plane)",
            ModalGroup::GDistance => "G group 3 (distance)",
            ModalGroup::GArcDistance => "G group 4 (arc distance)",
            ModalGroup::GFeedRateMode => "G group 5 (feed rate mode)",
            ModalGroup::GUnits => "G group 6 (units)",
            ModalGroup::GCutterComp => "G group 7 (cutter compensation)",
            ModalGroup::GToolLength => "G group 8 (tool length)",
            ModalGroup::GCoordSystem => "G group 12 (coordinate system)",
            ModalGroup::GPathControl => "G group 13 (path control)",
            ModalGroup::MStopping => "M group 4 (stopping)",
            ModalGroup::MToolChange => "M group 6 (tool change)",
            ModalGroup::MSpindle => "M group 7 (spindle)",
            ModalGroup::MCoolant => "M group 8 (coolant)",
            ModalGroup::MOverride => "M group 9 (override)",
        }
    }
}

/// Per-block record of which groups have been claimed.
#[derive(Debug, Default)]
pub struct ModalSeen {
    seen: [bool; ModalGroup::COUNT],
}

impl ModalSeen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `group` for this block; errors if it was already claimed.
    ///
    /// M7 and M8 are both coolant-on and are conventionally allowed together,
    /// so the coolant group tolerates one repeat: callers pass
    /// `allow_repeat` for that case only.
    pub fn claim(&mut self, group: ModalGroup, allow_repeat: bool) -> Result<(), ParseError> {
        let idx = group as usize;
        if self.seen[idx] && !allow_repeat {
            return Err(ParseError::ModalGroupViolation(group.name()));
        }
        self.seen[idx] = true;
        Ok(())
    }

    pub fn contains(&self, group: ModalGroup) -> bool {
        self.seen[group as usize]
    }
}
