//! The parsed-block value model.
//!
//! A [`ParsedBlock`] is a flat record of everything one line of G-code
//! requested, with `Option` fields marking which words were actually present.
//! The canonical machine consumes it in NIST execution order; the parser only
//! fills it in and enforces modal-group exclusion.

use crate::AXES;
use serde::Serialize;

/// Group 1 motion modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MotionMode {
    /// G0
    Traverse,
    /// G1
    Feed,
    /// G2
    CwArc,
    /// G3
    CcwArc,
    /// G38.2: probe toward workpiece, error on no contact
    ProbeTowardErr,
    /// G38.3: probe toward workpiece, no error
    ProbeToward,
    /// G38.4: probe away from workpiece, error on no contact
    ProbeAwayErr,
    /// G38.5: probe away from workpiece, no error
    ProbeAway,
    /// G80: cancel motion mode
    CancelMotion,
}

/// G17/G18/G19 arc planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum Plane {
    #[default]
    Xy,
    Xz,
    Yz,
}

/// G20/G21.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum Units {
    Inches,
    #[default]
    Millimeters,
}

/// G90/G91 (and G90.1/G91.1 for arc centers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum DistanceMode {
    #[default]
    Absolute,
    Incremental,
}

/// G93/G94.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum FeedRateMode {
    InverseTime,
    #[default]
    UnitsPerMinute,
}

/// G54–G59 work coordinate systems, plus G53 absolute override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CoordSystem {
    #[default]
    G54,
    G55,
    G56,
    G57,
    G58,
    G59,
}

impl CoordSystem {
    /// Stable numeric identifier (persistence key).
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Self> {
        use CoordSystem::*;
        [G54, G55, G56, G57, G58, G59].get(i).copied()
    }
}

/// G61/G61.1/G64 path-control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum PathControlMode {
    /// G61: exact path: come to a full stop at each junction.
    ExactPath,
    /// G61.1: exact stop.
    ExactStop,
    /// G64: continuous: corner at the junction-velocity limit.
    #[default]
    Continuous,
}

/// G43/G43.2/G49 tool-length offset control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ToolLengthMode {
    /// G43 H<slot>
    Apply,
    /// G43.2 H<slot>: additive
    ApplyAdditive,
    /// G49
    Cancel,
}

/// Group 0 non-modal codes. Only one may appear per block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum NonModal {
    /// G4 P<seconds>
    Dwell,
    /// G10 L2/L20 P<coord system>
    SetCoordData,
    /// G28: go via intermediate point to stored G28 position
    GoHome,
    /// G28.1: store current position as G28 position
    SetHome,
    /// G28.2: homing cycle (seek switches)
    HomingCycle,
    /// G28.3: set absolute position
    SetAbsolutePosition,
    /// G28.4: homing cycle without switches
    HomingCycleNoSwitch,
    /// G30: go to stored G30 position
    GoHomeAlt,
    /// G30.1: store current position as G30 position
    SetHomeAlt,
    /// G92: set origin offsets
    SetOriginOffsets,
    /// G92.1: reset origin offsets to zero
    ResetOriginOffsets,
    /// G92.2: suspend origin offsets
    SuspendOriginOffsets,
    /// G92.3: resume origin offsets
    ResumeOriginOffsets,
    /// G53: absolute override for this block
    AbsoluteOverride,
}

/// M3/M4/M5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpindleMode {
    Cw,
    Ccw,
    Off,
}

/// Program-flow M-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProgramFlow {
    /// M0
    Stop,
    /// M1
    OptionalStop,
    /// M60
    PalletChangeStop,
    /// M2
    End,
    /// M30
    EndRewind,
}

/// M50/M50.1/M51 override requests; the optional P word selects the factor
/// (P0 disables, P1 enables; a fractional P sets the factor directly).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverrideRequest {
    pub parameter: Option<f64>,
}

/// Everything a single line requested. `None` means "word not present".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedBlock {
    pub line_number: Option<u32>,
    pub block_delete: bool,
    /// Merged active-comment payload (`{msg: ...}`).
    pub payload: Option<serde_json::Value>,

    // Modal G words
    pub motion: Option<MotionMode>,
    pub plane: Option<Plane>,
    pub units: Option<Units>,
    pub distance: Option<DistanceMode>,
    pub arc_distance: Option<DistanceMode>,
    pub feed_mode: Option<FeedRateMode>,
    pub coord_system: Option<CoordSystem>,
    pub path_control: Option<PathControlMode>,
    pub tool_length: Option<ToolLengthMode>,
    /// G40 appeared (cutter compensation off; only the off form is supported).
    pub cutter_comp_off: bool,
    pub non_modal: Option<NonModal>,

    // M words
    pub program_flow: Option<ProgramFlow>,
    pub spindle: Option<SpindleMode>,
    pub tool_change: bool,
    /// M7 mist coolant on.
    pub coolant_mist: bool,
    /// M8 flood coolant on.
    pub coolant_flood: bool,
    /// M9 all coolant off.
    pub coolant_off: bool,
    /// M48 (true) / M49 (false).
    pub override_enable: Option<bool>,
    /// M50 feed override.
    pub feed_override: Option<OverrideRequest>,
    /// M50.1 traverse override.
    pub traverse_override: Option<OverrideRequest>,
    /// M51 spindle override.
    pub spindle_override: Option<OverrideRequest>,
    /// M100/M100.1/M101 user commands (value ×10 to keep the sub-code).
    pub user_mcode: Option<u16>,

    // Parameter words
    pub axis: [Option<f64>; AXES],
    /// I, J, K arc center offsets.
    pub offset: [Option<f64>; 3],
    pub radius: Option<f64>,
    pub feed_rate: Option<f64>,
    pub spindle_speed: Option<f64>,
    pub tool: Option<u8>,
    pub p_word: Option<f64>,
    pub l_word: Option<u8>,
    pub h_word: Option<u8>,
}

impl ParsedBlock {
    /// True when any axis word is present.
    pub fn has_axis_words(&self) -> bool {
        self.axis.iter().any(Option::is_some)
    }

    /// True when any arc offset word (I/J/K) is present.
    pub fn has_offset_words(&self) -> bool {
        self.offset.iter().any(Option::is_some)
    }

    /// True when the block contains nothing actionable (e.g. a bare comment
    /// line or a lone line number).
    pub fn is_empty(&self) -> bool {
        let actionable = self.motion.is_some()
            || self.plane.is_some()
            || self.units.is_some()
            || self.distance.is_some()
            || self.arc_distance.is_some()
            || self.feed_mode.is_some()
            || self.coord_system.is_some()
            || self.path_control.is_some()
            || self.tool_length.is_some()
            || self.cutter_comp_off
            || self.non_modal.is_some()
            || self.program_flow.is_some()
            || self.spindle.is_some()
            || self.tool_change
            || self.coolant_mist
            || self.coolant_flood
            || self.coolant_off
            || self.override_enable.is_some()
            || self.feed_override.is_some()
            || self.traverse_override.is_some()
            || self.spindle_override.is_some()
            || self.user_mcode.is_some()
            || self.has_axis_words()
            || self.feed_rate.is_some()
            || self.spindle_speed.is_some()
            || self.tool.is_some()
            || self.payload.is_some();
        !actionable
    }
}
