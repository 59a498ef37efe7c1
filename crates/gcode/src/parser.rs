//! Word-to-block mapping with modal-group validation.

use crate::block::*;
use crate::error::ParseError;
use crate::modal::{ModalGroup, ModalSeen};
use crate::normalize::normalize;
use crate::words::{extract_words, Word};
use crate::{AXIS_A, AXIS_B, AXIS_C, AXIS_X, AXIS_Y, AXIS_Z};

/// Parses one raw line all the way to a [`ParsedBlock`].
///
/// Runs the full pipeline: normalization, word extraction, modal validation.
/// A block-deleted line parses to an empty block with the flag set; the
/// caller decides whether block-delete is honored.
pub fn parse_line(raw: &str) -> Result<ParsedBlock, ParseError> {
    let normalized = normalize(raw)?;
    let words = extract_words(&normalized.text)?;

    let mut block = ParsedBlock {
        block_delete: normalized.block_delete,
        payload: normalized.payload.clone(),
        ..Default::default()
    };
    let mut seen = ModalSeen::new();

    for word in &words {
        apply_word(&mut block, &mut seen, word)?;
    }

    if normalized.had_checksum && block.line_number.is_none() {
        return Err(ParseError::MissingLineNumberWithChecksum);
    }

    // The P word may trail its M50/M50.1/M51; bind it once the line is done.
    let p_word = block.p_word;
    for req in [
        &mut block.feed_override,
        &mut block.traverse_override,
        &mut block.spindle_override,
    ]
    .into_iter()
    .flatten()
    {
        req.parameter = p_word;
    }

    // NIST: an axis-word-consuming group 0 code and a motion word in one
    // block is a conflict; the motion mode updates modally but is suspended.
    // Nothing to do here; the canonical machine gives group 0 precedence.

    // Probe and arc motion need axis words in the same block.
    if let Some(motion) = block.motion {
        let requires_axes = matches!(
            motion,
            MotionMode::ProbeToward
                | MotionMode::ProbeTowardErr
                | MotionMode::ProbeAway
                | MotionMode::ProbeAwayErr
        );
        if requires_axes && !block.has_axis_words() {
            return Err(ParseError::AxisIsMissing);
        }
    }

    Ok(block)
}

fn apply_word(block: &mut ParsedBlock, seen: &mut ModalSeen, word: &Word) -> Result<(), ParseError> {
    match word.letter {
        'N' => {
            if word.value < 0.0 || word.value.fract() != 0.0 {
                return Err(ParseError::BadNumberFormat(format!("N{}", word.value)));
            }
            block.line_number = Some(word.int_value as u32);
        }
        'G' => apply_g(block, seen, word)?,
        'M' => apply_m(block, seen, word)?,
        'X' => set_axis(block, AXIS_X, word.value),
        'Y' => set_axis(block, AXIS_Y, word.value),
        'Z' => set_axis(block, AXIS_Z, word.value),
        'A' => set_axis(block, AXIS_A, word.value),
        'B' => set_axis(block, AXIS_B, word.value),
        'C' => set_axis(block, AXIS_C, word.value),
        'I' => block.offset[0] = Some(word.value),
        'J' => block.offset[1] = Some(word.value),
        'K' => block.offset[2] = Some(word.value),
        'R' => block.radius = Some(word.value),
        'F' => {
            if word.value < 0.0 {
                return Err(ParseError::BadNumberFormat(format!("F{}", word.value)));
            }
            block.feed_rate = Some(word.value);
        }
        'S' => {
            if word.value < 0.0 {
                return Err(ParseError::BadNumberFormat(format!("S{}", word.value)));
            }
            block.spindle_speed = Some(word.value);
        }
        'T' => block.tool = Some(int_in_range(word, 0, 255)? as u8),
        'P' => block.p_word = Some(word.value),
        'L' => block.l_word = Some(int_in_range(word, 0, 255)? as u8),
        'H' => block.h_word = Some(int_in_range(word, 0, 255)? as u8),
        other => {
            return Err(ParseError::InvalidOrMalformedCommand(format!(
                "unsupported word letter '{other}'"
            )))
        }
    }
    Ok(())
}

fn set_axis(block: &mut ParsedBlock, axis: usize, value: f64) {
    block.axis[axis] = Some(value);
}

fn int_in_range(word: &Word, min: i64, max: i64) -> Result<i64, ParseError> {
    if word.value.fract() != 0.0 || word.int_value < min || word.int_value > max {
        return Err(ParseError::BadNumberFormat(format!(
            "{}{}",
            word.letter, word.value
        )));
    }
    Ok(word.int_value)
}

fn apply_g(block: &mut ParsedBlock, seen: &mut ModalSeen, word: &Word) -> Result<(), ParseError> {
    use ModalGroup::*;
    let (code, sub) = word.code();
    match (code, sub) {
        (0, 0) => {
            seen.claim(GMotion, false)?;
            block.motion = Some(MotionMode::Traverse);
        }
        (1, 0) => {
            seen.claim(GMotion, false)?;
            block.motion = Some(MotionMode::Feed);
        }
        (2, 0) => {
            seen.claim(GMotion, false)?;
            block.motion = Some(MotionMode::CwArc);
        }
        (3, 0) => {
            seen.claim(GMotion, false)?;
            block.motion = Some(MotionMode::CcwArc);
        }
        (4, 0) => {
            seen.claim(GNonModal, false)?;
            block.non_modal = Some(NonModal::Dwell);
        }
        (10, 0) => {
            seen.claim(GNonModal, false)?;
            block.non_modal = Some(NonModal::SetCoordData);
        }
        (17, 0) => {
            seen.claim(GPlane, false)?;
            block.plane = Some(Plane::Xy);
        }
        (18, 0) => {
            seen.claim(GPlane, false)?;
            block.plane = Some(Plane::Xz);
        }
        (19, 0) => {
            seen.claim(GPlane, false)?;
            block.plane = Some(Plane::Yz);
        }
        (20, 0) => {
            seen.claim(GUnits, false)?;
            block.units = Some(Units::Inches);
        }
        (21, 0) => {
            seen.claim(GUnits, false)?;
            block.units = Some(Units::Millimeters);
        }
        (28, s) => {
            seen.claim(GNonModal, false)?;
            block.non_modal = Some(match s {
                0 => NonModal::GoHome,
                1 => NonModal::SetHome,
                2 => NonModal::HomingCycle,
                3 => NonModal::SetAbsolutePosition,
                4 => NonModal::HomingCycleNoSwitch,
                _ => return Err(ParseError::GcodeCommandUnsupported(format!("28.{s}"))),
            });
        }
        (30, s) => {
            seen.claim(GNonModal, false)?;
            block.non_modal = Some(match s {
                0 => NonModal::GoHomeAlt,
                1 => NonModal::SetHomeAlt,
                _ => return Err(ParseError::GcodeCommandUnsupported(format!("30.{s}"))),
            });
        }
        (38, s) => {
            seen.claim(GMotion, false)?;
            block.motion = Some(match s {
                2 => MotionMode::ProbeTowardErr,
                3 => MotionMode::ProbeToward,
                4 => MotionMode::ProbeAwayErr,
                5 => MotionMode::ProbeAway,
                _ => return Err(ParseError::GcodeCommandUnsupported(format!("38.{s}"))),
            });
        }
        (40, 0) => {
            seen.claim(GCutterComp, false)?;
            block.cutter_comp_off = true;
        }
        (43, s) => {
            seen.claim(GToolLength, false)?;
            block.tool_length = Some(match s {
                0 => ToolLengthMode::Apply,
                2 => ToolLengthMode::ApplyAdditive,
                _ => return Err(ParseError::GcodeCommandUnsupported(format!("43.{s}"))),
            });
        }
        (49, 0) => {
            seen.claim(GToolLength, false)?;
            block.tool_length = Some(ToolLengthMode::Cancel);
        }
        (53, 0) => {
            seen.claim(GNonModal, false)?;
            block.non_modal = Some(NonModal::AbsoluteOverride);
        }
        (54..=59, 0) => {
            seen.claim(GCoordSystem, false)?;
            block.coord_system = CoordSystem::from_index((code - 54) as usize);
        }
        (61, 0) => {
            seen.claim(GPathControl, false)?;
            block.path_control = Some(PathControlMode::ExactPath);
        }
        (61, 1) => {
            seen.claim(GPathControl, false)?;
            block.path_control = Some(PathControlMode::ExactStop);
        }
        (64, 0) => {
            seen.claim(GPathControl, false)?;
            block.path_control = Some(PathControlMode::Continuous);
        }
        (80, 0) => {
            seen.claim(GMotion, false)?;
            block.motion = Some(MotionMode::CancelMotion);
        }
        (90, 0) => {
            seen.claim(GDistance, false)?;
            block.distance = Some(DistanceMode::Absolute);
        }
        (90, 1) => {
            seen.claim(GArcDistance, false)?;
            block.arc_distance = Some(DistanceMode::Absolute);
        }
        (91, 0) => {
            seen.claim(GDistance, false)?;
            block.distance = Some(DistanceMode::Incremental);
        }
        (91, 1) => {
            seen.claim(GArcDistance, false)?;
            block.arc_distance = Some(DistanceMode::Incremental);
        }
        (92, s) => {
            seen.claim(GNonModal, false)?;
            block.non_modal = Some(match s {
                0 => NonModal::SetOriginOffsets,
                1 => NonModal::ResetOriginOffsets,
                2 => NonModal::SuspendOriginOffsets,
                3 => NonModal::ResumeOriginOffsets,
                _ => return Err(ParseError::GcodeCommandUnsupported(format!("92.{s}"))),
            });
        }
        (93, 0) => {
            seen.claim(GFeedRateMode, false)?;
            block.feed_mode = Some(FeedRateMode::InverseTime);
        }
        (94, 0) => {
            seen.claim(GFeedRateMode, false)?;
            block.feed_mode = Some(FeedRateMode::UnitsPerMinute);
        }
        _ => {
            return Err(ParseError::GcodeCommandUnsupported(if sub == 0 {
                format!("{code}")
            } else {
                format!("{code}.{sub}")
            }))
        }
    }
    Ok(())
}

fn apply_m(block: &mut ParsedBlock, seen: &mut ModalSeen, word: &Word) -> Result<(), ParseError> {
    use ModalGroup::*;
    let (code, sub) = word.code();
    match (code, sub) {
        (0, 0) => {
            seen.claim(MStopping, false)?;
            block.program_flow = Some(ProgramFlow::Stop);
        }
        (1, 0) => {
            seen.claim(MStopping, false)?;
            block.program_flow = Some(ProgramFlow::OptionalStop);
        }
        (2, 0) => {
            seen.claim(MStopping, false)?;
            block.program_flow = Some(ProgramFlow::End);
        }
        (30, 0) => {
            seen.claim(MStopping, false)?;
            block.program_flow = Some(ProgramFlow::EndRewind);
        }
        (60, 0) => {
            seen.claim(MStopping, false)?;
            block.program_flow = Some(ProgramFlow::PalletChangeStop);
        }
        (3, 0) => {
            seen.claim(MSpindle, false)?;
            block.spindle = Some(SpindleMode::Cw);
        }
        (4, 0) => {
            seen.claim(MSpindle, false)?;
            block.spindle = Some(SpindleMode::Ccw);
        }
        (5, 0) => {
            seen.claim(MSpindle, false)?;
            block.spindle = Some(SpindleMode::Off);
        }
        (6, 0) => {
            seen.claim(MToolChange, false)?;
            block.tool_change = true;
        }
        (7, 0) => {
            seen.claim(MCoolant, true)?;
            block.coolant_mist = true;
        }
        (8, 0) => {
            seen.claim(MCoolant, true)?;
            block.coolant_flood = true;
        }
        (9, 0) => {
            seen.claim(MCoolant, false)?;
            block.coolant_off = true;
        }
        (48, 0) => {
            seen.claim(MOverride, false)?;
            block.override_enable = Some(true);
        }
        (49, 0) => {
            seen.claim(MOverride, false)?;
            block.override_enable = Some(false);
        }
        (50, 0) => {
            seen.claim(MOverride, false)?;
            block.feed_override = Some(OverrideRequest {
                parameter: block.p_word,
            });
        }
        (50, 1) => {
            seen.claim(MOverride, false)?;
            block.traverse_override = Some(OverrideRequest {
                parameter: block.p_word,
            });
        }
        (51, 0) => {
            seen.claim(MOverride, false)?;
            block.spindle_override = Some(OverrideRequest {
                parameter: block.p_word,
            });
        }
        (100, 0) => block.user_mcode = Some(1000),
        (100, 1) => block.user_mcode = Some(1001),
        (101, 0) => block.user_mcode = Some(1010),
        _ => {
            return Err(ParseError::McodeCommandUnsupported(if sub == 0 {
                format!("{code}")
            } else {
                format!("{code}.{sub}")
            }))
        }
    }
    Ok(())
}
