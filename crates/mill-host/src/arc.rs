//! Arc decomposition.
//!
//! G2/G3 arcs are reduced to chorded linear moves whose sagitta never
//! exceeds the configured chordal tolerance. Supports the IJK center-offset
//! form (incremental or absolute per G91.1/G90.1), the R radius form, full
//! circles, and helical interpolation of the off-plane axes. The generator
//! is persistent: chords stream into the planner as admission room appears.

use gcode::{DistanceMode, ParsedBlock, Plane};
use motion::{AXES, LENGTH_EPSILON};

/// Largest allowed distance between the programmed endpoint and the circle
/// through the start point, mm.
const ARC_RADIUS_TOLERANCE: f64 = 0.5;

/// Streams chord endpoints for one arc.
#[derive(Debug, Clone)]
pub struct ArcGenerator {
    axis_0: usize,
    axis_1: usize,
    center_0: f64,
    center_1: f64,
    radius: f64,
    start_angle: f64,
    /// Signed total sweep; negative is clockwise in the plane.
    sweep: f64,
    start: [f64; AXES],
    target: [f64; AXES],
    segments: u32,
    emitted: u32,
    feed: f64,
}

fn plane_axes(plane: Plane) -> (usize, usize) {
    match plane {
        Plane::Xy => (0, 1),
        // NIST axis ordering keeps arc direction conventions intact.
        Plane::Xz => (2, 0),
        Plane::Yz => (1, 2),
    }
}

impl ArcGenerator {
    /// Resolves the arc geometry. `units_scale` converts programmed I/J/K/R
    /// values to mm; `work_offset` locates absolute (G90.1) centers.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        start: [f64; AXES],
        target: [f64; AXES],
        parsed: &ParsedBlock,
        plane: Plane,
        arc_distance: DistanceMode,
        clockwise: bool,
        chordal_tolerance: f64,
        units_scale: f64,
        work_offset: [f64; AXES],
        feed: f64,
    ) -> Result<Self, &'static str> {
        let (a0, a1) = plane_axes(plane);
        let d0 = target[a0] - start[a0];
        let d1 = target[a1] - start[a1];

        let (center_0, center_1, radius, full_circle) = if let Some(r_word) = parsed.radius {
            // R form. No full circles; endpoints must differ in the plane.
            let r = r_word * units_scale;
            let d_sq = d0 * d0 + d1 * d1;
            if d_sq < LENGTH_EPSILON {
                return Err("radius-form arc requires distinct endpoints");
            }
            let mut h_x2_div_d = 4.0 * r * r - d_sq;
            if h_x2_div_d < 0.0 {
                return Err("arc radius too small to reach endpoint");
            }
            h_x2_div_d = -h_x2_div_d.sqrt() / d_sq.sqrt();
            if !clockwise {
                h_x2_div_d = -h_x2_div_d;
            }
            // Negative R selects the longer of the two arcs.
            let r_abs = if r < 0.0 {
                h_x2_div_d = -h_x2_div_d;
                -r
            } else {
                r
            };
            (
                start[a0] + 0.5 * (d0 - d1 * h_x2_div_d),
                start[a1] + 0.5 * (d1 + d0 * h_x2_div_d),
                r_abs,
                false,
            )
        } else if parsed.has_offset_words() {
            let offset_for = |axis: usize| parsed.offset[axis].unwrap_or(0.0) * units_scale;
            let (c0, c1) = match arc_distance {
                DistanceMode::Incremental => (start[a0] + offset_for(a0), start[a1] + offset_for(a1)),
                DistanceMode::Absolute => {
                    (offset_for(a0) + work_offset[a0], offset_for(a1) + work_offset[a1])
                }
            };
            let r0 = ((start[a0] - c0).powi(2) + (start[a1] - c1).powi(2)).sqrt();
            let r1 = ((target[a0] - c0).powi(2) + (target[a1] - c1).powi(2)).sqrt();
            if (r0 - r1).abs() > ARC_RADIUS_TOLERANCE {
                return Err("arc endpoint is not on the circle");
            }
            let full = d0.abs() < LENGTH_EPSILON && d1.abs() < LENGTH_EPSILON;
            (c0, c1, r0, full)
        } else {
            return Err("arc requires I/J/K offsets or R");
        };

        if radius < LENGTH_EPSILON {
            return Err("arc radius is zero");
        }

        let start_angle = (start[a1] - center_1).atan2(start[a0] - center_0);
        let end_angle = (target[a1] - center_1).atan2(target[a0] - center_0);
        let tau = std::f64::consts::TAU;
        let mut sweep = end_angle - start_angle;
        if full_circle {
            sweep = if clockwise { -tau } else { tau };
        } else if clockwise {
            if sweep > -1e-12 {
                sweep -= tau;
            }
        } else if sweep < 1e-12 {
            sweep += tau;
        }

        // Chord angle from the sagitta bound: s = r (1 - cos(dtheta/2)).
        let dtheta = 2.0 * (1.0 - (chordal_tolerance / radius).min(1.0)).acos();
        let segments = if dtheta > 1e-9 {
            (sweep.abs() / dtheta).ceil().max(1.0) as u32
        } else {
            1
        };

        Ok(Self {
            axis_0: a0,
            axis_1: a1,
            center_0,
            center_1,
            radius,
            start_angle,
            sweep,
            start,
            target,
            segments,
            emitted: 0,
            feed,
        })
    }

    pub fn feed(&self) -> f64 {
        self.feed
    }

    /// Next chord endpoint; the final chord lands exactly on the programmed
    /// target.
    pub fn next_target(&mut self) -> Option<[f64; AXES]> {
        if self.emitted >= self.segments {
            return None;
        }
        self.emitted += 1;
        if self.emitted == self.segments {
            return Some(self.target);
        }
        let fraction = self.emitted as f64 / self.segments as f64;
        let angle = self.start_angle + self.sweep * fraction;

        // Off-plane axes (including the helical linear axis) interpolate
        // linearly with arc progress.
        let mut point: [f64; AXES] =
            core::array::from_fn(|axis| {
                self.start[axis] + (self.target[axis] - self.start[axis]) * fraction
            });
        point[self.axis_0] = self.center_0 + self.radius * angle.cos();
        point[self.axis_1] = self.center_1 + self.radius * angle.sin();
        Some(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcode::parse_line;

    fn quarter_circle() -> ArcGenerator {
        // G3 (CCW) from (10,0) to (0,10) around (0,0).
        let parsed = parse_line("G3 X0 Y10 I-10 J0").unwrap();
        let mut start = [0.0; AXES];
        start[0] = 10.0;
        let mut target = [0.0; AXES];
        target[1] = 10.0;
        ArcGenerator::new(
            start,
            target,
            &parsed,
            Plane::Xy,
            DistanceMode::Incremental,
            false,
            0.01,
            1.0,
            [0.0; AXES],
            20.0,
        )
        .unwrap()
    }

    #[test]
    fn chords_stay_on_circle_and_reach_target() {
        let mut arc = quarter_circle();
        let mut last = [0.0; AXES];
        let mut count = 0;
        while let Some(p) = arc.next_target() {
            let r = (p[0] * p[0] + p[1] * p[1]).sqrt();
            assert!((r - 10.0).abs() < 0.02, "chord endpoint off circle: {r}");
            last = p;
            count += 1;
        }
        assert!(count > 5, "quarter circle produced only {count} chords");
        assert!((last[0]).abs() < 1e-12 && (last[1] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn chord_count_scales_with_tolerance() {
        let parsed = parse_line("G3 X0 Y10 I-10 J0").unwrap();
        let mut start = [0.0; AXES];
        start[0] = 10.0;
        let mut target = [0.0; AXES];
        target[1] = 10.0;
        let coarse = ArcGenerator::new(
            start, target, &parsed, Plane::Xy, DistanceMode::Incremental,
            false, 0.1, 1.0, [0.0; AXES], 20.0,
        )
        .unwrap();
        let fine = ArcGenerator::new(
            start, target, &parsed, Plane::Xy, DistanceMode::Incremental,
            false, 0.001, 1.0, [0.0; AXES], 20.0,
        )
        .unwrap();
        assert!(fine.segments > coarse.segments * 3);
    }

    #[test]
    fn full_circle_sweeps_tau() {
        let parsed = parse_line("G2 X10 Y0 I-10 J0").unwrap();
        let mut start = [0.0; AXES];
        start[0] = 10.0;
        let mut target = [0.0; AXES];
        target[0] = 10.0;
        let arc = ArcGenerator::new(
            start, target, &parsed, Plane::Xy, DistanceMode::Incremental,
            true, 0.01, 1.0, [0.0; AXES], 20.0,
        )
        .unwrap();
        assert!((arc.sweep + std::f64::consts::TAU).abs() < 1e-12);
    }

    #[test]
    fn radius_form_places_center() {
        // CW quarter from (0,0) to (10,10) with R10: center at (10,0).
        let parsed = parse_line("G2 X10 Y10 R10").unwrap();
        let start = [0.0; AXES];
        let mut target = [0.0; AXES];
        target[0] = 10.0;
        target[1] = 10.0;
        let arc = ArcGenerator::new(
            start, target, &parsed, Plane::Xy, DistanceMode::Incremental,
            true, 0.01, 1.0, [0.0; AXES], 20.0,
        )
        .unwrap();
        assert!((arc.center_0 - 10.0).abs() < 1e-9, "center {}", arc.center_0);
        assert!(arc.center_1.abs() < 1e-9);
    }

    #[test]
    fn off_circle_endpoint_rejected() {
        let parsed = parse_line("G3 X5 Y99 I-10 J0").unwrap();
        let mut start = [0.0; AXES];
        start[0] = 10.0;
        let mut target = [0.0; AXES];
        target[0] = 5.0;
        target[1] = 99.0;
        assert!(ArcGenerator::new(
            start, target, &parsed, Plane::Xy, DistanceMode::Incremental,
            false, 0.01, 1.0, [0.0; AXES], 20.0,
        )
        .is_err());
    }

    #[test]
    fn helical_axis_interpolates() {
        let parsed = parse_line("G3 X0 Y10 Z5 I-10 J0").unwrap();
        let mut start = [0.0; AXES];
        start[0] = 10.0;
        let mut target = [0.0; AXES];
        target[1] = 10.0;
        target[2] = 5.0;
        let mut arc = ArcGenerator::new(
            start, target, &parsed, Plane::Xy, DistanceMode::Incremental,
            false, 0.01, 1.0, [0.0; AXES], 20.0,
        )
        .unwrap();
        let mut prev_z = 0.0;
        while let Some(p) = arc.next_target() {
            assert!(p[2] >= prev_z - 1e-12, "Z went backwards");
            prev_z = p[2];
        }
        assert!((prev_z - 5.0).abs() < 1e-12);
    }
}
