//! Quintic-Bézier velocity sampling via forward differences.
//!
//! Head and tail sections follow the quintic smoothstep
//! `s(t) = 6t^5 - 15t^4 + 10t^3`, which has zero first and second derivatives
//! at both ends: velocity enters and leaves each section with zero
//! acceleration and zero jerk. Sampling happens once per segment at interval
//! midpoints (`t = h/2, 3h/2, ...`) so each sample approximates the
//! segment's average velocity.
//!
//! Evaluating the quintic per segment would cost five multiplies; instead the
//! difference table is built once per section and each subsequent sample is
//! five additions.

/// Forward-difference generator for one section's velocity curve.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardDiffs {
    value: f64,
    diff: [f64; 5],
}

impl ForwardDiffs {
    /// Builds the difference table for a section running from `v0` to `v1`
    /// over `segments` equal intervals.
    pub fn init(v0: f64, v1: f64, segments: u32) -> Self {
        debug_assert!(segments >= 1);
        let h = 1.0 / segments as f64;
        let t0 = 0.5 * h;
        let dv = v1 - v0;
        let curve = |t: f64| {
            let s = ((6.0 * t - 15.0) * t + 10.0) * t * t * t;
            v0 + dv * s
        };

        let mut samples = [0.0; 6];
        for (i, sample) in samples.iter_mut().enumerate() {
            *sample = curve(t0 + i as f64 * h);
        }

        // Difference table: diff[k] holds the (k+1)-th forward difference at
        // the first sample. The fifth difference of a quintic is constant.
        let mut table = samples;
        let mut diff = [0.0; 5];
        for (order, d) in diff.iter_mut().enumerate() {
            for i in 0..(5 - order) {
                table[i] = table[i + 1] - table[i];
            }
            *d = table[0];
        }

        Self {
            value: samples[0],
            diff,
        }
    }

    /// Velocity sample for the first segment of the section.
    pub fn first(&self) -> f64 {
        self.value
    }

    /// Advances to the next segment's velocity sample.
    pub fn next(&mut self) -> f64 {
        self.value += self.diff[0];
        self.diff[0] += self.diff[1];
        self.diff[1] += self.diff[2];
        self.diff[2] += self.diff[3];
        self.diff[3] += self.diff[4];
        self.value
    }
}
