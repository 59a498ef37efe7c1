//! Ramp ("zoid") computation.
//!
//! Every block runs a double-S velocity profile: an accelerating HEAD, a
//! constant-velocity BODY and a decelerating TAIL, any of which may be empty.
//! Head and tail follow a quintic Bézier velocity curve with zero boundary
//! acceleration and jerk, for which two closed-form relations hold:
//!
//! * minimum time for a velocity change dv under peak jerk j:
//!   `T = sqrt(dv * 10 / (sqrt(3) * j))`
//! * distance covered during that change: `L = (v0 + v1) / 2 * T`
//!   (the curve is symmetric, so the average velocity is the midpoint).
//!
//! Everything in this module is derived from those two. The solvers are
//! deterministic: the cubic for target velocity is closed-form, the
//! remaining inversions are fixed-iteration bisections.

use crate::block::{Block, BufferState, PlanHint};
use crate::{LENGTH_EPSILON, VELOCITY_EPSILON};

/// Peak jerk of the quintic curve relative to `dv / T^2`; the maximum of the
/// second derivative of the smoothstep 6t^5 - 15t^4 + 10t^3.
const CURVE_PEAK_JERK: f64 = 5.773_502_691_896_258; // 10 / sqrt(3)

/// Time constant `k` such that the fastest jerk-limited velocity change of
/// `dv` takes `k * sqrt(dv)` seconds.
pub fn jerk_time_factor(jerk: f64) -> f64 {
    (CURVE_PEAK_JERK / jerk).sqrt()
}

/// Distance covered changing velocity between `v0` and `v1` (either
/// direction) as fast as jerk allows.
pub fn target_length(v0: f64, v1: f64, k: f64) -> f64 {
    0.5 * (v0 + v1) * k * (v1 - v0).abs().sqrt()
}

/// Distance needed to brake from `v` to a stop.
pub fn braking_length(v: f64, k: f64) -> f64 {
    target_length(0.0, v, k)
}

/// Highest velocity reachable from `v_init` over `length`, accelerating as
/// fast as jerk allows. Closed form: substituting `u = sqrt(vf - vi)` into
/// the length relation yields the depressed cubic
/// `u^3 + 2 vi u - 2 L / k = 0`, which has exactly one real root.
pub fn target_velocity(v_init: f64, length: f64, k: f64) -> f64 {
    if length <= LENGTH_EPSILON {
        return v_init;
    }
    let p = 2.0 * v_init;
    let q = 2.0 * length / k;
    let disc = (q * 0.5) * (q * 0.5) + (p / 3.0).powi(3);
    let root = disc.sqrt();
    let u = (q * 0.5 + root).cbrt() + (q * 0.5 - root).cbrt();
    v_init + u * u
}

/// Velocity remaining after decelerating from `v_init` over `length`.
/// Returns zero when `length` is at least the braking length. Solved by
/// bisection on the (monotone) braking-distance relation.
pub fn decel_velocity(v_init: f64, length: f64, k: f64) -> f64 {
    if length <= LENGTH_EPSILON {
        return v_init;
    }
    if length >= braking_length(v_init, k) - LENGTH_EPSILON {
        return 0.0;
    }
    let mut lo = 0.0;
    let mut hi = v_init;
    for _ in 0..60 {
        let mid = 0.5 * (lo + hi);
        if target_length(mid, v_init, k) > length {
            lo = mid; // still too far to brake: exit must be faster
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Peak ("meet") velocity for a head+tail move with no body: the velocity
/// `vm >= max(ve, vx)` such that accelerating `ve -> vm` and decelerating
/// `vm -> vx` together cover exactly `length`. Callers guarantee such a peak
/// exists (the full-cruise profile did not fit).
pub fn meet_velocity(ve: f64, vx: f64, length: f64, k: f64) -> f64 {
    let mut lo = ve.max(vx);
    // Reachable-velocity bound: accelerating the whole length from the lower
    // boundary velocity overshoots any feasible peak.
    let mut hi = target_velocity(ve.min(vx), length, k);
    if hi < lo {
        return lo;
    }
    for _ in 0..60 {
        let mid = 0.5 * (lo + hi);
        let needed = target_length(ve, mid, k) + target_length(vx, mid, k);
        if needed > length {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Computes one block's ramp: head/body/tail lengths and times such that the
/// integrated distance equals the block length and jerk limits hold. Sets
/// `cruise_velocity`, may lower `exit_velocity` to what is reachable, and
/// moves the block to [`BufferState::FullyPlanned`].
pub fn ramp(block: &mut Block, entry_velocity: f64) {
    let length = block.length;
    let k = block.jerk_time_k;
    let ve = entry_velocity.max(0.0);

    if length <= LENGTH_EPSILON {
        block.head_length = 0.0;
        block.body_length = 0.0;
        block.tail_length = 0.0;
        block.head_time = 0.0;
        block.body_time = 0.0;
        block.tail_time = 0.0;
        block.cruise_velocity = ve;
        block.exit_velocity = ve;
        block.hint = PlanHint::ZeroBlock;
        block.buffer_state = BufferState::FullyPlanned;
        return;
    }

    let mut vx = block.exit_velocity.min(block.cruise_vmax).max(0.0);
    let vc_limit = block.cruise_vmax.max(ve).max(vx);

    let mut head;
    let mut body;
    let mut tail;
    let cruise;
    let hint;

    let full_head = target_length(ve, vc_limit, k);
    let full_tail = target_length(vx, vc_limit, k);

    if full_head + full_tail <= length {
        // The requested cruise fits.
        head = full_head;
        tail = full_tail;
        body = length - head - tail;
        cruise = vc_limit;
        hint = classify(head, body, tail);
    } else if (ve - vx).abs() < VELOCITY_EPSILON {
        // Symmetric bump: accelerate to a peak at the midpoint.
        cruise = target_velocity(ve, 0.5 * length, k).min(vc_limit);
        head = 0.5 * length;
        tail = 0.5 * length;
        body = 0.0;
        hint = PlanHint::SymmetricBump;
    } else if ve < vx {
        let reachable = target_velocity(ve, length, k);
        if reachable <= vx + VELOCITY_EPSILON {
            // Pure acceleration; the exit may have to come down to what the
            // length allows.
            vx = reachable.min(vx);
            cruise = vx;
            head = length;
            body = 0.0;
            tail = 0.0;
            hint = PlanHint::PerfectAcceleration;
        } else {
            let vm = meet_velocity(ve, vx, length, k).min(vc_limit);
            head = target_length(ve, vm, k);
            tail = target_length(vx, vm, k);
            body = (length - head - tail).max(0.0);
            cruise = vm;
            hint = PlanHint::AsymmetricBump;
        }
    } else {
        // Net deceleration.
        let brake = target_length(vx, ve, k);
        if brake >= length - LENGTH_EPSILON {
            // The whole block is a tail. If the length can't absorb the
            // decel to the requested exit, the exit rises to what's possible;
            // back-planning normally prevents this.
            vx = decel_velocity(ve, length, k).max(vx);
            cruise = ve;
            head = 0.0;
            body = 0.0;
            tail = length;
            hint = PlanHint::PerfectDeceleration;
        } else {
            let vm = meet_velocity(ve, vx, length, k).min(vc_limit);
            head = target_length(ve, vm, k);
            tail = target_length(vx, vm, k);
            body = (length - head - tail).max(0.0);
            cruise = vm;
            hint = PlanHint::AsymmetricBump;
        }
    }

    block.head_length = head;
    block.body_length = body;
    block.tail_length = tail;
    block.head_time = section_time(head, ve, cruise);
    block.body_time = if cruise > VELOCITY_EPSILON {
        body / cruise
    } else {
        0.0
    };
    block.tail_time = section_time(tail, cruise, vx);
    block.cruise_velocity = cruise;
    block.exit_velocity = vx;
    block.hint = hint;
    block.buffer_state = BufferState::FullyPlanned;
}

/// Section time from its length and boundary velocities (midpoint average).
fn section_time(length: f64, v0: f64, v1: f64) -> f64 {
    let avg = 0.5 * (v0 + v1);
    if length <= LENGTH_EPSILON || avg <= VELOCITY_EPSILON {
        0.0
    } else {
        length / avg
    }
}

fn classify(head: f64, body: f64, tail: f64) -> PlanHint {
    let h = head > LENGTH_EPSILON;
    let b = body > LENGTH_EPSILON;
    let t = tail > LENGTH_EPSILON;
    match (h, b, t) {
        (true, false, false) => PlanHint::PerfectAcceleration,
        (false, true, false) => PlanHint::PerfectCruise,
        (false, false, true) => PlanHint::PerfectDeceleration,
        (true, true, false) => PlanHint::MixedAcceleration,
        (false, true, true) => PlanHint::MixedDeceleration,
        (true, false, true) => PlanHint::SymmetricBump,
        _ => PlanHint::NoHint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;

    fn aline(length: f64, cruise_vmax: f64, exit: f64, jerk: f64) -> Block {
        let mut b = Block::default();
        b.set_aline_geometry(length, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        b.cruise_vset = cruise_vmax;
        b.cruise_vmax = cruise_vmax;
        b.absolute_vmax = cruise_vmax;
        b.exit_velocity = exit;
        b.set_jerk(jerk);
        b
    }

    #[test]
    fn length_relation_inverts() {
        let k = jerk_time_factor(5_000_000.0 / 60.0); // a typical axis jerk, mm/s^3
        let l = target_length(0.0, 100.0, k);
        let v = target_velocity(0.0, l, k);
        assert!((v - 100.0).abs() < 1e-6, "v = {v}");
    }

    #[test]
    fn decel_velocity_inverts_braking() {
        let k = jerk_time_factor(100_000.0);
        let l = target_length(20.0, 80.0, k);
        let v = decel_velocity(80.0, l, k);
        assert!((v - 20.0).abs() < 1e-6, "v = {v}");
        assert_eq!(decel_velocity(80.0, braking_length(80.0, k) * 2.0, k), 0.0);
    }

    #[test]
    fn full_trapezoid_sections_sum_to_length() {
        let mut b = aline(100.0, 100.0, 0.0, 100_000.0);
        ramp(&mut b, 0.0);
        assert!(b.head_length > 0.0 && b.body_length > 0.0 && b.tail_length > 0.0);
        let sum = b.head_length + b.body_length + b.tail_length;
        assert!((sum - 100.0).abs() < 1e-3);
        assert_eq!(b.cruise_velocity, 100.0);
        assert_eq!(b.exit_velocity, 0.0);
        // Symmetric move: head and tail match.
        assert!((b.head_length - b.tail_length).abs() < 1e-9);
    }

    #[test]
    fn short_move_becomes_symmetric_bump() {
        let mut b = aline(1.0, 200.0, 0.0, 100_000.0);
        ramp(&mut b, 0.0);
        assert_eq!(b.hint, PlanHint::SymmetricBump);
        assert!(b.cruise_velocity < 200.0);
        assert!((b.head_length + b.tail_length - 1.0).abs() < 1e-9);
    }

    #[test]
    fn meet_velocity_balances_sections() {
        let k = jerk_time_factor(100_000.0);
        let vm = meet_velocity(10.0, 30.0, 2.0, k);
        let total = target_length(10.0, vm, k) + target_length(30.0, vm, k);
        assert!((total - 2.0).abs() < 1e-6);
        assert!(vm >= 30.0);
    }

    #[test]
    fn pure_acceleration_clamps_exit() {
        // Entry 0, requested exit far above what 0.5 mm can reach.
        let mut b = aline(0.5, 500.0, 500.0, 100_000.0);
        ramp(&mut b, 0.0);
        assert_eq!(b.hint, PlanHint::PerfectAcceleration);
        assert!(b.exit_velocity < 500.0);
        let k = jerk_time_factor(100_000.0);
        assert!((b.exit_velocity - target_velocity(0.0, 0.5, k)).abs() < 1e-9);
    }

    #[test]
    fn hot_entry_becomes_deceleration() {
        let mut b = aline(0.5, 10.0, 0.0, 100_000.0);
        ramp(&mut b, 200.0);
        assert_eq!(b.hint, PlanHint::PerfectDeceleration);
        assert_eq!(b.tail_length, 0.5);
        // Can't stop in half a millimeter from 200 mm/s: exit stays hot.
        assert!(b.exit_velocity > 0.0);
    }

    #[test]
    fn cruise_only_when_boundaries_match_cruise() {
        let mut b = aline(10.0, 50.0, 50.0, 100_000.0);
        ramp(&mut b, 50.0);
        assert_eq!(b.hint, PlanHint::PerfectCruise);
        assert!((b.body_length - 10.0).abs() < 1e-9);
        assert!((b.body_time - 0.2).abs() < 1e-9);
    }
}
