//! Back-planning and just-in-time forward planning.
//!
//! Two passes with very different timing constraints share this module:
//!
//! * [`backplan`] runs on every main-loop callback. It walks from the newest
//!   arrival backward, tightening exit velocities until it reaches the
//!   running block or a block whose result did not change. Re-entrant: a
//!   block may go `NotPlanned -> BackPlanned` many times as later arrivals
//!   reshape the tail of the queue.
//! * [`plan_forward`] runs one block at a time in the low-priority interrupt
//!   context. It computes the ramp for exactly one move (plus any command
//!   blocks ahead of it), never touches the running block, and never plans
//!   more than one block past the executor.

use crate::block::{BufferState, PlanHint};
use crate::queue::PlannerQueue;
use crate::zoid::{ramp, target_velocity};
use crate::VELOCITY_EPSILON;
use tracing::trace;

/// Rearward velocity-smoothing pass.
///
/// For each move (newest first) the exit velocity is limited to what the
/// *following* block can absorb: its corner limit and the velocity it can
/// brake away from over its own length. The newest block always plans to a
/// zero exit; arrivals re-run the pass and relax it.
pub fn backplan(queue: &mut PlannerQueue) {
    let Some(newest) = queue.newest_index() else {
        return;
    };
    let run_idx = queue.running_index();

    // Max velocity the block at `idx` may exit with, accumulated from
    // everything queued after it.
    let mut exit_limit = 0.0_f64;
    let mut idx = newest;
    loop {
        let block = queue.block_mut(idx);
        match block.buffer_state {
            BufferState::Empty | BufferState::Initializing | BufferState::Running => break,
            _ => {}
        }
        if !block.plannable {
            break;
        }

        if block.is_move() {
            let new_exit = exit_limit.min(block.cruise_vmax);
            let first_pass = block.buffer_state < BufferState::BackPlanned;
            let changed = (new_exit - block.exit_velocity).abs() > VELOCITY_EPSILON;
            block.exit_vmax = new_exit;
            if !first_pass && !changed {
                // Everything behind this block already planned against the
                // same constraint: the pass has converged.
                break;
            }
            block.exit_velocity = new_exit;
            // A ramped block whose exit moved must be re-ramped.
            block.buffer_state = BufferState::BackPlanned;
            exit_limit = block
                .junction_vmax
                .min(target_velocity(
                    block.exit_velocity,
                    block.length,
                    block.jerk_time_k,
                ))
                .min(block.cruise_vmax);
            trace!(
                index = idx,
                exit = block.exit_velocity,
                entry_limit = exit_limit,
                "back-planned"
            );
        } else if block.forces_stop() {
            block.buffer_state = block.buffer_state.max(BufferState::BackPlanned);
            exit_limit = 0.0;
        } else {
            // Commands are velocity-transparent.
            block.buffer_state = block.buffer_state.max(BufferState::BackPlanned);
        }

        if idx == run_idx {
            break;
        }
        idx = queue.prev_index(idx);
    }
}

/// One-shot ramp computation ("the zoid step").
///
/// `idle_entry_velocity` is the velocity the machine will carry into the next
/// block when nothing is running (zero after a stop, the last exit velocity
/// otherwise); when a move is running its own exit velocity takes precedence.
///
/// Returns true if a block reached [`BufferState::FullyPlanned`].
pub fn plan_forward(queue: &mut PlannerQueue, idle_entry_velocity: f64) -> bool {
    let mut idx = queue.running_index();
    let mut entry = idle_entry_velocity;
    let mut crossed_runner = false;

    for _ in 0..queue.capacity() {
        let state = queue.block(idx).buffer_state;
        match state {
            BufferState::Empty | BufferState::Initializing | BufferState::NotPlanned => {
                // Not planned (or nothing there): wait for back-planning.
                return false;
            }
            BufferState::Running => {
                // Plan at most one move past the runner.
                entry = queue.block(idx).exit_velocity;
                crossed_runner = true;
                idx = queue.next_index(idx);
            }
            BufferState::BackPlanned => {
                let block = queue.block_mut(idx);
                if block.is_move() {
                    ramp(block, entry);
                    trace!(
                        index = idx,
                        entry,
                        cruise = block.cruise_velocity,
                        exit = block.exit_velocity,
                        hint = ?block.hint,
                        "forward-planned"
                    );
                    return true;
                }
                // Commands and stops plan trivially; keep walking to the
                // trailing move.
                if block.forces_stop() {
                    entry = 0.0;
                }
                block.hint = PlanHint::CommandBlock;
                block.buffer_state = BufferState::FullyPlanned;
                idx = queue.next_index(idx);
            }
            BufferState::FullyPlanned => {
                let block = queue.block(idx);
                if block.is_move() {
                    // Already ramped. Beyond the runner we stop here; at the
                    // run cursor we also stop (the next block is planned only
                    // once this one is running).
                    return false;
                }
                if block.forces_stop() {
                    entry = 0.0;
                }
                if crossed_runner {
                    // Don't run ahead through command chains either.
                    return false;
                }
                idx = queue.next_index(idx);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockType, StopKind};
    use crate::zoid::jerk_time_factor;

    const JERK: f64 = 100_000.0;

    fn push_move(q: &mut PlannerQueue, length: f64, vmax: f64, junction: f64) {
        let b = q.allocate().expect("queue full");
        b.set_aline_geometry(length, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        b.set_jerk(JERK);
        b.cruise_vset = vmax;
        b.cruise_vmax = vmax;
        b.absolute_vmax = vmax;
        b.junction_vmax = junction;
        q.commit(0.0);
    }

    fn push_stop(q: &mut PlannerQueue) {
        let b = q.allocate().expect("queue full");
        b.block_type = BlockType::Dwell;
        b.dwell_seconds = 0.5;
        b.stop = Some(StopKind::Stop);
        q.commit(0.0);
    }

    #[test]
    fn single_move_plans_to_zero_exit() {
        let mut q = PlannerQueue::new();
        push_move(&mut q, 100.0, 100.0, f64::MAX);
        backplan(&mut q);
        let b = q.block(q.running_index());
        assert_eq!(b.buffer_state, BufferState::BackPlanned);
        assert_eq!(b.exit_velocity, 0.0);
        assert!(plan_forward(&mut q, 0.0));
        let b = q.block(q.running_index());
        assert_eq!(b.buffer_state, BufferState::FullyPlanned);
        assert_eq!(b.cruise_velocity, 100.0);
    }

    #[test]
    fn colinear_chain_carries_cruise_through_boundaries() {
        let mut q = PlannerQueue::new();
        // 20 colinear short moves; junctions wide open.
        for _ in 0..20 {
            push_move(&mut q, 0.5, 200.0, f64::MAX);
        }
        backplan(&mut q);
        // Boundary velocities decline monotonically toward the mandatory
        // stop at the end of the queue; the front of the chain runs fast.
        let mut idx = q.running_index();
        let mut prev = f64::MAX;
        for i in 0..20 {
            let v = q.block(idx).exit_velocity;
            assert!(v <= prev + 1e-9, "block {i} exit {v} rose above {prev}");
            prev = v;
            idx = q.next_index(idx);
        }
        let first = q.block(q.running_index()).exit_velocity;
        assert!(first > 100.0, "front of chain too slow: {first}");
        assert_eq!(prev, 0.0);
    }

    #[test]
    fn sharp_corner_pins_boundary_velocity() {
        let mut q = PlannerQueue::new();
        push_move(&mut q, 10.0, 100.0, f64::MAX);
        // 90-degree corner: tiny junction limit on the second block.
        push_move(&mut q, 10.0, 100.0, 0.5);
        backplan(&mut q);
        let first = q.block(q.running_index());
        assert!(first.exit_velocity <= 0.5 + 1e-9);
    }

    #[test]
    fn exit_limited_by_next_block_braking_distance() {
        let mut q = PlannerQueue::new();
        push_move(&mut q, 100.0, 200.0, f64::MAX);
        // Short closer: the first block must exit slow enough that 1 mm can
        // brake to zero.
        push_move(&mut q, 1.0, 200.0, f64::MAX);
        backplan(&mut q);
        let first = q.block(q.running_index());
        let k = jerk_time_factor(JERK);
        let max_entry = target_velocity(0.0, 1.0, k);
        assert!(first.exit_velocity <= max_entry + 1e-9);
        assert!(first.exit_velocity > 0.0);
    }

    #[test]
    fn stop_blocks_force_zero_and_commands_pass_through() {
        let mut q = PlannerQueue::new();
        push_move(&mut q, 50.0, 100.0, f64::MAX);
        push_stop(&mut q);
        push_move(&mut q, 50.0, 100.0, f64::MAX);
        backplan(&mut q);
        let first = q.block(q.running_index());
        assert_eq!(first.exit_velocity, 0.0);

        // Forward planning walks through the dwell and ramps the first move.
        assert!(plan_forward(&mut q, 0.0));
        assert_eq!(
            q.block(q.running_index()).buffer_state,
            BufferState::FullyPlanned
        );
    }

    #[test]
    fn forward_plans_only_one_ahead_of_runner() {
        let mut q = PlannerQueue::new();
        push_move(&mut q, 10.0, 100.0, f64::MAX);
        push_move(&mut q, 10.0, 100.0, 100.0);
        push_move(&mut q, 10.0, 100.0, 100.0);
        backplan(&mut q);
        assert!(plan_forward(&mut q, 0.0));
        // Mark the first as running, as the executor would.
        let idx = q.running_index();
        q.block_mut(idx).buffer_state = BufferState::Running;
        q.block_mut(idx).plannable = false;
        assert!(plan_forward(&mut q, 0.0));
        let second = q.next_index(idx);
        assert_eq!(q.block(second).buffer_state, BufferState::FullyPlanned);
        // The third stays back-planned: only one ahead.
        let third = q.next_index(second);
        assert!(!plan_forward(&mut q, 0.0));
        assert_eq!(q.block(third).buffer_state, BufferState::BackPlanned);
    }

    #[test]
    fn convergence_stops_the_walk() {
        let mut q = PlannerQueue::new();
        for _ in 0..10 {
            push_move(&mut q, 5.0, 100.0, 40.0);
        }
        backplan(&mut q);
        let snapshot: Vec<f64> = (0..10)
            .scan(q.running_index(), |idx, _| {
                let v = q.block(*idx).exit_velocity;
                *idx = q.next_index(*idx);
                Some(v)
            })
            .collect();
        // A second pass with no new arrivals must not move anything.
        backplan(&mut q);
        let again: Vec<f64> = (0..10)
            .scan(q.running_index(), |idx, _| {
                let v = q.block(*idx).exit_velocity;
                *idx = q.next_index(*idx);
                Some(v)
            })
            .collect();
        assert_eq!(snapshot, again);
    }
}
