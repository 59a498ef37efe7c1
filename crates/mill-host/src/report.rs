//! Status reports.
//!
//! Rate-limited JSON objects describing machine state, positions and
//! velocity, emitted over the same channel as command responses. The LED
//! blink period mirrors the machine state for headless diagnosis.

use crate::machine::{Machine, MachineState};
use motion::{HoldState, PlannerQueue, Runtime, AXES};
use serde::Serialize;

/// One status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: MachineState,
    pub hold: HoldState,
    pub line: Option<u32>,
    /// Work-coordinate position.
    pub position: [f64; AXES],
    /// Machine-coordinate position.
    pub machine_position: [f64; AXES],
    /// Current path velocity, mm/s.
    pub velocity: f64,
    /// Planner depth (committed blocks).
    pub queue_depth: usize,
    /// Status LED blink period for this state, ms.
    pub led_blink_ms: u32,
}

impl StatusReport {
    pub fn build(machine: &Machine, runtime: &Runtime, queue: &PlannerQueue) -> Self {
        let offset = machine.work_offset();
        let machine_position = runtime.position();
        let position = core::array::from_fn(|i| machine_position[i] - offset[i]);
        Self {
            state: machine.state(),
            hold: runtime.hold_state(),
            line: machine.gm.line_number,
            position,
            machine_position,
            velocity: runtime.velocity(),
            queue_depth: queue.queued(),
            led_blink_ms: machine.state().led_blink_ms(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Rate limiter for periodic reports.
#[derive(Debug)]
pub struct Reporter {
    interval: f64,
    last: f64,
}

impl Reporter {
    pub fn new(interval: f64) -> Self {
        Self {
            interval,
            last: f64::NEG_INFINITY,
        }
    }

    /// True when a periodic report is due at `now`; arms the next one.
    pub fn due(&mut self, now: f64) -> bool {
        if self.interval <= 0.0 {
            return false;
        }
        if now - self.last >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}
