//! The planner ring.
//!
//! A fixed-capacity ring of [`Block`]s addressed by index (no pointers, no
//! links). Two cursors partition it:
//!
//! * `w`: next slot to initialize. Written only by the canonical-machine
//!   side (main loop).
//! * `r`: the running block, or the next block to run. Written only by the
//!   executor.
//!
//! Admission applies back-pressure: [`PlannerQueue::allocate`] refuses a slot
//! while fewer than [`crate::PLANNER_HEADROOM`] + 1 remain, which guarantees
//! the back-planner always has look-ahead depth to work with. Blocks are
//! never dropped.

use crate::block::{Block, BufferState};
use crate::{PLANNER_HEADROOM, PLANNER_QUEUE_SIZE};

/// Capacity of the secondary ring used while a feed hold is in force.
pub const SECONDARY_QUEUE_SIZE: usize = 12;

/// Ring buffer of planner blocks. See the module docs for the cursor
/// discipline.
#[derive(Debug)]
pub struct PlannerQueue {
    blocks: Vec<Block>,
    /// Next slot to initialize.
    w: usize,
    /// Currently running block, or next to run.
    r: usize,
    /// Time of the most recent commit, seconds on the caller's clock.
    last_arrival: f64,
}

impl Default for PlannerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlannerQueue {
    /// Primary queue, [`PLANNER_QUEUE_SIZE`] slots.
    pub fn new() -> Self {
        Self::with_capacity(PLANNER_QUEUE_SIZE)
    }

    /// A queue with a specific capacity (the feed-hold secondary ring uses
    /// [`SECONDARY_QUEUE_SIZE`]).
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > PLANNER_HEADROOM + 1);
        Self {
            blocks: vec![Block::default(); capacity],
            w: 0,
            r: 0,
            last_arrival: 0.0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    /// Committed blocks currently in the ring.
    pub fn queued(&self) -> usize {
        (self.w + self.capacity() - self.r) % self.capacity()
    }

    /// Empty slots.
    pub fn available(&self) -> usize {
        self.capacity() - self.queued()
    }

    /// True when a new block may be admitted: admission refuses while only
    /// the headroom remains, so the ring cannot wrap into the run cursor.
    pub fn has_room(&self) -> bool {
        self.available() > PLANNER_HEADROOM
    }

    pub fn is_empty(&self) -> bool {
        self.queued() == 0
    }

    pub fn last_arrival(&self) -> f64 {
        self.last_arrival
    }

    pub fn next_index(&self, i: usize) -> usize {
        (i + 1) % self.capacity()
    }

    pub fn prev_index(&self, i: usize) -> usize {
        (i + self.capacity() - 1) % self.capacity()
    }

    pub fn running_index(&self) -> usize {
        self.r
    }

    /// Newest committed block, if any.
    pub fn newest_index(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.prev_index(self.w))
        }
    }

    pub fn block(&self, i: usize) -> &Block {
        &self.blocks[i]
    }

    pub fn block_mut(&mut self, i: usize) -> &mut Block {
        &mut self.blocks[i]
    }

    /// Claims the write slot for filling. Returns `None` under back-pressure;
    /// the caller yields and retries on a later pass.
    pub fn allocate(&mut self) -> Option<&mut Block> {
        if !self.has_room() {
            return None;
        }
        let block = &mut self.blocks[self.w];
        debug_assert_eq!(block.buffer_state, BufferState::Empty);
        block.reset();
        block.buffer_state = BufferState::Initializing;
        block.plannable = true;
        Some(block)
    }

    /// Publishes the filled write slot to the planner.
    pub fn commit(&mut self, now: f64) {
        let block = &mut self.blocks[self.w];
        debug_assert_eq!(block.buffer_state, BufferState::Initializing);
        block.buffer_state = BufferState::NotPlanned;
        self.w = self.next_index(self.w);
        self.last_arrival = now;
    }

    /// Abandons a claimed-but-unfilled write slot.
    pub fn abort_write(&mut self) {
        let block = &mut self.blocks[self.w];
        if block.buffer_state == BufferState::Initializing {
            block.reset();
        }
    }

    /// The block at the run cursor, if one is committed.
    pub fn running(&self) -> Option<&Block> {
        let block = &self.blocks[self.r];
        (block.buffer_state > BufferState::Initializing).then_some(block)
    }

    pub fn running_mut(&mut self) -> Option<&mut Block> {
        let block = &mut self.blocks[self.r];
        (block.buffer_state > BufferState::Initializing).then_some(block)
    }

    /// Executor release: the run block returns to `Empty` and the cursor
    /// advances. Only called by the exec context.
    pub fn free_running(&mut self) {
        debug_assert!(self.blocks[self.r].buffer_state > BufferState::Initializing);
        self.blocks[self.r].reset();
        self.r = self.next_index(self.r);
    }

    /// Discards every queued block (alarm / queue-flush path). The write slot
    /// is reset as well; the executor must have released its block first.
    pub fn flush(&mut self) {
        for block in &mut self.blocks {
            block.reset();
        }
        self.w = 0;
        self.r = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockType;

    #[test]
    fn admission_preserves_headroom() {
        let mut q = PlannerQueue::new();
        let mut admitted = 0;
        while q.allocate().is_some() {
            q.commit(0.0);
            admitted += 1;
        }
        assert_eq!(admitted, PLANNER_QUEUE_SIZE - PLANNER_HEADROOM);
        assert_eq!(q.available(), PLANNER_HEADROOM);
    }

    #[test]
    fn fifo_order_and_release() {
        let mut q = PlannerQueue::new();
        for i in 0..3 {
            let b = q.allocate().unwrap();
            b.block_type = BlockType::Aline;
            b.length = i as f64 + 1.0;
            q.commit(0.0);
        }
        assert_eq!(q.queued(), 3);
        assert_eq!(q.running().unwrap().length, 1.0);
        q.free_running();
        assert_eq!(q.running().unwrap().length, 2.0);
        q.free_running();
        q.free_running();
        assert!(q.running().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn ring_wraps() {
        let mut q = PlannerQueue::with_capacity(8);
        for round in 0..5 {
            for _ in 0..2 {
                let b = q.allocate().unwrap();
                b.block_type = BlockType::Aline;
                q.commit(round as f64);
            }
            q.free_running();
            q.free_running();
        }
        assert!(q.is_empty());
        assert_eq!(q.last_arrival(), 4.0);
    }
}
