//! # Simulator
//!
//! Runs the whole pipeline (serial bytes, parser, canonical machine,
//! planner, executor, DDA) against a virtual clock, with recording
//! implementations of every hardware seam. Two runs with the same inputs
//! produce bit-identical pulse trains, which is what the end-to-end tests
//! lean on.

pub mod hal;
pub mod harness;

pub use hal::{Pulse, RecordingOutput, RecordingSink, SimProbe};
pub use harness::{Sample, SimEvent, Simulator};
