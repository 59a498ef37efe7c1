//! # Mill Host
//!
//! The machine-level layer over the motion core: the canonical machine
//! (G-code modal state, offsets, coordinate systems, arc decomposition), the
//! cooperative controller loop that ties parser, planner, executor and
//! stepper engine together, configuration loading, serial line assembly and
//! status reporting.
//!
//! The `mill-host` binary drives a [`controller::Controller`] from a G-code
//! file or stdin against a virtual clock; the `sim` crate drives the same
//! controller deterministically for the end-to-end tests.

pub mod arc;
pub mod config;
pub mod controller;
pub mod machine;
#[cfg(feature = "marlin")]
pub mod marlin;
pub mod report;
pub mod serial;

pub use config::MachineConfig;
pub use controller::{Controller, ControllerStatus};
pub use machine::{Machine, MachineError, MachineState};
pub use report::StatusReport;
