//! Machine configuration loader.
//!
//! INI-style configuration with `[machine]`, per-axis `[axis_x]`..`[axis_c]`
//! and per-motor `[motor_1]`..`[motor_4]` sections. Every field has a
//! default; a value that fails its range check is rejected with a warning and
//! the field keeps its prior value (a bad config line never poisons the
//! machine).

use anyhow::{Context, Result};
use configparser::ini::Ini;
use motion::{CartesianKinematics, CoreXyKinematics, Kinematics, AXES};
use std::path::Path;
use stepper::MOTORS;
use tracing::warn;

/// Corner-velocity heuristic bounds, seconds.
pub const JUNCTION_INTEGRATION_MIN: f64 = 0.05;
pub const JUNCTION_INTEGRATION_MAX: f64 = 2.0;

const AXIS_NAMES: [&str; AXES] = ["x", "y", "z", "a", "b", "c"];

/// Per-axis kinematic limits and travel range.
#[derive(Debug, Clone, Copy)]
pub struct AxisConfig {
    /// mm/s (deg/s for rotary axes).
    pub velocity_max: f64,
    /// mm/s^3.
    pub jerk_max: f64,
    pub travel_min: f64,
    pub travel_max: f64,
    /// Position taken after a homing seek completes.
    pub home_position: f64,
    /// Homing seek feed, mm/s.
    pub homing_feed: f64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            velocity_max: 250.0,
            jerk_max: 100_000.0,
            travel_min: 0.0,
            travel_max: 400.0,
            home_position: 0.0,
            homing_feed: 15.0,
        }
    }
}

/// Per-motor mapping and scale.
#[derive(Debug, Clone, Copy)]
pub struct MotorConfig {
    /// Which axis this motor follows (Cartesian kinematics).
    pub axis: usize,
    pub steps_per_unit: f64,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            axis: 0,
            steps_per_unit: 80.0,
        }
    }
}

/// The whole machine configuration.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// "cartesian" or "corexy".
    pub kinematics: String,
    /// Corner heuristic tuning, clamped to the junction-integration bounds.
    pub junction_integration_time: f64,
    /// Max chord-to-arc deviation when decomposing arcs, mm.
    pub chordal_tolerance: f64,
    /// Honor the `/` block-delete flag.
    pub block_delete: bool,
    /// Enforce per-axis travel limits on programmed targets.
    pub soft_limits: bool,
    /// Status report interval, seconds; zero disables periodic reports.
    pub report_interval: f64,
    /// Settling dwell armed when a feed hold is released, seconds; zero
    /// disables it. Consumed at the next loader cycle while idle.
    pub hold_exit_dwell: f64,
    pub axes: [AxisConfig; AXES],
    pub motors: [MotorConfig; MOTORS],
}

impl Default for MachineConfig {
    fn default() -> Self {
        let mut motors = [MotorConfig::default(); MOTORS];
        for (i, motor) in motors.iter_mut().enumerate() {
            motor.axis = i.min(AXES - 1);
        }
        Self {
            kinematics: "cartesian".to_string(),
            junction_integration_time: 0.1,
            chordal_tolerance: 0.01,
            block_delete: true,
            soft_limits: false,
            report_interval: 0.25,
            hold_exit_dwell: 0.0,
            axes: [AxisConfig::default(); AXES],
            motors,
        }
    }
}

impl MachineConfig {
    /// Loads and merges a configuration file over the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("failed to load configuration file {path:?}"))?;
        let mut config = Self::default();
        config.merge(&ini);
        Ok(config)
    }

    fn merge(&mut self, ini: &Ini) {
        if let Some(kin) = ini.get("machine", "kinematics") {
            match kin.as_str() {
                "cartesian" | "corexy" => self.kinematics = kin,
                other => warn!("unknown kinematics '{other}', keeping {}", self.kinematics),
            }
        }
        merge_float(
            ini,
            "machine",
            "junction_integration_time",
            &mut self.junction_integration_time,
            JUNCTION_INTEGRATION_MIN..=JUNCTION_INTEGRATION_MAX,
        );
        merge_float(
            ini,
            "machine",
            "chordal_tolerance",
            &mut self.chordal_tolerance,
            1e-4..=1.0,
        );
        merge_float(
            ini,
            "machine",
            "report_interval",
            &mut self.report_interval,
            0.0..=60.0,
        );
        merge_float(
            ini,
            "machine",
            "hold_exit_dwell",
            &mut self.hold_exit_dwell,
            0.0..=10.0,
        );
        merge_bool(ini, "machine", "block_delete", &mut self.block_delete);
        merge_bool(ini, "machine", "soft_limits", &mut self.soft_limits);

        for (i, axis) in self.axes.iter_mut().enumerate() {
            let section = format!("axis_{}", AXIS_NAMES[i]);
            merge_float(ini, &section, "velocity_max", &mut axis.velocity_max, 0.001..=10_000.0);
            merge_float(ini, &section, "jerk_max", &mut axis.jerk_max, 1.0..=1e9);
            merge_float(ini, &section, "travel_min", &mut axis.travel_min, -1e6..=1e6);
            merge_float(ini, &section, "travel_max", &mut axis.travel_max, -1e6..=1e6);
            merge_float(ini, &section, "home_position", &mut axis.home_position, -1e6..=1e6);
            merge_float(ini, &section, "homing_feed", &mut axis.homing_feed, 0.001..=1_000.0);
        }

        for (i, motor) in self.motors.iter_mut().enumerate() {
            let section = format!("motor_{}", i + 1);
            merge_float(ini, &section, "steps_per_unit", &mut motor.steps_per_unit, 0.001..=100_000.0);
            if let Some(name) = ini.get(&section, "axis") {
                match AXIS_NAMES.iter().position(|&n| n == name) {
                    Some(axis) => motor.axis = axis,
                    None => warn!("[{section}] axis '{name}' unknown, keeping previous"),
                }
            }
        }
    }

    /// Builds the kinematic model this configuration describes.
    pub fn build_kinematics(&self) -> Box<dyn Kinematics> {
        let steps: [f64; MOTORS] = core::array::from_fn(|m| self.motors[m].steps_per_unit);
        if self.kinematics == "corexy" {
            Box::new(CoreXyKinematics { steps_per_unit: steps })
        } else {
            Box::new(CartesianKinematics {
                steps_per_unit: steps,
                motor_axis: core::array::from_fn(|m| self.motors[m].axis),
            })
        }
    }
}

fn merge_float(
    ini: &Ini,
    section: &str,
    key: &str,
    slot: &mut f64,
    range: std::ops::RangeInclusive<f64>,
) {
    match ini.getfloat(section, key) {
        Ok(Some(value)) if range.contains(&value) => *slot = value,
        Ok(Some(value)) => {
            warn!("[{section}] {key} = {value} outside {range:?}, keeping {slot}");
        }
        Ok(None) => {}
        Err(e) => warn!("[{section}] {key}: {e}, keeping {slot}"),
    }
}

fn merge_bool(ini: &Ini, section: &str, key: &str, slot: &mut bool) {
    match ini.getbool(section, key) {
        Ok(Some(value)) => *slot = value,
        Ok(None) => {}
        Err(e) => warn!("[{section}] {key}: {e}, keeping {slot}"),
    }
}
