//! End-to-end scenarios through the full pipeline: serial bytes to pulse
//! trains, on the virtual clock.

use gcode::normalize::checksum;
use mill_host::{MachineConfig, MachineState};
use motion::zoid::{braking_length, jerk_time_factor};
use sim::{SimEvent, Simulator};

const STEPS_PER_MM: f64 = 80.0;
const JERK: f64 = 100_000.0;

fn sim() -> Simulator {
    let mut config = MachineConfig::default();
    config.report_interval = 0.0;
    for axis in &mut config.axes {
        axis.jerk_max = JERK;
    }
    Simulator::new(config)
}

#[test]
fn straight_line_profile() {
    let mut s = sim();
    s.load_program("G21 G90 G0 X0 Y0 Z0\nG1 X100 F6000\n");
    s.run(10.0).unwrap();

    // 100 mm at 80 steps/mm.
    assert!((s.net_steps()[0] - 8000).abs() <= 1, "steps {}", s.net_steps()[0]);
    assert_eq!(s.net_steps()[1], 0);
    let pos = s.controller.runtime.position();
    assert!((pos[0] - 100.0).abs() < 1e-9);

    // Cruise reaches the programmed 100 mm/s and no more.
    let peak = s.peak_velocity();
    assert!(peak <= 100.0 + 1e-6, "peak {peak}");
    assert!(peak > 99.0, "never cruised: {peak}");

    // Total time exceeds the pure-cruise bound by the two jerk ramps.
    let ramp = jerk_time_factor(JERK) * 100.0_f64.sqrt();
    let end = s.samples.last().unwrap().t;
    assert!(end > 1.0 && end < 1.0 + 2.0 * ramp, "took {end}s");
}

#[test]
fn sharp_corner_slows_to_junction_limit() {
    let mut s = sim();
    s.load_program("G21 G90 G1 X10 F6000\nG1 Y10\n");
    s.run(10.0).unwrap();

    let pos = s.controller.runtime.position();
    assert!((pos[0] - 10.0).abs() < 1e-9 && (pos[1] - 10.0).abs() < 1e-9);

    // Velocity through the 90-degree corner dips to the junction limit but
    // not to a stop.
    let corner_min = s
        .samples
        .iter()
        .filter(|smp| smp.position[0] > 9.5 && smp.position[1] < 0.5)
        .map(|smp| smp.velocity)
        .fold(f64::MAX, f64::min);
    assert!(corner_min < 65.0, "no corner slowdown: {corner_min}");
    assert!(corner_min > 20.0, "corner stopped dead: {corner_min}");
}

#[test]
fn colinear_chain_cruises_through_boundaries() {
    let mut s = sim();
    let mut program = String::from("G21 G90 F12000\n");
    for i in 1..=200 {
        program.push_str(&format!("G1 X{:.1}\n", i as f64 * 0.5));
    }
    s.load_program(&program);
    s.run(10.0).unwrap();

    assert!((s.net_steps()[0] - 8000).abs() <= 1);
    // Steady cruise across the middle of the chain: no boundary dips.
    let mid_min = s
        .samples
        .iter()
        .filter(|smp| smp.position[0] > 20.0 && smp.position[0] < 80.0)
        .map(|smp| smp.velocity)
        .fold(f64::MAX, f64::min);
    assert!(mid_min > 150.0, "boundary dip to {mid_min} mm/s");
    assert!(s.peak_velocity() > 190.0);
}

#[test]
fn feed_hold_decelerates_then_resumes_to_exact_length() {
    let mut s = sim();
    s.load_program("G21 G90 G1 X100 F6000\n");
    s.at(0.3, SimEvent::FeedHold);
    s.at(1.5, SimEvent::CycleStart);
    s.run(10.0).unwrap();

    // Deceleration was monotonic after the hold request.
    let mut decel_samples: Vec<f64> = s
        .samples
        .iter()
        .filter(|smp| smp.t > 0.3 && smp.t < 1.4 && smp.velocity > 0.0)
        .map(|smp| smp.velocity)
        .collect();
    let original = decel_samples.clone();
    decel_samples.sort_by(|a, b| b.partial_cmp(a).unwrap());
    assert_eq!(original, decel_samples, "deceleration was not monotonic");

    // Stop distance bounded by the braking length from cruise.
    let hold_position = s
        .samples
        .iter()
        .find(|smp| smp.t >= 0.3)
        .map(|smp| smp.position[0])
        .unwrap();
    let stop_position = s
        .samples
        .iter()
        .filter(|smp| smp.t < 1.5)
        .last()
        .map(|smp| smp.position[0])
        .unwrap();
    let brake = braking_length(100.0, jerk_time_factor(JERK));
    assert!(
        stop_position - hold_position <= brake + 1.0,
        "overran braking distance: {} > {}",
        stop_position - hold_position,
        brake
    );

    // The resumed move finishes the programmed length exactly.
    let pos = s.controller.runtime.position();
    assert!((pos[0] - 100.0).abs() < 1e-9);
    assert!((s.net_steps()[0] - 8000).abs() <= 1);
    assert_eq!(s.controller.machine.state(), MachineState::Ready);
}

#[test]
fn hold_exit_dwell_settles_before_resume() {
    let mut config = MachineConfig::default();
    config.report_interval = 0.0;
    config.hold_exit_dwell = 0.1;
    for axis in &mut config.axes {
        axis.jerk_max = JERK;
    }
    let mut s = Simulator::new(config);
    s.load_program("G21 G90 G1 X50 F6000\n");
    s.at(0.2, SimEvent::FeedHold);
    s.at(1.0, SimEvent::CycleStart);
    s.run(10.0).unwrap();

    // The armed settling dwell ran at the loader before motion resumed.
    assert!((99..=101).contains(&s.dwell_ticks), "dwelled {}", s.dwell_ticks);
    assert!((s.net_steps()[0] - 4000).abs() <= 1);
}

#[test]
fn dwell_stops_stepping_for_the_programmed_time() {
    let mut s = sim();
    s.load_program("G21 G90 G1 X5 F3000\nG4 P0.5\nG1 X10\n");
    s.run(10.0).unwrap();

    assert!((499..=501).contains(&s.dwell_ticks), "dwelled {}", s.dwell_ticks);
    assert!((s.net_steps()[0] - 800).abs() <= 1);
}

#[test]
fn checksummed_lines() {
    // Valid checksum executes as line 5.
    let mut s = sim();
    let body = "N5 G1 X10 F600";
    s.load_program(&format!("{body}*{}\n", checksum(body.as_bytes())));
    s.run(10.0).unwrap();
    assert!((s.net_steps()[0] - 800).abs() <= 1);
    assert_eq!(s.controller.machine.gm.line_number, Some(5));

    // Corrupted checksum: block rejected, planner untouched.
    let mut s = sim();
    let bad = checksum(body.as_bytes()) ^ 0x11;
    s.load_program(&format!("{body}*{bad}\n"));
    s.run(10.0).unwrap();
    assert_eq!(s.net_steps()[0], 0);
    let errors = s.controller.take_errors();
    assert!(errors.iter().any(|e| e.contains("checksum")), "{errors:?}");
}

#[test]
fn identical_inputs_produce_identical_pulse_trains() {
    let run = || {
        let mut s = sim();
        s.load_program("G21 G90 G1 X25 Y13 F4800\nG1 X0 Y0\n");
        s.run(10.0).unwrap();
        s.out.pulses.clone()
    };
    let first = run();
    let second = run();
    assert_eq!(first.len(), second.len());
    assert_eq!(first, second);
}

#[test]
fn arc_follows_the_circle() {
    let mut s = sim();
    s.load_program("G21 G90 G0 X10\nG3 X0 Y10 I-10 J0 F6000\n");
    s.run(20.0).unwrap();

    let pos = s.controller.runtime.position();
    assert!(pos[0].abs() < 1e-6 && (pos[1] - 10.0).abs() < 1e-6);

    // Sampled positions on the arc stay within chordal tolerance of the
    // circle.
    for smp in s
        .samples
        .iter()
        .filter(|smp| smp.position[0] > 0.5 && smp.position[1] > 0.5)
    {
        let r = (smp.position[0].powi(2) + smp.position[1].powi(2)).sqrt();
        assert!((r - 10.0).abs() < 0.05, "left the circle: r = {r}");
    }

    // X returns to zero: the pulse train nets out.
    assert!(s.net_steps()[0].abs() <= 1);
    assert!((s.net_steps()[1] - 800).abs() <= 1);
}

#[test]
fn probe_stops_on_contact_and_reports() {
    let mut s = sim();
    s.load_program("G21 G90 G38.2 Z-10 F300\n");
    // Contact 3 mm down.
    s.probe_when(|enc| enc[2] <= -(3.0 * STEPS_PER_MM) as i64);
    s.run(10.0).unwrap();

    let result = s.controller.machine.probe_result().expect("no probe result");
    assert!(result.tripped);
    assert!(
        (result.position[2] + 3.0).abs() < 0.1,
        "contact at {}",
        result.position[2]
    );
    // The move stopped early.
    assert!(s.controller.runtime.position()[2] > -4.0);
}

#[test]
fn probe_miss_semantics_follow_the_variant() {
    // G38.3: silent no-op on miss.
    let mut s = sim();
    s.load_program("G38.3 Z-2 F300\n");
    s.run(10.0).unwrap();
    assert_ne!(s.controller.machine.state(), MachineState::Alarm);
    let result = s.controller.machine.probe_result().unwrap();
    assert!(!result.tripped);

    // G38.2: alarm on miss.
    let mut s = sim();
    s.load_program("G38.2 Z-2 F300\n");
    s.run(10.0).unwrap();
    assert_eq!(s.controller.machine.state(), MachineState::Alarm);
}

#[test]
fn program_end_resets_modal_state() {
    let mut s = sim();
    s.load_program("G20 G91 G1 X1 F600\nM30\n");
    s.run(10.0).unwrap();
    assert_eq!(s.controller.machine.state(), MachineState::ProgramEnd);
    // M30 restored absolute distance and the per-minute feed mode; units are
    // not part of the end-of-program reset.
    assert_eq!(s.controller.machine.gm.distance, gcode::DistanceMode::Absolute);
    assert_eq!(
        s.controller.machine.gm.feed_mode,
        gcode::FeedRateMode::UnitsPerMinute
    );
    assert_eq!(s.controller.machine.gm.units, gcode::Units::Inches);
}

#[test]
fn trace_dump_is_valid_json() {
    let mut s = sim();
    s.load_program("G21 G90 G1 X2 F600\n");
    s.run(10.0).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.json");
    s.dump_trace(&path).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let net = value["net_steps"][0].as_i64().unwrap();
    assert!((net - 160).abs() <= 1, "net {net}");
    assert!(value["pulses"].as_array().unwrap().len() >= 159);
}

#[test]
fn commands_and_messages_execute_in_order() {
    let mut s = sim();
    s.load_program("(MSG starting)\nM3 S9000\nG1 X2 F600\nM5\nM30\n");
    s.run(10.0).unwrap();
    let kinds: Vec<String> = s
        .sink
        .commands
        .iter()
        .map(|c| format!("{c:?}").split(['(', ' ']).next().unwrap().to_string())
        .collect();
    assert_eq!(
        kinds,
        vec!["Message", "SpindleSpeed", "SpindleOn", "SpindleOff"]
    );
}
