//! Marlin dialect shim (enabled by the `marlin` cargo feature).
//!
//! Translates the handful of Marlin idioms worth accepting into the native
//! dialect before parsing. Heater and fan codes have no native counterpart
//! (peripherals live behind command sinks), so they surface as operator
//! messages in queue order instead of being rejected.

/// Rewrites one Marlin-flavored line into the native dialect.
pub fn translate(line: &str) -> String {
    let trimmed = line.trim();
    let upper = trimmed.to_ascii_uppercase();
    let first = upper.split_whitespace().next().unwrap_or("");
    match first {
        // Marlin G28 is a homing cycle, bare form homes everything.
        "G28" => {
            let axes: String = upper
                .split_whitespace()
                .skip(1)
                .filter_map(|word| word.chars().next())
                .filter(|c| matches!(c, 'X' | 'Y' | 'Z'))
                .map(|c| format!("{c}0"))
                .collect();
            if axes.is_empty() {
                "G28.2X0Y0Z0".to_string()
            } else {
                format!("G28.2{axes}")
            }
        }
        "M104" | "M109" | "M140" | "M190" | "M106" | "M107" => {
            format!("(MSG marlin {trimmed})")
        }
        _ => line.to_string(),
    }
}
