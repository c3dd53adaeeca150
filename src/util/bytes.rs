//! Utility helpers for byte counts: human-readable formatting and size strings.

use thiserror::Error;

/// Failure to interpret a configured size string such as `"2GB"`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid size `{input}`: expected a number followed by b, kb, mb, gb, tb or pb")]
pub struct ParseSizeError {
    input: String,
}

/// Format a byte count into IEC units (KiB, MiB, GiB, TiB) with trimmed precision.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit_index = 0;

    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        return format!("{bytes} {}", UNITS[unit_index]);
    }

    let mut value_str = if value >= 10.0 {
        format!("{value:.1}")
    } else {
        format!("{value:.2}")
    };

    if value_str.contains('.') {
        while value_str.ends_with('0') {
            value_str.pop();
        }
        if value_str.ends_with('.') {
            value_str.pop();
        }
    }

    format!("{value_str} {}", UNITS[unit_index])
}

/// Parse a decimal size string (`"500kb"`, `"2 GB"`, `"1.5mb"`) into bytes.
///
/// Units are powers of ten, matching how operators size volumes. Fractional
/// values are truncated after scaling.
pub fn parse_size(input: &str) -> Result<u64, ParseSizeError> {
    let invalid = || ParseSizeError {
        input: input.to_string(),
    };

    let trimmed = input.trim().to_ascii_lowercase();
    let split_at = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(invalid)?;
    let (number, unit) = trimmed.split_at(split_at);

    let multiplier: u64 = match unit.trim_start() {
        "b" => 1,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "tb" => 1_000_000_000_000,
        "pb" => 1_000_000_000_000_000,
        _ => return Err(invalid()),
    };

    if number.is_empty() || number.starts_with('.') || number.ends_with('.') {
        return Err(invalid());
    }

    match number.split_once('.') {
        None => number
            .parse::<u64>()
            .ok()
            .and_then(|value| value.checked_mul(multiplier))
            .ok_or_else(invalid),
        Some((whole, fraction)) => {
            if fraction.contains('.') {
                return Err(invalid());
            }
            let value: f64 = number.parse().map_err(|_| invalid())?;
            let scaled = value * multiplier as f64;
            if !scaled.is_finite() || scaled > u64::MAX as f64 || whole.is_empty() {
                return Err(invalid());
            }
            Ok(scaled as u64)
        }
    }
}
