//! Parsing of Go-style duration strings (`300ms`, `10m`, `1h30m`, `1.5h`) used in query strings.

use std::time::Duration;

use crate::error::{AgentError, Result};

/// Parses a sequence of `<decimal><unit>` terms. Units: ns, us/µs, ms, s, m, h.
/// A bare `0` is accepted; negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || AgentError::InvalidDuration(input.to_string());

    let mut s = input.strip_prefix('+').unwrap_or(input);
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() || s.starts_with('-') {
        return Err(invalid());
    }

    let mut nanos = 0f64;
    while !s.is_empty() {
        let num_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let number = &s[..num_end];
        if number.is_empty() || number == "." {
            return Err(invalid());
        }
        let value: f64 = number.parse().map_err(|_| invalid())?;
        s = &s[num_end..];

        let unit_end = s
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(s.len());
        let scale = match &s[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3_600e9,
            _ => return Err(invalid()),
        };
        nanos += value * scale;
        s = &s[unit_end..];
    }

    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}
