// SPDX-License-Identifier: Apache-2.0
//! Parser for "Flux Standard Duration" strings (`"30s"`, `"5m"`, `"1h"`),
//! scoped to what `--retry-busy` needs: no calendar arithmetic, just a
//! number and a unit suffix.

use std::time::Duration;

/// Parse a duration string like `"30s"`, `"5m"`, `"1.5h"`, or a bare
/// number of seconds (`"30"`).
pub fn parse(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let (number, unit) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&s[..s.len() - 1], c),
        _ => (s, 's'),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    if value < 0.0 {
        return Err(format!("negative duration: {s}"));
    }
    let seconds = match unit {
        's' => value,
        'm' => value * 60.0,
        'h' => value * 3600.0,
        'd' => value * 86400.0,
        other => return Err(format!("unknown duration unit '{other}'")),
    };
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_minutes_hours() {
        assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn rejects_unknown_unit_and_negative_values() {
        assert!(parse("5x").is_err());
        assert!(parse("-1s").is_err());
    }
}
