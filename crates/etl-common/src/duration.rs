//! Human-readable durations (`5m`, `45s`, `1m30s`, `300ms`)
//!
//! Timeouts travel on the wire as short strings in the same shape the control
//! plane prints them. A bare number is read as seconds.

use std::time::Duration;

/// Parse a duration string such as `5m`, `1h30m`, `250ms` or `30`.
///
/// Returns a message suitable for embedding in a validation error.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration is empty".to_string());
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit after '{}'", rest))?;
        if digits == 0 {
            return Err(format!("expected a number at '{}'", rest));
        }
        let number = &rest[..digits];
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let millis_per_unit: u64 = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            other => return Err(format!("unknown unit '{}'", other)),
        };

        let part = match number.parse::<u64>() {
            Ok(whole) => whole
                .checked_mul(millis_per_unit)
                .map(Duration::from_millis)
                .ok_or_else(|| format!("'{}{}' is too large", number, unit))?,
            Err(_) => {
                let value: f64 = number
                    .parse()
                    .map_err(|_| format!("'{}' is not a number", number))?;
                Duration::try_from_secs_f64(value * millis_per_unit as f64 / 1000.0)
                    .map_err(|_| format!("'{}{}' is out of range", number, unit))?
            },
        };
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("'{}' is too large", s))?;
    }

    Ok(total)
}

/// Render a duration in the shortest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 3_600_000 == 0 && millis > 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 && millis > 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "m", "5x", "five minutes", "-5m", "5m3"] {
            assert!(parse_duration(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_format_picks_largest_exact_unit() {
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
    }

    proptest::proptest! {
        #[test]
        fn prop_parse_never_panics(input in ".{0,16}") {
            let _ = parse_duration(&input);
        }

        #[test]
        fn prop_formatted_durations_parse_back(millis in 0u64..10_000_000) {
            let d = Duration::from_millis(millis);
            proptest::prop_assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }
}
