use std::time::Duration;

use crate::error::DurationError;

const UNITS: [(&str, u128); 7] = [
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 3600 * 1_000_000_000),
];

/// Parses durations written as a sequence of decimal numbers with units,
/// e.g. `300ms`, `1.5h` or `2h45m`. A bare `0` is allowed.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let err = |reason| DurationError { input: input.to_string(), reason };
    let s = input.trim();
    if s.is_empty() {
        return Err(err("empty"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut rest = s;
    let mut total: u128 = 0;
    while !rest.is_empty() {
        let num_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if num_len == 0 {
            return Err(err("expected a number"));
        }
        let (whole, frac) = match rest[..num_len].split_once('.') {
            Some((w, f)) => (w, f),
            None => (&rest[..num_len], ""),
        };
        if (whole.is_empty() && frac.is_empty()) || frac.contains('.') {
            return Err(err("invalid number"));
        }
        let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| err("invalid number"))? };
        let frac_value: u128 = if frac.is_empty() { 0 } else { frac.parse().map_err(|_| err("invalid number"))? };
        let frac_scale = 10u128.checked_pow(frac.len() as u32).ok_or_else(|| err("invalid number"))?;
        rest = &rest[num_len..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        if unit_len == 0 {
            return Err(err("missing unit"));
        }
        let unit = &rest[..unit_len];
        let scale = UNITS.iter().find(|(name, _)| *name == unit).map(|(_, scale)| *scale).ok_or_else(|| err("unknown unit"))?;
        let part = whole.checked_mul(scale).and_then(|w| w.checked_add(frac_value.checked_mul(scale)? / frac_scale));
        total = part.and_then(|p| total.checked_add(p)).ok_or_else(|| err("overflow"))?;
        rest = &rest[unit_len..];
    }
    let secs = u64::try_from(total / 1_000_000_000).map_err(|_| err("overflow"))?;
    Ok(Duration::new(secs, (total % 1_000_000_000) as u32))
}

/// Inverse of [`parse_duration`] for whole durations: `1h2m3s`, `90s` -> `1m30s`,
/// sub-second values as `500ms`.
pub fn display_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d < Duration::from_secs(1) {
        let ms = d.as_millis();
        if ms > 0 && d.subsec_nanos() % 1_000_000 == 0 {
            return format!("{ms}ms");
        }
        return format!("{}µs", d.as_micros());
    }

    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let millis = d.subsec_millis();
    let seconds = if millis > 0 { format!("{s}.{millis:03}").trim_end_matches('0').to_string() } else { s.to_string() };
    if h > 0 {
        format!("{h}h{m}m{seconds}s")
    } else if m > 0 {
        format!("{m}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h2m3s").unwrap(), Duration::from_secs(3723));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(parse_duration("").unwrap_err().reason, "empty");
        assert_eq!(parse_duration("10").unwrap_err().reason, "missing unit");
        assert_eq!(parse_duration("10y").unwrap_err().reason, "unknown unit");
        assert_eq!(parse_duration("s").unwrap_err().reason, "expected a number");
    }

    #[test]
    fn displays_like_it_parses() {
        assert_eq!(display_duration(Duration::from_secs(5)), "5s");
        assert_eq!(display_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(display_duration(Duration::from_secs(3723)), "1h2m3s");
        assert_eq!(display_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(display_duration(Duration::from_millis(1500)), "1.5s");
    }
}
