use std::time::Duration;

const UNITS: [(&str, u128); 7] = [
    ("week", 7 * 24 * 60 * 60 * 1_000_000),
    ("day", 24 * 60 * 60 * 1_000_000),
    ("hour", 60 * 60 * 1_000_000),
    ("minute", 60 * 1_000_000),
    ("second", 1_000_000),
    ("millisecond", 1_000),
    ("microsecond", 1),
];

/// Human form of a build duration limited to its two most significant units,
/// e.g. `2 minutes 5 seconds` or `340 milliseconds 12 microseconds`.
pub fn format_build_duration(d: Duration) -> String {
    let mut rest = d.as_micros();
    let mut parts = Vec::with_capacity(2);
    for (unit, size) in UNITS {
        if parts.len() == 2 {
            break;
        }
        let n = rest / size;
        rest %= size;
        if n == 0 {
            continue;
        }
        let plural = if n == 1 { "" } else { "s" };
        parts.push(format!("{n} {unit}{plural}"));
    }
    if parts.is_empty() {
        return "0 seconds".to_string();
    }
    parts.join(" ")
}
