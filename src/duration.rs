//! Human-readable interval strings.

use crate::error::Error;

/// Seconds per unit letter, largest first.
const UNITS: [(char, u64); 7] = [
    ('Y', 365 * 86400),
    ('M', 30 * 86400),
    ('W', 7 * 86400),
    ('D', 86400),
    ('h', 3600),
    ('m', 60),
    ('s', 1),
];

fn unit_seconds(unit: char) -> Option<u64> {
    UNITS.iter().find(|(u, _)| *u == unit).map(|(_, s)| *s)
}

/// Converts an interval string like `1M`, `1Y3M` or `5D2m4s` to seconds.
///
/// Units are `Y` (years), `M` (months), `W` (weeks), `D` (days), `h` (hours),
/// `m` (minutes) and `s` (seconds). The whole string must be a sequence of
/// `<value><unit>` pairs with non-zero values; anything else is rejected.
pub fn human_to_seconds(string: &str) -> Result<u64, Error> {
    let bad = || Error::BadInterval(string.to_owned());
    if string.is_empty() {
        return Err(bad());
    }

    let mut seconds: u64 = 0;
    let mut rest = string;
    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(bad)?;
        if digits_end == 0 {
            return Err(bad());
        }
        let value: u64 = rest[..digits_end].parse().map_err(|_| bad())?;
        let unit = rest[digits_end..].chars().next().ok_or_else(bad)?;
        let per_unit = unit_seconds(unit).ok_or_else(bad)?;
        if value == 0 {
            return Err(bad());
        }
        seconds = seconds
            .checked_add(value.checked_mul(per_unit).ok_or_else(bad)?)
            .ok_or_else(bad)?;
        rest = &rest[digits_end + unit.len_utf8()..];
    }
    Ok(seconds)
}
