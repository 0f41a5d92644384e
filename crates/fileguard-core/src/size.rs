//! Byte-size helpers.

const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

/// Formats a byte count with binary units, e.g. `1536` as `"1.5 KB"`.
pub fn human_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        return format!("{} B", bytes);
    }
    let formatted = format!("{:.2}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}

/// Parses an ini-style size value such as `2M`, `512k`, `1G` or `1048576`.
///
/// Returns `None` for empty or malformed values.
pub fn parse_ini_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let last = value.chars().last()?;
    let (digits, multiplier) = match last.to_ascii_uppercase() {
        'K' => (&value[..value.len() - 1], 1024),
        'M' => (&value[..value.len() - 1], 1024 * 1024),
        'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
}
