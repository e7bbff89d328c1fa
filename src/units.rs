pub fn to_megabits(bytes_per_sec: u64) -> f64 {
    bytes_per_sec as f64 * 8.0 / 1_000_000.0
}

/// Human-readable byte rate using decimal (SI) prefixes.
pub fn format_byte_rate(bytes_per_sec: u64) -> String {
    const UNITS: [&str; 5] = ["B/s", "kB/s", "MB/s", "GB/s", "TB/s"];
    let mut value = bytes_per_sec as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes_per_sec} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
