//! Shared utility functions used across the crate.

use std::time::Duration;

/// Parse a duration string (e.g., "30s", "500ms", "1m", "1h") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds, fractional allowed (e.g., "30s", "1.5s")
/// - `Nm` - minutes (e.g., "5m")
/// - `Nh` - hours (e.g., "1h")
/// - Plain number - treated as milliseconds (e.g., "1000")
///
/// Returns `None` if the string cannot be parsed.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(h) = s.strip_suffix('h') {
        return h.parse::<f64>().ok().map(|h| Duration::from_secs_f64(h * 3600.0));
    }
    if let Some(m) = s.strip_suffix('m') {
        return m.parse::<f64>().ok().map(|m| Duration::from_secs_f64(m * 60.0));
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<f64>().ok().map(Duration::from_secs_f64);
    }
    // Bare number is treated as milliseconds
    s.parse::<u64>().ok().map(Duration::from_millis)
}
