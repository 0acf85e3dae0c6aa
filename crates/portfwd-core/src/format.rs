//! Human-readable rendering of transmission data.

use std::fmt::Write as _;
use std::time::Duration;

/// Default number of payload bytes shown by [`hex_preview`] callers.
pub const PREVIEW_BYTES: usize = 256;

const BYTE_UNITS: [&str; 3] = ["Kb", "Mb", "Gb"];

/// `512b`, `1.50Kb`, `3.20Mb`, ...
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes}b");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = BYTE_UNITS[0];
    for next in &BYTE_UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.2}{unit}")
}

/// `2d 3h`, `1m 5s`, `250ms`. Zero components are omitted; zero itself is `0ms`.
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let parts = [
        (total_secs / 86_400, "d"),
        ((total_secs / 3_600) % 24, "h"),
        ((total_secs / 60) % 60, "m"),
        (total_secs % 60, "s"),
    ];

    let mut out = String::new();
    for (value, unit) in parts {
        if value > 0 {
            let _ = write!(out, "{value}{unit} ");
        }
    }
    let millis = duration.subsec_millis();
    if millis > 0 || out.is_empty() {
        let _ = write!(out, "{millis}ms");
    }
    out.trim_end().to_string()
}

/// Space-separated uppercase hex of at most `limit` bytes, with `...` when cut.
pub fn hex_preview(data: &[u8], limit: usize) -> String {
    let shown = &data[..data.len().min(limit)];
    let mut out = shown
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > limit {
        out.push_str(" ...");
    }
    out
}
