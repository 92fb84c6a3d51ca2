// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Small formatting helpers shared by the HTTP views and the CLI.

/// Mask a sensitive string (like the RPC secret) for logging.
///
/// Shows only the first `visible_prefix` characters and replaces the rest with "...".
///
/// # Examples
///
/// ```
/// use harvester::utils::mask_sensitive;
///
/// assert_eq!(mask_sensitive("hunter2-secret", 2), "hu...");
/// ```
pub fn mask_sensitive(input: &str, visible_prefix: usize) -> String {
    if input.chars().count() <= visible_prefix {
        // Still mask short values so the length is not leaked
        return "...".to_string();
    }

    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

fn scale(value: u64, units: &[&str]) -> String {
    if value == 0 {
        return format!("0 {}", units[0]);
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < units.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, units[unit])
}

/// Format a byte count, e.g. `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    scale(bytes, &["B", "KB", "MB", "GB", "TB"])
}

/// Format a transfer rate, e.g. `512.0 KB/s`.
pub fn format_speed(bytes_per_sec: u64) -> String {
    scale(bytes_per_sec, &["B/s", "KB/s", "MB/s", "GB/s"])
}
