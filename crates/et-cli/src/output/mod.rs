//! Terminal output helpers

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use std::io::Write;

use et_tunnel::ForwardStats;

fn print_tagged(mut out: impl Write, color: Color, tag: &str, msg: &str) {
    let _ = crossterm::execute!(
        out,
        SetForegroundColor(color),
        Print(tag),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a success message in green with a check mark prefix
pub fn print_success(msg: &str) {
    print_tagged(std::io::stdout(), Color::Green, "✓ ", msg);
}

/// Print an error message to stderr in red
pub fn print_error(msg: &str) {
    print_tagged(std::io::stderr(), Color::Red, "✗ ", msg);
}

/// Print a warning to stderr in yellow
pub fn print_warning(msg: &str) {
    print_tagged(std::io::stderr(), Color::Yellow, "⚠ ", msg);
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    print_tagged(std::io::stdout(), Color::Cyan, "ℹ ", msg);
}

/// One-line summary of a finished session's traffic
pub fn format_stats(stats: &ForwardStats) -> String {
    let mut line = format!(
        "{} connection{}, {} sent, {} received",
        stats.accepted,
        if stats.accepted == 1 { "" } else { "s" },
        format_bytes(stats.bytes_sent),
        format_bytes(stats.bytes_received),
    );
    if stats.failed_channels > 0 {
        line.push_str(&format!(", {} failed", stats.failed_channels));
    }
    line
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_format_stats() {
        let stats = ForwardStats {
            accepted: 1,
            active: 0,
            bytes_sent: 10,
            bytes_received: 2048,
            failed_channels: 0,
        };
        assert_eq!(format_stats(&stats), "1 connection, 10 B sent, 2.0 KiB received");

        let stats = ForwardStats {
            accepted: 3,
            failed_channels: 1,
            ..ForwardStats::default()
        };
        assert_eq!(format_stats(&stats), "3 connections, 0 B sent, 0 B received, 1 failed");
    }
}
