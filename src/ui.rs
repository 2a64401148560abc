//! Terminal styling helpers shared by list and status output.

use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use crate::process::Phase;

fn colors_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        if std::env::var_os("NO_COLOR").is_some() {
            return false;
        }

        if std::env::var("TERM")
            .map(|term| term.eq_ignore_ascii_case("dumb"))
            .unwrap_or(false)
        {
            return false;
        }

        io::stdout().is_terminal()
    })
}

fn paint(value: &str, code: &str) -> String {
    if colors_enabled() {
        format!("\x1b[{code}m{value}\x1b[0m")
    } else {
        value.to_string()
    }
}

pub fn label(value: &str) -> String {
    paint(value, "1;36")
}

pub fn table_header(value: &str) -> String {
    paint(value, "1;36")
}

pub fn table_border(value: &str) -> String {
    paint(value, "2;34")
}

/// Colours a (possibly pre-padded) cell by slot phase.
pub fn phase_cell(padded: &str, phase: Phase) -> String {
    match phase {
        Phase::Running => paint(padded, "1;32"),
        Phase::Starting | Phase::Stopping => paint(padded, "1;33"),
        Phase::Disabled => paint(padded, "2;37"),
        Phase::Latched => paint(padded, "1;31"),
    }
}

pub fn format_uptime(running: bool, uptime_secs: Option<u64>) -> String {
    match (running, uptime_secs) {
        (true, Some(secs)) => format_duration_compact(secs),
        _ => "-".to_string(),
    }
}

fn format_duration_compact(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let mins = (total_secs % 3_600) / 60;
    let secs = total_secs % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::format_uptime;

    #[test]
    fn uptime_is_dash_when_not_running() {
        assert_eq!(format_uptime(false, Some(100)), "-");
        assert_eq!(format_uptime(true, None), "-");
    }

    #[test]
    fn uptime_picks_two_most_significant_units() {
        assert_eq!(format_uptime(true, Some(42)), "42s");
        assert_eq!(format_uptime(true, Some(3 * 60 + 5)), "3m 5s");
        assert_eq!(format_uptime(true, Some(2 * 3_600 + 61)), "2h 1m");
        assert_eq!(format_uptime(true, Some(86_400 * 3 + 3_600)), "3d 1h");
    }
}
