use anyhow::Result;

use crate::config::AppConfig;
use crate::errors::WardenError;
use crate::process::SlotStatus;
use crate::ui::{format_uptime, label, phase_cell};

use super::common::{daemon_pid, load_snapshot};
use super::list::format_fails;

pub(crate) fn run(config: &AppConfig, slot: Option<&str>, json: bool) -> Result<()> {
    let snapshot = load_snapshot(config)?;

    match slot {
        Some(name) => {
            let status = snapshot
                .slot(name)
                .ok_or_else(|| WardenError::UnknownSlot(name.to_string()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(status)?);
            } else {
                print!("{}", render_slot(status));
            }
        }
        None if json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        None => {
            match daemon_pid(config) {
                Some(pid) => println!("{} running (pid {pid})", label("Daemon:     ")),
                None => println!("{} not running", label("Daemon:     ")),
            }
            println!("{} {}", label("Slots:      "), snapshot.slots.len());
            for status in &snapshot.slots {
                println!();
                print!("{}", render_slot(status));
            }
        }
    }

    Ok(())
}

fn render_slot(status: &SlotStatus) -> String {
    let mut out = String::new();
    let mut field = |name: &str, value: String| {
        out.push_str(&format!("{} {value}\n", label(&format!("{name:<12}"))));
    };

    field("Name:", status.name.clone());
    field("State:", phase_cell(&status.phase.to_string(), status.phase));
    field("Enabled:", yes_no(status.enabled));
    field(
        "PID:",
        if status.pid > 0 {
            status.pid.to_string()
        } else {
            "-".to_string()
        },
    );
    field(
        "Fails:",
        format_fails(status.failed_attempts, status.max_fails),
    );
    field(
        "Restarts:",
        format!("{}/{}", status.restart_count, status.max_restarts),
    );
    if let Some(metrics) = status.metrics {
        field("CPU:", format!("{:.1}%", metrics.cpu_percent));
        field("RAM:", format!("{} MB", metrics.memory_bytes / (1024 * 1024)));
        field(
            "Uptime:",
            format_uptime(status.running, Some(metrics.uptime_secs)),
        );
    }
    field("Command:", optional(status.command.clone()));
    field(
        "Working Dir:",
        optional(status.path.as_ref().map(|path| path.display().to_string())),
    );
    field("Environment:", optional(status.environment.clone()));
    field(
        "Log File:",
        optional(status.log_file.as_ref().map(|path| path.display().to_string())),
    );

    if !status.recent.is_empty() {
        out.push_str(&format!("{}\n", label("Recent:")));
        for line in &status.recent {
            out.push_str(&format!("  {line}\n"));
        }
    }
    out
}

fn optional(value: Option<String>) -> String {
    value
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "-".to_string())
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}
