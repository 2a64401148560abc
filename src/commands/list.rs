use anyhow::Result;

use crate::config::AppConfig;
use crate::process::{Phase, SlotStatus};
use crate::ui::{format_uptime, phase_cell, table_border, table_header};

use super::common::load_snapshot;

const COLUMNS: usize = 8;
const STATE_COLUMN: usize = 1;

pub(crate) fn run(config: &AppConfig) -> Result<()> {
    let snapshot = load_snapshot(config)?;
    print_slot_table(snapshot.slots);
    Ok(())
}

fn print_slot_table(mut slots: Vec<SlotStatus>) {
    slots.sort_by(|left, right| left.name.cmp(&right.name));

    if slots.is_empty() {
        println!("No supervised slots.");
        return;
    }

    let headers = [
        "NAME", "STATE", "PID", "FAILS", "RESTARTS", "CPU%", "RAM(MB)", "UPTIME",
    ];
    let phases: Vec<Phase> = slots.iter().map(|slot| slot.phase).collect();
    let rows: Vec<[String; COLUMNS]> = slots.iter().map(slot_row).collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.len());
        }
    }

    print_border(&widths);
    let header_cells: Vec<String> = headers
        .iter()
        .zip(widths)
        .map(|(header, width)| table_header(&format!("{header:<width$}")))
        .collect();
    print_row(&header_cells);
    print_border(&widths);
    for (row, phase) in rows.into_iter().zip(phases) {
        let cells: Vec<String> = row
            .into_iter()
            .enumerate()
            .map(|(idx, cell)| {
                let padded = format!("{cell:<width$}", width = widths[idx]);
                if idx == STATE_COLUMN {
                    phase_cell(&padded, phase)
                } else {
                    padded
                }
            })
            .collect();
        print_row(&cells);
    }
    print_border(&widths);
}

fn slot_row(slot: &SlotStatus) -> [String; COLUMNS] {
    let metrics = slot.metrics.filter(|_| slot.running);
    [
        slot.name.clone(),
        slot.phase.to_string(),
        if slot.pid > 0 {
            slot.pid.to_string()
        } else {
            "-".to_string()
        },
        format_fails(slot.failed_attempts, slot.max_fails),
        format!("{}/{}", slot.restart_count, slot.max_restarts),
        metrics.map_or_else(|| "-".to_string(), |m| format!("{:.1}", m.cpu_percent)),
        metrics.map_or_else(
            || "-".to_string(),
            |m| (m.memory_bytes / (1024 * 1024)).to_string(),
        ),
        format_uptime(slot.running, metrics.map(|m| m.uptime_secs)),
    ]
}

/// A fail limit of zero means start failures never latch the slot.
pub(crate) fn format_fails(failed_attempts: u32, max_fails: u32) -> String {
    if max_fails == 0 {
        failed_attempts.to_string()
    } else {
        format!("{failed_attempts}/{max_fails}")
    }
}

fn print_border(widths: &[usize; COLUMNS]) {
    let mut line = String::from("+");
    for width in widths {
        line.push_str(&format!("-{}-+", "-".repeat(*width)));
    }
    println!("{}", table_border(&line));
}

/// Cells arrive already padded, and possibly wrapped in colour codes.
fn print_row(cells: &[String]) {
    let separator = table_border("|");
    print!("{separator}");
    for cell in cells {
        print!(" {cell} {separator}");
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::{format_fails, slot_row};
    use crate::metrics::MetricsSample;
    use crate::process::{Phase, SlotStatus};

    #[test]
    fn running_slot_row_shows_metrics_and_counters() {
        let mut slot = SlotStatus::idle("web");
        slot.phase = Phase::Running;
        slot.running = true;
        slot.enabled = true;
        slot.pid = 4242;
        slot.failed_attempts = 1;
        slot.max_fails = 3;
        slot.restart_count = 2;
        slot.max_restarts = 5;
        slot.metrics = Some(MetricsSample {
            cpu_percent: 12.34,
            memory_bytes: 64 * 1024 * 1024,
            uptime_secs: 65,
        });

        let row = slot_row(&slot);
        assert_eq!(
            row,
            [
                "web".to_string(),
                "running".to_string(),
                "4242".to_string(),
                "1/3".to_string(),
                "2/5".to_string(),
                "12.3".to_string(),
                "64".to_string(),
                "1m 5s".to_string(),
            ]
        );
    }

    #[test]
    fn stopped_slot_row_hides_stale_metrics() {
        let mut slot = SlotStatus::idle("batch");
        slot.phase = Phase::Latched;
        slot.metrics = Some(MetricsSample::zero());

        let row = slot_row(&slot);
        assert_eq!(row[1], "latched");
        assert_eq!(row[2], "-");
        assert_eq!(row[5], "-");
        assert_eq!(row[7], "-");
    }

    #[test]
    fn unlimited_fail_budget_prints_bare_count() {
        assert_eq!(format_fails(4, 0), "4");
        assert_eq!(format_fails(0, 3), "0/3");
    }
}
