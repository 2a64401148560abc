use std::env;
use std::path::Path;

use anyhow::Result;

use crate::config::AppConfig;
use crate::handle::resolve_program;
use crate::process::{parse_command_line, parse_environment, SlotConfig};
use crate::slotfile::load_slots;

#[derive(Debug, Default)]
struct SlotFileReport {
    slot_count: usize,
    enabled_count: usize,
    warnings: Vec<String>,
}

pub(crate) fn run(config: &AppConfig, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&config.slots_path);
    let slots = load_slots(path)?;
    let report = inspect_slots(&slots);

    println!("Slot file validation: OK");
    println!("Path: {}", path.display());
    println!("Slots: {} ({} enabled)", report.slot_count, report.enabled_count);
    for warning in &report.warnings {
        println!("Warning: {warning}");
    }

    Ok(())
}

/// Flags problems that would only surface at start time: missing working
/// directories, programs that are not on the search path, and environment
/// entries the start would skip.
fn inspect_slots(slots: &[SlotConfig]) -> SlotFileReport {
    let mut report = SlotFileReport {
        slot_count: slots.len(),
        enabled_count: slots.iter().filter(|slot| slot.enabled).count(),
        warnings: Vec::new(),
    };

    for slot in slots {
        let spec = &slot.spec;
        if !spec.path.is_dir() {
            report.warnings.push(format!(
                "slot {}: working directory {} does not exist",
                slot.name,
                spec.path.display()
            ));
            continue;
        }
        if let Ok((program, _)) = parse_command_line(&spec.command) {
            if !program_exists(&spec.path, &program) {
                report.warnings.push(format!(
                    "slot {}: program {program:?} was not found",
                    slot.name
                ));
            }
        }
        for entry in parse_environment(&spec.env).rejected {
            report.warnings.push(format!(
                "slot {}: environment entry {entry:?} has no '=' and will be skipped",
                slot.name
            ));
        }
    }

    report
}

fn program_exists(workdir: &Path, program: &str) -> bool {
    let resolved = resolve_program(workdir, program);
    if resolved.components().count() > 1 {
        return resolved.is_file();
    }
    env::var_os("PATH").is_some_and(|paths| {
        env::split_paths(&paths).any(|dir| dir.join(&resolved).is_file())
    })
}
