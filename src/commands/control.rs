use anyhow::Result;

use crate::config::AppConfig;
use crate::errors::WardenError;
use crate::process::Phase;
use crate::storage::{load_control, load_status, save_control};

use super::common::{daemon_pid, known_slots};

pub(crate) fn run(config: &AppConfig, slot: &str, enabled: bool) -> Result<()> {
    if !known_slots(config)?.contains(slot) {
        return Err(WardenError::UnknownSlot(slot.to_string()).into());
    }

    let previous = set_override(config, slot, enabled)?;
    let verb = if enabled { "enabled" } else { "disabled" };
    if previous == Some(enabled) {
        println!("Slot {slot} already {verb}.");
    } else {
        println!("Slot {slot} {verb}.");
    }

    let latched = load_status(&config.status_path)?
        .slot(slot)
        .is_some_and(|status| status.phase == Phase::Latched);
    if enabled && latched && previous != Some(false) {
        println!(
            "Slot {slot} is latched. Run `pgwarden disable {slot}`, wait for the next tick, \
             then enable it again to clear the latch."
        );
    }
    if daemon_pid(config).is_none() {
        println!("Daemon is not running; the change applies when it starts.");
    }

    Ok(())
}

/// Records the operator decision and returns the override it replaced.
fn set_override(config: &AppConfig, slot: &str, enabled: bool) -> Result<Option<bool>> {
    let mut overrides = load_control(&config.control_path)?;
    let previous = overrides.enabled.insert(slot.to_string(), enabled);
    save_control(&config.control_path, &overrides)?;
    Ok(previous)
}
