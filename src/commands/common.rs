use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;

use crate::config::AppConfig;
use crate::daemon::desired_slots;
use crate::identity::IdentityFile;
use crate::logging::slot_log_path;
use crate::probe::ProcessTable;
use crate::storage::{load_status, StatusSnapshot};

/// Pid of the daemon serving this home directory, if one is alive.
pub(crate) fn daemon_pid(config: &AppConfig) -> Option<i32> {
    let marker = IdentityFile::for_slot(&config.base_dir, "daemon");
    let pid = marker.read().ok().flatten()?;
    ProcessTable::new().is_alive(pid).then_some(pid)
}

pub(crate) fn load_snapshot(config: &AppConfig) -> Result<StatusSnapshot> {
    let snapshot = load_status(&config.status_path)?;
    if daemon_pid(config).is_none() && !snapshot.slots.is_empty() {
        eprintln!("warning: daemon is not running; showing the last recorded status");
    }
    Ok(snapshot)
}

/// Slot names from the slot file and from the last status snapshot.
pub(crate) fn known_slots(config: &AppConfig) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    if config.slots_path.exists() {
        for slot in desired_slots(config, &config.slots_path)? {
            names.insert(slot.name);
        }
    }
    for slot in load_status(&config.status_path)?.slots {
        names.insert(slot.name);
    }
    Ok(names)
}

/// Where a slot's output lands: the slot file setting, then what the daemon
/// last reported, then the default per-slot log.
pub(crate) fn log_path_for(config: &AppConfig, name: &str) -> Result<PathBuf> {
    if config.slots_path.exists() {
        let configured = desired_slots(config, &config.slots_path)?
            .into_iter()
            .find(|slot| slot.name == name)
            .and_then(|slot| slot.spec.log_file);
        if let Some(path) = configured {
            return Ok(path);
        }
    }
    let reported = load_status(&config.status_path)?
        .slot(name)
        .and_then(|slot| slot.log_file.clone());
    Ok(reported.unwrap_or_else(|| slot_log_path(&config.log_dir, name)))
}
