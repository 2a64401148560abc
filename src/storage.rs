use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::process::SlotStatus;

/// Written by the daemon after every tick and read by `status`/`list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_pid: u32,
    pub updated_at: u64,
    pub slots: Vec<SlotStatus>,
}

impl StatusSnapshot {
    pub fn slot(&self, name: &str) -> Option<&SlotStatus> {
        self.slots.iter().find(|slot| slot.name == name)
    }
}

/// Operator enable/disable decisions layered over the slot file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlOverrides {
    #[serde(default)]
    pub enabled: BTreeMap<String, bool>,
}

pub fn load_status(path: &Path) -> Result<StatusSnapshot> {
    load_json(path, "status")
}

pub fn save_status(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    save_json(path, snapshot)
}

pub fn load_control(path: &Path) -> Result<ControlOverrides> {
    load_json(path, "control")
}

pub fn save_control(path: &Path, overrides: &ControlOverrides) -> Result<()> {
    save_json(path, overrides)
}

fn load_json<T: DeserializeOwned + Default>(path: &Path, what: &str) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} file {}", path.display()))?;

    if content.trim().is_empty() {
        return Ok(T::default());
    }

    match serde_json::from_str::<T>(&content) {
        Ok(value) => Ok(value),
        Err(error) => {
            let backup = corrupted_backup_path(path);
            if let Err(rename_err) = fs::rename(path, &backup) {
                warn!(
                    "failed to move corrupted {what} file {} -> {}: {rename_err}",
                    path.display(),
                    backup.display()
                );
            } else {
                warn!(
                    "{what} file {} is corrupted ({error}), moved to {}",
                    path.display(),
                    backup.display()
                );
            }
            Ok(T::default())
        }
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let payload = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("tmp");

    fs::write(&tmp_path, payload)
        .with_context(|| format!("failed to write temporary file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn corrupted_backup_path(path: &Path) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    path.with_extension(format!("corrupt-{suffix}.json"))
}
