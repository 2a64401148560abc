//! The `slots.toml` file: one `[[slots]]` table per supervised process, with
//! an optional `[defaults]` table whose values each slot may override.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::errors::WardenError;
use crate::process::{parse_command_line, parse_signal, ProcessSpec, SlotConfig};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SlotFile {
    version: Option<u32>,
    #[serde(default)]
    defaults: SlotDefaults,
    #[serde(default)]
    slots: Vec<SlotEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SlotDefaults {
    path: Option<PathBuf>,
    env: Option<EnvValue>,
    overwrite_env: Option<bool>,
    kill_signal: Option<String>,
    kill_timeout_secs: Option<u64>,
    boot_delay_secs: Option<u64>,
    max_fails: Option<u32>,
    max_restarts: Option<u32>,
    history: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SlotEntry {
    name: String,
    command: String,
    path: Option<PathBuf>,
    env: Option<EnvValue>,
    overwrite_env: Option<bool>,
    kill_signal: Option<String>,
    kill_timeout_secs: Option<u64>,
    pid_offset: Option<i32>,
    boot_delay_secs: Option<u64>,
    max_fails: Option<u32>,
    max_restarts: Option<u32>,
    log_file: Option<PathBuf>,
    enabled: Option<bool>,
    history: Option<bool>,
}

/// `env = "A=1,B=2"` or `env = { A = "1", B = "2" }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EnvValue {
    Text(String),
    Table(BTreeMap<String, String>),
}

impl EnvValue {
    fn render(&self) -> Result<String> {
        match self {
            EnvValue::Text(text) => Ok(text.clone()),
            EnvValue::Table(table) => {
                let mut entries = Vec::with_capacity(table.len());
                for (key, value) in table {
                    if key.contains('=') || key.contains(',') || value.contains(',') {
                        bail!("environment entry {key:?} cannot contain ',' (or '=' in the key)");
                    }
                    entries.push(format!("{key}={value}"));
                }
                Ok(entries.join(","))
            }
        }
    }
}

pub fn load_slots(path: &Path) -> Result<Vec<SlotConfig>> {
    let payload = fs::read_to_string(path)
        .with_context(|| format!("failed to read slot file {}", path.display()))?;
    let base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    parse_slots(&payload, base_dir)
        .with_context(|| format!("invalid slot file {}", path.display()))
}

/// Parses and validates slot definitions. Relative paths resolve against `base_dir`.
pub fn parse_slots(payload: &str, base_dir: &Path) -> Result<Vec<SlotConfig>> {
    let parsed: SlotFile = toml::from_str(payload).context("failed to parse slot file")?;
    if let Some(version) = parsed.version {
        if version != 1 {
            bail!("unsupported slot file version: {version}");
        }
    }

    let defaults = parsed.defaults;
    let mut seen = HashSet::new();
    let mut slots = Vec::with_capacity(parsed.slots.len());
    for entry in parsed.slots {
        validate_slot_name(&entry.name)?;
        if !seen.insert(entry.name.clone()) {
            bail!("duplicate slot name: {}", entry.name);
        }
        let slot = resolve_slot(entry, &defaults, base_dir)?;
        slots.push(slot);
    }
    Ok(slots)
}

fn resolve_slot(entry: SlotEntry, defaults: &SlotDefaults, base_dir: &Path) -> Result<SlotConfig> {
    let name = entry.name;
    parse_command_line(&entry.command).with_context(|| format!("slot {name}: bad command"))?;

    let path = entry
        .path
        .or_else(|| defaults.path.clone())
        .map(|path| absolutize(base_dir, path))
        .unwrap_or_else(|| base_dir.to_path_buf());

    let kill_signal = entry
        .kill_signal
        .or_else(|| defaults.kill_signal.clone())
        .unwrap_or_else(|| "SIGTERM".to_string());
    if parse_signal(&kill_signal).is_none() {
        bail!("slot {name}: unknown kill signal {kill_signal:?}");
    }

    let env = match entry.env.as_ref().or(defaults.env.as_ref()) {
        Some(value) => value
            .render()
            .with_context(|| format!("slot {name}: bad env"))?,
        None => String::new(),
    };

    let spec = ProcessSpec {
        path,
        command: entry.command,
        env,
        overwrite_env: entry
            .overwrite_env
            .or(defaults.overwrite_env)
            .unwrap_or(false),
        kill_signal,
        kill_timeout_secs: entry
            .kill_timeout_secs
            .or(defaults.kill_timeout_secs)
            .unwrap_or(5),
        pid_offset: entry.pid_offset.unwrap_or(0),
        boot_delay_secs: entry
            .boot_delay_secs
            .or(defaults.boot_delay_secs)
            .unwrap_or(0),
        max_fails: entry.max_fails.or(defaults.max_fails).unwrap_or(3),
        max_restarts: entry.max_restarts.or(defaults.max_restarts).unwrap_or(5),
        log_file: entry.log_file.map(|path| absolutize(base_dir, path)),
    };

    Ok(SlotConfig {
        name,
        enabled: entry.enabled.unwrap_or(true),
        history: entry.history.or(defaults.history).unwrap_or(false),
        spec,
    })
}

fn absolutize(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

/// Slot names end up in file names, so only `[A-Za-z0-9_.-]` is allowed.
pub fn validate_slot_name(name: &str) -> Result<(), WardenError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(WardenError::InvalidSlotName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{parse_slots, validate_slot_name};

    const SAMPLE: &str = r#"
version = 1

[defaults]
path = "apps"
max_fails = 2
kill_signal = "SIGINT"
env = { MODE = "prod" }

[[slots]]
name = "web"
command = "./server --port 8080"
env = "PORT=8080,MODE=dev"
max_restarts = 0
log_file = "logs/web.log"

[[slots]]
name = "worker"
path = "/srv/worker"
command = "python3 worker.py"
kill_timeout_secs = 1
pid_offset = 1
enabled = false
history = true
"#;

    #[test]
    fn defaults_apply_and_slot_values_override_them() {
        let slots = parse_slots(SAMPLE, Path::new("/etc/pgwarden")).expect("sample should parse");
        assert_eq!(slots.len(), 2);

        let web = &slots[0];
        assert_eq!(web.name, "web");
        assert!(web.enabled);
        assert_eq!(web.spec.path, PathBuf::from("/etc/pgwarden/apps"));
        assert_eq!(web.spec.env, "PORT=8080,MODE=dev");
        assert_eq!(web.spec.max_fails, 2);
        assert_eq!(web.spec.max_restarts, 0);
        assert_eq!(web.spec.kill_signal, "SIGINT");
        assert_eq!(
            web.spec.log_file,
            Some(PathBuf::from("/etc/pgwarden/logs/web.log"))
        );

        let worker = &slots[1];
        assert!(!worker.enabled);
        assert!(worker.history);
        assert_eq!(worker.spec.path, PathBuf::from("/srv/worker"));
        assert_eq!(worker.spec.env, "MODE=prod");
        assert_eq!(worker.spec.kill_timeout_secs, 1);
        assert_eq!(worker.spec.pid_offset, 1);
        assert_eq!(worker.spec.max_restarts, 5);
        assert_eq!(worker.spec.log_file, None);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let payload = r#"
[[slots]]
name = "a"
command = "sleep 1"

[[slots]]
name = "a"
command = "sleep 2"
"#;
        let err = parse_slots(payload, Path::new("/tmp")).expect_err("duplicates must fail");
        assert!(err.to_string().contains("duplicate slot name"));
    }

    #[test]
    fn unknown_signal_and_version_are_rejected() {
        let payload = "[[slots]]\nname = \"a\"\ncommand = \"sleep 1\"\nkill_signal = \"SIGNOPE\"\n";
        let err = parse_slots(payload, Path::new("/tmp")).expect_err("bad signal must fail");
        assert!(format!("{err:#}").contains("unknown kill signal"));

        let err = parse_slots("version = 2\n", Path::new("/tmp")).expect_err("bad version");
        assert!(err.to_string().contains("unsupported slot file version"));
    }

    #[test]
    fn unterminated_quote_in_command_is_rejected() {
        let payload = "[[slots]]\nname = \"a\"\ncommand = \"sh -c 'oops\"\n";
        let err = parse_slots(payload, Path::new("/tmp")).expect_err("bad quoting must fail");
        assert!(format!("{err:#}").contains("bad command"));
    }

    #[test]
    fn slot_names_are_file_name_safe() {
        assert!(validate_slot_name("web-1.blue_a").is_ok());
        let long = "x".repeat(65);
        for bad in ["", ".hidden", "a/b", "sp ace", long.as_str()] {
            assert!(validate_slot_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
