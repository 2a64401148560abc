use std::path::PathBuf;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::errors::WardenError;
use crate::metrics::MetricsSample;

/// Launch parameters for one slot. A copy is taken for every start so a
/// reload never changes a process that is already running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessSpec {
    pub path: PathBuf,
    pub command: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub overwrite_env: bool,
    #[serde(default = "default_kill_signal")]
    pub kill_signal: String,
    #[serde(default = "default_kill_timeout_secs")]
    pub kill_timeout_secs: u64,
    #[serde(default)]
    pub pid_offset: i32,
    #[serde(default)]
    pub boot_delay_secs: u64,
    #[serde(default)]
    pub max_fails: u32,
    #[serde(default)]
    pub max_restarts: u32,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn stop_signal(&self) -> Signal {
        parse_signal(&self.kill_signal).unwrap_or(Signal::SIGTERM)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConfig {
    pub name: String,
    pub enabled: bool,
    pub history: bool,
    pub spec: ProcessSpec,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Disabled,
    Latched,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Phase::Disabled => "disabled",
            Phase::Latched => "latched",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
        };
        write!(f, "{value}")
    }
}

/// Everything a slot publishes to the control boundary after a tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotStatus {
    pub name: String,
    pub phase: Phase,
    pub enabled: bool,
    pub running: bool,
    /// `-1` when nothing is tracked.
    pub pid: i32,
    pub path: Option<PathBuf>,
    pub command: Option<String>,
    pub environment: Option<String>,
    pub failed_attempts: u32,
    pub restart_count: u32,
    pub max_fails: u32,
    pub max_restarts: u32,
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub metrics: Option<MetricsSample>,
    #[serde(default)]
    pub recent: Vec<String>,
    pub updated_at: u64,
}

impl SlotStatus {
    pub fn idle(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: Phase::Disabled,
            enabled: false,
            running: false,
            pid: -1,
            path: None,
            command: None,
            environment: None,
            failed_attempts: 0,
            restart_count: 0,
            max_fails: 0,
            max_restarts: 0,
            log_file: None,
            metrics: None,
            recent: Vec::new(),
            updated_at: 0,
        }
    }
}

/// Splits a command line into program and arguments using shell quoting rules.
pub fn parse_command_line(command_line: &str) -> Result<(String, Vec<String>), WardenError> {
    let tokens = shell_words::split(command_line)
        .map_err(|err| WardenError::InvalidArgument(format!("command syntax: {err}")))?;

    let Some((program, args)) = tokens.split_first() else {
        return Err(WardenError::InvalidArgument(
            "command cannot be empty".to_string(),
        ));
    };
    Ok((program.clone(), args.to_vec()))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvAssignments {
    pub pairs: Vec<(String, String)>,
    pub rejected: Vec<String>,
}

/// Parses `KEY=VALUE,KEY2=VALUE2`. Each entry is split once on `=`, so values
/// may themselves contain `=`. Entries without `=` or with an empty key land
/// in `rejected`.
pub fn parse_environment(raw: &str) -> EnvAssignments {
    let mut parsed = EnvAssignments::default();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                parsed
                    .pairs
                    .push((key.trim().to_string(), value.to_string()));
            }
            _ => parsed.rejected.push(entry.to_string()),
        }
    }
    parsed
}

/// Accepts `TERM`, `SIGTERM`, `sigterm` or a raw number such as `15`.
pub fn parse_signal(value: &str) -> Option<Signal> {
    let normalized = value.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return None;
    }
    if let Ok(number) = normalized.parse::<i32>() {
        return Signal::try_from(number).ok();
    }
    let raw = normalized.strip_prefix("SIG").unwrap_or(&normalized);
    match raw {
        "TERM" => Some(Signal::SIGTERM),
        "INT" => Some(Signal::SIGINT),
        "QUIT" => Some(Signal::SIGQUIT),
        "HUP" => Some(Signal::SIGHUP),
        "KILL" => Some(Signal::SIGKILL),
        "USR1" => Some(Signal::SIGUSR1),
        "USR2" => Some(Signal::SIGUSR2),
        "ABRT" => Some(Signal::SIGABRT),
        "ALRM" => Some(Signal::SIGALRM),
        _ => None,
    }
}

fn default_kill_signal() -> String {
    "SIGTERM".to_string()
}

fn default_kill_timeout_secs() -> u64 {
    5
}
