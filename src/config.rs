use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::diagnostics::DiagLevel;
use crate::identity::default_runtime_dir;
use crate::logging::LogRotationPolicy;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    pub slots_path: PathBuf,
    pub status_path: PathBuf,
    pub control_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_rotation: LogRotationPolicy,
    pub runtime_dir: PathBuf,
    pub tick_interval: Duration,
    pub settle: Duration,
    pub diag_max_chars: usize,
    pub diag_level: DiagLevel,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let base_dir = env_path("PGWARDEN_HOME").unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(env::temp_dir)
                .join("pgwarden")
        });
        let slots_path =
            env_path("PGWARDEN_SLOTS").unwrap_or_else(|| base_dir.join("slots.toml"));
        // The default runtime dir is derived from the canonical home, so the
        // home has to exist first.
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create {}", base_dir.display()))?;
        let runtime_dir = env_path("PGWARDEN_RUNTIME_DIR")
            .unwrap_or_else(|| default_runtime_dir(&base_dir));
        let diag_level = env::var("PGWARDEN_DIAG_LEVEL")
            .ok()
            .and_then(|value| DiagLevel::parse(&value))
            .unwrap_or(DiagLevel::Info);

        let config = Self {
            status_path: base_dir.join("status.json"),
            control_path: base_dir.join("control.json"),
            log_dir: base_dir.join("logs"),
            log_rotation: LogRotationPolicy {
                max_size_bytes: env_u64("PGWARDEN_LOG_MAX_SIZE_MB", 20).saturating_mul(1024 * 1024),
                max_files: env_u64("PGWARDEN_LOG_MAX_FILES", 5).max(1) as u32,
            },
            base_dir,
            slots_path,
            runtime_dir,
            tick_interval: Duration::from_millis(env_u64("PGWARDEN_TICK_MS", 2000).max(50)),
            settle: Duration::from_millis(env_u64("PGWARDEN_SETTLE_MS", 1000)),
            diag_max_chars: env_u64("PGWARDEN_DIAG_MAX_CHARS", 512) as usize,
            diag_level,
        };
        config.ensure_layout()?;
        Ok(config)
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("failed to create {}", self.base_dir.display()))?;
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        Ok(())
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
