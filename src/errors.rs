use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("environment not usable: {0}")]
    Environment(String),
    #[error("process failed to start: {0}")]
    Runtime(String),
    #[error("kill escalation failed: {0}")]
    Escalation(String),
    #[error("unknown slot: {0}")]
    UnknownSlot(String),
    #[error("invalid slot name: {0}")]
    InvalidSlotName(String),
    #[error("daemon already running with pid {0}")]
    DaemonAlreadyRunning(i32),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl WardenError {
    /// Short tag used when an error is flattened into a diagnostic line.
    pub fn kind(&self) -> &'static str {
        match self {
            WardenError::InvalidArgument(_) => "argument",
            WardenError::Environment(_) => "environment",
            WardenError::Runtime(_) => "runtime",
            WardenError::Escalation(_) => "escalation",
            WardenError::UnknownSlot(_) | WardenError::InvalidSlotName(_) => "slot",
            WardenError::DaemonAlreadyRunning(_) => "daemon",
            WardenError::Io(_) => "io",
            WardenError::Serde(_) => "serde",
        }
    }
}
