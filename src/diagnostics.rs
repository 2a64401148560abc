//! Text diagnostics written by process handles and forwarded by supervisors.
//!
//! Handles append free-text lines tagged with a level token. A supervisor
//! drains the buffer once per tick, splits it into lines, truncates overlong
//! lines and forwards `(text, level)` pairs to a [`LogSink`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub const CUT_MARKER: &str = " [...]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl DiagLevel {
    pub fn tag(self) -> &'static str {
        match self {
            DiagLevel::Debug => "DEBUG",
            DiagLevel::Info => "INFO",
            DiagLevel::Warning => "WARNING",
            DiagLevel::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(DiagLevel::Debug),
            "info" => Some(DiagLevel::Info),
            "warn" | "warning" => Some(DiagLevel::Warning),
            "error" => Some(DiagLevel::Error),
            _ => None,
        }
    }
}

/// Shared line buffer. Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    buffer: Arc<Mutex<String>>,
    verbosity: DiagLevel,
}

impl Diagnostics {
    pub fn new(verbosity: DiagLevel) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(String::new())),
            verbosity,
        }
    }

    pub fn debug(&self, text: impl AsRef<str>) {
        self.line(DiagLevel::Debug, text.as_ref());
    }

    pub fn info(&self, text: impl AsRef<str>) {
        self.line(DiagLevel::Info, text.as_ref());
    }

    pub fn warning(&self, text: impl AsRef<str>) {
        self.line(DiagLevel::Warning, text.as_ref());
    }

    pub fn error(&self, text: impl AsRef<str>) {
        self.line(DiagLevel::Error, text.as_ref());
    }

    fn line(&self, level: DiagLevel, text: &str) {
        if level < self.verbosity {
            return;
        }
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buffer.push_str(level.tag());
        buffer.push(' ');
        buffer.push_str(text);
        buffer.push('\n');
    }

    /// Takes everything written so far.
    pub fn drain(&self) -> String {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *buffer)
    }
}

/// First matching token wins, searched in the order INFO, WARNING, ERROR, DEBUG.
/// Untagged lines are INFO.
pub fn detect_level(line: &str) -> DiagLevel {
    const SEARCH_ORDER: [DiagLevel; 4] = [
        DiagLevel::Info,
        DiagLevel::Warning,
        DiagLevel::Error,
        DiagLevel::Debug,
    ];
    SEARCH_ORDER
        .into_iter()
        .find(|level| line.contains(level.tag()))
        .unwrap_or(DiagLevel::Info)
}

/// Splits drained text into leveled lines. `max_chars == 0` disables truncation.
pub fn split_lines(text: &str, max_chars: usize) -> Vec<(String, DiagLevel)> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let level = detect_level(line);
            (truncate_line(line, max_chars), level)
        })
        .collect()
}

fn truncate_line(line: &str, max_chars: usize) -> String {
    if max_chars == 0 || line.chars().count() <= max_chars {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(max_chars).collect();
    cut.push_str(CUT_MARKER);
    cut
}

pub trait LogSink: Send {
    fn log(&mut self, text: &str, level: DiagLevel);

    fn recent(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Emits each line as a tracing event and keeps the last `capacity` lines
/// for the status snapshot.
pub struct SlotLogSink {
    slot: String,
    ring: VecDeque<String>,
    capacity: usize,
}

impl SlotLogSink {
    pub fn new(slot: &str, capacity: usize) -> Self {
        Self {
            slot: slot.to_string(),
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
}

impl LogSink for SlotLogSink {
    fn log(&mut self, text: &str, level: DiagLevel) {
        match level {
            DiagLevel::Debug => debug!(slot = %self.slot, "{text}"),
            DiagLevel::Info => info!(slot = %self.slot, "{text}"),
            DiagLevel::Warning => warn!(slot = %self.slot, "{text}"),
            DiagLevel::Error => error!(slot = %self.slot, "{text}"),
        }

        if self.capacity == 0 {
            return;
        }
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(text.to_string());
    }

    fn recent(&self) -> Vec<String> {
        self.ring.iter().cloned().collect()
    }
}
