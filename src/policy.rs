//! Restart and failure policy for one slot, as a pure transition function.
//!
//! [`SlotMachine::step`] consumes one [`Input`] and returns the [`Effect`]s the
//! supervisor must carry out. Nothing here touches processes or clocks, so the
//! per-tick rules can be exercised without timing.

use std::fmt;

use crate::process::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Consecutive failed starts before latching. `0` never latches on failures.
    pub max_fails: u32,
    /// Restarts after an observed death. `0` forbids automatic restarts.
    pub max_restarts: u32,
    pub history: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Untracked,
    Alive,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    EnableToggled(bool),
    Tick(Liveness),
    StartSucceeded,
    StartFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    RestartsDisabled,
    RestartLimit(u32),
    FailLimit(u32),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::RestartsDisabled => write!(f, "process exited and restarts are disabled, will not restart"),
            Notice::RestartLimit(limit) => {
                write!(f, "restart limit of {limit} reached, will not restart")
            }
            Notice::FailLimit(limit) => {
                write!(f, "{limit} consecutive start failures, giving up")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Stop the tracked group and drop the handle.
    Stop,
    /// The tracked process is gone (or never came up); clear it and go offline.
    ForgetProcess,
    Start,
    Sample,
    ZeroFill,
    Fatal(Notice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingRestart {
    AfterDeath,
    AfterFailedStart,
}

#[derive(Debug, Clone)]
pub struct SlotMachine {
    limits: Limits,
    enabled: bool,
    latched: bool,
    pending: Option<PendingRestart>,
    failed_attempts: u32,
    restart_count: u32,
    tracked: bool,
    running: bool,
}

impl SlotMachine {
    pub fn new(limits: Limits, enabled: bool) -> Self {
        Self {
            limits,
            enabled,
            latched: false,
            pending: None,
            failed_attempts: 0,
            restart_count: 0,
            tracked: false,
            running: false,
        }
    }

    /// Records a process recovered from an identity file at startup.
    pub fn adopt(&mut self) {
        self.tracked = true;
        self.running = true;
    }

    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[cfg(test)]
    pub fn latched(&self) -> bool {
        self.latched
    }

    pub fn restart_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn phase(&self) -> Phase {
        if !self.enabled {
            if self.tracked {
                Phase::Stopping
            } else {
                Phase::Disabled
            }
        } else if self.latched {
            Phase::Latched
        } else if self.running {
            Phase::Running
        } else {
            Phase::Starting
        }
    }

    pub fn step(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::EnableToggled(enabled) => {
                if enabled && !self.enabled {
                    self.reset_counters();
                }
                self.enabled = enabled;
                Vec::new()
            }
            Input::Tick(liveness) => self.tick(liveness),
            Input::StartSucceeded => {
                self.tracked = true;
                self.running = true;
                Vec::new()
            }
            Input::StartFailed => self.start_failed(),
        }
    }

    fn reset_counters(&mut self) {
        self.failed_attempts = 0;
        self.restart_count = 0;
        self.latched = false;
        self.pending = None;
    }

    fn zero_fill(&self, effects: &mut Vec<Effect>) {
        if self.limits.history {
            effects.push(Effect::ZeroFill);
        }
    }

    fn latch(&mut self, notice: Notice, effects: &mut Vec<Effect>) {
        self.latched = true;
        self.pending = None;
        effects.push(Effect::Fatal(notice));
    }

    fn tick(&mut self, liveness: Liveness) -> Vec<Effect> {
        let mut effects = Vec::new();

        if !self.enabled {
            self.reset_counters();
            if liveness == Liveness::Untracked {
                self.zero_fill(&mut effects);
            } else {
                effects.push(Effect::Stop);
            }
            self.tracked = false;
            self.running = false;
            return effects;
        }

        if self.latched {
            self.zero_fill(&mut effects);
            return effects;
        }

        match liveness {
            Liveness::Alive => {
                self.tracked = true;
                self.running = true;
            }
            Liveness::Dead => {
                self.tracked = false;
                self.running = false;
                effects.push(Effect::ForgetProcess);
                if self.limits.max_restarts == 0 {
                    self.latch(Notice::RestartsDisabled, &mut effects);
                    return effects;
                }
                self.pending = Some(PendingRestart::AfterDeath);
            }
            Liveness::Untracked => {
                self.tracked = false;
                self.running = false;
            }
        }

        let max_restarts = self.limits.max_restarts;
        if max_restarts == 0 && self.pending.is_some() {
            self.latch(Notice::RestartsDisabled, &mut effects);
            return effects;
        }

        // A still-running process that reached the limit is left alone; the
        // limit only blocks the next start.
        if max_restarts > 0 && self.restart_count >= max_restarts && !self.running {
            self.latch(Notice::RestartLimit(max_restarts), &mut effects);
            return effects;
        }

        if !self.tracked && (max_restarts == 0 || self.restart_count < max_restarts) {
            if self.pending.take() == Some(PendingRestart::AfterDeath) {
                self.restart_count += 1;
            }
            self.zero_fill(&mut effects);
            effects.push(Effect::Start);
        }

        if self.running {
            effects.push(Effect::Sample);
        }
        effects
    }

    fn start_failed(&mut self) -> Vec<Effect> {
        self.tracked = false;
        self.running = false;
        self.failed_attempts += 1;

        let mut effects = vec![Effect::ForgetProcess];
        let max_fails = self.limits.max_fails;
        if max_fails > 0 && self.failed_attempts >= max_fails {
            self.latch(Notice::FailLimit(max_fails), &mut effects);
        } else {
            self.pending = Some(PendingRestart::AfterFailedStart);
        }
        effects
    }
}
