//! One supervisor per slot: owns the slot's [`ProcessHandle`], feeds ticks
//! into its [`SlotMachine`] and carries out the effects it returns.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::diagnostics::{split_lines, DiagLevel, Diagnostics, LogSink};
use crate::handle::ProcessHandle;
use crate::logging::{rotate_if_needed, LogRotationPolicy};
use crate::metrics::{idle_metrics, MetricsSample, MetricsSource};
use crate::policy::{Effect, Input, Limits, Liveness, SlotMachine};
use crate::probe::ProcessTable;
use crate::process::{ProcessSpec, SlotConfig, SlotStatus};

/// Broadcast by the scheduler to every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    Tick,
    Shutdown { leave_running: bool },
}

/// What every supervisor in one daemon shares.
#[derive(Clone)]
pub struct SupervisorContext {
    pub table: Arc<ProcessTable>,
    pub metrics: Arc<dyn MetricsSource>,
    pub runtime_dir: PathBuf,
    pub settle: Duration,
    pub diag_level: DiagLevel,
    pub diag_max_chars: usize,
    pub log_rotation: Option<LogRotationPolicy>,
}

impl SupervisorContext {
    pub fn new(table: Arc<ProcessTable>, runtime_dir: PathBuf) -> Self {
        Self {
            metrics: table.clone(),
            table,
            runtime_dir,
            settle: crate::handle::DEFAULT_SETTLE,
            diag_level: DiagLevel::Info,
            diag_max_chars: 512,
            log_rotation: None,
        }
    }
}

pub struct Supervisor {
    config: SlotConfig,
    ctx: SupervisorContext,
    machine: SlotMachine,
    handle: Option<ProcessHandle>,
    diagnostics: Diagnostics,
    sink: Box<dyn LogSink>,
    status: SlotStatus,
    boot_delay_pending: bool,
    /// Pid that outlived a full escalation. No further stop is attempted on
    /// it until it exits or the slot is toggled.
    unkillable: Option<i32>,
}

fn limits_of(config: &SlotConfig) -> Limits {
    Limits {
        max_fails: config.spec.max_fails,
        max_restarts: config.spec.max_restarts,
        history: config.history,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

impl Supervisor {
    /// Creates the slot's handle, which re-adopts a process left running by a
    /// previous daemon.
    pub fn new(config: SlotConfig, ctx: SupervisorContext, sink: Box<dyn LogSink>) -> Self {
        let diagnostics = Diagnostics::new(ctx.diag_level);
        let machine = SlotMachine::new(limits_of(&config), config.enabled);
        let mut supervisor = Self {
            status: SlotStatus::idle(&config.name),
            config,
            ctx,
            machine,
            handle: None,
            diagnostics,
            sink,
            boot_delay_pending: false,
            unkillable: None,
        };

        let handle = supervisor.new_handle();
        let adopted = handle.pid();
        supervisor.handle = Some(handle);
        match adopted {
            Some(pid) => {
                supervisor.machine.adopt();
                let spec = supervisor.config.spec.clone();
                supervisor.mark_online(pid, &spec);
            }
            None => {
                supervisor.boot_delay_pending = supervisor.config.spec.boot_delay_secs > 0;
            }
        }
        supervisor.forward_diagnostics();
        supervisor.publish();
        supervisor
    }

    pub fn status(&self) -> &SlotStatus {
        &self.status
    }

    pub fn pid(&self) -> Option<i32> {
        self.handle.as_ref().and_then(ProcessHandle::pid)
    }

    fn new_handle(&self) -> ProcessHandle {
        let mut handle = ProcessHandle::new(
            self.ctx.table.clone(),
            &self.ctx.runtime_dir,
            &self.config.name,
            false,
            self.diagnostics.clone(),
            &self.config.name,
        );
        self.configure_handle(&mut handle);
        handle
    }

    fn configure_handle(&self, handle: &mut ProcessHandle) {
        let spec = &self.config.spec;
        handle.set_stop_signal(spec.stop_signal());
        handle.set_kill_timeout(spec.kill_timeout_secs);
        handle.set_pid_offset(spec.pid_offset);
        handle.set_settle(self.ctx.settle);
    }

    /// Drops the current handle (stopping what it tracks) and installs a fresh
    /// one. A process that survived escalation is re-adopted by the new handle.
    fn replace_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            self.configure_handle(&mut handle);
            drop(handle);
        }
        self.handle = Some(self.new_handle());
    }

    fn liveness(&self) -> Liveness {
        match self.pid() {
            None => Liveness::Untracked,
            Some(pid) if self.ctx.table.is_alive(pid) => Liveness::Alive,
            Some(_) => Liveness::Dead,
        }
    }

    /// Applies a reloaded configuration. Launch parameters take effect on the
    /// next start; kill settings apply to the current handle immediately.
    pub fn apply_config(&mut self, config: SlotConfig) {
        if config.enabled != self.config.enabled {
            self.diagnostics.info(format!(
                "{}: {}",
                config.name,
                if config.enabled { "enabled" } else { "disabled" }
            ));
            self.machine.step(Input::EnableToggled(config.enabled));
            self.unkillable = None;
        }
        if self.machine.running() && config.spec.command != self.config.spec.command {
            self.diagnostics.info(format!(
                "{}: command changed; takes effect on next start",
                config.name
            ));
        }
        self.machine.set_limits(limits_of(&config));
        self.config = config;
        if let Some(mut handle) = self.handle.take() {
            self.configure_handle(&mut handle);
            self.handle = Some(handle);
        }
    }

    /// One evaluation cycle: observe, decide, act, publish.
    pub fn tick(&mut self) {
        let liveness = self.liveness();
        let effects = self.machine.step(Input::Tick(liveness));
        self.apply(effects);
        self.forward_diagnostics();
        self.publish();
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Stop => self.stop(),
                Effect::ForgetProcess => {
                    if self.pid().is_some() {
                        let pending = if self.machine.restart_pending() {
                            ", restart pending"
                        } else {
                            ""
                        };
                        self.diagnostics
                            .warning(format!("{}: process exited{pending}", self.config.name));
                    }
                    self.replace_handle();
                    self.mark_offline();
                }
                Effect::Start => self.start(),
                Effect::Sample => self.sample(),
                Effect::ZeroFill => self.status.metrics = idle_metrics(self.config.history),
                Effect::Fatal(notice) => {
                    self.diagnostics
                        .error(format!("{}: {notice}", self.config.name));
                }
            }
        }
    }

    fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            self.mark_offline();
            return;
        };
        if self.unkillable.is_some() && self.unkillable == handle.pid() && handle.is_alive() {
            self.handle = Some(handle);
            return;
        }

        self.configure_handle(&mut handle);
        match handle.kill() {
            Ok(()) => {
                self.unkillable = None;
                drop(handle);
                self.handle = Some(self.new_handle());
                self.mark_offline();
            }
            Err(err) => {
                self.unkillable = handle.pid();
                self.diagnostics.error(format!(
                    "{}: {err}; keeping it tracked without further stop attempts",
                    self.config.name
                ));
                self.handle = Some(handle);
            }
        }
    }

    fn start(&mut self) {
        if self.boot_delay_pending {
            self.boot_delay_pending = false;
            let delay = self.config.spec.boot_delay_secs;
            self.diagnostics.info(format!(
                "{}: waiting {delay}s boot delay before first start",
                self.config.name
            ));
            self.forward_diagnostics();
            thread::sleep(Duration::from_secs(delay));
        }

        let spec = self.config.spec.clone();
        if let (Some(log_file), Some(policy)) = (spec.log_file.as_deref(), self.ctx.log_rotation) {
            match rotate_if_needed(log_file, policy) {
                Ok(true) => self.diagnostics.info(format!(
                    "{}: rotated {}",
                    self.config.name,
                    log_file.display()
                )),
                Ok(false) => {}
                Err(err) => self.diagnostics.warning(format!(
                    "{}: log rotation failed: {err:#}",
                    self.config.name
                )),
            }
        }

        if self.handle.is_none() {
            self.handle = Some(self.new_handle());
        }
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        let result = handle.start_process(
            &spec.path,
            &spec.command,
            spec.log_file.as_deref(),
            &spec.env,
            spec.overwrite_env,
        );

        let group = handle.group();

        match result {
            Ok(pid) => {
                if let Some(group) = group {
                    self.diagnostics
                        .debug(format!("{}: pid {pid} leads group {group}", self.config.name));
                }
                self.machine.step(Input::StartSucceeded);
                self.mark_online(pid, &spec);
            }
            Err(err) => {
                self.diagnostics.error(format!(
                    "{}: start failed [{}]: {err}",
                    self.config.name,
                    err.kind()
                ));
                let follow_up = self.machine.step(Input::StartFailed);
                self.apply(follow_up);
            }
        }
    }

    fn sample(&mut self) {
        let Some(pid) = self.pid() else {
            return;
        };
        match self.ctx.metrics.sample(pid) {
            Ok(sample) => self.status.metrics = Some(sample),
            Err(err) => self.diagnostics.warning(format!(
                "{}: metrics sample failed: {err}",
                self.config.name
            )),
        }
    }

    fn mark_online(&mut self, pid: i32, spec: &ProcessSpec) {
        self.status.pid = pid;
        self.status.running = true;
        self.status.path = Some(spec.path.clone());
        self.status.command = Some(spec.command.clone());
        self.status.environment = Some(spec.env.clone());
    }

    fn mark_offline(&mut self) {
        self.status.pid = -1;
        self.status.running = false;
        self.status.path = None;
        self.status.command = None;
        self.status.environment = None;
        self.status.metrics = Some(MetricsSample::zero());
    }

    fn forward_diagnostics(&mut self) {
        let text = self.diagnostics.drain();
        for (line, level) in split_lines(&text, self.ctx.diag_max_chars) {
            self.sink.log(&line, level);
        }
    }

    fn publish(&mut self) {
        let limits = self.machine.limits();
        self.status.phase = self.machine.phase();
        self.status.enabled = self.machine.enabled();
        self.status.running = self.machine.running() && self.status.pid > 0;
        self.status.failed_attempts = self.machine.failed_attempts();
        self.status.restart_count = self.machine.restart_count();
        self.status.max_fails = limits.max_fails;
        self.status.max_restarts = limits.max_restarts;
        self.status.log_file = self.config.spec.log_file.clone();
        self.status.recent = self.sink.recent();
        self.status.updated_at = unix_now();
    }

    /// Tears the slot down. With `leave_running` the tracked process keeps
    /// running and its identity file stays behind for the next daemon.
    pub fn shutdown(&mut self, leave_running: bool) {
        if let Some(mut handle) = self.handle.take() {
            if leave_running {
                if let Some(pid) = handle.pid() {
                    self.diagnostics.info(format!(
                        "{}: leaving pid {pid} running, identity kept at {}",
                        self.config.name,
                        handle.identity().path().display()
                    ));
                }
                handle.disconnect();
            } else {
                self.configure_handle(&mut handle);
            }
            drop(handle);
        }
        if !leave_running {
            self.mark_offline();
        }
        self.forward_diagnostics();
        self.publish();
    }

    /// Blocking loop for a dedicated thread. Returns after a shutdown event,
    /// once the scheduler goes away, or when the config sender is dropped.
    pub fn run(
        mut self,
        mut events: broadcast::Receiver<SlotEvent>,
        mut config: watch::Receiver<SlotConfig>,
        status: watch::Sender<SlotStatus>,
    ) {
        debug!(slot = %self.config.name, "supervisor loop started");
        loop {
            match events.blocking_recv() {
                Ok(SlotEvent::Tick) | Err(RecvError::Lagged(_)) => {
                    match config.has_changed() {
                        Ok(true) => {
                            let next = config.borrow_and_update().clone();
                            self.apply_config(next);
                        }
                        Ok(false) => {}
                        // The scheduler dropped this slot from its configuration.
                        Err(_) => {
                            self.shutdown(false);
                            status.send_replace(self.status.clone());
                            break;
                        }
                    }
                    self.tick();
                    status.send_replace(self.status.clone());
                }
                Ok(SlotEvent::Shutdown { leave_running }) => {
                    self.shutdown(leave_running);
                    status.send_replace(self.status.clone());
                    break;
                }
                Err(RecvError::Closed) => {
                    self.shutdown(false);
                    status.send_replace(self.status.clone());
                    break;
                }
            }
        }
        info!(slot = %self.config.name, "supervisor stopped");
    }
}
