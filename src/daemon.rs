use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, watch};
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::diagnostics::SlotLogSink;
use crate::errors::WardenError;
use crate::handle::install_reaper;
use crate::identity::IdentityFile;
use crate::logging::slot_log_path;
use crate::probe::ProcessTable;
use crate::process::{SlotConfig, SlotStatus};
use crate::slotfile::load_slots;
use crate::storage::{load_control, save_status, StatusSnapshot};
use crate::supervisor::{SlotEvent, Supervisor, SupervisorContext};

const RECENT_LINES: usize = 32;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

struct SlotWorker {
    config_tx: watch::Sender<SlotConfig>,
    status_rx: watch::Receiver<SlotStatus>,
    thread: JoinHandle<()>,
}

/// Modification times of the files the desired slot set is built from.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
struct SourceStamps {
    slots: Option<SystemTime>,
    control: Option<SystemTime>,
}

impl SourceStamps {
    fn read(slots_path: &Path, control_path: &Path) -> Self {
        let stamp = |path: &Path| fs::metadata(path).and_then(|meta| meta.modified()).ok();
        Self {
            slots: stamp(slots_path),
            control: stamp(control_path),
        }
    }
}

/// Slot definitions with operator overrides and default log paths applied.
pub fn desired_slots(config: &AppConfig, slots_path: &Path) -> Result<Vec<SlotConfig>> {
    let mut slots = load_slots(slots_path)?;
    let overrides = load_control(&config.control_path)?;
    for slot in &mut slots {
        if let Some(enabled) = overrides.enabled.get(&slot.name) {
            slot.enabled = *enabled;
        }
        if slot.spec.log_file.is_none() {
            slot.spec.log_file = Some(slot_log_path(&config.log_dir, &slot.name));
        }
    }
    Ok(slots)
}

struct Scheduler {
    config: AppConfig,
    slots_path: PathBuf,
    ctx: SupervisorContext,
    events: broadcast::Sender<SlotEvent>,
    workers: BTreeMap<String, SlotWorker>,
    retired: Vec<JoinHandle<()>>,
    stamps: SourceStamps,
}

impl Scheduler {
    fn new(config: AppConfig, slots_path: PathBuf) -> Self {
        let mut ctx = SupervisorContext::new(ProcessTable::new(), config.runtime_dir.clone());
        ctx.settle = config.settle;
        ctx.diag_level = config.diag_level;
        ctx.diag_max_chars = config.diag_max_chars;
        ctx.log_rotation = Some(config.log_rotation);
        let (events, _) = broadcast::channel(16);
        Self {
            config,
            slots_path,
            ctx,
            events,
            workers: BTreeMap::new(),
            retired: Vec::new(),
            stamps: SourceStamps::default(),
        }
    }

    /// Reconciles running workers with the slot file and control overrides
    /// when either changed on disk.
    fn reload_if_changed(&mut self) -> Result<()> {
        let stamps = SourceStamps::read(&self.slots_path, &self.config.control_path);
        if stamps == self.stamps {
            return Ok(());
        }
        let desired = desired_slots(&self.config, &self.slots_path)?;
        self.stamps = stamps;

        let wanted: BTreeMap<String, SlotConfig> = desired
            .into_iter()
            .map(|slot| (slot.name.clone(), slot))
            .collect();

        let removed: Vec<String> = self
            .workers
            .keys()
            .filter(|name| !wanted.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(worker) = self.workers.remove(&name) {
                info!(slot = %name, "slot removed from configuration; stopping");
                drop(worker.config_tx);
                self.retired.push(worker.thread);
            }
        }

        for (name, slot) in wanted {
            if let Some(worker) = self.workers.get(&name) {
                worker.config_tx.send_if_modified(|current| {
                    if *current == slot {
                        false
                    } else {
                        *current = slot;
                        true
                    }
                });
                continue;
            }
            let worker = self.spawn_worker(slot)?;
            self.workers.insert(name, worker);
        }
        Ok(())
    }

    fn spawn_worker(&self, slot: SlotConfig) -> Result<SlotWorker> {
        let name = slot.name.clone();
        let sink = Box::new(SlotLogSink::new(&name, RECENT_LINES));
        let supervisor = Supervisor::new(slot.clone(), self.ctx.clone(), sink);
        if supervisor.status().running {
            info!(slot = %name, pid = supervisor.status().pid, "re-adopted running process");
        }

        let (config_tx, config_rx) = watch::channel(slot);
        let (status_tx, status_rx) = watch::channel(supervisor.status().clone());
        let events = self.events.subscribe();
        let thread = thread::Builder::new()
            .name(format!("slot-{name}"))
            .spawn(move || supervisor.run(events, config_rx, status_tx))
            .with_context(|| format!("failed to spawn supervisor thread for {name}"))?;

        Ok(SlotWorker {
            config_tx,
            status_rx,
            thread,
        })
    }

    fn status_changed(&self) -> bool {
        self.workers
            .values()
            .any(|worker| worker.status_rx.has_changed().unwrap_or(false))
    }

    fn snapshot(&mut self) -> StatusSnapshot {
        let slots = self
            .workers
            .values_mut()
            .map(|worker| worker.status_rx.borrow_and_update().clone())
            .collect();
        snapshot_of(slots)
    }

    fn save_snapshot(&mut self) {
        let snapshot = self.snapshot();
        self.write_snapshot(&snapshot);
    }

    fn write_snapshot(&self, snapshot: &StatusSnapshot) {
        if let Err(err) = save_status(&self.config.status_path, snapshot) {
            error!("failed to write status snapshot: {err:#}");
        }
    }

    fn join_retired(&mut self) {
        let (finished, pending): (Vec<_>, Vec<_>) = self
            .retired
            .drain(..)
            .partition(|thread| thread.is_finished());
        self.retired = pending;
        for thread in finished {
            if thread.join().is_err() {
                error!("a retired supervisor thread panicked");
            }
        }
    }

    /// Restarts supervisors whose thread ended while the slot is still
    /// configured. The replacement re-adopts the slot's process from its
    /// identity file; counters start from zero.
    fn revive_stopped_workers(&mut self) {
        let stopped: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.thread.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        for name in stopped {
            let Some(worker) = self.workers.remove(&name) else {
                continue;
            };
            let slot = worker.config_tx.borrow().clone();
            match worker.thread.join() {
                Ok(()) => warn!(slot = %name, "supervisor thread exited early; restarting it"),
                Err(_) => error!(slot = %name, "supervisor thread panicked; restarting it"),
            }
            match self.spawn_worker(slot) {
                Ok(worker) => {
                    self.workers.insert(name, worker);
                }
                Err(err) => error!(slot = %name, "failed to restart supervisor: {err:#}"),
            }
        }
    }

    /// Broadcasts shutdown and waits for every supervisor to finish its
    /// escalation. Config senders stay alive until then so no worker mistakes
    /// the shutdown for a retirement.
    async fn shutdown(mut self, leave_running: bool) {
        let _ = self.events.send(SlotEvent::Shutdown { leave_running });

        let mut channels = Vec::with_capacity(self.workers.len());
        let mut threads: Vec<JoinHandle<()>> = self.retired.drain(..).collect();
        for (_, worker) in std::mem::take(&mut self.workers) {
            channels.push((worker.config_tx, worker.status_rx));
            threads.push(worker.thread);
        }

        let joined = tokio::task::spawn_blocking(move || {
            threads
                .into_iter()
                .filter_map(|thread| thread.join().err())
                .count()
        })
        .await;
        match joined {
            Ok(0) => {}
            Ok(panicked) => error!("{panicked} supervisor thread(s) panicked during shutdown"),
            Err(err) => error!("failed to join supervisor threads: {err}"),
        }

        let slots = channels
            .iter()
            .map(|(_, status_rx)| status_rx.borrow().clone())
            .collect();
        self.write_snapshot(&snapshot_of(slots));
    }
}

fn snapshot_of(slots: Vec<SlotStatus>) -> StatusSnapshot {
    StatusSnapshot {
        daemon_pid: std::process::id(),
        updated_at: SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0),
        slots,
    }
}

/// Refuses to start a second daemon against the same home directory.
fn claim_daemon_pid(config: &AppConfig) -> Result<IdentityFile> {
    let table = ProcessTable::new();
    let marker = IdentityFile::for_slot(&config.base_dir, "daemon");
    if let Some(pid) = marker.read()? {
        if pid != std::process::id() as i32 && table.is_alive(pid) {
            return Err(WardenError::DaemonAlreadyRunning(pid).into());
        }
    }
    marker.write(std::process::id() as i32)?;
    Ok(marker)
}

pub async fn run_foreground(
    config: AppConfig,
    slots_path: Option<PathBuf>,
    leave_running: bool,
) -> Result<()> {
    config.ensure_layout()?;
    let slots_path = slots_path.unwrap_or_else(|| config.slots_path.clone());
    if !slots_path.exists() {
        anyhow::bail!("slot file not found: {}", slots_path.display());
    }
    IdentityFile::for_slot(&config.runtime_dir, "probe")
        .ensure_writable_dir()
        .context("identity directory is not usable")?;
    let marker = claim_daemon_pid(&config)?;
    install_reaper();

    let mut scheduler = Scheduler::new(config.clone(), slots_path.clone());
    scheduler.reload_if_changed()?;
    scheduler.save_snapshot();

    let mut tick = tokio::time::interval(config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut flush = tokio::time::interval(FLUSH_INTERVAL);
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    info!(
        "pgwarden supervising {} slot(s) from {} every {:?}",
        scheduler.workers.len(),
        slots_path.display(),
        config.tick_interval
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(err) = scheduler.reload_if_changed() {
                    warn!("keeping previous slot configuration: {err:#}");
                }
                scheduler.join_retired();
                scheduler.revive_stopped_workers();
                if scheduler.events.send(SlotEvent::Tick).is_err() {
                    warn!("no slots configured");
                }
            }
            _ = flush.tick() => {
                if scheduler.status_changed() {
                    scheduler.save_snapshot();
                }
            }
            ctrl = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl {
                    warn!("failed to wait for CTRL-C signal: {err}");
                }
                info!("received interrupt; shutting down supervisors");
                break;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM; shutting down supervisors");
                break;
            }
        }
    }

    scheduler.shutdown(leave_running).await;
    if let Err(err) = marker.remove() {
        warn!("failed to remove daemon marker: {err}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use super::{desired_slots, Scheduler};
    use crate::supervisor::SlotEvent;
    use crate::config::AppConfig;
    use crate::diagnostics::DiagLevel;
    use crate::logging::LogRotationPolicy;
    use crate::storage::{save_control, ControlOverrides};

    #[test]
    fn control_overrides_and_default_log_paths_are_applied() {
        let config = test_config("desired");
        let slots_path = config.base_dir.join("slots.toml");
        fs::write(
            &slots_path,
            "[[slots]]\nname = \"web\"\ncommand = \"sleep 30\"\n\n[[slots]]\nname = \"db\"\ncommand = \"sleep 30\"\nlog_file = \"/tmp/db.log\"\n",
        )
        .expect("failed to write slot file");
        let mut overrides = ControlOverrides::default();
        overrides.enabled.insert("web".to_string(), false);
        save_control(&config.control_path, &overrides).expect("failed to write overrides");

        let slots = desired_slots(&config, &slots_path).expect("slots should load");
        let web = slots.iter().find(|slot| slot.name == "web").expect("web");
        let db = slots.iter().find(|slot| slot.name == "db").expect("db");
        assert!(!web.enabled);
        assert_eq!(web.spec.log_file, Some(config.log_dir.join("web.log")));
        assert!(db.enabled);
        assert_eq!(db.spec.log_file, Some(PathBuf::from("/tmp/db.log")));

        let _ = fs::remove_dir_all(&config.base_dir);
    }

    #[test]
    fn reload_spawns_and_retires_workers() {
        let config = test_config("reload");
        let slots_path = config.base_dir.join("slots.toml");
        fs::write(
            &slots_path,
            "[[slots]]\nname = \"a\"\ncommand = \"sleep 30\"\nenabled = false\n\n[[slots]]\nname = \"b\"\ncommand = \"sleep 30\"\nenabled = false\n",
        )
        .expect("failed to write slot file");

        let mut scheduler = Scheduler::new(config.clone(), slots_path.clone());
        scheduler.reload_if_changed().expect("initial load");
        assert_eq!(
            scheduler.workers.keys().cloned().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );

        std::thread::sleep(Duration::from_millis(20));
        fs::write(
            &slots_path,
            "[[slots]]\nname = \"b\"\ncommand = \"sleep 30\"\nenabled = false\n",
        )
        .expect("failed to rewrite slot file");
        scheduler.reload_if_changed().expect("reload");
        assert_eq!(scheduler.workers.len(), 1);
        assert_eq!(scheduler.retired.len(), 1);

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.slots.len(), 1);
        assert_eq!(snapshot.slots[0].name, "b");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("failed to build runtime");
        runtime.block_on(scheduler.shutdown(false));
        assert!(config.status_path.exists());

        let _ = fs::remove_dir_all(&config.base_dir);
    }

    #[test]
    fn finished_worker_is_replaced_on_next_check() {
        let config = test_config("revive");
        let slots_path = config.base_dir.join("slots.toml");
        fs::write(
            &slots_path,
            "[[slots]]\nname = \"solo\"\ncommand = \"sleep 30\"\nenabled = false\n",
        )
        .expect("failed to write slot file");

        let mut scheduler = Scheduler::new(config.clone(), slots_path);
        scheduler.reload_if_changed().expect("initial load");
        scheduler
            .events
            .send(SlotEvent::Shutdown {
                leave_running: false,
            })
            .expect("worker should be listening");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !scheduler.workers["solo"].thread.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(scheduler.workers["solo"].thread.is_finished());

        scheduler.revive_stopped_workers();
        let revived = &scheduler.workers["solo"];
        assert!(!revived.thread.is_finished(), "a fresh supervisor should be running");
        assert_eq!(revived.config_tx.borrow().name, "solo");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("failed to build runtime");
        runtime.block_on(scheduler.shutdown(false));
        let _ = fs::remove_dir_all(&config.base_dir);
    }

    fn test_config(prefix: &str) -> AppConfig {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let base_dir = std::env::temp_dir().join(format!("pgwarden-daemon-{prefix}-{nonce}"));
        let config = AppConfig {
            slots_path: base_dir.join("slots.toml"),
            status_path: base_dir.join("status.json"),
            control_path: base_dir.join("control.json"),
            log_dir: base_dir.join("logs"),
            log_rotation: LogRotationPolicy {
                max_size_bytes: 1024 * 1024,
                max_files: 2,
            },
            runtime_dir: base_dir.join("run"),
            tick_interval: Duration::from_millis(100),
            settle: Duration::from_millis(100),
            diag_max_chars: 256,
            diag_level: DiagLevel::Debug,
            base_dir,
        };
        config.ensure_layout().expect("failed to create layout");
        config
    }
}
