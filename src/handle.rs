//! Ownership of one supervised process group.
//!
//! A [`ProcessHandle`] launches a command into its own process group, learns
//! the pid through the slot's identity file, and on drop escalates from the
//! configured stop signal to `SIGKILL`. Because the identity file lives in a
//! reboot-cleared directory, a supervisor that restarts can re-adopt a child
//! its previous incarnation launched.

use std::ffi::CString;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Once, RwLock};
use std::thread;
use std::time::Duration;

use nix::libc;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::diagnostics::Diagnostics;
use crate::errors::WardenError;
use crate::identity::IdentityFile;
use crate::logging::open_append;
use crate::probe::{GroupId, ProcessTable};
use crate::process::{parse_command_line, parse_environment};

pub const DEFAULT_SETTLE: Duration = Duration::from_secs(1);
const KILL_POLL_INTERVAL: Duration = Duration::from_secs(1);
const FORCE_KILL_GRACE: Duration = Duration::from_millis(500);
const REAP_INTERVAL: Duration = Duration::from_millis(200);
#[cfg(target_os = "linux")]
const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Spawners hold the read side across `Command::spawn`; the reaper holds the
/// write side while it sweeps. A failed exec makes std wait for its own child
/// inside `spawn`, and that child must not be reaped out from under it.
static SPAWN_GATE: RwLock<()> = RwLock::new(());

pub struct ProcessHandle {
    label: String,
    identity: IdentityFile,
    delete_after_read: bool,
    table: Arc<ProcessTable>,
    diagnostics: Diagnostics,
    pid: Option<i32>,
    group: Option<GroupId>,
    stop_signal: Signal,
    kill_timeout: Duration,
    pid_offset: i32,
    settle: Duration,
    connected: bool,
}

impl ProcessHandle {
    /// Builds a handle for the identity file `<identity_dir>/pgwarden-<identity_name>.pid`
    /// and adopts the pid it names when that process is still alive.
    pub fn new(
        table: Arc<ProcessTable>,
        identity_dir: &Path,
        identity_name: &str,
        delete_after_read: bool,
        diagnostics: Diagnostics,
        label: &str,
    ) -> Self {
        let identity = IdentityFile::for_slot(identity_dir, identity_name);
        let mut handle = Self {
            label: label.to_string(),
            identity,
            delete_after_read,
            table,
            diagnostics,
            pid: None,
            group: None,
            stop_signal: Signal::SIGTERM,
            kill_timeout: Duration::from_secs(5),
            pid_offset: 0,
            settle: DEFAULT_SETTLE,
            connected: true,
        };
        handle.recover();
        handle
    }

    fn recover(&mut self) {
        let recorded = self.table.serialized(|| self.identity.read());
        let pid = match recorded {
            Ok(Some(pid)) => pid,
            Ok(None) => return,
            Err(err) => {
                self.diagnostics.debug(format!(
                    "{}: identity {} unreadable: {err}",
                    self.label,
                    self.identity.path().display()
                ));
                return;
            }
        };

        if !self.table.is_alive(pid) {
            self.diagnostics.debug(format!(
                "{}: identity names pid {pid} which is gone; starting empty",
                self.label
            ));
            let _ = self.table.serialized(|| self.identity.remove());
        } else if !self.table.can_signal(pid) {
            self.diagnostics.warning(format!(
                "{}: identity names pid {pid} owned by another user; not adopting it",
                self.label
            ));
            let _ = self.table.serialized(|| self.identity.remove());
        } else {
            let group = GroupId::of(pid).unwrap_or_else(|| GroupId::leader(pid));
            self.pid = Some(pid);
            self.group = Some(group);
            self.diagnostics.info(format!(
                "{}: adopted running pid {pid} (group {group}) from {}",
                self.label,
                self.identity.path().display()
            ));
        }
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn identity(&self) -> &IdentityFile {
        &self.identity
    }

    /// True when a process is tracked and the process table still shows it.
    pub fn is_alive(&self) -> bool {
        self.pid.is_some_and(|pid| self.table.is_alive(pid))
    }

    pub fn set_stop_signal(&mut self, signal: Signal) {
        self.stop_signal = signal;
    }

    pub fn set_kill_timeout(&mut self, seconds: u64) {
        self.kill_timeout = Duration::from_secs(seconds);
    }

    /// Offset between the launched pid and the pid that is monitored, for
    /// wrappers that fork the real workload.
    pub fn set_pid_offset(&mut self, offset: i32) {
        self.pid_offset = offset;
    }

    pub fn set_settle(&mut self, settle: Duration) {
        self.settle = settle;
    }

    /// Leaves the tracked process running; dropping the handle afterwards
    /// neither signals it nor touches the identity file.
    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    pub fn start_process(
        &mut self,
        path: &Path,
        command: &str,
        log_file: Option<&Path>,
        environment: &str,
        overwrite_env: bool,
    ) -> Result<i32, WardenError> {
        if path.as_os_str().is_empty() {
            return Err(WardenError::InvalidArgument(
                "path cannot be empty".to_string(),
            ));
        }
        if command.trim().is_empty() {
            return Err(WardenError::InvalidArgument(
                "command cannot be empty".to_string(),
            ));
        }

        if self.is_alive() {
            self.diagnostics.warning(format!(
                "{}: start requested while pid {:?} is alive; stopping it first",
                self.label, self.pid
            ));
            self.kill()?;
        }
        self.pid = None;
        self.group = None;

        self.identity.ensure_writable_dir()?;

        let workdir = path.canonicalize().map_err(|err| {
            WardenError::Runtime(format!("working directory {}: {err}", path.display()))
        })?;
        let (program, args) = parse_command_line(command)?;
        let env = parse_environment(environment);
        for rejected in &env.rejected {
            self.diagnostics.warning(format!(
                "{}: ignoring environment entry without '=': {rejected}",
                self.label
            ));
        }

        let program_path = resolve_program(&workdir, &program);
        let mut child_command = Command::new(&program_path);
        child_command
            .args(&args)
            .current_dir(&workdir)
            .stdin(Stdio::null());
        if overwrite_env {
            child_command.env_clear();
        }
        child_command.envs(env.pairs.iter().map(|(key, value)| (key, value)));

        if let Some(log_file) = log_file {
            let (stdout, stderr) = open_log_file(log_file)?;
            child_command.stdout(stdout).stderr(stderr);
        }

        let identity_path = self.identity.c_path()?;
        let fd_limit = inherited_fd_limit();
        // Everything the child needs is prepared above; the closure only makes
        // async-signal-safe calls.
        unsafe {
            child_command.pre_exec(move || prepare_child(&identity_path, fd_limit));
        }

        self.diagnostics.debug(format!(
            "{}: launching {} in {}",
            self.label,
            program_path.display(),
            workdir.display()
        ));
        let spawned = {
            let _gate = SPAWN_GATE
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            child_command.spawn()
        };
        if let Err(err) = spawned {
            let _ = self.table.serialized(|| self.identity.remove());
            return Err(WardenError::Runtime(format!(
                "failed to exec {}: {err}",
                program_path.display()
            )));
        }

        thread::sleep(self.settle);

        let recorded = self
            .table
            .serialized(|| self.identity.read())?
            .ok_or_else(|| {
                WardenError::Runtime(format!(
                    "no pid recorded in {} within {:?}",
                    self.identity.path().display(),
                    self.settle
                ))
            })?;

        let tracked = recorded.saturating_add(self.pid_offset);
        self.table.serialized(|| -> Result<(), WardenError> {
            if self.delete_after_read {
                self.identity.remove()
            } else if tracked != recorded {
                self.identity.write(tracked)
            } else {
                Ok(())
            }
        })?;

        let group = GroupId::leader(recorded);
        self.pid = Some(tracked);
        self.group = Some(group);
        self.diagnostics.info(format!(
            "{}: started pid {tracked} (group {group})",
            self.label
        ));
        Ok(tracked)
    }

    /// Stops the tracked process group: stop signal, up to `kill_timeout`
    /// seconds of polling (at least one), then `SIGKILL`. If even that fails
    /// the pid stays tracked and an escalation error is returned.
    pub fn kill(&mut self) -> Result<(), WardenError> {
        let Some(pid) = self.pid else {
            self.forget_identity();
            return Ok(());
        };
        let group = self.group.unwrap_or_else(|| GroupId::leader(pid));

        if self.table.is_alive(pid) {
            self.diagnostics.info(format!(
                "{}: sending {} to group {group}",
                self.label, self.stop_signal
            ));
            if let Err(err) = group.signal(self.stop_signal) {
                self.diagnostics.warning(format!(
                    "{}: failed to send {} to group {group}: {err}",
                    self.label, self.stop_signal
                ));
            }

            let polls = self.kill_timeout.as_secs().max(1);
            let mut stopped = false;
            for _ in 0..polls {
                thread::sleep(KILL_POLL_INTERVAL);
                if !self.table.is_alive(pid) {
                    stopped = true;
                    break;
                }
            }

            if !stopped {
                self.diagnostics.warning(format!(
                    "{}: pid {pid} ignored {} for {polls}s; sending SIGKILL",
                    self.label, self.stop_signal
                ));
                if let Err(err) = group.signal(Signal::SIGKILL) {
                    self.diagnostics.warning(format!(
                        "{}: failed to send SIGKILL to group {group}: {err}",
                        self.label
                    ));
                }
                thread::sleep(FORCE_KILL_GRACE);
                if self.table.is_alive(pid) {
                    let message = format!("pid {pid} survived SIGKILL to group {group}");
                    self.diagnostics
                        .error(format!("{}: {message}", self.label));
                    return Err(WardenError::Escalation(message));
                }
            }

            let stragglers = self.table.group_size(group);
            if stragglers > 0 {
                self.diagnostics.warning(format!(
                    "{}: {stragglers} process(es) left in group {group}",
                    self.label
                ));
            }
            self.diagnostics
                .info(format!("{}: pid {pid} stopped", self.label));
        }

        self.pid = None;
        self.group = None;
        self.forget_identity();
        Ok(())
    }

    fn forget_identity(&self) {
        if self.delete_after_read {
            return;
        }
        if let Err(err) = self.table.serialized(|| self.identity.remove()) {
            self.diagnostics.warning(format!(
                "{}: failed to remove {}: {err}",
                self.label,
                self.identity.path().display()
            ));
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.connected {
            return;
        }
        // Escalation failures are already written to diagnostics.
        let _ = self.kill();
    }
}

/// Installs the process-wide reaper for children this process forks. Safe to
/// call any number of times; only the first call spawns the thread.
pub fn install_reaper() {
    static REAPER: Once = Once::new();
    REAPER.call_once(|| {
        let spawned = thread::Builder::new()
            .name("pgwarden-reaper".to_string())
            .spawn(|| loop {
                reap_exited_children();
                thread::sleep(REAP_INTERVAL);
            });
        if let Err(err) = spawned {
            tracing::error!("failed to start child reaper: {err}");
        }
    });
}

fn reap_exited_children() {
    let _gate = SPAWN_GATE
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

/// `program` relative to the working directory when it names a file there
/// (or contains a slash); otherwise left bare for `PATH` lookup.
pub(crate) fn resolve_program(workdir: &Path, program: &str) -> PathBuf {
    let candidate = Path::new(program);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    let joined = workdir.join(candidate);
    if program.contains('/') || joined.is_file() {
        joined
    } else {
        candidate.to_path_buf()
    }
}

fn open_log_file(path: &Path) -> Result<(Stdio, Stdio), WardenError> {
    let stdout = open_append(path)
        .map_err(|err| WardenError::Runtime(format!("log file {}: {err}", path.display())))?;
    let stderr = stdout.try_clone()?;
    Ok((Stdio::from(stdout), Stdio::from(stderr)))
}

fn inherited_fd_limit() -> libc::c_int {
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if limit <= 0 {
        1024
    } else {
        limit.min(libc::c_int::MAX as libc::c_long) as libc::c_int
    }
}

/// Sets `FD_CLOEXEC` on every descriptor from 3 up. Uses `close_range(2)`
/// where the kernel has it and walks the whole descriptor table otherwise.
unsafe fn mark_inherited_cloexec(fd_limit: libc::c_int) {
    #[cfg(target_os = "linux")]
    {
        let rc = libc::syscall(
            libc::SYS_close_range,
            3 as libc::c_uint,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        );
        if rc == 0 {
            return;
        }
    }
    for inherited in 3..fd_limit {
        let flags = libc::fcntl(inherited, libc::F_GETFD);
        if flags >= 0 && flags & libc::FD_CLOEXEC == 0 {
            libc::fcntl(inherited, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

/// Runs in the forked child between fork and exec.
fn prepare_child(identity_path: &CString, fd_limit: libc::c_int) -> std::io::Result<()> {
    unsafe {
        if libc::setpgid(0, 0) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let fd = libc::open(
            identity_path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        );
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let mut digits = [0_u8; 16];
        let text = format_pid(libc::getpid(), &mut digits);
        let mut written = 0_usize;
        while written < text.len() {
            let rc = libc::write(
                fd,
                text[written..].as_ptr() as *const libc::c_void,
                text.len() - written,
            );
            if rc <= 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            written += rc as usize;
        }
        libc::close(fd);

        mark_inherited_cloexec(fd_limit);
    }
    Ok(())
}

/// Decimal rendering without allocation.
fn format_pid(pid: libc::pid_t, buffer: &mut [u8; 16]) -> &[u8] {
    let mut value = pid.max(0) as u32;
    let mut start = buffer.len();
    loop {
        start -= 1;
        buffer[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &buffer[start..]
}
