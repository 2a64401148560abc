//! Serialized access to the OS process table.
//!
//! `sysinfo::System` keeps per-process state between refreshes and is not
//! meant to be poked from several slots at once, so every query goes through
//! one mutex. Identity-file I/O takes the same lock (see [`ProcessTable::serialized`]).

use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use sysinfo::{Pid as SysPid, ProcessStatus, ProcessesToUpdate, System};

use crate::errors::WardenError;
use crate::metrics::{MetricsSample, MetricsSource};

/// A process-group id. Only values known to be a group leader's pid are
/// wrapped, so signalling through this type always reaches the whole group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(i32);

impl GroupId {
    /// The caller guarantees `pid` called `setpgid(0, 0)` before exec.
    pub fn leader(pid: i32) -> Self {
        Self(pid)
    }

    /// Resolves the group a running pid belongs to.
    pub fn of(pid: i32) -> Option<Self> {
        if pid <= 0 {
            return None;
        }
        getpgid(Some(Pid::from_raw(pid)))
            .ok()
            .map(|pgid| Self(pgid.as_raw()))
    }

    #[cfg(test)]
    pub fn as_raw(self) -> i32 {
        self.0
    }

    /// Delivers `signal` to `-pgid`. A group that is already gone is not an error.
    pub fn signal(self, signal: Signal) -> Result<(), Errno> {
        match killpg(Pid::from_raw(self.0), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "-{}", self.0)
    }
}

pub struct ProcessTable {
    system: Mutex<System>,
}

impl ProcessTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            system: Mutex::new(System::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, System> {
        self.system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` while holding the process-table lock.
    pub fn serialized<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.lock();
        f()
    }

    /// A pid is alive when it exists and is not a zombie waiting to be reaped.
    pub fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None::<Signal>) {
            Ok(()) | Err(Errno::EPERM) => {}
            Err(_) => return false,
        }

        let sys_pid = SysPid::from_u32(pid as u32);
        let mut system = self.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        match system.process(sys_pid) {
            Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
            // Not visible to the table (e.g. another user's pid namespace); trust kill(2).
            None => true,
        }
    }

    /// False for pids this process may not signal, such as another user's.
    pub fn can_signal(&self, pid: i32) -> bool {
        pid > 0 && kill(Pid::from_raw(pid), None::<Signal>).is_ok()
    }

    /// Counts live members of a process group.
    pub fn group_size(&self, group: GroupId) -> usize {
        let mut system = self.lock();
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
            .processes()
            .iter()
            .filter(|(_, process)| {
                !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
            })
            .filter(|(pid, _)| GroupId::of(pid.as_u32() as i32) == Some(group))
            .count()
    }
}

impl MetricsSource for ProcessTable {
    fn sample(&self, pid: i32) -> Result<MetricsSample, WardenError> {
        if pid <= 0 {
            return Err(WardenError::InvalidArgument(format!("pid {pid}")));
        }
        let sys_pid = SysPid::from_u32(pid as u32);
        let mut system = self.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        let process = system.process(sys_pid).ok_or_else(|| {
            WardenError::Runtime(format!("pid {pid} not present in process table"))
        })?;
        Ok(MetricsSample {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
            uptime_secs: process.run_time(),
        })
    }
}
