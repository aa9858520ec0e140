use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Child;
use warden_process::ResourceUsage;

use crate::support;

/// What a liveness probe saw.
///
/// An unreadable probe is reported as `Gone`; the state machine decides what that
/// means for the current state (crash vs. completed stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive { responding: bool },
    Gone,
}

impl Liveness {
    pub fn is_alive(self) -> bool {
        matches!(self, Liveness::Alive { .. })
    }
}

/// OS-level view of one externally launched process.
#[async_trait]
pub trait OsProcess: Send + Sync {
    fn pid(&self) -> u32;

    async fn probe(&self) -> Liveness;

    /// Memory and CPU time; zero once the process is gone.
    async fn usage(&self) -> ResourceUsage;

    /// Politely ask the process to exit. Returns whether the request was delivered.
    async fn close_main_window(&self) -> bool;

    async fn kill(&self) -> anyhow::Result<()>;
}

/// A real process, addressed by PID.
///
/// When the supervisor also owns the [`Child`], exits are reaped through it so the
/// PID does not linger as a zombie entry.
#[derive(Debug)]
pub struct SystemProcess {
    pid: u32,
    child: Option<Mutex<Child>>,
}

impl SystemProcess {
    pub fn attach(pid: u32) -> Self {
        Self { pid, child: None }
    }

    pub fn from_child(child: Child) -> anyhow::Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("child has already exited"))?;
        Ok(Self {
            pid,
            child: Some(Mutex::new(child)),
        })
    }

    fn child_exited(&self) -> Option<bool> {
        let child = self.child.as_ref()?;
        let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
        Some(!matches!(child.try_wait(), Ok(None)))
    }
}

#[async_trait]
impl OsProcess for SystemProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn probe(&self) -> Liveness {
        if self.child_exited() == Some(true) {
            return Liveness::Gone;
        }
        probe_pid(self.pid, self.child.is_some()).await
    }

    async fn usage(&self) -> ResourceUsage {
        if !self.probe().await.is_alive() {
            return ResourceUsage::default();
        }
        let memory_bytes = support::read_proc_rss_bytes(self.pid).await.unwrap_or(0);
        let cpu_time = support::read_proc_cpu_ticks(self.pid)
            .await
            .map(support::ticks_to_duration)
            .unwrap_or_default();
        ResourceUsage {
            memory_bytes,
            cpu_time,
        }
    }

    async fn close_main_window(&self) -> bool {
        send_signal(self.pid, Signal::Terminate)
    }

    async fn kill(&self) -> anyhow::Result<()> {
        if let Some(child) = &self.child {
            let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
            return match child.start_kill() {
                Ok(()) => Ok(()),
                // Already reaped.
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                Err(e) => Err(anyhow::Error::new(e).context(format!("kill pid {}", self.pid))),
            };
        }
        if send_signal(self.pid, Signal::Kill) || !probe_pid(self.pid, false).await.is_alive() {
            return Ok(());
        }
        anyhow::bail!("failed to kill pid {}", self.pid)
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe { libc::kill(pid, sig) == 0 }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) -> bool {
    false
}

#[cfg(target_os = "linux")]
async fn probe_pid(pid: u32, _owned: bool) -> Liveness {
    match support::read_proc_state(pid).await {
        None => Liveness::Gone,
        Some('Z' | 'X' | 'x') => Liveness::Gone,
        Some('T' | 't' | 'D') => Liveness::Alive { responding: false },
        Some(_) => Liveness::Alive { responding: true },
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn probe_pid(pid: u32, _owned: bool) -> Liveness {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Liveness::Gone;
    };
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM) {
        Liveness::Alive { responding: true }
    } else {
        Liveness::Gone
    }
}

// Without /proc or signals only an owned child can be observed.
#[cfg(not(unix))]
async fn probe_pid(_pid: u32, owned: bool) -> Liveness {
    if owned {
        Liveness::Alive { responding: true }
    } else {
        Liveness::Gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn probe_sees_own_process_alive() {
        let me = SystemProcess::attach(std::process::id());
        assert!(me.probe().await.is_alive());
        let usage = me.usage().await;
        assert!(usage.memory_bytes > 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn probe_reports_missing_pid_gone() {
        // PID numbers above pid_max are never allocated.
        let ghost = SystemProcess::attach(u32::MAX - 1);
        assert_eq!(ghost.probe().await, Liveness::Gone);
        assert_eq!(ghost.usage().await, ResourceUsage::default());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn owned_child_is_gone_after_kill() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let p = SystemProcess::from_child(child).unwrap();
        assert!(p.probe().await.is_alive());

        p.kill().await.unwrap();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while p.probe().await.is_alive() {
            assert!(tokio::time::Instant::now() < deadline, "child survived kill");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}
