//! Zombie reaping.
//!
//! The reaper is the only place that calls `waitpid`. It collects every
//! terminated descendant, including the supervised child, whose status is
//! handed back to the supervisor. Splitting that between a blanket
//! `waitpid(-1)` and a per-child wait would race: whichever runs first steals
//! the other's status and the loser sees `ECHILD`.

use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::signal::unix::Signal as SignalStream;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// A process collected by [`reap_zombies`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: Pid,
    pub status: WaitStatus,
}

/// Collect every terminated child without blocking.
///
/// Stops when nothing else has exited yet or when there are no children
/// left. `EINTR` is retried.
pub fn reap_zombies() -> Vec<Reaped> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => match status.pid() {
                Some(pid) => reaped.push(Reaped { pid, status }),
                None => break,
            },
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                warn!(error = %e, "waitpid failed");
                break;
            }
        }
    }
    reaped
}

/// Background reaper bound to one supervised child.
pub struct Reaper {
    child: Pid,
    sigchld: SignalStream,
    exited: Option<oneshot::Sender<WaitStatus>>,
}

impl Reaper {
    /// `sigchld` must be registered before the child is spawned so that an
    /// early exit is not missed.
    pub fn new(child: Pid, sigchld: SignalStream, exited: oneshot::Sender<WaitStatus>) -> Self {
        Self {
            child,
            sigchld,
            exited: Some(exited),
        }
    }

    /// Sweep once up front, then again on every SIGCHLD.
    pub async fn run(mut self) {
        loop {
            self.sweep();
            if self.sigchld.recv().await.is_none() {
                break;
            }
        }
    }

    fn sweep(&mut self) {
        for Reaped { pid, status } in reap_zombies() {
            if pid != self.child {
                info!(pid = pid.as_raw(), status = ?status, "reaped zombie process");
                continue;
            }
            info!(pid = pid.as_raw(), status = ?status, "child exited");
            if let Some(tx) = self.exited.take() {
                let _ = tx.send(status);
            }
        }
    }
}
