//! PID 1 responsibilities: launch the single child, relay signals to it and
//! reap every zombie until it exits.
//!
//! Based on the same patterns as [tini](https://github.com/krallin/tini):
//! - the child gets its own process group so signals reach its descendants
//! - the stop signal becomes a pre-stop notification followed, after a grace
//!   period, by the real stop signal
//! - outside of PID 1 we register as a child subreaper so orphans still land
//!   on us

pub mod group;
pub mod reaper;
pub mod relay;

use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Arc;

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::error::{EXIT_SPAWN_FAILED, EntrypointError, EntrypointResult};
use group::ChildGroup;
use reaper::Reaper;
pub use relay::ShutdownPolicy;

/// Exit code for a reaped child: its own code, `128 + signal` when killed by
/// a signal, or the spawn-failure sentinel when the status is undecodable.
pub fn exit_code(status: WaitStatus) -> u8 {
    let code = match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => return EXIT_SPAWN_FAILED,
    };
    u8::try_from(code).unwrap_or(EXIT_SPAWN_FAILED)
}

/// Make orphaned descendants reparent to us when we are not PID 1.
fn become_subreaper() {
    if nix::unistd::getpid() == Pid::from_raw(1) {
        return;
    }
    match nix::sys::prctl::set_child_subreaper(true) {
        Ok(()) => info!("not running as PID 1; registered as child subreaper"),
        Err(e) => warn!(error = %e, "could not register as child subreaper"),
    }
}

/// Spawn `command` and supervise it until it exits. Returns the exit code
/// this process should report.
pub async fn supervise(command: &[String], policy: ShutdownPolicy) -> EntrypointResult<u8> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| EntrypointError::Config("no command to run".into()))?;

    become_subreaper();

    // Listen before spawning so nothing the child does is missed.
    let sigchld = signal(SignalKind::child())
        .map_err(|e| EntrypointError::Signal(format!("listen for SIGCHLD: {e}")))?;
    let signals = relay::subscribe(relay::RELAYED_SIGNALS)?;

    let child = Command::new(program)
        .args(args)
        .process_group(0)
        .spawn()
        .map_err(|source| {
            error!(program = %program, error = %source, "failed to start child");
            EntrypointError::Spawn {
                program: program.clone(),
                source,
            }
        })?;
    let pid = i32::try_from(child.id())
        .map(Pid::from_raw)
        .map_err(|e| EntrypointError::Spawn {
            program: program.clone(),
            source: std::io::Error::other(format!("pid out of range: {e}")),
        })?;
    // The reaper collects the child; the std handle is never waited on.
    drop(child);

    let group = ChildGroup::new(pid);
    info!(pid = pid.as_raw(), pgid = group.pgid().as_raw(), program = %program, "child started");

    tokio::spawn(relay::relay(signals, Arc::new(group), policy));

    let (exited_tx, exited_rx) = oneshot::channel();
    tokio::spawn(Reaper::new(pid, sigchld, exited_tx).run());

    let code = match exited_rx.await {
        Ok(status) => exit_code(status),
        Err(_) => {
            error!(pid = pid.as_raw(), "reaper stopped before the child exited");
            EXIT_SPAWN_FAILED
        }
    };
    if code != 0 {
        warn!(code, command = ?command, "child exited with non-zero code");
    } else {
        info!("child exited cleanly");
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn exit_code_decoding() {
        let pid = Pid::from_raw(42);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 0)), 0);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 7)), 7);
        assert_eq!(exit_code(WaitStatus::Signaled(pid, Signal::SIGTERM, false)), 143);
        assert_eq!(exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, true)), 137);
        assert_eq!(exit_code(WaitStatus::StillAlive), EXIT_SPAWN_FAILED);
        assert_eq!(exit_code(WaitStatus::Continued(pid)), EXIT_SPAWN_FAILED);
    }
}
