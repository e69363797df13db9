//! Signal relay: everything this process receives is passed on to the child's
//! process group, except the stop signal which triggers a two-phase shutdown.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::group::ProcessGroup;
use crate::error::{EntrypointError, EntrypointResult};

/// Signals relayed to the child. SIGCHLD drives the reaper instead; SIGKILL
/// and SIGSTOP cannot be caught; synchronous faults are never forwarded.
pub const RELAYED_SIGNALS: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGTERM,
    Signal::SIGALRM,
    Signal::SIGWINCH,
    Signal::SIGCONT,
    Signal::SIGTSTP,
    Signal::SIGURG,
    Signal::SIGIO,
    Signal::SIGPWR,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Signal the container runtime sends to stop us.
    pub stop_signal: Signal,
    /// Sent to the child immediately so it can deregister from routing.
    pub pre_stop_signal: Signal,
    /// Delay between the pre-stop signal and the relayed stop signal.
    pub grace: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            stop_signal: Signal::SIGTERM,
            pre_stop_signal: Signal::SIGUSR1,
            grace: Duration::from_secs(3),
        }
    }
}

/// Install handlers for `signals` and funnel every delivery into one channel.
pub fn subscribe(signals: &[Signal]) -> EntrypointResult<mpsc::UnboundedReceiver<Signal>> {
    let (tx, rx) = mpsc::unbounded_channel();
    for &sig in signals {
        let mut stream = signal(SignalKind::from_raw(sig as i32))
            .map_err(|e| EntrypointError::Signal(format!("listen for {sig}: {e}")))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).is_err() {
                    break;
                }
            }
        });
    }
    Ok(rx)
}

/// Relay signals from `signals` to `group` until the channel closes.
///
/// The delayed stop signal runs on its own task, so signals arriving during
/// the grace window are still relayed immediately.
pub async fn relay(
    mut signals: mpsc::UnboundedReceiver<Signal>,
    group: Arc<dyn ProcessGroup>,
    policy: ShutdownPolicy,
) {
    while let Some(sig) = signals.recv().await {
        if sig != policy.stop_signal {
            send(group.as_ref(), sig);
            continue;
        }

        info!(
            signal = %sig,
            pre_stop = %policy.pre_stop_signal,
            grace_ms = policy.grace.as_millis() as u64,
            "stop requested; notifying child before shutdown"
        );
        send(group.as_ref(), policy.pre_stop_signal);

        let group = Arc::clone(&group);
        tokio::spawn(async move {
            tokio::time::sleep(policy.grace).await;
            info!(signal = %policy.stop_signal, "grace period over; stopping child");
            send(group.as_ref(), policy.stop_signal);
        });
    }
}

fn send(group: &dyn ProcessGroup, sig: Signal) {
    match group.signal(sig) {
        Ok(()) => info!(signal = %sig, "relayed signal to child group"),
        Err(e) => warn!(signal = %sig, error = %e, "failed to relay signal"),
    }
}
