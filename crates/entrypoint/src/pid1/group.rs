use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

/// Target for relayed signals: the supervised child and its descendants.
pub trait ProcessGroup: Send + Sync {
    fn signal(&self, sig: Signal) -> nix::Result<()>;
}

/// The process group created for the child at spawn (`pgid == pid`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildGroup {
    pgid: Pid,
}

impl ChildGroup {
    pub fn new(pgid: Pid) -> Self {
        Self { pgid }
    }

    pub fn pgid(&self) -> Pid {
        self.pgid
    }
}

impl ProcessGroup for ChildGroup {
    fn signal(&self, sig: Signal) -> nix::Result<()> {
        killpg(self.pgid, sig)
    }
}
