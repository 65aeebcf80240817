//! Task kinds and their outcome

use core::fmt;

/// What a task tells the entry/exit wrapper when it returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    /// A request finished; the connection may be reused
    RequestComplete,
    /// Link is registered with the selector; detach the worker
    KeepaliveSelect,
    /// Link entered a comet cycle; detach unless already woken
    Async,
    /// Link upgraded; continue in the duplex read loop
    Duplex,
    /// Connection closed
    Closed,
    /// Worker leaves the link
    Exit,
}

/// Task variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Accept,
    Keepalive,
    KeepaliveTimeout,
    CometResume,
    Duplex,
    Destroy,
}

impl TaskKind {
    pub const fn name(&self) -> &'static str {
        match self {
            TaskKind::Accept => "accept",
            TaskKind::Keepalive => "keepalive",
            TaskKind::KeepaliveTimeout => "keepalive-timeout",
            TaskKind::CometResume => "comet-resume",
            TaskKind::Duplex => "duplex",
            TaskKind::Destroy => "destroy",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
