//! Pool work items
//!
//! Every task variant runs through the same entry/exit wrapper:
//!
//! ```text
//!   start_thread ─► body (catch_unwind) ─► [Duplex? continue as duplex] ─► finish_thread
//! ```
//!
//! `finish_thread` runs exactly once per task, whatever the body returned
//! and even when it panicked.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tcplink_core::{TaskKind, TaskResult};

use crate::launcher::WorkItem;
use crate::link::{Link, Session};

pub struct Task {
    kind: TaskKind,
    link: Arc<Link>,
}

impl Task {
    pub(crate) fn new(kind: TaskKind, link: Arc<Link>) -> Self {
        Self { kind, link }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }
}

fn run_body(link: &Arc<Link>, kind: TaskKind, session: &mut Session) -> TaskResult {
    match kind {
        TaskKind::Accept => link.handle_accept_task(session),
        TaskKind::Keepalive => link.handle_keepalive_task(session),
        TaskKind::KeepaliveTimeout => link.handle_keepalive_timeout_task(session),
        TaskKind::CometResume => link.handle_resume_task(session),
        TaskKind::Duplex => link.handle_duplex_task(session),
        // finish_thread tears the link down
        TaskKind::Destroy => TaskResult::Exit,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

impl WorkItem for Task {
    fn run(self) {
        let Task { mut kind, link } = self;

        let Some(mut session) = link.start_thread() else {
            return;
        };

        let result = loop {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_body(&link, kind, &mut session)));

            let result = match outcome {
                Ok(result) => result,
                Err(payload) => {
                    tracing::error!(
                        link = %link.id(),
                        task = %kind,
                        panic = panic_message(payload.as_ref()),
                        "task panicked"
                    );
                    link.close_after_panic(&mut session);
                    TaskResult::Exit
                }
            };

            // Upgrade continues on the same worker
            if result == TaskResult::Duplex && kind != TaskKind::Duplex {
                kind = TaskKind::Duplex;
                continue;
            }
            break result;
        };

        link.finish_thread(session, result);
    }

    fn abandon(self) {
        self.link.abandon(self.kind);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("link", &self.link.id())
            .finish()
    }
}
