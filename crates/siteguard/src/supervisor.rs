//! Lifecycle of the long-running tasks.
//!
//! Pollers and the push listener each run as their own tokio task. The
//! [`Supervisor`] owns their handles so that they can be stopped together.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::detection::Domain;
use crate::error::{Error, Result};

/// What a supervised task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// A detection poller.
    Poller(Domain),
    /// The push-channel listener.
    Listener,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Poller(domain) => write!(f, "poller:{domain}"),
            Self::Listener => write!(f, "listener"),
        }
    }
}

/// Handle to one supervised task.
#[derive(Debug)]
pub struct TaskHandle {
    kind: TaskKind,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// What the task does.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Ask the task to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the task was asked to stop.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the task has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// The set of running tasks.
#[derive(Debug, Default)]
pub struct Supervisor {
    root: CancellationToken,
    tasks: Vec<TaskHandle>,
}

impl Supervisor {
    /// Create an empty supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task. `task` receives the token that stops it.
    pub fn spawn<F, Fut>(&mut self, kind: TaskKind, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.root.child_token();
        let join = tokio::spawn(task(cancel.clone()));
        debug!(task = %kind, "Task spawned");
        self.tasks.push(TaskHandle { kind, cancel, join });
    }

    /// Number of supervised tasks.
    #[must_use]
    pub fn count(&self) -> usize {
        self.tasks.len()
    }

    /// Whether any task is still running.
    #[must_use]
    pub fn any_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Handles of the supervised tasks.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskHandle> {
        self.tasks.iter()
    }

    /// Signal every task to stop.
    pub fn stop_all(&self) {
        self.root.cancel();
    }

    /// Stop every task and wait up to `grace` for each to return.
    ///
    /// # Errors
    ///
    /// Returns an error naming the tasks that did not stop in time or
    /// panicked.
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        self.stop_all();
        let mut stuck = Vec::new();
        for handle in self.tasks {
            let kind = handle.kind;
            match tokio::time::timeout(grace, handle.join).await {
                Ok(Ok(())) => debug!(task = %kind, "Task stopped"),
                Ok(Err(e)) => {
                    warn!(task = %kind, error = %e, "Task failed");
                    stuck.push(kind.to_string());
                }
                Err(_) => {
                    warn!(task = %kind, "Task did not stop in time");
                    stuck.push(kind.to_string());
                }
            }
        }
        if stuck.is_empty() {
            Ok(())
        } else {
            Err(Error::timeout(format!("stopping {}", stuck.join(", "))))
        }
    }
}
