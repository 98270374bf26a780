//! Supervision of per-peer tasks.
//!
//! Every peer connection runs as a child task of the manager's supervisor.
//! The supervisor watches each child and, whatever way it ends - clean
//! return, diagnostic kill, I/O error, or panic - posts a `PeerDied`
//! notification to the manager's mailbox so the registry can be cleaned up
//! and events published. On shutdown all remaining children are aborted,
//! and shutdown completes only once every death has been posted.

use crate::error::NetError;
use crate::manager::ManagerMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tracing::debug;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity for a supervised task.
///
/// Equality and hashing are on the id alone, so a handle remains a valid
/// lookup key after the task has finished.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    abort: AbortHandle,
}

impl TaskHandle {
    fn new(abort: AbortHandle) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            abort,
        }
    }

    /// The task's identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn for_tests(abort: AbortHandle) -> Self {
        Self::new(abort)
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskHandle {}

impl std::hash::Hash for TaskHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task#{}", self.id)
    }
}

/// Spawns peer tasks and reports their deaths to the manager.
#[derive(Clone)]
pub(crate) struct Supervisor {
    notify: mpsc::UnboundedSender<ManagerMessage>,
    children: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    idle: Arc<Notify>,
    closing: Arc<AtomicBool>,
}

impl Supervisor {
    /// Creates a supervisor that posts `PeerDied` to `notify`.
    pub fn new(notify: mpsc::UnboundedSender<ManagerMessage>) -> Self {
        Self {
            notify,
            children: Arc::new(Mutex::new(HashMap::new())),
            idle: Arc::new(Notify::new()),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns `fut` as a supervised child and returns its handle.
    ///
    /// A watcher task awaits the child and posts `PeerDied` with the
    /// child's error, if any. Abort (shutdown) counts as a clean death.
    pub fn spawn<F>(&self, fut: F) -> TaskHandle
    where
        F: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let join = tokio::spawn(fut);
        let handle = TaskHandle::new(join.abort_handle());
        {
            let mut children = self.children.lock();
            if self.closing.load(Ordering::Relaxed) {
                // Raced with shutdown; the child must not outlive it.
                join.abort();
            } else {
                children.insert(handle.id, handle.abort.clone());
            }
        }

        let notify = self.notify.clone();
        let children = Arc::clone(&self.children);
        let idle = Arc::clone(&self.idle);
        let task = handle.clone();
        tokio::spawn(async move {
            let err = match join.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(e) if e.is_cancelled() => None,
                Err(e) => Some(NetError::Internal(format!("peer task panicked: {}", e))),
            };
            let drained = {
                let mut children = children.lock();
                children.remove(&task.id);
                children.is_empty()
            };
            let _ = notify.send(ManagerMessage::PeerDied(task, err));
            if drained {
                idle.notify_waiters();
            }
        });

        handle
    }

    /// Aborts every remaining child and waits until each death has been
    /// posted to the manager's mailbox.
    pub async fn shutdown(&self) {
        let aborts: Vec<AbortHandle> = {
            let children = self.children.lock();
            self.closing.store(true, Ordering::Relaxed);
            children.values().cloned().collect()
        };
        if !aborts.is_empty() {
            debug!("Aborting {} peer tasks", aborts.len());
        }
        for abort in aborts {
            abort.abort();
        }

        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.children.lock().is_empty() {
                break;
            }
            notified.await;
        }
    }
}
