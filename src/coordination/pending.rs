use super::error::RouterError;
use super::task::TaskResponse;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Outcome delivered to whoever awaits a pending request.
pub type Reply = Result<TaskResponse, RouterError>;

struct PendingEntry {
    reply: oneshot::Sender<Reply>,
    timer: Option<JoinHandle<()>>,
    charged_to: Option<String>,
    started_at: Instant,
}

/// Exclusive right to settle one pending request.
///
/// Only one ticket can ever exist per entry: it is produced by removing the
/// entry from the table, so whichever path removes it first settles it.
#[derive(Debug)]
pub struct PendingTicket {
    pub task_id: String,
    pub charged_to: Option<String>,
    pub elapsed: Duration,
    reply: oneshot::Sender<Reply>,
}

impl PendingTicket {
    /// Hand the outcome to the waiting caller. `false` if it stopped waiting.
    pub fn resolve(self, outcome: Reply) -> bool {
        self.reply.send(outcome).is_ok()
    }
}

/// Correlation id -> waiting caller, with one watchdog timer per entry.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `task_id`, optionally charged to a supervisor.
    pub fn insert(
        &self,
        task_id: &str,
        charged_to: Option<String>,
    ) -> Result<oneshot::Receiver<Reply>, RouterError> {
        let mut entries = self.inner.lock();
        if entries.contains_key(task_id) {
            return Err(RouterError::DuplicateTask {
                task_id: task_id.to_string(),
            });
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            task_id.to_string(),
            PendingEntry {
                reply: tx,
                timer: None,
                charged_to,
                started_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Start the watchdog for `task_id`.
    ///
    /// When `timeout` elapses first, the entry is removed and `on_expire`
    /// receives its ticket. Settling the entry earlier aborts the timer.
    pub fn arm_watchdog<F>(&self, task_id: &str, timeout: Duration, on_expire: F)
    where
        F: FnOnce(PendingTicket) + Send + 'static,
    {
        let table = self.clone();
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(ticket) = table.remove(&id, false) {
                on_expire(ticket);
            }
        });

        let mut entries = self.inner.lock();
        match entries.get_mut(task_id) {
            Some(entry) => entry.timer = Some(handle),
            // Settled before the timer could be attached.
            None => handle.abort(),
        }
    }

    /// Claim the entry for `task_id`, stopping its watchdog.
    pub fn take(&self, task_id: &str) -> Option<PendingTicket> {
        self.remove(task_id, true)
    }

    /// Claim every entry, e.g. on shutdown.
    pub fn drain(&self) -> Vec<PendingTicket> {
        let ids: Vec<String> = self.inner.lock().keys().cloned().collect();
        ids.iter().filter_map(|id| self.take(id)).collect()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.inner.lock().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn remove(&self, task_id: &str, abort_timer: bool) -> Option<PendingTicket> {
        let (task_id, entry) = self.inner.lock().remove_entry(task_id)?;
        if abort_timer {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
        Some(PendingTicket {
            task_id,
            charged_to: entry.charged_to,
            elapsed: entry.started_at.elapsed(),
            reply: entry.reply,
        })
    }
}
