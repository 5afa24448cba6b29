//! Local FIFO read/write lock queues
//!
//! One queue per target, in arrival order. Runnable entries always form a
//! prefix of the queue: either a single write at the head, or the run of reads
//! from the head up to the first write. A read arriving behind a queued write
//! waits for it.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::model::{EntryState, LockQueueEntry, LockType};

struct QueueEntry {
    request_id: String,
    lock_type: LockType,
    running: bool,
    grant: Option<oneshot::Sender<bool>>,
}

impl QueueEntry {
    fn start(&mut self, target: &str) {
        self.running = true;
        debug!(
            "Lock {:?} on {} granted to {}",
            self.lock_type, target, self.request_id
        );
        if let Some(grant) = self.grant.take() {
            let _ = grant.send(true);
        }
    }
}

/// In-memory lock queues keyed by target; clones share the same queues
#[derive(Clone, Default)]
pub struct LocalLockManager {
    queues: Arc<Mutex<HashMap<String, VecDeque<QueueEntry>>>>,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `request_id` on `target`
    ///
    /// The entry joins the queue when this is called. The returned future
    /// yields once before the queue head is evaluated, then resolves `true`
    /// once granted or `false` if the entry was released while pending.
    pub fn acquire(
        &self,
        target: &str,
        request_id: &str,
        lock_type: LockType,
    ) -> impl Future<Output = bool> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.queues
            .lock()
            .entry(target.to_string())
            .or_default()
            .push_back(QueueEntry {
                request_id: request_id.to_string(),
                lock_type,
                running: false,
                grant: Some(tx),
            });
        debug!("Queued {:?} lock on {} for {}", lock_type, target, request_id);

        let manager = self.clone();
        let target = target.to_string();
        async move {
            tokio::task::yield_now().await;
            manager.resume_head(&target);
            rx.await.unwrap_or(false)
        }
    }

    /// Remove `request_id` from `target`'s queue and start whatever is next
    ///
    /// Releasing an entry that is not queued does nothing.
    pub fn release(&self, target: &str, request_id: &str) -> impl Future<Output = ()> + Send + 'static {
        {
            let mut queues = self.queues.lock();
            if let Some(queue) = queues.get_mut(target) {
                if let Some(pos) = queue.iter().position(|e| e.request_id == request_id) {
                    queue.remove(pos);
                    debug!("Released lock on {} for {}", target, request_id);
                    start_batch(target, queue);
                }
                if queue.is_empty() {
                    queues.remove(target);
                }
            }
        }
        tokio::task::yield_now()
    }

    fn resume_head(&self, target: &str) {
        if let Some(queue) = self.queues.lock().get_mut(target) {
            start_batch(target, queue);
        }
    }

    /// Entries of `target` in arrival order
    pub fn queue_snapshot(&self, target: &str) -> Vec<LockQueueEntry> {
        self.queues
            .lock()
            .get(target)
            .map(|queue| {
                queue
                    .iter()
                    .map(|e| LockQueueEntry {
                        request_id: e.request_id.clone(),
                        lock_type: e.lock_type,
                        state: if e.running {
                            EntryState::Running
                        } else {
                            EntryState::Pending
                        },
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Targets with a non-empty queue
    pub fn queued_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.queues.lock().keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn is_held(&self, target: &str, request_id: &str) -> bool {
        self.queues
            .lock()
            .get(target)
            .is_some_and(|q| q.iter().any(|e| e.request_id == request_id && e.running))
    }
}

fn start_batch(target: &str, queue: &mut VecDeque<QueueEntry>) {
    let Some(head) = queue.front_mut() else {
        return;
    };

    match head.lock_type {
        LockType::Write => {
            if !head.running {
                head.start(target);
            }
        }
        LockType::Read => {
            for entry in queue.iter_mut() {
                if entry.lock_type == LockType::Write {
                    break;
                }
                if !entry.running {
                    entry.start(target);
                }
            }
        }
    }
}
