//! Bounded background pool that fills in pending embeddings.
//!
//! Jobs carry the memory id and the exact text to embed. A job is applied
//! only if the memory still exists with that text, so re-running a job or
//! racing an update is harmless. Deleting a memory cancels its queued job;
//! a cancel mark lives only while a job for that id is queued or running.
//! When the queue is full the job is dropped and the memory stays flagged
//! `embedding_pending`; [`EmbeddingWorkers::backfill`] picks it up later.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::EmbeddingProvider;
use crate::db::Database;
use crate::error::TroveResult;
use crate::memory::store::{apply_embedding, pending_embeddings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingJob {
    pub memory_id: String,
    pub text: String,
}

struct Shared {
    db: Arc<Database>,
    provider: Arc<dyn EmbeddingProvider>,
    /// Queued or running jobs per memory id.
    queued: Mutex<HashMap<String, usize>>,
    /// Always a subset of the keys of `queued`.
    cancelled: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
}

impl Shared {
    fn track(&self, id: &str) {
        if let Ok(mut queued) = self.queued.lock() {
            *queued.entry(id.to_string()).or_insert(0) += 1;
        }
    }

    /// Forget one job for `id`; the cancel mark goes with the last one.
    fn untrack(&self, id: &str) {
        let Ok(mut queued) = self.queued.lock() else {
            return;
        };
        let remaining = match queued.get_mut(id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            queued.remove(id);
            self.clear_cancelled(id);
        }
    }

    fn cancel(&self, id: &str) {
        let Ok(queued) = self.queued.lock() else {
            return;
        };
        if queued.contains_key(id) {
            if let Ok(mut set) = self.cancelled.lock() {
                set.insert(id.to_string());
            }
        }
    }

    fn is_cancelled(&self, id: &str) -> bool {
        self.cancelled
            .lock()
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }

    fn clear_cancelled(&self, id: &str) {
        if let Ok(mut set) = self.cancelled.lock() {
            set.remove(id);
        }
    }

    async fn process(&self, job: EmbeddingJob) {
        if self.is_cancelled(&job.memory_id) {
            tracing::debug!(memory_id = %job.memory_id, "embedding job cancelled");
            return;
        }

        let provider = Arc::clone(&self.provider);
        let text = job.text.clone();
        let embedded = tokio::task::spawn_blocking(move || provider.embed(&text)).await;
        let vector = match embedded {
            Ok(Ok(vector)) => vector,
            Ok(Err(e)) => {
                tracing::warn!(memory_id = %job.memory_id, error = %e, "embedding failed");
                return;
            }
            Err(e) => {
                tracing::warn!(memory_id = %job.memory_id, error = %e, "embedding task panicked");
                return;
            }
        };

        if self.is_cancelled(&job.memory_id) {
            return;
        }

        let db = Arc::clone(&self.db);
        let id = job.memory_id.clone();
        let applied = tokio::task::spawn_blocking(move || {
            let dim = db.embedding_dim();
            db.write(|tx| apply_embedding(tx, &id, &job.text, &vector, dim))
        })
        .await;

        match applied {
            Ok(Ok(true)) => tracing::debug!(memory_id = %job.memory_id, "embedding stored"),
            Ok(Ok(false)) => {
                tracing::debug!(memory_id = %job.memory_id, "embedding stale, skipped")
            }
            Ok(Err(e)) => {
                tracing::warn!(memory_id = %job.memory_id, error = %e, "embedding not stored")
            }
            Err(e) => tracing::warn!(memory_id = %job.memory_id, error = %e, "store task panicked"),
        }
    }
}

/// Handle to the worker pool. Dropping it closes the queue; workers finish
/// the jobs already queued and exit.
pub struct EmbeddingWorkers {
    sender: mpsc::Sender<EmbeddingJob>,
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl EmbeddingWorkers {
    /// Spawn `workers` tasks on the current tokio runtime.
    pub fn spawn(
        db: Arc<Database>,
        provider: Arc<dyn EmbeddingProvider>,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<EmbeddingJob>(queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shared = Arc::new(Shared {
            db,
            provider,
            queued: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
        });

        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(job) = next else { break };
                        let id = job.memory_id.clone();
                        shared.process(job).await;
                        shared.untrack(&id);
                        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                    }
                    tracing::debug!(worker, "embedding worker stopped");
                })
            })
            .collect();

        Self {
            sender,
            shared,
            handles,
        }
    }

    /// Queue a job. Returns `false` when the queue is full or closed.
    pub fn enqueue(&self, job: EmbeddingJob) -> bool {
        self.shared.clear_cancelled(&job.memory_id);
        self.shared.track(&job.memory_id);
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                let job = e.into_inner();
                self.shared.untrack(&job.memory_id);
                tracing::debug!(memory_id = %job.memory_id, "embedding queue full, left pending");
                false
            }
        }
    }

    /// Drop any queued or running work for `memory_id`. A no-op when none
    /// exists.
    pub fn cancel(&self, memory_id: &str) {
        self.shared.cancel(memory_id);
    }

    /// Queue up to `limit` memories still flagged pending. Returns how many
    /// were queued.
    pub fn backfill(&self, limit: usize) -> TroveResult<usize> {
        let pending = self.shared.db.read(|conn| pending_embeddings(conn, limit))?;
        let queued = pending
            .into_iter()
            .map(|(memory_id, text)| self.enqueue(EmbeddingJob { memory_id, text }))
            .filter(|queued| *queued)
            .count();
        if queued > 0 {
            tracing::info!(queued, "pending embeddings queued");
        }
        Ok(queued)
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no job is queued or running. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let poll = async {
            while self.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Close the queue and wait for workers to drain it.
    pub async fn shutdown(self) {
        drop(self.sender);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
