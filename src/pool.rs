//! The Supervisor: owns the Worker set, makes dispatch decisions, manages
//! the admission queue, and recovers from crashes.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::{Config, CRASH_COOLDOWN};
use crate::error::AppError;
use crate::queue::{AdmissionQueue, QueueEntry};
use crate::worker::{OcrOutcome, PoolEvent, Worker, WorkerSpawnSpec};

/// Per-Worker view used by the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStats {
    pub id: usize,
    pub ready: bool,
    pub busy: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub workers: Vec<WorkerStats>,
    pub queue_depth: usize,
}

struct PoolState {
    queue: AdmissionQueue,
    restarting: HashSet<usize>,
}

/// Fixed-size manager of Workers and the admission queue. Outlives all
/// Workers; created at startup, destroyed at shutdown.
pub struct Pool {
    workers: Vec<Arc<Worker>>,
    state: Mutex<PoolState>,
    queue_timeout: Duration,
    seq: AtomicU64,
}

impl Pool {
    /// Construct the fixed Worker set. Does not spawn any child process yet;
    /// call `init` to do that.
    pub fn new(config: &Config, spawn_spec: WorkerSpawnSpec) -> (Arc<Self>, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let workers = (0..config.worker_count)
            .map(|id| {
                Worker::new(
                    id,
                    spawn_spec.clone(),
                    config.worker_ready_timeout,
                    config.ocr_timeout,
                    events_tx.clone(),
                )
            })
            .collect();

        let pool = Arc::new(Self {
            workers,
            state: Mutex::new(PoolState {
                queue: AdmissionQueue::new(config.queue_max_size),
                restarting: HashSet::new(),
            }),
            queue_timeout: config.ocr_timeout,
            seq: AtomicU64::new(0),
        });
        (pool, events_rx)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Start every Worker concurrently. Returns as soon as at least one
    /// reaches readiness; the rest continue starting in the background.
    /// Returns `FatalStartup` iff every Worker's start attempt fails.
    pub async fn init(self: &Arc<Self>) -> Result<(), AppError> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Result<usize, usize>>();

        for worker in &self.workers {
            let worker = Arc::clone(worker);
            let done_tx = done_tx.clone();
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                match worker.start().await {
                    Ok(()) => {
                        let _ = done_tx.send(Ok(worker.id));
                    }
                    Err(e) => {
                        warn!(worker_id = worker.id, error = %e, "initial start failed");
                        let _ = done_tx.send(Err(worker.id));
                        pool.on_worker_crash(worker.id, None);
                    }
                }
            });
        }
        drop(done_tx);

        let mut any_ready = false;
        let mut remaining = self.workers.len();
        while remaining > 0 {
            match done_rx.recv().await {
                Some(Ok(_)) => {
                    any_ready = true;
                    break;
                }
                Some(Err(_)) => {
                    remaining -= 1;
                }
                None => break,
            }
        }

        if any_ready {
            // Let the remaining starts finish in the background; we only
            // needed to observe the first success.
            tokio::spawn(async move { while done_rx.recv().await.is_some() {} });
            Ok(())
        } else {
            Err(AppError::FatalStartup)
        }
    }

    /// Handle `PoolEvent`s raised by Workers. Intended to be driven by a
    /// dedicated task for the Pool's lifetime:
    /// `tokio::spawn(pool.clone().run_event_loop(events_rx))`.
    pub async fn run_event_loop(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<PoolEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                PoolEvent::WorkerFree(id) => self.on_worker_free(id).await,
                PoolEvent::WorkerCrashed { id, exit_code } => self.on_worker_crash(id, exit_code),
            }
        }
    }

    /// Submit a PDF for OCR. Dispatches immediately to the first ready, idle
    /// Worker by id order; otherwise enqueues if the queue has capacity, else
    /// fails with *overloaded*.
    pub async fn run(
        self: &Arc<Self>,
        pdf_path: &Path,
        client_request_id: Option<String>,
    ) -> Result<OcrOutcome, AppError> {
        if let Some(worker) = self.workers.iter().find(|w| w.try_claim()) {
            let path_str = pdf_path.to_string_lossy().to_string();
            return worker.execute(&path_str).await;
        }

        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request_id = client_request_id.unwrap_or_else(generate_client_request_id);

        {
            let mut state = self.state.lock();
            if state.queue.is_full() {
                return Err(AppError::Overloaded);
            }
            state.queue.push_back(QueueEntry {
                seq,
                request_id: request_id.clone(),
                pdf_path: pdf_path.to_path_buf(),
                tx,
            });
            info!(request_id = %request_id, queue_depth = state.queue.len(), "job enqueued");
        }

        let pool = Arc::clone(self);
        let timeout = self.queue_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            pool.expire_queue_entry(seq);
        });

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(AppError::Internal(
                "queue entry sender dropped unexpectedly".into(),
            )),
        }
    }

    fn expire_queue_entry(&self, seq: u64) {
        let entry = {
            let mut state = self.state.lock();
            state.queue.remove_by_seq(seq)
        };
        if let Some(entry) = entry {
            warn!(request_id = %entry.request_id, "job timed out waiting in the admission queue");
            let _ = entry.tx.send(Err(AppError::QueuedTooLong));
        }
    }

    /// Callback a Worker raises when it finishes a job (by response or
    /// timeout). The Worker keeps `busy = true` across this entire call, so
    /// a concurrent `run` can never claim it directly while this decision is
    /// in flight. If the queue is non-empty, pop the head and hand it
    /// straight to `worker_id` iff it is still ready (reusing the existing
    /// claim rather than re-claiming); otherwise push the job back to the
    /// head and release the Worker so it can be claimed normally.
    async fn on_worker_free(self: &Arc<Self>, worker_id: usize) {
        let entry = {
            let mut state = self.state.lock();
            state.queue.pop_front()
        };
        let worker = &self.workers[worker_id];
        let Some(entry) = entry else {
            worker.release_claim();
            return;
        };

        if worker.is_still_ready() {
            let pdf_path = entry.pdf_path.to_string_lossy().to_string();
            let worker = Arc::clone(worker);
            let tx = entry.tx;
            tokio::spawn(async move {
                let result = worker.execute(&pdf_path).await;
                let _ = tx.send(result);
            });
        } else {
            worker.release_claim();
            let mut state = self.state.lock();
            state.queue.push_front(entry);
        }
    }

    /// Idempotent per Worker id: schedules a cooldown + respawn, and on
    /// successful restart drains the queue against every idle+ready Worker.
    fn on_worker_crash(self: &Arc<Self>, id: usize, exit_code: Option<i32>) {
        {
            let mut state = self.state.lock();
            if !state.restarting.insert(id) {
                return;
            }
        }
        warn!(worker_id = id, exit_code = ?exit_code, "scheduling worker respawn");

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(CRASH_COOLDOWN).await;
            let worker = Arc::clone(&pool.workers[id]);
            match worker.start().await {
                Ok(()) => {
                    pool.state.lock().restarting.remove(&id);
                    info!(worker_id = id, "worker respawned");
                    pool.drain_queue_against_all_idle().await;
                }
                Err(e) => {
                    warn!(worker_id = id, error = %e, "respawn attempt failed");
                    pool.state.lock().restarting.remove(&id);
                }
            }
        });
    }

    /// Keep dispatching queued jobs to any idle+ready Worker until the queue
    /// empties or no Worker is free — the drain step after a successful
    /// restart.
    async fn drain_queue_against_all_idle(self: &Arc<Self>) {
        loop {
            let has_more = { self.state.lock().queue.len() > 0 };
            if !has_more {
                break;
            }
            let Some(worker) = self.workers.iter().find(|w| w.try_claim()) else {
                break;
            };
            let entry = {
                let mut state = self.state.lock();
                state.queue.pop_front()
            };
            let Some(entry) = entry else {
                // Nothing left after all; release the claim we just took.
                worker.release_claim();
                break;
            };
            let pdf_path = entry.pdf_path.to_string_lossy().to_string();
            let worker = Arc::clone(worker);
            let tx = entry.tx;
            tokio::spawn(async move {
                let result = worker.execute(&pdf_path).await;
                let _ = tx.send(result);
            });
        }
    }

    /// `{id, ready, busy}` per Worker plus the current queue depth — drives
    /// the health endpoint.
    pub fn stats(&self) -> PoolStats {
        let workers = self
            .workers
            .iter()
            .map(|w| WorkerStats {
                id: w.id,
                ready: w.ready(),
                busy: w.busy(),
            })
            .collect();
        let queue_depth = self.state.lock().queue.len();
        PoolStats { workers, queue_depth }
    }

    /// Overall unreadiness: every Worker has `ready = false`.
    pub fn is_down(&self) -> bool {
        self.workers.iter().all(|w| !w.ready())
    }

    /// Terminate every Worker's child process. Called on shutdown.
    pub async fn shutdown(&self) {
        for worker in &self.workers {
            worker.kill().await;
        }
    }
}

/// 4 hex chars, distinct from a Worker-scoped 16-hex request id.
fn generate_client_request_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..4].to_string()
}
