//! One supervised OS child process hosting an OCR engine instance, plus the
//! supervisor-side bookkeeping for it.
//!
//! A Worker multiplexes at most one outstanding job at a time over a
//! newline-delimited JSON channel (see `protocol`). Crash detection, the
//! readiness handshake and request/response correlation all live here;
//! dispatch decisions and the admission queue live one layer up in `Pool`.

pub mod protocol;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::AppError;
use protocol::{parse_incoming_line, IncomingLine, RequestMessage};

/// Result of a successful OCR job.
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub text: String,
    pub page_count: Option<u32>,
}

/// Events a Worker raises on its owning Pool. Modeled as a one-way channel
/// (rather than a back-pointer to the Pool) per the cyclic-reference design
/// note: the Supervisor owns Workers, so Workers only get a narrow
/// notification capability, never a handle back into the Pool itself.
#[derive(Debug)]
pub enum PoolEvent {
    WorkerFree(usize),
    WorkerCrashed { id: usize, exit_code: Option<i32> },
}

pub type Notifier = mpsc::UnboundedSender<PoolEvent>;

/// Everything needed to (re)spawn the child process, fixed at pool construction.
#[derive(Debug, Clone)]
pub struct WorkerSpawnSpec {
    pub program: String,
    pub args: Vec<String>,
}

struct PendingEntry {
    tx: oneshot::Sender<Result<OcrOutcome, AppError>>,
}

/// Mutable bookkeeping behind a single coarse mutex: mutations are
/// serialized and the lock is never held across blocking I/O or awaits.
struct WorkerState {
    ready: bool,
    busy: bool,
    pending: HashMap<String, PendingEntry>,
    stdin: Option<Arc<tokio::sync::Mutex<ChildStdin>>>,
    kill_tx: Option<mpsc::Sender<()>>,
    ready_tx: Option<oneshot::Sender<Result<(), String>>>,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            ready: false,
            busy: false,
            pending: HashMap::new(),
            stdin: None,
            kill_tx: None,
            ready_tx: None,
        }
    }
}

pub struct Worker {
    pub id: usize,
    spawn_spec: WorkerSpawnSpec,
    ready_timeout: Duration,
    job_timeout: Duration,
    notifier: Notifier,
    state: Mutex<WorkerState>,
    /// Mirrors `state.ready` for lock-free reads from the Pool's dispatch scan.
    ready_flag: AtomicBool,
    /// Mirrors `state.busy` for the same reason.
    busy_flag: AtomicBool,
}

impl Worker {
    pub fn new(
        id: usize,
        spawn_spec: WorkerSpawnSpec,
        ready_timeout: Duration,
        job_timeout: Duration,
        notifier: Notifier,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            spawn_spec,
            ready_timeout,
            job_timeout,
            notifier,
            state: Mutex::new(WorkerState::new()),
            ready_flag: AtomicBool::new(false),
            busy_flag: AtomicBool::new(false),
        })
    }

    pub fn ready(&self) -> bool {
        self.ready_flag.load(Ordering::Acquire)
    }

    pub fn busy(&self) -> bool {
        self.busy_flag.load(Ordering::Acquire)
    }

    /// Spawn the child, arm the ready-timeout, and wait for the readiness
    /// handshake. Resolves once `{"ready": true}` is observed, or fails on
    /// timeout / early exit / spawn error. The stdout-reading loop keeps
    /// running in the background after this returns.
    pub async fn start(self: &Arc<Self>) -> Result<(), AppError> {
        self.ready_flag.store(false, Ordering::Release);
        self.busy_flag.store(false, Ordering::Release);

        let mut command = Command::new(&self.spawn_spec.program);
        command
            .args(&self.spawn_spec.args)
            .env("PYTHONUNBUFFERED", "1")
            .env("RUST_BACKTRACE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "failed to spawn OCR worker child");
                return Err(AppError::Internal(format!("spawn failed: {e}")));
            }
        };

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Internal("child stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Internal("child stdout not piped".into()))?;
        let stderr = child.stderr.take();

        let (ready_tx, ready_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = mpsc::channel(1);

        {
            let mut state = self.state.lock();
            state.stdin = Some(Arc::new(tokio::sync::Mutex::new(stdin)));
            state.kill_tx = Some(kill_tx);
            state.ready_tx = Some(ready_tx);
            state.pending.clear();
        }

        info!(worker_id = self.id, pid = ?child.id(), "OCR worker spawned");

        if let Some(stderr) = stderr {
            let id = self.id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(worker_id = id, stderr = %line, "OCR worker stderr");
                }
            });
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_io_loop(child, stdout, kill_rx).await;
        });

        let ready_timeout = self.ready_timeout;
        let this = Arc::clone(self);
        match tokio::time::timeout(ready_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                self.ready_flag.store(true, Ordering::Release);
                info!(worker_id = self.id, "OCR worker ready");
                Ok(())
            }
            Ok(Ok(Err(msg))) => {
                warn!(worker_id = self.id, error = %msg, "OCR worker reported not-ready");
                Err(AppError::Internal(msg))
            }
            Ok(Err(_)) => {
                // Sender dropped: the io loop observed an early exit and already
                // failed the ready signal through it, or a malformed shutdown.
                Err(AppError::Internal("worker exited before becoming ready".into()))
            }
            Err(_) => {
                warn!(worker_id = self.id, "OCR worker ready-timeout, killing child");
                this.force_kill_current().await;
                Err(AppError::Internal("ready-timeout exceeded".into()))
            }
        }
    }

    async fn force_kill_current(&self) {
        let kill_tx = self.state.lock().kill_tx.clone();
        if let Some(tx) = kill_tx {
            let _ = tx.send(()).await;
        }
    }

    /// Graceful termination; failures are ignored.
    pub async fn kill(&self) {
        self.force_kill_current().await;
    }

    /// The stdout-reading + crash-detection loop. Runs for the lifetime of
    /// one child process; a respawn after crash creates a brand new loop.
    async fn run_io_loop(
        self: Arc<Self>,
        mut child: Child,
        stdout: tokio::process::ChildStdout,
        mut kill_rx: mpsc::Receiver<()>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        let exit_code;
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.handle_incoming_line(&line),
                        Ok(None) => {
                            // stdout closed; wait() below will observe the exit.
                        }
                        Err(e) => {
                            warn!(worker_id = self.id, error = %e, "error reading worker stdout");
                        }
                    }
                    continue;
                }
                _ = kill_rx.recv() => {
                    let _ = child.start_kill();
                    continue;
                }
                status = child.wait() => {
                    exit_code = status.ok().and_then(|s| s.code());
                    break;
                }
            }
        }
        self.handle_crash(exit_code);
    }

    fn handle_incoming_line(&self, line: &str) {
        match parse_incoming_line(line) {
            Some(IncomingLine::Ready(msg)) => {
                let ready_tx = self.state.lock().ready_tx.take();
                if let Some(tx) = ready_tx {
                    let result = if msg.ready {
                        Ok(())
                    } else {
                        Err(msg.error.unwrap_or_else(|| "unknown error".into()))
                    };
                    let _ = tx.send(result);
                } else {
                    debug!(worker_id = self.id, "extra readiness line after handshake, ignored");
                }
            }
            Some(IncomingLine::Response(msg)) => {
                // `busy` stays `true` here even though the job is done: the
                // Pool still needs to decide whether a queued job takes this
                // Worker next before anyone else can claim it. Clearing
                // `busy` is left entirely to the Pool's free-signal handling
                // (`on_worker_free`/`release_claim`) so a racing direct
                // dispatch can never grab this Worker out from under a job
                // that was already waiting in the queue.
                let entry = {
                    let mut state = self.state.lock();
                    state.pending.remove(&msg.id)
                };
                match entry {
                    Some(entry) => {
                        let outcome = match msg.error {
                            Some(err) => Err(AppError::Internal(err)),
                            None => Ok(OcrOutcome {
                                text: msg.text.unwrap_or_default(),
                                page_count: msg.page_count,
                            }),
                        };
                        let _ = entry.tx.send(outcome);
                        let _ = self.notifier.send(PoolEvent::WorkerFree(self.id));
                    }
                    None => {
                        debug!(worker_id = self.id, request_id = %msg.id, "response for unknown/expired request id dropped");
                    }
                }
            }
            None => {
                warn!(worker_id = self.id, line = %line, "malformed line from OCR worker, discarded");
            }
        }
    }

    fn handle_crash(&self, exit_code: Option<i32>) {
        let pending = {
            let mut state = self.state.lock();
            state.ready = false;
            state.busy = false;
            state.stdin = None;
            state.kill_tx = None;
            let ready_tx = state.ready_tx.take();
            if let Some(tx) = ready_tx {
                let _ = tx.send(Err(format!("worker exited (code {exit_code:?})")));
            }
            std::mem::take(&mut state.pending)
        };
        self.ready_flag.store(false, Ordering::Release);
        self.busy_flag.store(false, Ordering::Release);

        warn!(worker_id = self.id, exit_code = ?exit_code, "OCR worker crashed");
        for (_, entry) in pending {
            let _ = entry.tx.send(Err(AppError::WorkerCrashed { exit_code }));
        }
        let _ = self
            .notifier
            .send(PoolEvent::WorkerCrashed { id: self.id, exit_code });
    }

    /// Atomically claim this Worker for dispatch iff `ready && !busy`, setting
    /// `busy` as part of the same check. This is the only place `busy` is set
    /// to `true`; doing the check-and-set under the Worker's own lock (rather
    /// than via separate atomic loads in the Pool's dispatch scan) is what
    /// makes "Worker serves exactly one OCR job at a time" hold under
    /// concurrent callers, without ever holding a lock across the I/O in
    /// `execute`. Note that `busy` only goes false again once the Pool has
    /// actually decided this Worker has no further work (see
    /// `release_claim`), so a completed job never makes this Worker briefly
    /// claimable while a queued job is still waiting for it.
    pub fn try_claim(&self) -> bool {
        let mut state = self.state.lock();
        if state.ready && !state.busy {
            state.busy = true;
            self.busy_flag.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Whether this Worker is still ready to run a job, without touching
    /// `busy`. Used by the Pool when handing a queued job to a Worker that
    /// just finished one: `busy` is already `true` from the prior claim, so
    /// only readiness needs checking before reusing it.
    pub fn is_still_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Release a claim that turned out to have no more work: either a
    /// `try_claim` that found nothing to dispatch, or a just-finished job
    /// whose Worker the Pool has confirmed has no queued job waiting.
    pub fn release_claim(&self) {
        let mut state = self.state.lock();
        state.busy = false;
        self.busy_flag.store(false, Ordering::Release);
    }

    /// Run one OCR job to completion. Caller must have already claimed this
    /// Worker via `try_claim`.
    pub async fn execute(self: &Arc<Self>, pdf_path: &str) -> Result<OcrOutcome, AppError> {
        let stdin = {
            let state = self.state.lock();
            match state.stdin.clone() {
                Some(s) => s,
                None => {
                    drop(state);
                    let mut state = self.state.lock();
                    state.busy = false;
                    self.busy_flag.store(false, Ordering::Release);
                    return Err(AppError::Internal("worker has no stdin handle".into()));
                }
            }
        };

        let request_id = generate_request_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.pending.insert(request_id.clone(), PendingEntry { tx });
        }

        let request = RequestMessage {
            id: request_id.clone(),
            pdf_path: pdf_path.to_string(),
        };
        let mut line = match serde_json::to_string(&request) {
            Ok(s) => s,
            Err(e) => {
                self.clear_pending_and_free(&request_id);
                return Err(AppError::Internal(format!("serialize request: {e}")));
            }
        };
        line.push('\n');

        {
            let mut guard = stdin.lock().await;
            if let Err(e) = guard.write_all(line.as_bytes()).await {
                drop(guard);
                self.clear_pending_and_free(&request_id);
                return Err(AppError::Internal(format!("write to worker stdin: {e}")));
            }
        }

        // Armed job-timeout handle: a background task that, if it fires
        // before the response arrives, claims the pending entry itself and
        // resolves the call with *ocr-timeout*. It is a no-op if the
        // response already claimed (and removed) the entry.
        let job_timeout = self.job_timeout;
        let this = Arc::clone(self);
        let timeout_req_id = request_id.clone();
        let timeout_handle = tokio::spawn(async move {
            tokio::time::sleep(job_timeout).await;
            this.fire_job_timeout(&timeout_req_id);
        });

        let result = rx.await;
        timeout_handle.abort();

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::Internal(
                "worker response channel dropped unexpectedly".into(),
            )),
        }
    }

    fn clear_pending_and_free(&self, request_id: &str) {
        let mut state = self.state.lock();
        state.pending.remove(request_id);
        state.busy = false;
        self.busy_flag.store(false, Ordering::Release);
    }

    /// Remove the pending entry, notify the Pool that this Worker may be
    /// free, and fail the call with a timeout error. The child is **not**
    /// killed: a late response for this request id is simply dropped.
    /// `busy` is left `true` here for the same reason as in the response
    /// path above — the Pool decides whether a queued job reuses this
    /// Worker before it becomes claimable by anyone else.
    fn fire_job_timeout(&self, request_id: &str) {
        let entry = {
            let mut state = self.state.lock();
            state.pending.remove(request_id)
        };
        if let Some(entry) = entry {
            let _ = entry.tx.send(Err(AppError::OcrTimeout));
            let _ = self.notifier.send(PoolEvent::WorkerFree(self.id));
        }
    }
}

/// 16 hex chars drawn from a cryptographic random source.
fn generate_request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_16_hex_chars() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn request_ids_are_distinct() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
    }
}
