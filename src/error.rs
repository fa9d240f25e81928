//! Error taxonomy shared by the pool, the pipeline and the HTTP surface.
//! Hand-rolled enum + `Display`, matching the rest of the codebase's error
//! types rather than pulling in `thiserror`.

use axum::http::StatusCode;

/// Abstract error kinds a request through the pool can fail with.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Queue at capacity; immediate rejection.
    Overloaded,
    /// Dequeue timeout fired before dispatch.
    QueuedTooLong,
    /// Child did not respond within the job budget.
    OcrTimeout,
    /// Child exited while the job was pending.
    WorkerCrashed { exit_code: Option<i32> },
    /// Upstream validation failure (non-PDF bytes, oversized upload, ...).
    BadInput(String),
    /// Every Worker has `ready = false`.
    PoolNotReady,
    /// Zero Workers reached readiness during `init`.
    FatalStartup,
    /// Catch-all for I/O and internal bookkeeping failures.
    Internal(String),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Overloaded => write!(f, "pool overloaded, queue is full"),
            AppError::QueuedTooLong => write!(f, "job timed out waiting in the admission queue"),
            AppError::OcrTimeout => write!(f, "OCR worker did not respond in time"),
            AppError::WorkerCrashed { exit_code } => {
                write!(f, "OCR worker crashed (exit code {exit_code:?})")
            }
            AppError::BadInput(msg) => write!(f, "bad input: {msg}"),
            AppError::PoolNotReady => write!(f, "OCR pool has no ready workers"),
            AppError::FatalStartup => write!(f, "no OCR worker ever became ready"),
            AppError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Abstract kind name used in the JSON error body and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Overloaded => "overloaded",
            AppError::QueuedTooLong => "queued-too-long",
            AppError::OcrTimeout => "ocr-timeout",
            AppError::WorkerCrashed { .. } => "worker-crashed",
            AppError::BadInput(_) => "bad-input",
            AppError::PoolNotReady => "pool-not-ready",
            AppError::FatalStartup => "fatal-startup",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            AppError::QueuedTooLong => StatusCode::GATEWAY_TIMEOUT,
            AppError::OcrTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::WorkerCrashed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadInput(_) => StatusCode::BAD_REQUEST,
            AppError::PoolNotReady => StatusCode::SERVICE_UNAVAILABLE,
            AppError::FatalStartup => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
