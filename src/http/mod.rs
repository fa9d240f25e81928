//! The HTTP surface consumed by clients. Owns multipart parsing, the 4-byte
//! PDF magic check, the file-size limit and JSON response shaping;
//! everything OCR-related is delegated to the pipeline/pool underneath.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::pipeline::run_ocr_pipeline;
use crate::pool::Pool;

const PDF_MAGIC: &[u8; 4] = b"%PDF";

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    let max_body_bytes = state.config.max_file_size_bytes();
    Router::new()
        .route("/ocr", post(ocr_handler))
        .route("/healthz", get(health_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes as usize))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct OcrResponse {
    text: String,
    page_count: Option<u32>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn ocr_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut pdf_bytes: Option<Vec<u8>> = None;
    let mut client_request_id: Option<String> = None;
    let max_size = state.config.max_file_size_bytes() as usize;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadInput(format!("invalid multipart body: {e}")))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                let mut buf = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| AppError::BadInput(format!("error reading upload: {e}")))?
                {
                    if buf.len() + chunk.len() > max_size {
                        return Err(AppError::BadInput(format!(
                            "upload exceeds MAX_FILE_SIZE_MB ({} bytes)",
                            state.config.max_file_size_bytes()
                        )));
                    }
                    buf.extend_from_slice(&chunk);
                }
                pdf_bytes = Some(buf);
            }
            "request_id" => {
                client_request_id = field.text().await.ok();
            }
            _ => {
                // Unknown field; ignore rather than reject, matching the
                // multipart extractor's permissive defaults elsewhere.
            }
        }
    }

    let pdf_bytes = pdf_bytes.ok_or_else(|| AppError::BadInput("missing 'file' part".into()))?;
    if pdf_bytes.len() < 4 || &pdf_bytes[..4] != PDF_MAGIC {
        return Err(AppError::BadInput("upload is not a PDF (bad magic bytes)".into()));
    }

    let outcome = run_ocr_pipeline(&state.pool, pdf_bytes, client_request_id).await?;
    Ok((
        StatusCode::OK,
        Json(OcrResponse {
            text: outcome.text,
            page_count: outcome.page_count,
        }),
    )
        .into_response())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    workers: Vec<crate::pool::WorkerStats>,
    queue_depth: usize,
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let stats = state.pool.stats();
    let down = state.pool.is_down();
    let status = if down { "down" } else { "ok" };
    let code = if down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    if down {
        warn!("health check: pool is down, every worker unready");
    } else {
        info!(queue_depth = stats.queue_depth, "health check: ok");
    }
    (
        code,
        Json(HealthResponse {
            status,
            workers: stats.workers,
            queue_depth: stats.queue_depth,
        }),
    )
        .into_response()
}
