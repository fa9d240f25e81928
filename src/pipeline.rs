//! The thin OCR pipeline: materialize an in-memory PDF to a scoped
//! temporary file, submit it to the Supervisor, and clean up regardless of
//! outcome.

use std::sync::Arc;

use tracing::warn;

use crate::error::AppError;
use crate::pool::Pool;
use crate::worker::OcrOutcome;

/// Write `pdf_bytes` to a fresh temporary directory (so concurrent requests
/// cannot collide on filenames), submit the path to the Pool, and remove the
/// directory on every exit path.
pub async fn run_ocr_pipeline(
    pool: &Arc<Pool>,
    pdf_bytes: Vec<u8>,
    client_request_id: Option<String>,
) -> Result<OcrOutcome, AppError> {
    let dir = tempfile::tempdir()
        .map_err(|e| AppError::Internal(format!("failed to create temp dir: {e}")))?;
    let pdf_path = dir.path().join("input.pdf");

    let write_result = tokio::fs::write(&pdf_path, &pdf_bytes).await;
    let result = match write_result {
        Ok(()) => pool.run(&pdf_path, client_request_id).await,
        Err(e) => Err(AppError::Internal(format!("failed to write temp pdf: {e}"))),
    };

    // tempfile::TempDir removes the directory on Drop; do it explicitly here
    // (still on every exit path) so failures are logged rather than silently
    // swallowed by a Drop impl that can't report errors.
    if let Err(e) = dir.close() {
        warn!(error = %e, "failed to remove temp directory, continuing");
    }

    result
}
