//! Handlers for job submission and status queries.

use std::path::PathBuf;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use rarcrack_core::error::CoreError;
use rarcrack_core::task::{
    validate_charset, validate_max_length, NewTask, Task, TaskSummary, DEFAULT_CHARSET,
    DEFAULT_MAX_LENGTH,
};
use rarcrack_core::types::DbId;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Extension given to stored uploads.
const ARCHIVE_EXTENSION: &str = "rar";

/// Largest accepted submission body.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Load a task or fail with 404.
pub async fn find_task(state: &AppState, id: DbId) -> AppResult<Task> {
    state
        .store
        .find_by_id(id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound { entity: "Task", id }))
}

/// POST /api/v1/tasks
///
/// Accepts a multipart form with a required `archive` file and optional
/// `charset` and `max_length` fields. The archive is stored under the
/// upload directory and a `pending` task is created for it.
pub async fn submit_task(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DataResponse<TaskSummary>>)> {
    let mut charset: Option<String> = None;
    let mut max_length_raw: Option<String> = None;
    let mut archive: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "archive" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                archive = Some(data.to_vec());
            }
            "charset" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                charset = Some(text);
            }
            "max_length" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                max_length_raw = Some(text);
            }
            _ => {} // ignore unknown fields
        }
    }

    let charset = charset
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CHARSET.to_string());
    validate_charset(&charset)?;

    let max_length = match max_length_raw.as_deref().map(str::trim) {
        None | Some("") => DEFAULT_MAX_LENGTH,
        Some(raw) => {
            let parsed: i64 = raw.parse().map_err(|_| {
                AppError::BadRequest(format!("max_length must be an integer (got '{raw}')"))
            })?;
            validate_max_length(parsed)?
        }
    };

    let data =
        archive.ok_or_else(|| AppError::BadRequest("Missing required 'archive' field".into()))?;
    if data.is_empty() {
        return Err(AppError::BadRequest("Archive file is empty".into()));
    }

    let path = store_upload(&state, &data).await?;
    let input = NewTask {
        charset,
        max_length,
        artifact_path: path.to_string_lossy().to_string(),
    };

    let task = match state.store.create(&input).await {
        Ok(task) => task,
        Err(e) => {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }
    };

    tracing::info!(
        task_id = task.id,
        charset_size = task.charset.chars().count(),
        max_length = task.max_length,
        "Task submitted",
    );
    Ok((StatusCode::CREATED, Json(DataResponse { data: task.summary() })))
}

/// GET /api/v1/tasks/{id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<DataResponse<TaskSummary>>> {
    let task = find_task(&state, id).await?;
    Ok(Json(DataResponse {
        data: task.summary(),
    }))
}

/// Write an uploaded archive under a fresh name in the upload directory.
async fn store_upload(state: &AppState, data: &[u8]) -> AppResult<PathBuf> {
    let dir = &state.config.upload_dir;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    let path = dir.join(format!("{}.{ARCHIVE_EXTENSION}", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, data)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;
    Ok(path)
}
