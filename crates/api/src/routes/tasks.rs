use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::handlers::tasks;
use crate::state::AppState;
use crate::ws;

/// Task routes, mounted under `/tasks`.
///
/// ```text
/// POST  /            submit a job (multipart)
/// GET   /{id}        status query
/// GET   /{id}/ws     live events (WebSocket)
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            post(tasks::submit_task).layer(DefaultBodyLimit::max(tasks::MAX_UPLOAD_BYTES)),
        )
        .route("/{id}", get(tasks::get_task))
        .route("/{id}/ws", get(ws::task_ws_handler))
}
