pub mod health;
pub mod tasks;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/tasks", tasks::router())
}
