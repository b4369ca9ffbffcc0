use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use rarcrack_core::types::DbId;

use crate::error::AppResult;
use crate::handlers::tasks::find_task;
use crate::state::AppState;
use crate::ws::gateway::SubscriptionGateway;

/// GET /api/v1/tasks/{id}/ws
///
/// Upgrades to a WebSocket that streams the job's events. Unknown task ids
/// are rejected with 404 before the upgrade.
pub async fn task_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<DbId>,
) -> AppResult<Response> {
    find_task(&state, task_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state.gateway, task_id)))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Attaches to the gateway, forwards gateway frames to the client on a
/// spawned task, and ignores anything the client sends until it closes.
async fn handle_socket(socket: WebSocket, gateway: Arc<SubscriptionGateway>, job_id: DbId) {
    let attachment = match gateway.attach(job_id).await {
        Ok(attachment) => attachment,
        Err(e) => {
            tracing::warn!(job_id, error = %e, "Rejecting WebSocket subscription");
            return;
        }
    };
    let conn_id = attachment.conn_id;
    let mut rx = attachment.receiver;
    tracing::info!(job_id, conn_id = %conn_id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();

    // Sender task: forward gateway frames to the WebSocket sink.
    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    // Receiver loop: the client has nothing to say to us.
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(Message::Text(text)) => {
                tracing::debug!(conn_id = %conn_id, len = text.len(), "Ignoring client message");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    gateway.detach(job_id, &conn_id).await;
    send_task.abort();
    tracing::info!(job_id, conn_id = %conn_id, "WebSocket disconnected");
}
