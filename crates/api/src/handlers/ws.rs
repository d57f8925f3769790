use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use shared::rpc::StatusEvent;
use tokio::sync::mpsc;

/// `GET /ws/{task_id}`: registers this connection as the sink for
/// `task_id`, replays the last known status (or a synthetic "connected"
/// event), then forwards whatever the pub/sub listener dispatches until the
/// terminal event or client disconnect.
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, task_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, task_id: String) {
    let (tx, mut rx) = mpsc::unbounded_channel::<StatusEvent>();
    state.register(task_id.clone(), tx.clone()).await;

    let initial = replay_or_synthetic(&state, &task_id).await;
    let mut done = initial.is_terminal();
    if send_event(&mut socket, &initial).await.is_err() {
        done = true;
    }

    while !done {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Client messages are ignored except as a liveness signal.
                    _ => continue,
                }
            }
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let is_terminal = event.is_terminal();
                        if send_event(&mut socket, &event).await.is_err() || is_terminal {
                            done = true;
                        }
                    }
                    // Displaced by a newer subscription for this task_id.
                    None => break,
                }
            }
        }
    }

    state.unregister_if_current(&task_id, &tx).await;
}

async fn replay_or_synthetic(state: &AppState, task_id: &str) -> StatusEvent {
    let mut cache = state.cache.clone();
    match cache.get_status(task_id).await {
        Ok(Some(event)) => event,
        Ok(None) => connected_event(task_id),
        Err(e) => {
            tracing::warn!(task_id, error = %e, "failed to look up cached task status");
            connected_event(task_id)
        }
    }
}

fn connected_event(task_id: &str) -> StatusEvent {
    StatusEvent::Processing {
        task_id: task_id.to_string(),
        message: "connected, waiting for worker".to_string(),
    }
}

async fn send_event(socket: &mut WebSocket, event: &StatusEvent) -> Result<(), axum::Error> {
    let body = serde_json::to_string(event).expect("StatusEvent always serializes");
    socket.send(Message::Text(body.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_event_is_a_non_terminal_processing_event() {
        let event = connected_event("task-1");
        assert!(!event.is_terminal());
        assert_eq!(event.task_id(), "task-1");
    }
}
