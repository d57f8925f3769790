use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Multipart, State};
use axum::Json;
use serde::Serialize;
use shared::rpc::TaskMessage;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub status: &'static str,
    pub task_id: String,
    pub websocket_url: String,
    pub message: String,
}

/// `POST /run`: accepts a strategy file (`.py`, required) and an optional
/// dependency manifest (`.txt`), enqueues a durable task, returns the
/// stream URL the client should open next.
pub async fn run_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<RunResponse>, ApiError> {
    let mut code: Option<Vec<u8>> = None;
    let mut requirements: Vec<u8> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InputValidation(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("").to_string();
                if !filename.ends_with(".py") {
                    return Err(ApiError::InputValidation(
                        "'file' must have a .py extension".to_string(),
                    ));
                }
                let bytes = field.bytes().await.map_err(|e| ApiError::InputValidation(e.to_string()))?;
                code = Some(bytes.to_vec());
            }
            "requirement" => {
                let filename = field.file_name().unwrap_or("").to_string();
                if !filename.is_empty() && !filename.ends_with(".txt") {
                    return Err(ApiError::InputValidation(
                        "'requirement' must have a .txt extension".to_string(),
                    ));
                }
                let bytes = field.bytes().await.map_err(|e| ApiError::InputValidation(e.to_string()))?;
                requirements = bytes.to_vec();
            }
            _ => {}
        }
    }

    let code =
        code.ok_or_else(|| ApiError::InputValidation("missing required 'file' field".to_string()))?;

    // Opaque 128-bit hex id (no dashes), the shape `VmNaming::derive` expects.
    let task_id = Uuid::new_v4().simple().to_string();

    let mut cache = state.cache.clone();
    cache.clear_status(&task_id).await?;

    let task = TaskMessage {
        task_id: task_id.clone(),
        code: String::from_utf8_lossy(&code).into_owned(),
        requirements: String::from_utf8_lossy(&requirements).into_owned(),
    };

    state.queue.publish(&task).await.map_err(|e| {
        tracing::error!(error = %e, "failed to publish task to broker");
        ApiError::BrokerUnavailable
    })?;

    Ok(Json(RunResponse {
        status: "queued",
        websocket_url: format!("ws://{}/ws/{}", state.listen_addr, task_id),
        task_id,
        message: "Task queued for execution".to_string(),
    }))
}
