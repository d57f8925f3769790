use crate::state::AppState;
use futures::StreamExt;
use shared::rpc::StatusEvent;
use std::time::Duration;

/// The single long-lived task that subscribes to `backtest_updates` and
/// fans events out into per-connection sinks via [`AppState::dispatch`].
/// Survives individual WebSocket disconnects; on a transient Redis error it
/// logs and resubscribes rather than tearing down the whole listener.
pub async fn run(redis_url: String, channel: String, state: AppState) {
    loop {
        if let Err(e) = listen_once(&redis_url, &channel, &state).await {
            tracing::error!(error = %e, "pub/sub listener error, resubscribing");
        } else {
            tracing::warn!("pub/sub stream ended, resubscribing");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn listen_once(redis_url: &str, channel: &str, state: &AppState) -> Result<(), redis::RedisError> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    tracing::info!(channel, "subscribed to pub/sub channel");

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let payload: Vec<u8> = message.get_payload()?;
        match serde_json::from_slice::<StatusEvent>(&payload) {
            Ok(event) => state.dispatch(event).await,
            Err(e) => tracing::warn!(error = %e, "malformed status event on pub/sub channel"),
        }
    }

    Ok(())
}
