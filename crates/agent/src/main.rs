mod constants;
mod engine;
mod mount;

use constants::AGENT_PORT;
use engine::Engine;
use shared::protocol;
use std::sync::Arc;
use tokio_vsock::{VMADDR_CID_ANY, VsockAddr, VsockListener};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    tracing::info!(port = AGENT_PORT, "agent listening on vsock");

    let deps_mount = mount::mount_dependencies().await;
    let engine = Arc::new(Engine::new(deps_mount));

    let addr = VsockAddr::new(VMADDR_CID_ANY, AGENT_PORT);
    let listener = match VsockListener::bind(addr) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind vsock listener");
            return;
        }
    };

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        tracing::info!(host_cid = addr.cid(), "connection accepted");

        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &engine).await {
                tracing::warn!(error = %e, "connection ended with an error");
            }
        });
    }
}

async fn handle_connection(
    mut stream: tokio_vsock::VsockStream,
    engine: &Engine,
) -> Result<(), protocol::ProtocolError> {
    let Some(payload) = protocol::read_until_terminated(&mut stream).await? else {
        return Ok(());
    };

    let strategy_source = String::from_utf8_lossy(&payload).into_owned();
    tracing::info!(bytes = strategy_source.len(), "received strategy, running backtest");

    let report = match engine.run(&strategy_source).await {
        Ok(value) => value,
        Err(e) => serde_json::json!({ "status": "error", "error": format!("Agent Error: {e}") }),
    };

    let body = serde_json::to_vec(&report).unwrap_or_else(|_| {
        br#"{"status": "error", "error": "failed to serialize result"}"#.to_vec()
    });

    tracing::info!(bytes = body.len(), "sending result");
    protocol::write_frame(&mut stream, &body).await
}
