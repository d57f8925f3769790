mod error;
mod handlers;
mod pubsub;
mod state;

use axum::routing::{get, post};
use axum::Router;
use broker::{Cache, TaskQueue};
use shared::config::Config;
use state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let cache = Cache::connect(
        &config.redis_url,
        &config.pub_sub_channel,
        config.status_ttl_secs,
        config.detail_ttl_secs,
    )
    .await
    .expect("failed to connect to redis");

    let queue = TaskQueue::connect(&config.rabbit_mq_url, &config.task_queue_name)
        .await
        .expect("failed to connect to broker");

    let state = AppState::new(cache, queue, config.listen_addr.clone());

    tokio::spawn(pubsub::run(config.redis_url.clone(), config.pub_sub_channel.clone(), state.clone()));

    let app = Router::new()
        .route("/run", post(handlers::run::run_handler))
        .route("/ws/:task_id", get(handlers::ws::ws_handler))
        .route("/chart/:task_id/:ticker", get(handlers::chart::chart_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind listen address");
    tracing::info!(addr = %config.listen_addr, "api listening");

    axum::serve(listener, app).await.expect("server error");
}
