mod worker;

use broker::{Cache, TaskQueue};
use dib::DependencyImageBuilder;
use orchestrator::RunConfig;
use shared::config::Config;
use worker::Worker;

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

    let dib = DependencyImageBuilder::new(
        config.dep_cache_dir.clone(),
        config.dep_build_dir.clone(),
        config.drive_size_mb,
    );
    let run_config = RunConfig::from_shared(&config);

    tracing::info!(workers = config.worker_count, "starting worker pool");

    let mut handles = Vec::with_capacity(config.worker_count);
    for id in 0..config.worker_count {
        let queue = match TaskQueue::connect(&config.rabbit_mq_url, &config.task_queue_name).await {
            Ok(queue) => queue,
            Err(e) => {
                tracing::error!(worker = id, error = %e, "failed to connect to broker");
                continue;
            }
        };
        let cache = match Cache::connect(
            &config.redis_url,
            &config.pub_sub_channel,
            config.status_ttl_secs,
            config.detail_ttl_secs,
        )
        .await
        {
            Ok(cache) => cache,
            Err(e) => {
                tracing::error!(worker = id, error = %e, "failed to connect to cache");
                continue;
            }
        };

        let worker = Worker { id, queue, cache, dib: dib.clone(), run_config: run_config.clone() };
        handles.push(tokio::spawn(worker.run_forever()));
    }

    if handles.is_empty() {
        tracing::error!("no workers could be started, exiting");
        std::process::exit(1);
    }

    for handle in handles {
        let _ = handle.await;
    }
}
