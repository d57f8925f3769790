//! One consumer loop driving the DIB and the MicroVM Orchestrator in
//! sequence for each task it dequeues. `worker-bin::main` spawns one of
//! these per configured worker slot; they share nothing but the
//! `DependencyImageBuilder`'s own internal per-hash locking.
use broker::queue;
use broker::{Cache, TaskQueue, split_report};
use dib::DependencyImageBuilder;
use orchestrator::RunConfig;
use shared::rpc::{ResultOutcome, StatusEvent, TaskMessage};
use tokio::sync::mpsc;

pub struct Worker {
    pub id: usize,
    pub queue: TaskQueue,
    pub cache: Cache,
    pub dib: DependencyImageBuilder,
    pub run_config: RunConfig,
}

impl Worker {
    /// Consume tasks until the AMQP consumer stream ends (connection closed
    /// or broker shutdown). Never returns early on a single task's failure,
    /// every error is logged and the message is still acknowledged, per the
    /// at-least-once/no-dead-letter policy documented in DESIGN.md.
    pub async fn run_forever(mut self) {
        let consumer_tag = format!("worker-{}", self.id);
        let mut consumer = match self.queue.consumer(&consumer_tag).await {
            Ok(consumer) => consumer,
            Err(e) => {
                tracing::error!(worker = self.id, error = %e, "failed to start consuming");
                return;
            }
        };

        tracing::info!(worker = self.id, "worker ready, waiting for tasks");
        while let Some(next) = queue::next_task(&mut consumer).await {
            let (task, delivery) = match next {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(worker = self.id, error = %e, "malformed delivery, dropping");
                    continue;
                }
            };

            let task_id = task.task_id.clone();
            if let Err(e) = self.process_task(task).await {
                tracing::error!(worker = self.id, task_id = %task_id, error = %e, "task handler raised internally");
            }

            if let Err(e) = queue::ack(delivery).await {
                tracing::error!(worker = self.id, task_id = %task_id, error = %e, "failed to ack delivery");
            }
        }

        tracing::warn!(worker = self.id, "consumer stream ended, worker exiting");
    }

    /// Run the DIB and the orchestrator for one task and publish the
    /// resulting status events. Returns `Err` only for a cache/pub-sub
    /// failure (Redis down); the caller acks regardless.
    async fn process_task(&mut self, task: TaskMessage) -> Result<(), broker::CacheError> {
        let task_id = task.task_id.clone();

        self.cache
            .publish_status(&StatusEvent::Processing {
                task_id: task_id.clone(),
                message: "Booting MicroVM...".to_string(),
            })
            .await?;

        // Bridge the synchronous `log_sink` callbacks the DIB/orchestrator
        // expect onto async Redis publishes, via a channel drained by a
        // forwarding task. This keeps all `processing` lines in the FIFO
        // order the worker emitted them without requiring either callback
        // to block on I/O.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut forward_cache = self.cache.clone();
        let forward_task_id = task_id.clone();
        let forward = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                tracing::debug!(task_id = %forward_task_id, %message, "progress");
                let event = StatusEvent::Processing { task_id: forward_task_id.clone(), message };
                if let Err(e) = forward_cache.publish_status(&event).await {
                    tracing::warn!(task_id = %forward_task_id, error = %e, "failed to publish progress line");
                }
            }
        });

        let dib_tx = tx.clone();
        let deps_result = self
            .dib
            .build(task.requirements.as_bytes(), move |line: &str| {
                let _ = dib_tx.send(line.to_string());
            })
            .await;

        let deps_image_path = match deps_result {
            Ok(path) => path,
            Err(e) => {
                drop(tx);
                let _ = forward.await;
                tracing::warn!(task_id = %task_id, error = %e, "dependency image build failed");
                let outcome = ResultOutcome::Error {
                    kind: "DependencyResolutionError".to_string(),
                    message: e.to_string(),
                    traceback: None,
                };
                self.cache.publish_status(&StatusEvent::error(task_id, outcome)).await?;
                return Ok(());
            }
        };

        let orch_tx = tx.clone();
        let outcome = orchestrator::run(
            &task_id,
            task.code.as_bytes(),
            &self.run_config,
            deps_image_path.as_deref(),
            move |line: &str| {
                let _ = orch_tx.send(line.to_string());
            },
        )
        .await;

        drop(tx);
        let _ = forward.await;

        match outcome {
            ResultOutcome::Success { report } => {
                let split = split_report(report);
                for (ticker, blob) in &split.details {
                    self.cache.set_detail(&task_id, ticker, blob).await?;
                }
                self.cache
                    .publish_status(&StatusEvent::Success {
                        task_id: task_id.clone(),
                        metrics: split.metrics,
                        portfolio_summary: split.portfolio_summary,
                    })
                    .await?;
            }
            error @ ResultOutcome::Error { .. } => {
                tracing::warn!(task_id = %task_id, "task finished with an error result");
                self.cache.publish_status(&StatusEvent::error(task_id, error)).await?;
            }
        }

        Ok(())
    }
}
