use broker::{Cache, TaskQueue};
use shared::rpc::StatusEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// The `task_id -> sink` map behind every WebSocket connection currently
/// streaming. Guarded by a plain `Mutex`, never held across an `.await` on a
/// socket, per DESIGN.md's decision on duplicate-subscription handling.
#[derive(Clone, Default)]
struct Subscribers {
    connections: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<StatusEvent>>>>,
}

impl Subscribers {
    /// Register `sender` as the sink for `task_id`, displacing any prior
    /// subscriber. The displaced sender is dropped here, which closes its
    /// receiver and ends that connection's forward loop on its next poll.
    async fn register(&self, task_id: String, sender: mpsc::UnboundedSender<StatusEvent>) {
        self.connections.lock().await.insert(task_id, sender);
    }

    /// Remove the map entry for `task_id` iff it still points at `sender`
    /// (a newer subscription may already have displaced it).
    async fn unregister_if_current(&self, task_id: &str, sender: &mpsc::UnboundedSender<StatusEvent>) {
        let mut connections = self.connections.lock().await;
        if connections.get(task_id).is_some_and(|current| current.same_channel(sender)) {
            connections.remove(task_id);
        }
    }

    /// Fan out one pub/sub event to its subscriber, if one is connected.
    /// Silently drops events for tasks nobody is currently streaming.
    async fn dispatch(&self, event: StatusEvent) {
        let connections = self.connections.lock().await;
        if let Some(sender) = connections.get(event.task_id()) {
            let _ = sender.send(event);
        }
    }
}

/// Process-wide state shared by every request handler and the pub/sub
/// listener task.
#[derive(Clone)]
pub struct AppState {
    pub cache: Cache,
    pub queue: Arc<TaskQueue>,
    pub listen_addr: String,
    subscribers: Subscribers,
}

impl AppState {
    pub fn new(cache: Cache, queue: TaskQueue, listen_addr: String) -> Self {
        Self { cache, queue: Arc::new(queue), listen_addr, subscribers: Subscribers::default() }
    }

    pub async fn register(&self, task_id: String, sender: mpsc::UnboundedSender<StatusEvent>) {
        self.subscribers.register(task_id, sender).await;
    }

    pub async fn unregister_if_current(&self, task_id: &str, sender: &mpsc::UnboundedSender<StatusEvent>) {
        self.subscribers.unregister_if_current(task_id, sender).await;
    }

    pub async fn dispatch(&self, event: StatusEvent) {
        self.subscribers.dispatch(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processing(task_id: &str, message: &str) -> StatusEvent {
        StatusEvent::Processing { task_id: task_id.to_string(), message: message.to_string() }
    }

    /// Stands in for the `backtest_updates` pub/sub channel: dispatch goes
    /// straight through `Subscribers` rather than a real Redis subscription,
    /// exercising the publish-order guarantee without needing Redis.
    #[tokio::test]
    async fn dispatched_events_arrive_in_publish_order() {
        let subscribers = Subscribers::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscribers.register("task-1".to_string(), tx).await;

        subscribers.dispatch(processing("task-1", "one")).await;
        subscribers.dispatch(processing("task-1", "two")).await;
        subscribers.dispatch(processing("task-1", "three")).await;

        let messages: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| match event {
                StatusEvent::Processing { message, .. } => message,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
    }

    /// A reconnect registers a fresh sender for the same `task_id`; the
    /// prior connection's sender is displaced and its
    /// `unregister_if_current` becomes a no-op rather than evicting the new one.
    #[tokio::test]
    async fn reconnecting_displaces_the_prior_subscriber_without_evicting_the_new_one() {
        let subscribers = Subscribers::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        subscribers.register("task-1".to_string(), tx1.clone()).await;
        subscribers.register("task-1".to_string(), tx2).await;

        subscribers.dispatch(processing("task-1", "after-reconnect")).await;
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());

        // The old connection's cleanup path must not remove the new subscriber.
        subscribers.unregister_if_current("task-1", &tx1).await;
        subscribers.dispatch(processing("task-1", "still-routed")).await;
        assert!(rx2.try_recv().is_ok());
    }
}
