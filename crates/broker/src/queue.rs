use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use shared::rpc::TaskMessage;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{0}")]
    Amqp(#[from] lapin::Error),
    #[error("malformed task message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A durable, prefetch-1 connection to the `backtest_tasks` work queue.
/// One `TaskQueue` is shared by a single worker: AMQP's per-channel prefetch
/// means one in-flight delivery at a time, matching the one-VM-per-task model.
pub struct TaskQueue {
    channel: Channel,
    queue_name: String,
}

impl TaskQueue {
    pub async fn connect(amqp_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let connection =
            Connection::connect(amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await?;
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        Ok(Self { channel, queue_name: queue_name.to_string() })
    }

    /// Publish one task as a persistent message, matching `pika`'s
    /// `delivery_mode=2`.
    pub async fn publish(&self, task: &TaskMessage) -> Result<(), QueueError> {
        let body = serde_json::to_vec(task).expect("TaskMessage always serializes");
        self.channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }

    pub async fn consumer(&self, consumer_tag: &str) -> Result<Consumer, QueueError> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer)
    }
}

/// Pulls the next task off `consumer`, decoding its body. Returns `None`
/// once the consumer stream ends (channel/connection closed).
///
/// The caller is handed the raw delivery so it can ack after the terminal
/// status event has been published. The queue's at-least-once policy means
/// a crash before ack simply redelivers the task, it is never nacked or
/// dead-lettered.
pub async fn next_task(
    consumer: &mut Consumer,
) -> Option<Result<(TaskMessage, lapin::message::Delivery), QueueError>> {
    let delivery = consumer.next().await?;
    let delivery = match delivery {
        Ok(d) => d,
        Err(e) => return Some(Err(e.into())),
    };

    match serde_json::from_slice::<TaskMessage>(&delivery.data) {
        Ok(task) => Some(Ok((task, delivery))),
        Err(e) => Some(Err(e.into())),
    }
}

pub async fn ack(delivery: lapin::message::Delivery) -> Result<(), QueueError> {
    delivery.ack(BasicAckOptions::default()).await?;
    Ok(())
}
