use std::collections::HashSet;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;

use crate::config::BusConfig;
use crate::error::Result;
use crate::scheduler::task::Dispatch;

/// Egress side of the message bus: publishes dispatch messages keyed so
/// that only the targeted worker consumes them.
#[async_trait]
pub trait BusProducer: Send + Sync {
    async fn send_dispatch(&self, task_id: &str, server_id: &str) -> Result<()>;
}

/// RabbitMQ-backed producer. Each worker gets its own durable queue named
/// `<dispatch_queue>.<server_id>`, declared lazily on first dispatch.
pub struct AmqpProducer {
    connection: Connection,
    channel: Channel,
    dispatch_queue: String,
    declared: Mutex<HashSet<String>>,
}

impl AmqpProducer {
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let connection =
            Connection::connect(&config.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        tracing::info!(url = %config.url, "Connected dispatch producer to message bus");

        Ok(Self {
            connection,
            channel,
            dispatch_queue: config.dispatch_queue.clone(),
            declared: Mutex::new(HashSet::new()),
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close(200, "scheduler shutting down").await?;
        tracing::info!("Bus producer connection closed");
        Ok(())
    }

    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        let mut declared = self.declared.lock().await;
        if declared.contains(queue) {
            return Ok(());
        }
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        declared.insert(queue.to_string());
        tracing::debug!(queue, "Declared per-worker dispatch queue");
        Ok(())
    }
}

#[async_trait]
impl BusProducer for AmqpProducer {
    async fn send_dispatch(&self, task_id: &str, server_id: &str) -> Result<()> {
        let queue = format!("{}.{}", self.dispatch_queue, server_id);
        self.ensure_queue(&queue).await?;

        let payload = serde_json::to_vec(&Dispatch {
            task_id: task_id.to_string(),
            server_id: server_id.to_string(),
        })?;

        // Persistent delivery, published to the default exchange so the
        // routing key is the per-worker queue itself. Wait for the broker
        // confirm before reporting success.
        self.channel
            .basic_publish(
                "",
                &queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;

        tracing::debug!(task_id, server_id, queue = %queue, "Dispatch published");
        Ok(())
    }
}
