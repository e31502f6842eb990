use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::BusConfig;
use crate::error::Result;

/// Ingress side of the message bus.
///
/// Each method is long-lived: it delivers raw message bodies onto `out`
/// until the shutdown token fires or the broker connection is lost. Acking
/// is the implementation's business; the scheduler treats bodies as opaque
/// bytes.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    async fn handle_tasks(
        &self,
        out: mpsc::Sender<Vec<u8>>,
        queue: &str,
        routing_key: &str,
        consumer_tag: &str,
    );

    async fn handle_completions(
        &self,
        out: mpsc::Sender<Vec<u8>>,
        queue: &str,
        routing_key: &str,
        consumer_tag: &str,
    );

    async fn handle_joins(&self, out: mpsc::Sender<Vec<u8>>, consumer_tag: &str);
}

fn exchange_kind(name: &str) -> ExchangeKind {
    match name {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// RabbitMQ-backed consumer for the task, completion, and membership
/// streams.
pub struct AmqpConsumer {
    connection: Connection,
    channel: Channel,
    exchange: String,
    join_exchange: String,
    shutdown: CancellationToken,
}

impl AmqpConsumer {
    /// Connect, open a channel, and declare the task exchange.
    pub async fn connect(config: &BusConfig, shutdown: CancellationToken) -> Result<Self> {
        let connection =
            Connection::connect(&config.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &config.exchange,
                exchange_kind(&config.exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(url = %config.url, exchange = %config.exchange, "Connected to message bus");

        Ok(Self {
            connection,
            channel,
            exchange: config.exchange.clone(),
            join_exchange: config.join_exchange.clone(),
            shutdown,
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close(200, "scheduler shutting down").await?;
        tracing::info!("Bus consumer connection closed");
        Ok(())
    }

    /// Declare `queue` (durable), bind it to the task exchange, and start
    /// consuming.
    async fn consume_bound(
        &self,
        queue: &str,
        routing_key: &str,
        consumer_tag: &str,
    ) -> Result<Consumer> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_bind(
                declared.name().as_str(),
                &self.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer = self
            .channel
            .basic_consume(
                declared.name().as_str(),
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::debug!(queue, routing_key, consumer_tag, "Consuming from bound queue");
        Ok(consumer)
    }

    /// Declare an exclusive, broker-named queue bound to the membership
    /// fanout exchange and start consuming. Every scheduler instance sees
    /// every join/leave event.
    async fn consume_joins(&self, consumer_tag: &str) -> Result<Consumer> {
        self.channel
            .exchange_declare(
                &self.join_exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let declared = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_bind(
                declared.name().as_str(),
                &self.join_exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer = self
            .channel
            .basic_consume(
                declared.name().as_str(),
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::debug!(
            exchange = %self.join_exchange,
            queue = declared.name().as_str(),
            consumer_tag,
            "Consuming membership events"
        );
        Ok(consumer)
    }

    /// Forward delivery bodies onto `out` until shutdown. A closed delivery
    /// stream means the broker connection is gone; that is unrecoverable,
    /// so the shared shutdown token is cancelled.
    async fn pump(&self, mut consumer: Consumer, out: mpsc::Sender<Vec<u8>>, consumer_tag: &str) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!(consumer_tag, "Consumer stream stopping on shutdown");
                    break;
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                tracing::warn!(consumer_tag, error = %e, "Failed to ack delivery");
                            }
                            if out.send(delivery.data).await.is_err() {
                                tracing::debug!(consumer_tag, "Ingress channel closed, stopping consumer");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!(consumer_tag, error = %e, "Delivery error on consumer stream");
                        }
                        None => {
                            tracing::error!(consumer_tag, "Bus delivery stream closed, shutting down");
                            self.shutdown.cancel();
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn run_stream(
        &self,
        setup: Result<Consumer>,
        out: mpsc::Sender<Vec<u8>>,
        consumer_tag: &str,
    ) {
        match setup {
            Ok(consumer) => self.pump(consumer, out, consumer_tag).await,
            Err(e) => {
                tracing::error!(consumer_tag, error = %e, "Failed to start consumer, shutting down");
                self.shutdown.cancel();
            }
        }
    }
}

#[async_trait]
impl BusConsumer for AmqpConsumer {
    async fn handle_tasks(
        &self,
        out: mpsc::Sender<Vec<u8>>,
        queue: &str,
        routing_key: &str,
        consumer_tag: &str,
    ) {
        let setup = self.consume_bound(queue, routing_key, consumer_tag).await;
        self.run_stream(setup, out, consumer_tag).await;
    }

    async fn handle_completions(
        &self,
        out: mpsc::Sender<Vec<u8>>,
        queue: &str,
        routing_key: &str,
        consumer_tag: &str,
    ) {
        let setup = self.consume_bound(queue, routing_key, consumer_tag).await;
        self.run_stream(setup, out, consumer_tag).await;
    }

    async fn handle_joins(&self, out: mpsc::Sender<Vec<u8>>, consumer_tag: &str) {
        let setup = self.consume_joins(consumer_tag).await;
        self.run_stream(setup, out, consumer_tag).await;
    }
}
