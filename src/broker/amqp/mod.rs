//! AMQP (RabbitMQ) transport.
//!
//! One connection and one confirm-mode channel per session. The session's
//! close notification fires on any connection or channel error, and on any
//! failed publish, so the reconnect loop replaces it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{
    Acknowledger, BrokerError, DeliveryStream, Dialer, InboundMessage, PendingConfirm, Result,
    Session, Topology,
};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with lapin.
#[derive(Debug, Default, Clone)]
pub struct AmqpDialer;

impl AmqpDialer {
    pub fn new() -> Self {
        Self
    }

    async fn declare(channel: &Channel, topology: &Topology) -> Result<()> {
        channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Setup(format!("Failed to declare exchange: {}", e)))?;

        let Some(queue) = &topology.queue else {
            return Ok(());
        };

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Setup(format!("Failed to declare queue: {}", e)))?;

        for routing_key in &topology.bindings {
            channel
                .queue_bind(
                    queue,
                    &topology.exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Setup(format!("Failed to bind queue: {}", e)))?;

            info!(
                queue = %queue,
                exchange = %topology.exchange,
                routing_key = %routing_key,
                "Bound queue to exchange"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Dialer for AmqpDialer {
    async fn dial(&self, url: &str, topology: &Topology) -> Result<Arc<dyn Session>> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        {
            let closed = closed.clone();
            connection.on_error(move |e| {
                error!(error = %e, "AMQP connection error");
                closed.send_replace(true);
            });
        }

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))?;
        {
            let closed = closed.clone();
            channel.on_error(move |e| {
                error!(error = %e, "AMQP channel error");
                closed.send_replace(true);
            });
        }

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to enable confirms: {}", e)))?;

        Self::declare(&channel, topology).await?;

        Ok(Arc::new(AmqpSession {
            connection,
            channel,
            closed,
        }))
    }
}

/// A live connection plus confirm-mode channel.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    closed: Arc<watch::Sender<bool>>,
}

fn publish_properties(content_type: &str) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(content_type.into())
        .with_delivery_mode(PERSISTENT)
}

fn inbound(delivery: Delivery) -> InboundMessage {
    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_string());
    InboundMessage::new(
        content_type,
        delivery.routing_key.as_str(),
        delivery.data,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

#[async_trait]
impl Session for AmqpSession {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<PendingConfirm> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                publish_properties(content_type),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => {
                error!(error = %e, "Failed to publish, channel unusable");
                self.closed.send_replace(true);
                return Err(BrokerError::Disconnected);
            }
        };

        Ok(async move {
            confirm
                .await
                .map(|confirmation| confirmation.is_ack())
                .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))
        }
        .boxed())
    }

    async fn qos(&self, prefetch: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to set prefetch: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        debug!(queue = %queue, consumer = %consumer_tag, "Consumer registered");

        let closed = self.closed.clone();
        Ok(consumer
            .map(move |delivery| match delivery {
                Ok(delivery) => Ok(inbound(delivery)),
                Err(e) => {
                    closed.send_replace(true);
                    Err(BrokerError::Consume(format!("Delivery failed: {}", e)))
                }
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to cancel consumer: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "client closing")
            .await
            .map_err(|e| BrokerError::Shutdown(format!("Failed to close channel: {}", e)))?;
        self.connection
            .close(REPLY_SUCCESS, "client closing")
            .await
            .map_err(|e| BrokerError::Shutdown(format!("Failed to close connection: {}", e)))?;
        self.closed.send_replace(true);
        Ok(())
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut closed = self.closed.subscribe();
        async move {
            let _ = closed.wait_for(|closed| *closed).await;
        }
        .boxed()
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| BrokerError::Acknowledge(format!("Failed to nack: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Acknowledge(format!("Failed to reject: {}", e)))
    }
}
