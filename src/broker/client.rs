//! Lifecycle Controller.
//!
//! `BrokerClient` wires a connection manager, a publisher and (for clients
//! with a queue) a consumer pool together. Startup is gated on the manager
//! reporting connected. Shutdown drains the workers before anything is
//! cancelled or closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::connection::{redact_url, ConnectionManager};
use super::consumer::ConsumerPool;
use super::publisher::Publisher;
use super::{raised, BrokerError, ConnectionState, Dialer, EventHandler, Result};
use crate::config::BrokerConfig;
use crate::event::DomainEvent;

/// Pause before re-registering consumers on a session that is still open.
const STREAM_RESTART_DELAY: Duration = Duration::from_secs(1);

/// One broker connection shared by a publisher and an optional consumer pool.
pub struct BrokerClient {
    manager: Arc<ConnectionManager>,
    publisher: Publisher,
    pool: Option<ConsumerPool>,
}

impl BrokerClient {
    /// Build the client and start the reconnect loop in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: &BrokerConfig, dialer: Arc<dyn Dialer>) -> Self {
        let manager = Arc::new(ConnectionManager::new(
            dialer,
            config.topology(),
            config.reconnect.clone(),
        ));
        let publisher = Publisher::new(
            manager.clone(),
            config.resend_delay(),
            config.max_publish_attempts,
        );
        let pool = config.queue.as_ref().map(|queue| {
            ConsumerPool::new(
                manager.clone(),
                queue.clone(),
                config.worker_count(),
                config.consumer_prefix.clone(),
            )
        });

        info!(
            url = %redact_url(&config.url),
            exchange = %config.exchange,
            queue = ?config.queue,
            "Starting broker client"
        );
        tokio::spawn(manager.clone().maintain(config.url.clone()));

        Self {
            manager,
            publisher,
            pool,
        }
    }

    /// Start against RabbitMQ.
    #[cfg(feature = "amqp")]
    pub fn start_amqp(config: &BrokerConfig) -> Self {
        Self::start(config, Arc::new(super::AmqpDialer::new()))
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Suspend until the manager reports connected.
    pub async fn wait_connected(&self) -> Result<()> {
        self.manager.wait_connected().await
    }

    /// See [`Publisher::publish`].
    pub async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        self.publisher.publish(routing_key, body).await
    }

    /// See [`Publisher::publish_event`].
    pub async fn publish_event<E: DomainEvent>(&self, event: &E) -> Result<()> {
        self.publisher.publish_event(event).await
    }

    /// Run the consumer pool once. See [`ConsumerPool::stream`].
    pub async fn stream<H: EventHandler>(
        &self,
        handler: Arc<H>,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        self.pool()?.stream(handler, cancel).await
    }

    /// Stream until cancelled or closed, restarting after every reconnect.
    ///
    /// If the broker ends the consumers while the channel stays open, no
    /// reconnect follows; the consumers are registered again on the same
    /// session after a short pause.
    pub async fn consume<H: EventHandler>(
        &self,
        handler: Arc<H>,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let pool = self.pool()?;
        loop {
            let generation = self.manager.generation();
            match pool.stream(handler.clone(), cancel.clone()).await {
                Ok(()) => return Ok(()),
                Err(e @ (BrokerError::Disconnected | BrokerError::Consume(_))) => {
                    warn!(error = %e, "Streaming interrupted, restarting");
                    let mut cancelled = cancel.clone();
                    tokio::select! {
                        biased;
                        _ = raised(&mut cancelled) => return Ok(()),
                        reconnected = self.manager.wait_reconnected(generation) => reconnected?,
                        _ = tokio::time::sleep(STREAM_RESTART_DELAY) => {
                            debug!(generation, "No reconnect, registering consumers again");
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Graceful shutdown.
    ///
    /// A client that is not connected only stops its reconnect loop. Otherwise
    /// the loop is stopped, in-flight messages finish, each consumer is
    /// cancelled, then the channel and connection close. A failed
    /// cancellation aborts the shutdown and is returned as is.
    pub async fn close(&self) -> Result<()> {
        if !self.manager.is_connected() {
            debug!(state = %self.manager.state(), "Broker client not connected, nothing to close");
            self.manager.stop();
            return Ok(());
        }

        info!("Closing broker client");
        self.manager.stop();

        if let Some(pool) = &self.pool {
            pool.drain().await;
            pool.cancel_consumers().await?;
        }

        self.manager.close_session().await?;
        info!("Broker client closed");
        Ok(())
    }

    fn pool(&self) -> Result<&ConsumerPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| BrokerError::Consume("no queue configured".to_string()))
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.manager.stop();
    }
}
