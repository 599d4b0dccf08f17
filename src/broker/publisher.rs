//! Confirmed publisher.
//!
//! `publish` blocks until the broker positively confirms the message. A send
//! that is not confirmed within the resend delay, or that the broker nacks,
//! is sent again. The broker may therefore receive duplicates: delivery is
//! at-least-once, never exactly-once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::connection::ConnectionManager;
use super::{BrokerError, Result};
use crate::event::{DomainEvent, Envelope};

/// Default wait for a confirmation before resending.
pub const DEFAULT_RESEND_DELAY: Duration = Duration::from_secs(5);

/// Publishes through the connection manager's current session.
pub struct Publisher {
    manager: Arc<ConnectionManager>,
    resend_delay: Duration,
    max_attempts: Option<u32>,
}

impl Publisher {
    /// `max_attempts: None` keeps retrying until confirmed or the client closes.
    pub fn new(
        manager: Arc<ConnectionManager>,
        resend_delay: Duration,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            manager,
            resend_delay,
            max_attempts,
        }
    }

    pub fn resend_delay(&self) -> Duration {
        self.resend_delay
    }

    /// Publish `body` under `routing_key` and wait for a positive confirmation.
    ///
    /// Fails immediately with `NotConnected` if the manager is not connected;
    /// nothing is buffered. Once started, a dropped connection does not fail
    /// the call: the send is repeated after the manager reconnects.
    #[tracing::instrument(name = "broker.publish", skip_all, fields(routing_key = %routing_key))]
    pub async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        if !self.manager.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        let mut attempt: u32 = 0;
        loop {
            if let Some(max) = self.max_attempts {
                if attempt >= max {
                    return Err(BrokerError::PublishExhausted { attempts: attempt });
                }
            }

            let generation = self.manager.generation();
            let confirm = match self.manager.send(routing_key, body).await {
                Ok(confirm) => confirm,
                Err(BrokerError::Disconnected) => {
                    debug!(attempt, "Connection dropped mid-publish, resending once reconnected");
                    self.manager.wait_reconnected(generation).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            attempt += 1;

            match tokio::time::timeout(self.resend_delay, confirm).await {
                Ok(Ok(true)) => {
                    debug!(attempt, "Publish confirmed");
                    return Ok(());
                }
                Ok(Ok(false)) => {
                    warn!(attempt, "Broker nacked publish, resending");
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "Publish confirmation lost, resending");
                }
                Err(_) => {
                    warn!(
                        attempt,
                        resend_delay_ms = self.resend_delay.as_millis() as u64,
                        "Publish not confirmed in time, resending"
                    );
                }
            }
        }
    }

    /// Send once without waiting for the broker's confirmation.
    ///
    /// No delivery guarantee: a message lost in flight is never resent.
    pub async fn publish_unconfirmed(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        if !self.manager.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.manager.send(routing_key, body).await.map(drop)
    }

    /// Wrap `event` in the envelope and publish it under its routing key.
    pub async fn publish_event<E: DomainEvent>(&self, event: &E) -> Result<()> {
        let body = Envelope::wrap(event)?.to_vec()?;
        self.publish(E::ROUTING_KEY, &body).await
    }
}
