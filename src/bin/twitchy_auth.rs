//! twitchy-auth: account registration publisher
//!
//! Publishes one `account_created` event per JSON line read from stdin,
//! e.g. `{"id": 1, "email": "ada@example.com", "username": "ada"}`, and
//! records the `account_created_ack` events downstream services send back.
//!
//! ## Configuration
//! - First argument or TWITCHY_CONFIG: YAML config file (optional)
//! - TWITCHY__BROKER__URL, or RABBITMQ_USER/PASSWORD/HOST/PORT: broker address
//! - TWITCHY__BROKER__MAX_PUBLISH_ATTEMPTS: bound publish retries (default: unbounded)
//! - TWITCHY_LOG: log filter (default: info)
//!
//! Keeps streaming acks after stdin closes, until Ctrl+C or SIGTERM.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use twitchy::broker::{BrokerClient, BrokerError};
use twitchy::config::Config;
use twitchy::event::AccountCreated;
use twitchy::handlers::AckHandler;
use twitchy::utils::bootstrap::{cancel_on_shutdown_signal, cancellation, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref(), Config::auth_service())?;

    let client = Arc::new(BrokerClient::start_amqp(&config.broker));
    let acks = Arc::new(AckHandler::new());

    let (cancel, cancel_rx) = cancellation();
    cancel_on_shutdown_signal(cancel);

    let consumer = {
        let client = client.clone();
        let acks = acks.clone();
        let cancel_rx = cancel_rx.clone();
        tokio::spawn(async move { client.consume(acks, cancel_rx).await })
    };

    let mut shutdown = cancel_rx.clone();
    let connected = tokio::select! {
        biased;
        _ = shutdown.wait_for(|stop| *stop) => false,
        connected = client.wait_connected() => connected.is_ok(),
    };

    if connected {
        info!("twitchy-auth started, reading accounts from stdin");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                info!("stdin closed, streaming acks until shutdown");
                let _ = shutdown.wait_for(|stop| *stop).await;
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let event: AccountCreated = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed account line");
                    continue;
                }
            };

            match client.publish_event(&event).await {
                Ok(()) => info!(account_id = event.id, "Published account_created"),
                Err(e) => warn!(account_id = event.id, error = %e, "Failed to publish account_created"),
            }
        }
    }

    client.close().await?;

    match consumer.await? {
        Ok(()) | Err(BrokerError::Closed) => {}
        Err(e) => error!(error = %e, "Ack streaming failed"),
    }

    info!(acks = acks.acks().await.len(), "twitchy-auth stopped");
    Ok(())
}
