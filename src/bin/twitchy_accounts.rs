//! twitchy-accounts: account provisioning consumer
//!
//! Consumes `account_created` events from the accounts queue, stores each
//! account and answers with an `account_created_ack`.
//!
//! ## Architecture
//! ```text
//! [auth] --(account.created)--> [accounts_topic] --> [accounts_queue] --> [twitchy-accounts]
//!                                      ^                                        |
//!                                      +-----------(account.created.ack)--------+
//! ```
//!
//! ## Configuration
//! - First argument or TWITCHY_CONFIG: YAML config file (optional)
//! - TWITCHY__BROKER__URL, or RABBITMQ_USER/PASSWORD/HOST/PORT: broker address
//! - TWITCHY__BROKER__WORKERS: consumer workers (default: available parallelism)
//! - TWITCHY__ACCOUNTS__EMIT_ACKS: publish acks (default: true)
//! - TWITCHY_LOG: log filter (default: info)
//!
//! Ctrl+C or SIGTERM stops the workers after their current message, cancels
//! the consumers and closes the connection.

use std::sync::Arc;

use tracing::{error, info};

use twitchy::broker::{BrokerClient, BrokerError};
use twitchy::config::Config;
use twitchy::handlers::{AccountDirectory, AccountEventHandler};
use twitchy::utils::bootstrap::{cancel_on_shutdown_signal, cancellation, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref(), Config::accounts_service())?;

    let client = Arc::new(BrokerClient::start_amqp(&config.broker));
    let directory = Arc::new(AccountDirectory::new());

    let mut handler = AccountEventHandler::new(directory.clone());
    if config.accounts.emit_acks {
        handler = handler.with_acks(client.clone(), config.accounts.service_name.clone());
    }

    let (cancel, cancel_rx) = cancellation();
    cancel_on_shutdown_signal(cancel);

    info!(
        queue = ?config.broker.queue,
        workers = config.broker.worker_count(),
        "twitchy-accounts started"
    );

    let streamed = client.consume(Arc::new(handler), cancel_rx).await;
    client.close().await?;

    match streamed {
        Ok(()) | Err(BrokerError::Closed) => {}
        Err(e) => {
            error!(error = %e, "Streaming failed");
            return Err(e.into());
        }
    }

    info!(accounts = directory.len().await, "twitchy-accounts stopped");
    Ok(())
}
