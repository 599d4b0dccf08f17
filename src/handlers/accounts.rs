//! Accounts service handler.
//!
//! Stores each `account_created` event through an [`AccountService`] and,
//! when configured, answers with an `account_created_ack`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::broker::{BrokerClient, EventHandler, HandlerError};
use crate::event::{decode_payload, AccountCreated, AccountCreatedAck, DomainEvent};

/// An account as the accounts service stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub email: String,
    pub username: String,
}

impl From<AccountCreated> for Account {
    fn from(event: AccountCreated) -> Self {
        Self {
            id: event.id,
            email: event.email,
            username: event.username,
        }
    }
}

/// Account persistence.
#[async_trait]
pub trait AccountService: Send + Sync {
    /// Store a new account. An existing id is an error.
    async fn create_account(&self, account: Account) -> Result<(), HandlerError>;
}

/// In-memory [`AccountService`].
#[derive(Default)]
pub struct AccountDirectory {
    accounts: RwLock<HashMap<i64, Account>>,
}

impl AccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: i64) -> Option<Account> {
        self.accounts.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }
}

#[async_trait]
impl AccountService for AccountDirectory {
    async fn create_account(&self, account: Account) -> Result<(), HandlerError> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&account.id) {
            return Err(HandlerError::Failed(format!(
                "account {} already exists",
                account.id
            )));
        }
        accounts.insert(account.id, account);
        Ok(())
    }
}

struct AckEmitter {
    client: Arc<BrokerClient>,
    service_name: String,
}

/// Consumes `account_created`.
pub struct AccountEventHandler {
    service: Arc<dyn AccountService>,
    acks: Option<AckEmitter>,
}

impl AccountEventHandler {
    pub fn new(service: Arc<dyn AccountService>) -> Self {
        Self {
            service,
            acks: None,
        }
    }

    /// Publish an `account_created_ack` through `client` after each stored account.
    pub fn with_acks(mut self, client: Arc<BrokerClient>, service_name: impl Into<String>) -> Self {
        self.acks = Some(AckEmitter {
            client,
            service_name: service_name.into(),
        });
        self
    }
}

impl EventHandler for AccountEventHandler {
    type Event = AccountCreated;

    fn decode(&self, kind: &str, payload: &str) -> serde_json::Result<Option<AccountCreated>> {
        match kind {
            AccountCreated::KIND => decode_payload(payload).map(Some),
            _ => Ok(None),
        }
    }

    fn dispatch(&self, event: AccountCreated) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin(async move {
            let id = event.id;
            self.service.create_account(event.into()).await?;
            info!(account_id = id, "Account created");

            // The account is stored either way; a lost ack is not a processing failure.
            if let Some(acks) = &self.acks {
                let ack = AccountCreatedAck {
                    id,
                    service: acks.service_name.clone(),
                };
                if let Err(e) = acks.client.publish_event(&ack).await {
                    warn!(account_id = id, error = %e, "Failed to publish account ack");
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::processing::process_message;
    use crate::broker::{MockBroker, Settlement};
    use crate::config::Config;
    use crate::event::Envelope;

    fn created(id: i64) -> AccountCreated {
        AccountCreated {
            id,
            email: format!("user{id}@example.com"),
            username: format!("user{id}"),
        }
    }

    #[tokio::test]
    async fn test_directory_rejects_duplicate_id() {
        let directory = AccountDirectory::new();

        directory.create_account(created(1).into()).await.unwrap();
        let result = directory.create_account(created(1).into()).await;

        assert!(matches!(result, Err(HandlerError::Failed(_))));
        assert_eq!(directory.len().await, 1);
    }

    #[tokio::test]
    async fn test_handler_stores_account() {
        let directory = Arc::new(AccountDirectory::new());
        let handler = AccountEventHandler::new(directory.clone());
        let body = br#"{"type":"account_created","payload":"{\"id\":12345,\"email\":\"test@gmail.com\"}"}"#;

        let settlement = process_message(&handler, body).await;

        assert_eq!(settlement, Settlement::Ack);
        let account = directory.get(12345).await.unwrap();
        assert_eq!(account.email, "test@gmail.com");
        assert_eq!(account.username, "");
    }

    #[tokio::test]
    async fn test_duplicate_account_is_nacked() {
        let directory = Arc::new(AccountDirectory::new());
        let handler = AccountEventHandler::new(directory.clone());
        let body = Envelope::wrap(&created(5)).unwrap().to_vec().unwrap();

        assert_eq!(process_message(&handler, &body).await, Settlement::Ack);
        assert_eq!(
            process_message(&handler, &body).await,
            Settlement::Nack { requeue: false }
        );
    }

    #[tokio::test]
    async fn test_ack_type_is_not_for_accounts() {
        let handler = AccountEventHandler::new(Arc::new(AccountDirectory::new()));
        let ack = AccountCreatedAck {
            id: 1,
            service: "accounts".to_string(),
        };
        let body = Envelope::wrap(&ack).unwrap().to_vec().unwrap();

        assert_eq!(
            process_message(&handler, &body).await,
            Settlement::Reject { requeue: false }
        );
    }

    #[tokio::test]
    async fn test_handler_publishes_ack() {
        let broker = MockBroker::new();
        let client = Arc::new(BrokerClient::start(
            &Config::accounts_service().broker,
            Arc::new(broker.clone()),
        ));
        client.wait_connected().await.unwrap();
        let handler =
            AccountEventHandler::new(Arc::new(AccountDirectory::new())).with_acks(client, "accounts");

        handler.dispatch(created(9)).await.unwrap();

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "account.created.ack");
        let envelope = Envelope::decode(&published[0].body).unwrap();
        let ack: AccountCreatedAck = decode_payload(&envelope.payload).unwrap();
        assert_eq!(ack.id, 9);
        assert_eq!(ack.service, "accounts");
    }
}
