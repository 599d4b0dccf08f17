//! Auth service handler.
//!
//! Records which downstream services have provisioned each account.

use std::collections::BTreeSet;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::info;

use crate::broker::{EventHandler, HandlerError};
use crate::event::{decode_payload, AccountCreatedAck, DomainEvent};

/// Consumes `account_created_ack`.
#[derive(Default)]
pub struct AckHandler {
    acks: RwLock<Vec<AccountCreatedAck>>,
}

impl AckHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every ack received so far, in arrival order.
    pub async fn acks(&self) -> Vec<AccountCreatedAck> {
        self.acks.read().await.clone()
    }

    /// Services that acknowledged account `id`.
    pub async fn provisioned_by(&self, id: i64) -> BTreeSet<String> {
        self.acks
            .read()
            .await
            .iter()
            .filter(|ack| ack.id == id)
            .map(|ack| ack.service.clone())
            .collect()
    }
}

impl EventHandler for AckHandler {
    type Event = AccountCreatedAck;

    fn decode(&self, kind: &str, payload: &str) -> serde_json::Result<Option<AccountCreatedAck>> {
        match kind {
            AccountCreatedAck::KIND => decode_payload(payload).map(Some),
            _ => Ok(None),
        }
    }

    fn dispatch(&self, ack: AccountCreatedAck) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin(async move {
            info!(account_id = ack.id, service = %ack.service, "Account provisioned");
            self.acks.write().await.push(ack);
            Ok(())
        })
    }
}
