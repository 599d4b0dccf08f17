//! Account lifecycle events exchanged between the auth and account services.

use serde::{Deserialize, Serialize};

use super::DomainEvent;

/// Topic exchange carrying account events.
pub const ACCOUNTS_EXCHANGE: &str = "accounts_topic";
/// Queue consumed by the account service.
pub const ACCOUNTS_QUEUE: &str = "accounts_queue";
/// Queue consumed by the auth service.
pub const AUTH_SERVICE_QUEUE: &str = "auth_service_queue";

/// Emitted by auth after a user registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCreated {
    pub id: i64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
}

impl DomainEvent for AccountCreated {
    const KIND: &'static str = "account_created";
    const ROUTING_KEY: &'static str = "account.created";
}

/// Emitted by a downstream service once it has provisioned the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCreatedAck {
    pub id: i64,
    pub service: String,
}

impl DomainEvent for AccountCreatedAck {
    const KIND: &'static str = "account_created_ack";
    const ROUTING_KEY: &'static str = "account.created.ack";
}
