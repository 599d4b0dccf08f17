//! Domain event envelope.
//!
//! Every message body is `{"type": string, "payload": string}` where
//! `payload` is itself the JSON encoding of the typed event. The payload is
//! decoded in a second stage once the type is known.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

mod account;

pub use account::{
    AccountCreated, AccountCreatedAck, ACCOUNTS_EXCHANGE, ACCOUNTS_QUEUE, AUTH_SERVICE_QUEUE,
};

/// A typed event that can travel inside an [`Envelope`].
pub trait DomainEvent: Serialize + DeserializeOwned + Send + 'static {
    /// Value of the envelope's `type` field.
    const KIND: &'static str;
    /// Routing key used on the topic exchange.
    const ROUTING_KEY: &'static str;
}

/// Outer wire format shared by all services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    /// A missing key decodes as empty, which consumers treat as malformed.
    #[serde(default)]
    pub payload: String,
}

impl Envelope {
    pub fn wrap<E: DomainEvent>(event: &E) -> serde_json::Result<Self> {
        Ok(Self {
            kind: E::KIND.to_string(),
            payload: serde_json::to_string(event)?,
        })
    }

    pub fn decode(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    pub fn is<E: DomainEvent>(&self) -> bool {
        self.kind == E::KIND
    }
}

/// Second decoding stage.
pub fn decode_payload<E: DomainEvent>(payload: &str) -> serde_json::Result<E> {
    serde_json::from_str(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_double_encoded_envelope() {
        let body = br#"{"type":"account_created","payload":"{\"id\":12345,\"email\":\"test@gmail.com\"}"}"#;

        let envelope = Envelope::decode(body).unwrap();
        assert!(envelope.is::<AccountCreated>());
        assert!(envelope.has_payload());

        let event: AccountCreated = decode_payload(&envelope.payload).unwrap();
        assert_eq!(event.id, 12345);
        assert_eq!(event.email, "test@gmail.com");
        assert_eq!(event.username, "");
    }

    #[test]
    fn test_missing_payload_decodes_empty() {
        let envelope = Envelope::decode(br#"{"type":"account_created"}"#).unwrap();
        assert!(!envelope.has_payload());
    }

    #[test]
    fn test_missing_type_is_an_error() {
        assert!(Envelope::decode(br#"{"payload":"{}"}"#).is_err());
    }

    #[test]
    fn test_wrap_encodes_payload_as_string() {
        let ack = AccountCreatedAck {
            id: 3,
            service: "accounts".to_string(),
        };

        let bytes = Envelope::wrap(&ack).unwrap().to_vec().unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(raw["type"], "account_created_ack");
        assert!(raw["payload"].is_string());
        let inner: serde_json::Value =
            serde_json::from_str(raw["payload"].as_str().unwrap()).unwrap();
        assert_eq!(inner["id"], 3);
        assert_eq!(inner["service"], "accounts");
    }
}
