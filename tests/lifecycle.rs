//! Broker client lifecycle tests against the in-memory broker.
//!
//! Run with: cargo test --test lifecycle
//!
//! Covers startup gating, end-to-end message processing, streaming restarts
//! after a dropped connection, and graceful shutdown with in-flight work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{watch, Semaphore};

use twitchy::broker::{BrokerClient, BrokerError, EventHandler, HandlerError, MockBroker, Settlement};
use twitchy::config::{BrokerConfig, Config};
use twitchy::event::{decode_payload, AccountCreated, AccountCreatedAck, DomainEvent, Envelope};
use twitchy::handlers::{AccountDirectory, AccountEventHandler};
use twitchy::utils::retry::ReconnectPolicy;

const WAIT: Duration = Duration::from_secs(5);

const SCENARIO_A: &[u8] =
    br#"{"type":"account_created","payload":"{\"id\":12345,\"email\":\"test@gmail.com\"}"}"#;
const SCENARIO_B: &[u8] = br#"{"type":"account_created"}"#;

fn accounts_config(workers: usize) -> BrokerConfig {
    BrokerConfig {
        workers: Some(workers),
        reconnect: ReconnectPolicy::linear(0),
        ..Config::accounts_service().broker
    }
}

fn start(broker: &MockBroker, workers: usize) -> Arc<BrokerClient> {
    Arc::new(BrokerClient::start(
        &accounts_config(workers),
        Arc::new(broker.clone()),
    ))
}

fn spawn_consume<H: EventHandler>(
    client: &Arc<BrokerClient>,
    handler: Arc<H>,
    cancel: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<Result<(), BrokerError>> {
    let client = client.clone();
    tokio::spawn(async move { client.consume(handler, cancel).await })
}

async fn wait_for_registrations(broker: &MockBroker, count: usize) {
    tokio::time::timeout(WAIT, async {
        while broker.consumer_tags().await.len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumers never registered");
}

/// Blocks every handler call on a shared gate.
struct GatedHandler {
    gate: Arc<Semaphore>,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl GatedHandler {
    fn new(gate: Arc<Semaphore>) -> Self {
        Self {
            gate,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }
}

impl EventHandler for GatedHandler {
    type Event = AccountCreated;

    fn decode(&self, kind: &str, payload: &str) -> serde_json::Result<Option<AccountCreated>> {
        match kind {
            AccountCreated::KIND => decode_payload(payload).map(Some),
            _ => Ok(None),
        }
    }

    fn dispatch(&self, _event: AccountCreated) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| HandlerError::Failed(e.to_string()))?;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_scenario_a_account_created_is_stored_and_acked() {
    let broker = MockBroker::new();
    let client = start(&broker, 2);
    let directory = Arc::new(AccountDirectory::new());
    let handler = Arc::new(AccountEventHandler::new(directory.clone()).with_acks(client.clone(), "accounts"));
    let (_cancel, cancel_rx) = watch::channel(false);

    let consumer = spawn_consume(&client, handler, cancel_rx);
    wait_for_registrations(&broker, 2).await;

    assert!(broker.deliver("account.created", SCENARIO_A.to_vec()).await);
    tokio::time::timeout(WAIT, broker.wait_settled(1)).await.unwrap();

    assert_eq!(broker.settlements().await, vec![Settlement::Ack]);
    assert_eq!(directory.get(12345).await.unwrap().email, "test@gmail.com");

    let published = broker.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "accounts_topic");
    assert_eq!(published[0].routing_key, AccountCreatedAck::ROUTING_KEY);

    client.close().await.unwrap();
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_scenario_b_missing_payload_is_nacked() {
    let broker = MockBroker::new();
    let client = start(&broker, 1);
    let directory = Arc::new(AccountDirectory::new());
    let handler = Arc::new(AccountEventHandler::new(directory.clone()));
    let (_cancel, cancel_rx) = watch::channel(false);

    let consumer = spawn_consume(&client, handler, cancel_rx);
    wait_for_registrations(&broker, 1).await;

    broker.deliver("account.created", SCENARIO_B.to_vec()).await;
    tokio::time::timeout(WAIT, broker.wait_settled(1)).await.unwrap();

    assert_eq!(
        broker.settlements().await,
        vec![Settlement::Nack { requeue: false }]
    );
    assert!(directory.is_empty().await);

    client.close().await.unwrap();
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_scenario_c_close_waits_for_in_flight_handlers() {
    let broker = MockBroker::new();
    let client = start(&broker, 3);
    let gate = Arc::new(Semaphore::new(0));
    let handler = Arc::new(GatedHandler::new(gate.clone()));
    let (_cancel, cancel_rx) = watch::channel(false);

    let consumer = spawn_consume(&client, handler.clone(), cancel_rx);
    wait_for_registrations(&broker, 3).await;

    for id in 1..=3 {
        let event = AccountCreated {
            id,
            email: format!("user{id}@example.com"),
            username: format!("user{id}"),
        };
        let body = Envelope::wrap(&event).unwrap().to_vec().unwrap();
        assert!(broker.deliver("account.created", body).await);
    }
    tokio::time::timeout(WAIT, async {
        while handler.started.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("handlers never started");

    let closing = {
        let client = client.clone();
        tokio::spawn(async move { client.close().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!closing.is_finished());
    assert!(broker.settlements().await.is_empty());
    assert_eq!(broker.close_count().await, 0);

    gate.add_permits(3);
    tokio::time::timeout(WAIT, closing).await.unwrap().unwrap().unwrap();

    assert_eq!(handler.finished.load(Ordering::SeqCst), 3);
    assert_eq!(broker.settlements().await, vec![Settlement::Ack; 3]);
    assert_eq!(broker.cancelled().await.len(), 3);
    assert_eq!(broker.close_count().await, 1);
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_consume_restarts_after_reconnect() {
    let broker = MockBroker::new();
    let client = start(&broker, 2);
    let directory = Arc::new(AccountDirectory::new());
    let handler = Arc::new(AccountEventHandler::new(directory.clone()));
    let (_cancel, cancel_rx) = watch::channel(false);

    let consumer = spawn_consume(&client, handler, cancel_rx);
    wait_for_registrations(&broker, 2).await;

    broker.drop_connection().await;
    wait_for_registrations(&broker, 4).await;
    assert_eq!(broker.dial_count(), 2);

    broker.deliver("account.created", SCENARIO_A.to_vec()).await;
    tokio::time::timeout(WAIT, broker.wait_settled(1)).await.unwrap();
    assert!(directory.get(12345).await.is_some());

    client.close().await.unwrap();
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_consume_reregisters_when_broker_ends_consumers() {
    let broker = MockBroker::new();
    let client = start(&broker, 2);
    let directory = Arc::new(AccountDirectory::new());
    let handler = Arc::new(AccountEventHandler::new(directory.clone()));
    let (_cancel, cancel_rx) = watch::channel(false);

    let consumer = spawn_consume(&client, handler, cancel_rx);
    wait_for_registrations(&broker, 2).await;

    broker.end_deliveries().await;
    wait_for_registrations(&broker, 4).await;
    assert_eq!(broker.dial_count(), 1);
    assert_eq!(broker.active_consumers().await, 2);

    assert!(broker.deliver("account.created", SCENARIO_A.to_vec()).await);
    tokio::time::timeout(WAIT, broker.wait_settled(1)).await.unwrap();
    assert!(directory.get(12345).await.is_some());

    client.close().await.unwrap();
    consumer.await.unwrap().unwrap();
    assert_eq!(broker.cancelled().await.len(), 2);
}

#[tokio::test]
async fn test_cancel_stops_consume() {
    let broker = MockBroker::new();
    let client = start(&broker, 2);
    let handler = Arc::new(AccountEventHandler::new(Arc::new(AccountDirectory::new())));
    let (cancel, cancel_rx) = watch::channel(false);

    let consumer = spawn_consume(&client, handler, cancel_rx);
    wait_for_registrations(&broker, 2).await;

    cancel.send_replace(true);
    tokio::time::timeout(WAIT, consumer).await.unwrap().unwrap().unwrap();

    client.close().await.unwrap();
    assert_eq!(broker.close_count().await, 1);
}

#[tokio::test]
async fn test_close_surfaces_cancel_failure() {
    let broker = MockBroker::new();
    let client = start(&broker, 2);
    let handler = Arc::new(AccountEventHandler::new(Arc::new(AccountDirectory::new())));
    let (_cancel, cancel_rx) = watch::channel(false);

    let consumer = spawn_consume(&client, handler, cancel_rx);
    wait_for_registrations(&broker, 2).await;
    broker.fail_cancel(true).await;

    let result = client.close().await;

    assert!(matches!(result, Err(BrokerError::Shutdown(_))));
    assert_eq!(broker.close_count().await, 0);
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_publish_before_connect_is_rejected() {
    let broker = MockBroker::new();
    broker.refuse_dials(usize::MAX);
    let client = start(&broker, 1);

    let event = AccountCreated {
        id: 1,
        email: "ada@example.com".to_string(),
        username: "ada".to_string(),
    };
    let result = client.publish_event(&event).await;

    assert!(matches!(result, Err(BrokerError::NotConnected)));
    assert_eq!(broker.published_count().await, 0);
    client.close().await.unwrap();
}
