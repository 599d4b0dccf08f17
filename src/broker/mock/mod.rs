//! Mock broker for testing.
//!
//! An in-memory `Dialer` whose sessions record publishes, consumer
//! registrations and settlements. Tests drive it by scripting confirmations,
//! refusing dials, delivering messages and dropping the connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    Acknowledger, BrokerError, DeliveryStream, Dialer, InboundMessage, PendingConfirm, Result,
    Session, Settlement, Topology,
};

/// Scripted broker answer for one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockConfirm {
    Ack,
    Nack,
    /// Never confirms. The confirmation fails once the connection drops.
    Silent,
}

/// A publish the mock broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

type DeliverySender = mpsc::UnboundedSender<Result<InboundMessage>>;

#[derive(Default)]
struct MockState {
    confirms: VecDeque<MockConfirm>,
    published: Vec<PublishedMessage>,
    unconfirmed: Vec<oneshot::Sender<bool>>,
    settlements: Vec<Settlement>,
    consumers: Vec<(String, DeliverySender)>,
    consumer_tags: Vec<String>,
    cancelled: Vec<String>,
    next_consumer: usize,
    prefetch: Option<u16>,
    fail_cancel: bool,
    close_count: usize,
    topology: Option<Topology>,
    current: Option<Arc<Link>>,
}

struct Inner {
    refusals: AtomicUsize,
    setup_failures: AtomicUsize,
    dials: AtomicUsize,
    settled: watch::Sender<usize>,
    state: Mutex<MockState>,
}

/// Liveness of one mock session.
struct Link {
    open: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Link {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            open: AtomicBool::new(true),
            closed,
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn sever(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.send_replace(true);
    }
}

/// In-memory broker. Clones share state.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                refusals: AtomicUsize::new(0),
                setup_failures: AtomicUsize::new(0),
                dials: AtomicUsize::new(0),
                settled,
                state: Mutex::new(MockState::default()),
            }),
        }
    }

    /// Fail the next `count` dials.
    pub fn refuse_dials(&self, count: usize) {
        self.inner.refusals.store(count, Ordering::SeqCst);
    }

    /// Accept the next `count` dials but fail declaring the topology.
    pub fn fail_setup(&self, count: usize) {
        self.inner.setup_failures.store(count, Ordering::SeqCst);
    }

    /// Dial attempts so far, refused ones included.
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Queue confirmations for upcoming publishes. Unscripted publishes are acked.
    pub async fn script_confirms(&self, confirms: impl IntoIterator<Item = MockConfirm>) {
        self.inner.state.lock().await.confirms.extend(confirms);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state.lock().await.published.clone()
    }

    pub async fn published_count(&self) -> usize {
        self.inner.state.lock().await.published.len()
    }

    /// Terminal actions in the order workers applied them.
    pub async fn settlements(&self) -> Vec<Settlement> {
        self.inner.state.lock().await.settlements.clone()
    }

    /// Suspend until at least `count` deliveries have been settled.
    pub async fn wait_settled(&self, count: usize) {
        let mut settled = self.inner.settled.subscribe();
        let _ = settled.wait_for(|n| *n >= count).await;
    }

    /// Every consumer tag ever registered, in order.
    pub async fn consumer_tags(&self) -> Vec<String> {
        self.inner.state.lock().await.consumer_tags.clone()
    }

    /// Consumers currently registered on the live session.
    pub async fn active_consumers(&self) -> usize {
        self.inner.state.lock().await.consumers.len()
    }

    pub async fn cancelled(&self) -> Vec<String> {
        self.inner.state.lock().await.cancelled.clone()
    }

    pub async fn prefetch(&self) -> Option<u16> {
        self.inner.state.lock().await.prefetch
    }

    /// Make consumer cancellation fail.
    pub async fn fail_cancel(&self, fail: bool) {
        self.inner.state.lock().await.fail_cancel = fail;
    }

    /// Graceful session closes so far.
    pub async fn close_count(&self) -> usize {
        self.inner.state.lock().await.close_count
    }

    pub async fn declared_topology(&self) -> Option<Topology> {
        self.inner.state.lock().await.topology.clone()
    }

    /// Hand one message to the next registered consumer, round-robin.
    ///
    /// Returns `false` when no consumer is registered.
    pub async fn deliver(&self, routing_key: &str, body: impl Into<Vec<u8>>) -> bool {
        let body = body.into();
        let mut state = self.inner.state.lock().await;
        if state.consumers.is_empty() {
            return false;
        }
        let index = state.next_consumer % state.consumers.len();
        state.next_consumer = state.next_consumer.wrapping_add(1);

        let acker = MockAcker {
            inner: self.inner.clone(),
        };
        let message = InboundMessage::new(
            Some(super::JSON_CONTENT_TYPE.to_string()),
            routing_key,
            body,
            Box::new(acker),
        );
        state.consumers[index].1.send(Ok(message)).is_ok()
    }

    /// Push a delivery error into every registered consumer's stream.
    ///
    /// Returns how many consumers received it.
    pub async fn fail_deliveries(&self) -> usize {
        let state = self.inner.state.lock().await;
        let mut failed = 0;
        for (tag, tx) in &state.consumers {
            let error = BrokerError::Consume(format!("Mock broker failed delivery to {tag}"));
            if tx.send(Err(error)).is_ok() {
                failed += 1;
            }
        }
        failed
    }

    /// Cancel every consumer from the broker side, as when the queue is
    /// deleted. The channel and connection stay open.
    pub async fn end_deliveries(&self) {
        self.inner.state.lock().await.consumers.clear();
    }

    /// Simulate the broker dropping the connection.
    ///
    /// Delivery streams end, pending confirmations fail and the session's
    /// close notification fires.
    pub async fn drop_connection(&self) {
        let mut state = self.inner.state.lock().await;
        state.consumers.clear();
        state.unconfirmed.clear();
        if let Some(link) = state.current.take() {
            link.sever();
        }
    }
}

#[async_trait]
impl Dialer for MockBroker {
    async fn dial(&self, _url: &str, topology: &Topology) -> Result<Arc<dyn Session>> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .inner
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::Connection(
                "Mock broker refused connection".to_string(),
            ));
        }
        let rejected = self
            .inner
            .setup_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BrokerError::Setup(format!(
                "Mock broker rejected declaration of exchange {}",
                topology.exchange
            )));
        }

        let link = Arc::new(Link::new());
        let mut state = self.inner.state.lock().await;
        state.topology = Some(topology.clone());
        state.current = Some(link.clone());

        Ok(Arc::new(MockSession {
            inner: self.inner.clone(),
            link,
        }))
    }
}

/// One mock connection plus channel.
pub struct MockSession {
    inner: Arc<Inner>,
    link: Arc<Link>,
}

impl MockSession {
    fn ensure_open(&self) -> Result<()> {
        if self.link.is_open() {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<PendingConfirm> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            content_type: content_type.to_string(),
            body: body.to_vec(),
        });

        match state.confirms.pop_front().unwrap_or(MockConfirm::Ack) {
            MockConfirm::Ack => Ok(future::ready(Ok(true)).boxed()),
            MockConfirm::Nack => Ok(future::ready(Ok(false)).boxed()),
            MockConfirm::Silent => {
                let (tx, rx) = oneshot::channel();
                state.unconfirmed.push(tx);
                Ok(rx.map(|confirm| confirm.map_err(|_| BrokerError::Disconnected)).boxed())
            }
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<()> {
        self.ensure_open()?;
        self.inner.state.lock().await.prefetch = Some(prefetch);
        Ok(())
    }

    async fn consume(&self, _queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()
            .map_err(|_| BrokerError::Consume("channel closed".to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().await;
        state.consumers.push((consumer_tag.to_string(), tx));
        state.consumer_tags.push(consumer_tag.to_string());
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.fail_cancel {
            return Err(BrokerError::Consume(format!(
                "Mock broker refused to cancel {consumer_tag}"
            )));
        }
        state.consumers.retain(|(tag, _)| tag != consumer_tag);
        state.cancelled.push(consumer_tag.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.close_count += 1;
        if state
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &self.link))
        {
            state.consumers.clear();
            state.current = None;
        }
        self.link.sever();
        Ok(())
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut closed = self.link.closed.subscribe();
        async move {
            let _ = closed.wait_for(|closed| *closed).await;
        }
        .boxed()
    }
}

struct MockAcker {
    inner: Arc<Inner>,
}

impl MockAcker {
    async fn record(&self, settlement: Settlement) -> Result<()> {
        self.inner.state.lock().await.settlements.push(settlement);
        self.inner.settled.send_modify(|n| *n += 1);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MockAcker {
    async fn ack(&self) -> Result<()> {
        self.record(Settlement::Ack).await
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.record(Settlement::Nack { requeue }).await
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.record(Settlement::Reject { requeue }).await
    }
}
