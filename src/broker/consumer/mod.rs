//! Consumer Pool.
//!
//! A fixed set of workers, each with its own consumer registration on the
//! inbound queue. Workers are started together by `stream` and joined through
//! a shared completion counter. Cancellation is cooperative: a worker checks
//! for it between messages and never interrupts a handler mid-flight.
//!
//! No ordering is guaranteed across workers, even within one routing key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::connection::ConnectionManager;
use super::processing::handle_delivery;
use super::{raised, BrokerError, DeliveryStream, EventHandler, Result, PREFETCH_PER_WORKER};

/// Worker count when none is configured: available parallelism, floor 1.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1)
}

#[derive(Default)]
struct Registration {
    generation: u64,
    tags: Vec<String>,
}

/// Decrements the completion counter when a worker exits, however it exits.
struct ActiveGuard(Arc<watch::Sender<usize>>);

impl ActiveGuard {
    fn enter(active: &Arc<watch::Sender<usize>>) -> Self {
        active.send_modify(|n| *n += 1);
        Self(active.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub struct ConsumerPool {
    manager: Arc<ConnectionManager>,
    queue: String,
    workers: usize,
    consumer_prefix: String,
    active: Arc<watch::Sender<usize>>,
    stop: watch::Sender<bool>,
    registration: Mutex<Registration>,
}

impl ConsumerPool {
    pub fn new(
        manager: Arc<ConnectionManager>,
        queue: impl Into<String>,
        workers: usize,
        consumer_prefix: impl Into<String>,
    ) -> Self {
        let (active, _) = watch::channel(0);
        let (stop, _) = watch::channel(false);
        Self {
            manager,
            queue: queue.into(),
            workers: workers.max(1),
            consumer_prefix: consumer_prefix.into(),
            active: Arc::new(active),
            stop,
            registration: Mutex::new(Registration::default()),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Workers currently running.
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Consumer tag for the worker at `index`.
    pub fn consumer_tag(&self, index: usize) -> String {
        format!("{}-{}", self.consumer_prefix, index)
    }

    /// Run the worker set until cancelled, stopped or disconnected.
    ///
    /// Waits for the manager to report connected, sets a prefetch of one per
    /// worker, registers every consumer and starts the workers. Returns once
    /// all workers have exited: `Ok` after cancellation or drain,
    /// `Disconnected` if any worker saw its delivery stream end.
    #[tracing::instrument(name = "broker.stream", skip_all, fields(queue = %self.queue, workers = self.workers))]
    pub async fn stream<H: EventHandler>(
        &self,
        handler: Arc<H>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = raised(&mut cancel) => {
                debug!("Cancelled before connecting");
                return Ok(());
            }
            connected = self.manager.wait_connected() => connected?,
        }

        let generation = self.manager.generation();
        let session = self
            .manager
            .current_session()
            .await
            .ok_or(BrokerError::Disconnected)?;

        session.qos(PREFETCH_PER_WORKER).await?;

        let mut tags: Vec<String> = Vec::with_capacity(self.workers);
        let mut streams: Vec<DeliveryStream> = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            let tag = self.consumer_tag(index);
            match session.consume(&self.queue, &tag).await {
                Ok(deliveries) => {
                    tags.push(tag);
                    streams.push(deliveries);
                }
                Err(e) => {
                    error!(consumer = %tag, error = %e, "Failed to register consumer");
                    for registered in &tags {
                        if let Err(e) = session.cancel(registered).await {
                            warn!(consumer = %registered, error = %e, "Failed to cancel consumer");
                        }
                    }
                    return Err(e);
                }
            }
        }

        *self.registration.lock().await = Registration {
            generation,
            tags: tags.clone(),
        };

        let dropped = Arc::new(AtomicBool::new(false));
        for (tag, deliveries) in tags.into_iter().zip(streams) {
            let guard = ActiveGuard::enter(&self.active);
            let worker = Worker {
                tag,
                deliveries,
                handler: handler.clone(),
                cancel: cancel.clone(),
                stop: self.stop.subscribe(),
                dropped: dropped.clone(),
            };
            tokio::spawn(async move {
                let _guard = guard;
                worker.run().await;
            });
        }
        info!("Consumer workers started");

        self.wait_idle().await;

        if dropped.load(Ordering::SeqCst) {
            warn!("Consumer workers stopped after the connection dropped");
            return Err(BrokerError::Disconnected);
        }
        info!("Consumer workers stopped");
        Ok(())
    }

    /// Stop every worker after its current message and wait for all of them.
    pub async fn drain(&self) {
        self.stop.send_replace(true);
        self.wait_idle().await;
    }

    /// Cancel each registered consumer. The first failure aborts the rest.
    ///
    /// Registrations from an earlier session died with its channel and are skipped.
    pub async fn cancel_consumers(&self) -> Result<()> {
        let registration = std::mem::take(&mut *self.registration.lock().await);
        if registration.tags.is_empty() {
            return Ok(());
        }
        if registration.generation != self.manager.generation() {
            debug!("Consumers belong to a previous session, nothing to cancel");
            return Ok(());
        }
        let Some(session) = self.manager.current_session().await else {
            return Ok(());
        };

        for tag in &registration.tags {
            session.cancel(tag).await.map_err(|e| {
                BrokerError::Shutdown(format!("failed to cancel consumer {tag}: {e}"))
            })?;
            debug!(consumer = %tag, "Consumer cancelled");
        }
        Ok(())
    }

    async fn wait_idle(&self) {
        let mut active = self.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;
    }
}

struct Worker<H> {
    tag: String,
    deliveries: DeliveryStream,
    handler: Arc<H>,
    cancel: watch::Receiver<bool>,
    stop: watch::Receiver<bool>,
    dropped: Arc<AtomicBool>,
}

impl<H: EventHandler> Worker<H> {
    async fn run(mut self) {
        debug!(consumer = %self.tag, "Worker started");
        loop {
            tokio::select! {
                biased;
                _ = raised(&mut self.cancel) => {
                    debug!(consumer = %self.tag, "Worker cancelled");
                    return;
                }
                _ = raised(&mut self.stop) => {
                    debug!(consumer = %self.tag, "Worker drained");
                    return;
                }
                next = self.deliveries.next() => match next {
                    Some(Ok(message)) => handle_delivery(self.handler.as_ref(), message).await,
                    Some(Err(e)) => {
                        error!(consumer = %self.tag, error = %e, "Delivery stream failed");
                        self.dropped.store(true, Ordering::SeqCst);
                        return;
                    }
                    None => {
                        warn!(consumer = %self.tag, "Delivery stream closed");
                        self.dropped.store(true, Ordering::SeqCst);
                        return;
                    }
                },
            }
        }
    }
}
