//! Connection Manager.
//!
//! Sole owner of the broker session. Everything else reads the connection
//! state and borrows the current session; only the reconnect loop replaces it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use super::{
    raised, BrokerError, ConnectionState, Dialer, PendingConfirm, Result, Session, Topology,
    JSON_CONTENT_TYPE,
};
use crate::utils::retry::ReconnectPolicy;

/// Owns the physical connection and channel and keeps them alive.
pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    topology: Topology,
    reconnect: ReconnectPolicy,
    session: RwLock<Option<Arc<dyn Session>>>,
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    alive: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ConnectionManager {
    pub fn new(dialer: Arc<dyn Dialer>, topology: Topology, reconnect: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            dialer,
            topology,
            reconnect,
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            state,
            alive: AtomicBool::new(true),
            shutdown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Number of sessions installed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Make one connection attempt: dial, open the channel, declare the topology.
    ///
    /// Installs the new session on success. Failures are logged, never raised.
    pub async fn connect(&self, url: &str) -> bool {
        match self.dialer.dial(url, &self.topology).await {
            Ok(session) => {
                self.install(session).await;
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to broker");
                false
            }
        }
    }

    /// Reconnect loop. Runs until `stop` is called.
    ///
    /// Retries `connect` with the configured backoff, then waits on the
    /// session's close notification and starts over.
    pub async fn maintain(self: Arc<Self>, url: String) {
        let mut shutdown = self.shutdown.subscribe();

        while self.is_alive() {
            self.state.send_replace(ConnectionState::Connecting);
            let started = Instant::now();
            info!(url = %redact_url(&url), "Attempting to connect to broker");

            let mut backoff = self.reconnect.backoff();
            let mut attempt: u32 = 0;
            while !self.connect(&url).await {
                if !self.is_alive() {
                    return;
                }
                attempt += 1;
                let delay = backoff.next().unwrap_or_else(|| self.reconnect.max_delay());
                warn!(
                    attempt,
                    backoff_ms = %delay.as_millis(),
                    "Broker unreachable, retrying after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = raised(&mut shutdown) => return,
                }
            }

            if !self.is_alive() {
                // Lost the race with `stop`: nobody will close this session.
                if let Err(e) = self.close_session().await {
                    warn!(error = %e, "Failed to close session opened during shutdown");
                }
                return;
            }

            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                generation = self.generation(),
                "Connected to broker"
            );

            let Some(closed) = self.current_session().await.map(|s| s.closed()) else {
                continue;
            };

            tokio::select! {
                _ = closed => {
                    warn!("Broker connection closed, reconnecting");
                    self.state.send_replace(ConnectionState::Connecting);
                    let stale = self.session.write().await.take();
                    // A channel-level close leaves the connection itself open.
                    if let Some(session) = stale {
                        if let Err(e) = session.close().await {
                            warn!(error = %e, "Failed to close dropped session");
                        }
                    }
                }
                _ = raised(&mut shutdown) => return,
            }
        }
    }

    /// Suspend until connected. Fails with `Closed` once the manager is stopped.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            _ = raised(&mut shutdown) => Err(BrokerError::Closed),
            reached = reached(&mut state, ConnectionState::Connected) => {
                if reached {
                    Ok(())
                } else {
                    Err(BrokerError::Closed)
                }
            }
        }
    }

    /// Suspend until a session newer than `since` is installed and connected.
    pub async fn wait_reconnected(&self, since: u64) -> Result<()> {
        let mut state = self.state.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if !self.is_alive() {
                return Err(BrokerError::Closed);
            }
            if self.generation() > since && self.is_connected() {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = raised(&mut shutdown) => return Err(BrokerError::Closed),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(BrokerError::Closed);
                    }
                }
            }
        }
    }

    /// Fire-and-forget send on the current session. No delivery guarantee.
    pub(crate) async fn send(&self, routing_key: &str, body: &[u8]) -> Result<PendingConfirm> {
        if !self.is_connected() {
            return Err(BrokerError::Disconnected);
        }
        let session = self
            .current_session()
            .await
            .ok_or(BrokerError::Disconnected)?;
        session
            .publish(&self.topology.exchange, routing_key, JSON_CONTENT_TYPE, body)
            .await
    }

    /// Borrow the current session for issuing calls.
    pub(crate) async fn current_session(&self) -> Option<Arc<dyn Session>> {
        self.session.read().await.clone()
    }

    /// Stop the reconnect loop. Idempotent.
    pub(crate) fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    /// Close the channel and connection and mark the manager disconnected.
    pub(crate) async fn close_session(&self) -> Result<()> {
        let session = self.session.write().await.take();
        self.state.send_replace(ConnectionState::Disconnected);
        match session {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    async fn install(&self, session: Arc<dyn Session>) {
        *self.session.write().await = Some(session);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Connected);
    }
}

/// Resolves with `true` once `state` reaches `target`, `false` if the sender is gone.
async fn reached(state: &mut watch::Receiver<ConnectionState>, target: ConnectionState) -> bool {
    state.wait_for(|s| *s == target).await.is_ok()
}

/// Strip credentials from a broker URL before logging it.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
