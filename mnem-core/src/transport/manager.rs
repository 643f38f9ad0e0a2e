//! ConnectionManager - endpoint selection, health monitoring, reconnection.
//!
//! Every connect attempt opens a new epoch. State writes and transport
//! installs from an older epoch are discarded, so a slow attempt that
//! finishes after a newer connect or a disconnect cannot clobber state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ConnectOptions, ConnectOutcome, ConnectionStatus, Invocation, ProtocolTransport, Route,
    TransportConnector,
};
use crate::api::CredentialSource;
use crate::config::ConnectionPolicy;
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, with_timeout};
use crate::types::{ConnectionState, Endpoint, EndpointKind};

/// Owns at most one live protocol transport.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    policy: ConnectionPolicy,
    connector: Arc<dyn TransportConnector>,
    credential: CredentialSource,
    state_tx: watch::Sender<ConnectionState>,
    /// Guards epoch bumps together with the state/transport writes they gate
    transition: Mutex<()>,
    epoch: AtomicU64,
    active: Mutex<Option<ActiveTransport>>,
    heartbeat_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
    /// Options and session token of the last foreground connect, reused by reconnects
    last_request: Mutex<Option<(ConnectOptions, CancellationToken)>>,
    reconnect_pending: AtomicBool,
    monitor: Mutex<Option<AbortHandle>>,
    reconnect: Mutex<Option<AbortHandle>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
struct ActiveTransport {
    endpoint: Endpoint,
    transport: Arc<dyn ProtocolTransport>,
    /// Serializes request/response pairs and heartbeats on one channel
    io_lock: Arc<tokio::sync::Mutex<()>>,
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    Reconnect,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ConnectionManager {
    pub fn new(
        policy: ConnectionPolicy,
        connector: Arc<dyn TransportConnector>,
        credential: CredentialSource,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                policy,
                connector,
                credential,
                state_tx,
                transition: Mutex::new(()),
                epoch: AtomicU64::new(0),
                active: Mutex::new(None),
                heartbeat_failures: AtomicU32::new(0),
                last_error: Mutex::new(None),
                last_request: Mutex::new(None),
                reconnect_pending: AtomicBool::new(false),
                monitor: Mutex::new(None),
                reconnect: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Establish a transport, trying endpoints in preference order.
    ///
    /// Each endpoint gets up to `max_attempts_per_endpoint` attempts with
    /// backoff. An auth rejection aborts the whole sequence. When every
    /// endpoint is exhausted the state becomes `Failed` and, if allowed, the
    /// outcome tells the caller to use the direct API instead.
    ///
    /// `cancel` is the session token; cancelling it aborts the attempt and
    /// any reconnection scheduled on its behalf.
    pub async fn connect(
        &self,
        options: ConnectOptions,
        cancel: CancellationToken,
    ) -> Result<ConnectOutcome> {
        self.inner.connect_with(options, cancel, Origin::Caller).await
    }

    /// Resolve where the next foreground request should go.
    ///
    /// Waits (bounded by the connect timeout) for an in-flight connect or a
    /// scheduled reconnection to settle.
    pub async fn route(&self) -> Result<Route> {
        Ok(match self.inner.resolve().await? {
            Some(active) => Route::Transport {
                endpoint: active.endpoint,
                transport: active.transport,
            },
            None => Route::DirectApi,
        })
    }

    /// Send one request over the transport and wait for its reply, or hand
    /// the request back for the direct API when no transport is available.
    pub async fn invoke(&self, request: serde_json::Value) -> Result<Invocation> {
        let Some(active) = self.inner.resolve().await? else {
            debug!("No transport, routing request to direct API");
            return Ok(Invocation::DirectApi(request));
        };

        let _io = active.io_lock.lock().await;
        let reply = with_timeout(self.inner.policy.connect_timeout, "invoke", async {
            active.transport.send(request).await?;
            active.transport.receive().await
        })
        .await?;
        Ok(Invocation::Response(reply))
    }

    /// Close the transport and stop background tasks. The manager can connect again.
    pub async fn disconnect(&self) {
        self.inner.stop_monitor();
        self.inner.stop_reconnect();
        self.inner.begin_epoch(ConnectionState::Disconnected);
        self.inner.release_active().await;
        info!("Disconnected");
    }

    /// Permanent teardown. Later connects return `Error::Cancelled`.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.disconnect().await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state(),
            endpoint: lock(&self.inner.active)
                .as_ref()
                .map(|active| active.endpoint.clone()),
            consecutive_heartbeat_failures: self.inner.heartbeat_failures.load(Ordering::SeqCst),
            last_error: lock(&self.inner.last_error).clone(),
        }
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.inner.policy
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.inner.stop_monitor();
        self.inner.stop_reconnect();
    }
}

impl Inner {
    async fn connect_with(
        self: &Arc<Self>,
        options: ConnectOptions,
        cancel: CancellationToken,
        origin: Origin,
    ) -> Result<ConnectOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.stop_monitor();
        match origin {
            Origin::Caller => self.stop_reconnect(),
            Origin::Reconnect => {
                lock(&self.reconnect).take();
            }
        }

        let epoch = self.begin_epoch(ConnectionState::Connecting);
        self.release_active().await;
        self.heartbeat_failures.store(0, Ordering::SeqCst);
        *lock(&self.last_request) = Some((options, cancel.clone()));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
            result = self.try_endpoints(epoch, options) => result,
        };

        if matches!(result, Err(Error::Cancelled)) {
            info!("Connection attempt cancelled");
            self.advance(epoch, ConnectionState::Disconnected);
        }
        if origin == Origin::Reconnect {
            self.reconnect_pending.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn try_endpoints(
        self: &Arc<Self>,
        epoch: u64,
        options: ConnectOptions,
    ) -> Result<ConnectOutcome> {
        let credential = self.credential.get();
        let mut last_error: Option<Error> = None;

        for endpoint in self.ordered_endpoints(options.prefer_remote) {
            info!(endpoint = %endpoint.uri, kind = %endpoint.kind, "Connecting to protocol endpoint");

            let connect_timeout = self.policy.connect_timeout;
            let result = retry_with_backoff(
                &self.policy.backoff,
                self.policy.max_attempts_per_endpoint,
                &self.shutdown,
                |attempt| {
                    let connector = Arc::clone(&self.connector);
                    let endpoint = endpoint.clone();
                    let credential = credential.clone();
                    async move {
                        debug!(attempt, endpoint = %endpoint.uri, "Connect attempt");
                        with_timeout(
                            connect_timeout,
                            "connect",
                            connector.connect(&endpoint, credential.as_deref()),
                        )
                        .await
                    }
                },
            )
            .await;

            match result {
                Ok(transport) => return self.install(epoch, endpoint, transport).await,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.is_auth() => {
                    warn!(endpoint = %endpoint.uri, error = %e, "Endpoint rejected credential");
                    self.record_error(&e);
                    self.advance(epoch, ConnectionState::Failed);
                    return Err(e);
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.uri, error = %e, "Endpoint exhausted");
                    self.record_error(&e);
                    last_error = Some(e);
                }
            }
        }

        self.advance(epoch, ConnectionState::Failed);

        if self.policy.allow_direct_api {
            info!("No protocol endpoint reachable, falling back to direct API");
            return Ok(ConnectOutcome {
                mode: EndpointKind::Remote,
                transport_active: false,
                endpoint: None,
            });
        }

        Err(Error::Network(match last_error {
            Some(e) => format!("All protocol endpoints exhausted: {}", e),
            None => "No protocol endpoints configured".into(),
        }))
    }

    /// Publish a freshly connected transport unless a newer epoch started.
    async fn install(
        self: &Arc<Self>,
        epoch: u64,
        endpoint: Endpoint,
        transport: Arc<dyn ProtocolTransport>,
    ) -> Result<ConnectOutcome> {
        let installed = {
            let _guard = lock(&self.transition);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                *lock(&self.active) = Some(ActiveTransport {
                    endpoint: endpoint.clone(),
                    transport: Arc::clone(&transport),
                    io_lock: Arc::new(tokio::sync::Mutex::new(())),
                    epoch,
                });
                self.state_tx.send_replace(ConnectionState::Connected);
                true
            } else {
                false
            }
        };

        if !installed {
            debug!(endpoint = %endpoint.uri, "Discarding transport from superseded attempt");
            let _ = transport.close().await;
            return Err(Error::Cancelled);
        }

        *lock(&self.last_error) = None;
        info!(endpoint = %endpoint.uri, kind = %endpoint.kind, "Connected");
        self.start_monitor(epoch);

        Ok(ConnectOutcome {
            mode: endpoint.kind,
            transport_active: true,
            endpoint: Some(endpoint.uri),
        })
    }

    fn ordered_endpoints(&self, prefer_remote: bool) -> Vec<Endpoint> {
        let preferred = if prefer_remote {
            EndpointKind::Remote
        } else {
            EndpointKind::Local
        };
        let mut endpoints = self.policy.endpoints.clone();
        endpoints.sort_by_key(|e| (e.kind != preferred, e.priority));
        endpoints
    }

    async fn resolve(&self) -> Result<Option<ActiveTransport>> {
        let mut rx = self.state_tx.subscribe();
        let settled = async {
            loop {
                let state = *rx.borrow_and_update();
                let reconnecting = state == ConnectionState::Disconnected
                    && self.reconnect_pending.load(Ordering::SeqCst);
                if !state.is_pending() && !reconnecting {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return state;
                }
            }
        };

        let state = match tokio::time::timeout(self.policy.connect_timeout, settled).await {
            Ok(state) => state,
            Err(_) => {
                debug!("Connection did not settle in time");
                *self.state_tx.borrow()
            }
        };

        if state.is_usable() {
            if let Some(active) = lock(&self.active).clone() {
                return Ok(Some(active));
            }
        }
        if self.policy.allow_direct_api {
            return Ok(None);
        }
        Err(Error::Network(format!(
            "No protocol transport available (connection {})",
            state
        )))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Heartbeat & reconnection
    // ─────────────────────────────────────────────────────────────────────────

    fn start_monitor(self: &Arc<Self>, epoch: u64) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.heartbeat_loop(epoch).await });
        if let Some(previous) = lock(&self.monitor).replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, epoch: u64) {
        let threshold = self.policy.heartbeat_failure_threshold.max(1);
        let mut ticker = tokio::time::interval(self.policy.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(active) = self.current_active(epoch) else {
                break;
            };

            let probe = {
                let _io = active.io_lock.lock().await;
                with_timeout(
                    self.policy.connect_timeout,
                    "heartbeat",
                    active.transport.heartbeat(),
                )
                .await
            };

            match probe {
                Ok(()) => {
                    let previous = self.heartbeat_failures.swap(0, Ordering::SeqCst);
                    if previous > 0 {
                        info!(endpoint = %active.endpoint.uri, "Heartbeat recovered");
                        self.advance(epoch, ConnectionState::Connected);
                    }
                }
                Err(e) if e.is_auth() => {
                    warn!(endpoint = %active.endpoint.uri, error = %e, "Credential rejected during heartbeat");
                    self.record_error(&e);
                    self.drop_transport(epoch, ConnectionState::Failed).await;
                    break;
                }
                Err(e) => {
                    let failures = self.heartbeat_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    self.record_error(&e);
                    if failures >= threshold {
                        warn!(
                            endpoint = %active.endpoint.uri,
                            failures,
                            error = %e,
                            "Heartbeat failure threshold reached, reconnecting"
                        );
                        // Pending before Disconnected is published, so `route` waits
                        self.reconnect_pending.store(true, Ordering::SeqCst);
                        self.drop_transport(epoch, ConnectionState::Disconnected).await;
                        self.schedule_reconnect(epoch);
                        break;
                    }
                    warn!(endpoint = %active.endpoint.uri, failures, error = %e, "Heartbeat failed");
                    self.advance(epoch, ConnectionState::Degraded);
                }
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, epoch: u64) {
        let Some((options, cancel)) = lock(&self.last_request).clone() else {
            self.reconnect_pending.store(false, Ordering::SeqCst);
            return;
        };
        if cancel.is_cancelled() || self.shutdown.is_cancelled() {
            self.reconnect_pending.store(false, Ordering::SeqCst);
            return;
        }

        let delay = self.policy.backoff.delay(0);
        self.reconnect_pending.store(true, Ordering::SeqCst);
        debug!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => {}
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if inner.epoch.load(Ordering::SeqCst) == epoch {
                        if let Err(e) = inner.connect_with(options, cancel, Origin::Reconnect).await {
                            warn!(error = %e, "Reconnect failed");
                        }
                    }
                }
            }
            inner.reconnect_pending.store(false, Ordering::SeqCst);
        });

        if let Some(previous) = lock(&self.reconnect).replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    fn stop_monitor(&self) {
        if let Some(handle) = lock(&self.monitor).take() {
            handle.abort();
        }
    }

    fn stop_reconnect(&self) {
        if let Some(handle) = lock(&self.reconnect).take() {
            handle.abort();
        }
        self.reconnect_pending.store(false, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a new epoch and publish its first state. Returns the epoch.
    fn begin_epoch(&self, state: ConnectionState) -> u64 {
        let _guard = lock(&self.transition);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.state_tx.send_replace(state);
        epoch
    }

    /// Publish `state` only if `epoch` is still current.
    fn advance(&self, epoch: u64, state: ConnectionState) -> bool {
        let _guard = lock(&self.transition);
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        true
    }

    fn current_active(&self, epoch: u64) -> Option<ActiveTransport> {
        lock(&self.active)
            .as_ref()
            .filter(|active| active.epoch == epoch)
            .cloned()
    }

    /// Remove the epoch's transport, publish `state`, then close the channel.
    async fn drop_transport(&self, epoch: u64, state: ConnectionState) {
        let removed = {
            let _guard = lock(&self.transition);
            if self.epoch.load(Ordering::SeqCst) != epoch {
                None
            } else {
                self.state_tx.send_replace(state);
                lock(&self.active).take()
            }
        };
        if let Some(active) = removed {
            let _ = active.transport.close().await;
        }
    }

    async fn release_active(&self) {
        let previous = lock(&self.active).take();
        if let Some(active) = previous {
            debug!(endpoint = %active.endpoint.uri, "Closing transport");
            if let Err(e) = active.transport.close().await {
                debug!(error = %e, "Transport close failed");
            }
        }
    }

    fn record_error(&self, error: &Error) {
        *lock(&self.last_error) = Some(error.to_string());
    }
}
