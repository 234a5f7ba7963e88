//! Load-balanced requester for one logical service.
//!
//! Owns every connection to the instances of a service and keeps the pool in step with
//! discovery:
//!
//! ```text
//!  discovery ──► refresh queue (single worker, in order)
//!                    │ diff vs last known set
//!                    ├─ new uri ─► connect task ─► health check ─► publish (copy-on-write swap)
//!                    └─ gone uri ─► grace delay ─► remove ─► dispose
//!
//!  session closed / probe failed ─► unhealthy ─► reconnect campaign (N × interval)
//!  health timer ─► probe all active          sweep timer ─► one attempt per unhealthy uri
//! ```
//!
//! Calls take one snapshot of the active map, pick a connection through the
//! [`LoadBalancer`], and are retried once on another connection after a
//! connection-class failure.

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures::{
    future::{join_all, BoxFuture},
    stream, FutureExt, StreamExt, TryStreamExt,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use super::{
    load_balancer::{LoadBalanceKind, LoadBalanceStrategy, LoadBalancer, SelectionHint},
    UpstreamConnection, UpstreamError,
};
use crate::{
    protocol::ServicesExposed,
    service::ServiceRegistry,
    transport::{Payload, PayloadStream, Transport},
};

/// Timers and limits of the requester state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequesterConfig {
    /// Default per-call timeout when the caller supplies none.
    pub call_timeout: Duration,
    /// Delay before dropping a URI discovery no longer reports, for pure consumers.
    pub consumer_grace_delay: Duration,
    /// Same, when this process also exposes services.
    pub provider_grace_delay: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    /// Probe period; also the timeout of probes and connection attempts.
    pub health_check_interval: Duration,
    pub unhealthy_sweep_interval: Duration,
    /// Upper bound a call waits for the very first address update to complete.
    pub initial_connect_timeout: Duration,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(3),
            consumer_grace_delay: Duration::from_secs(15),
            provider_grace_delay: Duration::from_secs(45),
            reconnect_attempts: 12,
            reconnect_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(15),
            unhealthy_sweep_interval: Duration::from_secs(300),
            initial_connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Shared dependencies for every requester a manager creates.
#[derive(Clone)]
pub struct RequesterContext {
    pub transport: Arc<dyn Transport>,
    pub config: RequesterConfig,
    pub load_balance: LoadBalanceKind,
    /// Local services, re-announced to every (re)connected peer.
    pub registry: Option<Arc<ServiceRegistry>>,
    pub instance_id: Arc<str>,
}

impl RequesterContext {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: RequesterConfig::default(),
            load_balance: LoadBalanceKind::default(),
            registry: None,
            instance_id: Arc::from(uuid::Uuid::new_v4().to_string()),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: RequesterConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_load_balance(mut self, kind: LoadBalanceKind) -> Self {
        self.load_balance = kind;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<Arc<str>>) -> Self {
        self.instance_id = instance_id.into();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub hint: SelectionHint,
    /// Overrides [`RequesterConfig::call_timeout`].
    pub timeout: Option<Duration>,
}

impl CallOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_hint(mut self, hint: SelectionHint) -> Self {
        self.hint = hint;
        self
    }
}

/// Per-connection result of a fan-out.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, UpstreamError)>,
}

impl BroadcastOutcome {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Point-in-time view of a requester, for logs and status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RequesterStats {
    pub service: String,
    pub strategy: &'static str,
    pub active: Vec<String>,
    pub unhealthy: Vec<String>,
    pub reconnecting: Vec<String>,
    pub connecting: Vec<String>,
    pub last_known: Vec<String>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub disposed: bool,
}

struct RefreshCommand {
    uris: BTreeSet<String>,
    done: oneshot::Sender<()>,
}

type ConnectionMap = BTreeMap<String, Arc<UpstreamConnection>>;

struct RequesterInner {
    service: String,
    config: RequesterConfig,
    transport: Arc<dyn Transport>,
    balancer: LoadBalancer,
    registry: Option<Arc<ServiceRegistry>>,
    instance_id: Arc<str>,

    active: ArcSwap<ConnectionMap>,
    unhealthy: DashSet<String>,
    reconnecting: DashSet<String>,
    /// New URIs whose first connection attempt is still running.
    connecting: DashSet<String>,
    last_known: ArcSwap<BTreeSet<String>>,
    removal_epochs: DashMap<String, u64>,
    removal_counter: AtomicU64,

    last_refresh_ms: AtomicI64,
    last_health_check_ms: AtomicI64,
    initialized: watch::Sender<bool>,
    refresh_tx: mpsc::UnboundedSender<RefreshCommand>,

    shutdown: CancellationToken,
    tasks: TaskTracker,
    disposed: AtomicBool,
}

/// Connection pool plus failover for one service. Cheap to clone.
#[derive(Clone)]
pub struct LoadBalancedRequester {
    inner: Arc<RequesterInner>,
}

impl LoadBalancedRequester {
    /// Creates a requester using the context's strategy kind.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime; background tasks start immediately.
    pub fn new(service: impl Into<String>, context: &RequesterContext) -> Self {
        Self::with_strategy(service, context, context.load_balance.build())
    }

    /// Creates a requester with an explicit strategy instance.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime.
    pub fn with_strategy(
        service: impl Into<String>,
        context: &RequesterContext,
        strategy: Arc<dyn LoadBalanceStrategy>,
    ) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let (initialized, _) = watch::channel(false);
        let inner = Arc::new(RequesterInner {
            service: service.into(),
            config: context.config.clone(),
            transport: context.transport.clone(),
            balancer: LoadBalancer::new(strategy),
            registry: context.registry.clone(),
            instance_id: context.instance_id.clone(),
            active: ArcSwap::from_pointee(BTreeMap::new()),
            unhealthy: DashSet::new(),
            reconnecting: DashSet::new(),
            connecting: DashSet::new(),
            last_known: ArcSwap::from_pointee(BTreeSet::new()),
            removal_epochs: DashMap::new(),
            removal_counter: AtomicU64::new(0),
            last_refresh_ms: AtomicI64::new(0),
            last_health_check_ms: AtomicI64::new(0),
            initialized,
            refresh_tx,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            disposed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.tasks.spawn(run_reconciler(weak.clone(), refresh_rx, inner.shutdown.clone()));
        inner.tasks.spawn(run_timer(
            weak.clone(),
            inner.shutdown.clone(),
            inner.config.health_check_interval,
            |inner| {
                async move {
                    inner.probe_active().await;
                }
                .boxed()
            },
        ));
        inner.tasks.spawn(run_timer(
            weak,
            inner.shutdown.clone(),
            inner.config.unhealthy_sweep_interval,
            |inner| {
                async move {
                    inner.sweep_unhealthy();
                }
                .boxed()
            },
        ));

        debug!(service = %inner.service, strategy = inner.balancer.strategy().name(), "requester created");
        Self { inner }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn config(&self) -> &RequesterConfig {
        &self.inner.config
    }

    /// Applies a new address set and waits until it has been reconciled.
    ///
    /// An identical set (in any order) is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Disposed`] once the requester has been disposed.
    pub async fn refresh_uris<I, S>(&self, uris: I) -> Result<(), UpstreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let done = self.enqueue(uris)?;
        done.await.map_err(|_| self.inner.disposed_error())
    }

    /// Queues an address set without waiting for it to be applied.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Disposed`] once the requester has been disposed.
    pub fn submit_uris<I, S>(&self, uris: I) -> Result<(), UpstreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enqueue(uris).map(drop)
    }

    fn enqueue<I, S>(&self, uris: I) -> Result<oneshot::Receiver<()>, UpstreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.inner.is_disposed() {
            return Err(self.inner.disposed_error());
        }
        let (done, rx) = oneshot::channel();
        let uris = uris.into_iter().map(Into::into).collect();
        self.inner
            .refresh_tx
            .send(RefreshCommand { uris, done })
            .map_err(|_| self.inner.disposed_error())?;
        Ok(rx)
    }

    pub async fn request_response(
        &self,
        payload: Payload,
        options: &CallOptions,
    ) -> Result<Payload, UpstreamError> {
        self.invoke(options, |conn| {
            let payload = payload.clone();
            async move { conn.request_response(payload).await }
        })
        .await
    }

    pub async fn fire_and_forget(&self, payload: Payload, options: &CallOptions) -> Result<(), UpstreamError> {
        self.invoke(options, |conn| {
            let payload = payload.clone();
            async move { conn.fire_and_forget(payload).await }
        })
        .await
    }

    /// Pushes metadata to one selected connection.
    pub async fn metadata_push(&self, metadata: Bytes, options: &CallOptions) -> Result<(), UpstreamError> {
        self.invoke(options, |conn| {
            let metadata = metadata.clone();
            async move { conn.metadata_push(metadata).await }
        })
        .await
    }

    /// Opens a response stream. A connection-class failure before the first item is
    /// retried once; later failures end the stream with the error.
    pub fn request_stream(&self, payload: Payload, options: CallOptions) -> PayloadStream {
        let inner = self.inner.clone();
        stream::once(async move { inner.open_stream(payload, options).await }).try_flatten().boxed()
    }

    /// Opens a bidirectional exchange. Retried once only if the failed attempt never
    /// started consuming `outbound`.
    pub fn request_channel(&self, initial: Payload, outbound: PayloadStream, options: CallOptions) -> PayloadStream {
        let inner = self.inner.clone();
        stream::once(async move { inner.open_channel(initial, outbound, options).await })
            .try_flatten()
            .boxed()
    }

    /// Sends `payload` to every active connection concurrently.
    ///
    /// # Errors
    ///
    /// Only fails when the requester is disposed; per-connection failures are reported
    /// in the outcome.
    pub async fn broadcast_fire_and_forget(&self, payload: Payload) -> Result<BroadcastOutcome, UpstreamError> {
        self.inner
            .broadcast(|conn| {
                let payload = payload.clone();
                async move { conn.fire_and_forget(payload).await }
            })
            .await
    }

    pub async fn broadcast_metadata_push(&self, metadata: Bytes) -> Result<BroadcastOutcome, UpstreamError> {
        self.inner
            .broadcast(|conn| {
                let metadata = metadata.clone();
                async move { conn.metadata_push(metadata).await }
            })
            .await
    }

    /// Probes every active connection now. Returns the number that failed.
    pub async fn check_health(&self) -> usize {
        self.inner.probe_active().await
    }

    /// Starts one reconnect attempt per idle unhealthy URI. Returns how many started.
    pub fn sweep_unhealthy(&self) -> usize {
        self.inner.sweep_unhealthy()
    }

    pub fn active_uris(&self) -> Vec<String> {
        self.inner.active.load().keys().cloned().collect()
    }

    pub fn unhealthy_uris(&self) -> Vec<String> {
        sorted(self.inner.unhealthy.iter().map(|uri| uri.key().clone()))
    }

    pub fn last_known_uris(&self) -> Vec<String> {
        self.inner.last_known.load().iter().cloned().collect()
    }

    pub fn connection(&self, uri: &str) -> Option<Arc<UpstreamConnection>> {
        self.inner.active.load().get(uri).cloned()
    }

    pub fn has_available_connections(&self) -> bool {
        self.inner.active.load().values().any(|conn| conn.is_available())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn stats(&self) -> RequesterStats {
        let inner = &self.inner;
        RequesterStats {
            service: inner.service.clone(),
            strategy: inner.balancer.strategy().name(),
            active: self.active_uris(),
            unhealthy: self.unhealthy_uris(),
            reconnecting: sorted(inner.reconnecting.iter().map(|uri| uri.key().clone())),
            connecting: sorted(inner.connecting.iter().map(|uri| uri.key().clone())),
            last_known: self.last_known_uris(),
            last_refresh: timestamp(&inner.last_refresh_ms),
            last_health_check: timestamp(&inner.last_health_check_ms),
            disposed: inner.is_disposed(),
        }
    }

    /// Stops the refresh queue, cancels timers and campaigns, and disposes every
    /// connection. Later calls fail fast with [`UpstreamError::Disposed`].
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Waits until every background task has finished after [`Self::dispose`].
    pub async fn wait_for_shutdown(&self) {
        self.inner.tasks.wait().await;
    }

    async fn invoke<T, F, Fut>(&self, options: &CallOptions, op: F) -> Result<T, UpstreamError>
    where
        F: Fn(Arc<UpstreamConnection>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let inner = &self.inner;
        let first = inner.select(&options.hint).await?;
        match inner.call_once(&first, options, op(first.clone())).await {
            Err(e) if e.is_retryable() => {
                let retry = inner.select(&options.hint).await?;
                debug!(
                    service = %inner.service,
                    failed = %first.uri(),
                    retry = %retry.uri(),
                    error = %e,
                    "retrying call on another connection"
                );
                inner.call_once(&retry, options, op(retry.clone())).await
            }
            other => other,
        }
    }
}

fn sorted(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut items: Vec<_> = items.collect();
    items.sort();
    items
}

fn timestamp(cell: &AtomicI64) -> Option<DateTime<Utc>> {
    match cell.load(Ordering::Acquire) {
        0 => None,
        millis => DateTime::from_timestamp_millis(millis),
    }
}

/// Outbound stream of a channel, handed to at most one attempt.
///
/// The attempt's view takes the real stream on its first poll; until then a failed
/// attempt leaves it in place for the retry.
struct SharedOutbound {
    slot: Arc<Mutex<Option<PayloadStream>>>,
    polled: Arc<AtomicBool>,
}

impl SharedOutbound {
    fn new(outbound: PayloadStream) -> Self {
        Self { slot: Arc::new(Mutex::new(Some(outbound))), polled: Arc::new(AtomicBool::new(false)) }
    }

    fn attach(&self) -> PayloadStream {
        let slot = self.slot.clone();
        let polled = self.polled.clone();
        stream::once(async move {
            polled.store(true, Ordering::Release);
            slot.lock().take()
        })
        .filter_map(futures::future::ready)
        .flatten()
        .boxed()
    }

    fn was_polled(&self) -> bool {
        self.polled.load(Ordering::Acquire)
    }
}

async fn run_reconciler(
    weak: Weak<RequesterInner>,
    mut commands: mpsc::UnboundedReceiver<RefreshCommand>,
    shutdown: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        let Some(inner) = weak.upgrade() else { break };
        let pending = inner.reconcile(command.uris);
        inner.finish_update(pending, command.done);
    }
    trace!("refresh queue stopped");
}

async fn run_timer<F>(weak: Weak<RequesterInner>, shutdown: CancellationToken, period: Duration, tick: F)
where
    F: Fn(Arc<RequesterInner>) -> BoxFuture<'static, ()>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else { break };
        tick(inner).await;
    }
}

impl RequesterInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn disposed_error(&self) -> UpstreamError {
        UpstreamError::Disposed(self.service.clone())
    }

    fn touch(cell: &AtomicI64) {
        cell.store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    fn grace_delay(&self) -> Duration {
        let provider = self.registry.as_ref().is_some_and(|registry| registry.has_exposed_services());
        if provider {
            self.config.provider_grace_delay
        } else {
            self.config.consumer_grace_delay
        }
    }

    /// Applies one address set and returns the connect tasks it started. Never waits
    /// on the network, so a slow URI cannot hold up later updates.
    fn reconcile(self: &Arc<Self>, uris: BTreeSet<String>) -> Vec<JoinHandle<()>> {
        if self.is_disposed() {
            return Vec::new();
        }
        let previous = self.last_known.load_full();
        if *previous == uris && *self.initialized.borrow() {
            trace!(service = %self.service, "address set unchanged");
            return Vec::new();
        }

        self.last_known.store(Arc::new(uris.clone()));
        Self::touch(&self.last_refresh_ms);

        let active = self.active.load_full();
        let added: Vec<String> = uris
            .iter()
            .filter(|uri| {
                !active.contains_key(*uri) &&
                    !self.unhealthy.contains(*uri) &&
                    !self.reconnecting.contains(*uri) &&
                    !self.connecting.contains(*uri)
            })
            .cloned()
            .collect();
        let removed: Vec<String> = active.keys().filter(|uri| !uris.contains(*uri)).cloned().collect();
        let forgotten: Vec<String> = self
            .unhealthy
            .iter()
            .filter(|uri| !uris.contains(uri.key()))
            .map(|uri| uri.key().clone())
            .collect();
        for uri in &forgotten {
            self.unhealthy.remove(uri);
        }

        info!(
            service = %self.service,
            total = uris.len(),
            added = added.len(),
            removed = removed.len(),
            "applying address update"
        );

        for uri in removed {
            self.schedule_removal(uri);
        }
        added.into_iter().map(|uri| self.spawn_connect(uri)).collect()
    }

    /// Completes an address update once its connect tasks have settled.
    fn finish_update(self: &Arc<Self>, pending: Vec<JoinHandle<()>>, done: oneshot::Sender<()>) {
        if pending.is_empty() {
            // An earlier update still connecting marks the requester ready itself.
            if self.connecting.is_empty() {
                self.initialized.send_replace(true);
            }
            let _ = done.send(());
            return;
        }
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            join_all(pending).await;
            inner.initialized.send_replace(true);
            let _ = done.send(());
        });
    }

    /// First connection to a newly advertised URI, off the refresh queue.
    fn spawn_connect(self: &Arc<Self>, uri: String) -> JoinHandle<()> {
        self.connecting.insert(uri.clone());
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            let attempt = tokio::select! {
                () = inner.shutdown.cancelled() => None,
                attempt = inner.open_checked(&uri) => Some(attempt),
            };
            inner.connecting.remove(&uri);
            let Some(attempt) = attempt else { return };
            let advertised = inner.last_known.load().contains(&uri);
            match attempt {
                Ok(conn) if advertised => {
                    inner.publish(vec![conn]);
                    // Discovery may have dropped the uri between the check and the swap.
                    if !inner.last_known.load().contains(&uri) {
                        inner.schedule_removal(uri);
                    }
                }
                Ok(conn) => {
                    debug!(service = %inner.service, uri = %uri, "uri dropped while connecting");
                    conn.dispose();
                }
                Err(e) if advertised => {
                    warn!(service = %inner.service, uri = %uri, error = %e, "initial connection failed");
                    inner.unhealthy.insert(uri.clone());
                    inner.spawn_reconnect(uri, inner.config.reconnect_attempts, true);
                }
                Err(e) => {
                    debug!(service = %inner.service, uri = %uri, error = %e, "connect failed after discovery dropped the uri");
                }
            }
        })
    }

    /// Connects and runs one health check; the probe interval bounds both steps.
    async fn open_checked(&self, uri: &str) -> Result<Arc<UpstreamConnection>, UpstreamError> {
        let limit = self.config.health_check_interval;
        let session = match tokio::time::timeout(limit, self.transport.connect(uri)).await {
            Ok(session) => session?,
            Err(_) => {
                return Err(UpstreamError::ConnectionFailed(format!(
                    "connecting to {uri} took longer than {limit:?}"
                )))
            }
        };
        let conn = Arc::new(UpstreamConnection::new(uri, session));
        if let Err(e) = conn.health_check(limit).await {
            conn.dispose();
            return Err(e);
        }
        Ok(conn)
    }

    /// Installs connections in one swap. A URI that is already active keeps its
    /// existing session and the newcomer is disposed.
    fn publish(self: &Arc<Self>, connections: Vec<Arc<UpstreamConnection>>) {
        if connections.is_empty() {
            return;
        }
        if self.is_disposed() {
            for conn in connections {
                conn.dispose();
            }
            return;
        }

        let mut admitted = Vec::new();
        let mut duplicates = Vec::new();
        self.active.rcu(|current| {
            admitted.clear();
            duplicates.clear();
            let mut next = ConnectionMap::clone(current);
            for conn in &connections {
                if next.contains_key(conn.uri()) {
                    duplicates.push(conn.clone());
                } else {
                    next.insert(conn.uri().to_string(), conn.clone());
                    admitted.push(conn.clone());
                }
            }
            next
        });

        for conn in duplicates {
            debug!(service = %self.service, uri = %conn.uri(), "uri already active, dropping new session");
            conn.dispose();
        }
        if self.is_disposed() {
            self.dispose_active();
            return;
        }
        for conn in admitted {
            self.unhealthy.remove(conn.uri());
            debug!(service = %self.service, uri = %conn.uri(), "connection admitted");
            self.watch_connection(conn.clone());
            self.announce_services(conn);
        }
    }

    /// Removes `uri` from the active map, only if it still maps to `expected` when given.
    fn remove_connection(
        &self,
        uri: &str,
        expected: Option<&Arc<UpstreamConnection>>,
    ) -> Option<Arc<UpstreamConnection>> {
        let matches = |map: &ConnectionMap| {
            map.get(uri).is_some_and(|current| expected.map_or(true, |e| Arc::ptr_eq(e, current)))
        };
        if !matches(self.active.load().as_ref()) {
            return None;
        }
        let mut removed = None;
        self.active.rcu(|current| {
            removed = None;
            let mut next = ConnectionMap::clone(current);
            if matches(current.as_ref()) {
                removed = next.remove(uri);
            }
            next
        });
        removed
    }

    fn on_connection_failure(self: &Arc<Self>, conn: &Arc<UpstreamConnection>, reason: &UpstreamError) {
        let removed = self.remove_connection(conn.uri(), Some(conn)).is_some();
        conn.dispose();
        if !removed || self.is_disposed() {
            return;
        }
        self.balancer.forget(conn.uri());
        if !self.last_known.load().contains(conn.uri()) {
            debug!(service = %self.service, uri = %conn.uri(), "connection closed after discovery dropped it");
            return;
        }
        warn!(service = %self.service, uri = %conn.uri(), error = %reason, "connection lost, scheduling reconnect");
        self.unhealthy.insert(conn.uri().to_string());
        self.spawn_reconnect(conn.uri().to_string(), self.config.reconnect_attempts, true);
    }

    /// A session that ended for a reason other than a connection failure is dropped
    /// without a campaign; the sweep gives it another try while discovery still lists it.
    fn on_session_ended(&self, conn: &Arc<UpstreamConnection>, reason: &UpstreamError) {
        let removed = self.remove_connection(conn.uri(), Some(conn)).is_some();
        conn.dispose();
        if !removed || self.is_disposed() {
            return;
        }
        self.balancer.forget(conn.uri());
        if self.last_known.load().contains(conn.uri()) {
            info!(service = %self.service, uri = %conn.uri(), reason = %reason, "session ended, left for the sweep");
            self.unhealthy.insert(conn.uri().to_string());
        }
    }

    fn watch_connection(self: &Arc<Self>, conn: Arc<UpstreamConnection>) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let reason = tokio::select! {
                () = shutdown.cancelled() => return,
                reason = conn.closed() => reason,
            };
            let Some(inner) = weak.upgrade() else { return };
            if reason.is_connection_error() {
                inner.on_connection_failure(&conn, &reason);
            } else {
                inner.on_session_ended(&conn, &reason);
            }
        });
    }

    fn announce_services(self: &Arc<Self>, conn: Arc<UpstreamConnection>) {
        let Some(registry) = &self.registry else { return };
        let services = registry.exposed_services();
        if services.is_empty() {
            return;
        }
        let event = ServicesExposed { instance_id: self.instance_id.to_string(), services };
        let metadata = match event.encode() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(service = %self.service, error = %e, "failed to encode service exposure");
                return;
            }
        };
        self.tasks.spawn(async move {
            if let Err(e) = conn.metadata_push(metadata).await {
                debug!(uri = %conn.uri(), error = %e, "service exposure push failed");
            }
        });
    }

    /// At most one campaign per URI runs at a time.
    fn spawn_reconnect(self: &Arc<Self>, uri: String, attempts: u32, delay_first: bool) {
        if attempts == 0 || self.is_disposed() {
            return;
        }
        if !self.reconnecting.insert(uri.clone()) {
            trace!(service = %self.service, uri = %uri, "reconnect already in progress");
            return;
        }
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            if !inner.run_reconnect(&uri, attempts, delay_first).await {
                inner.reconnecting.remove(&uri);
            }
        });
    }

    /// Returns `true` if the campaign already released its `reconnecting` marker.
    async fn run_reconnect(self: &Arc<Self>, uri: &str, attempts: u32, delay_first: bool) -> bool {
        for attempt in 1..=attempts {
            if delay_first || attempt > 1 {
                tokio::select! {
                    () = self.shutdown.cancelled() => return false,
                    () = tokio::time::sleep(self.config.reconnect_interval) => {}
                }
            }
            if self.is_disposed() {
                return false;
            }
            if !self.last_known.load().contains(uri) {
                debug!(service = %self.service, uri = %uri, "uri no longer advertised, abandoning reconnect");
                self.unhealthy.remove(uri);
                return false;
            }
            if self.active.load().contains_key(uri) {
                self.unhealthy.remove(uri);
                return false;
            }

            match self.open_checked(uri).await {
                Ok(conn) => {
                    info!(service = %self.service, uri = %uri, attempt, "reconnected");
                    // Released first so a close right after publish can start a new campaign.
                    self.reconnecting.remove(uri);
                    self.publish(vec![conn]);
                    return true;
                }
                Err(e) => {
                    debug!(service = %self.service, uri = %uri, attempt, attempts, error = %e, "reconnect attempt failed");
                }
            }
        }
        warn!(service = %self.service, uri = %uri, attempts, "reconnect attempts exhausted, uri stays unhealthy");
        false
    }

    fn schedule_removal(self: &Arc<Self>, uri: String) {
        let epoch = self.removal_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.removal_epochs.insert(uri.clone(), epoch);
        let grace = self.grace_delay();
        debug!(service = %self.service, uri = %uri, grace = ?grace, "uri dropped by discovery, removal scheduled");

        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(grace) => {}
            }
            let Some(inner) = weak.upgrade() else { return };
            if inner.removal_epochs.remove_if(&uri, |_, current| *current == epoch).is_none() {
                return;
            }
            if inner.last_known.load().contains(&uri) {
                debug!(service = %inner.service, uri = %uri, "uri re-advertised during grace, keeping");
                return;
            }
            if let Some(conn) = inner.remove_connection(&uri, None) {
                inner.balancer.forget(&uri);
                conn.dispose();
                info!(service = %inner.service, uri = %uri, "connection removed after grace delay");
            }
            inner.unhealthy.remove(&uri);
        });
    }

    async fn probe_active(self: &Arc<Self>) -> usize {
        Self::touch(&self.last_health_check_ms);
        let snapshot = self.active.load_full();
        let limit = self.config.health_check_interval;
        let probes = snapshot.values().map(|conn| async move { (conn, conn.health_check(limit).await) });
        let mut failures = 0;
        for (conn, result) in join_all(probes).await {
            if let Err(e) = result {
                failures += 1;
                self.on_connection_failure(conn, &e);
            }
        }
        if failures > 0 {
            debug!(service = %self.service, failures, probed = snapshot.len(), "health probe round finished");
        }
        failures
    }

    fn sweep_unhealthy(self: &Arc<Self>) -> usize {
        let known = self.last_known.load();
        let candidates: Vec<String> = self
            .unhealthy
            .iter()
            .map(|uri| uri.key().clone())
            .filter(|uri| known.contains(uri) && !self.reconnecting.contains(uri))
            .collect();
        for uri in &candidates {
            self.spawn_reconnect(uri.clone(), 1, false);
        }
        if !candidates.is_empty() {
            debug!(service = %self.service, count = candidates.len(), "sweeping unhealthy uris");
        }
        candidates.len()
    }

    async fn await_initial_refresh(&self) {
        if *self.initialized.borrow() {
            return;
        }
        let mut ready = self.initialized.subscribe();
        let waited =
            tokio::time::timeout(self.config.initial_connect_timeout, ready.wait_for(|done| *done)).await;
        if waited.is_err() {
            debug!(service = %self.service, "no address update before the initial wait elapsed");
        }
    }

    async fn select(&self, hint: &SelectionHint) -> Result<Arc<UpstreamConnection>, UpstreamError> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        self.await_initial_refresh().await;
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        let snapshot = self.active.load();
        let candidates: Vec<_> = snapshot.values().filter(|conn| conn.is_available()).cloned().collect();
        self.balancer
            .select(&candidates, hint)
            .ok_or_else(|| UpstreamError::NoAvailableConnection(self.service.clone()))
    }

    /// Runs one attempt under the call timeout and feeds the outcome back to the strategy.
    async fn call_once<T, Fut>(
        self: &Arc<Self>,
        conn: &Arc<UpstreamConnection>,
        options: &CallOptions,
        attempt: Fut,
    ) -> Result<T, UpstreamError>
    where
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let limit = options.timeout.unwrap_or(self.config.call_timeout);
        let started = Instant::now();
        let result = tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| Err(UpstreamError::Timeout));
        match &result {
            Err(e) if e.should_penalize_connection() => {
                self.balancer.record_error(conn.uri());
                if e.is_connection_error() {
                    self.on_connection_failure(conn, e);
                }
            }
            _ => self.balancer.record_success(conn.uri(), started.elapsed()),
        }
        result
    }

    async fn open_stream(self: Arc<Self>, payload: Payload, options: CallOptions) -> Result<PayloadStream, UpstreamError> {
        let first = self.select(&options.hint).await?;
        match self.start_stream(&first, payload.clone(), &options).await {
            Err(e) if e.is_retryable() => {
                let retry = self.select(&options.hint).await?;
                debug!(service = %self.service, failed = %first.uri(), retry = %retry.uri(), error = %e, "retrying stream");
                self.start_stream(&retry, payload, &options).await
            }
            other => other,
        }
    }

    async fn start_stream(
        self: &Arc<Self>,
        conn: &Arc<UpstreamConnection>,
        payload: Payload,
        options: &CallOptions,
    ) -> Result<PayloadStream, UpstreamError> {
        let opened = self.call_once(conn, options, conn.request_stream(payload)).await?;
        self.await_first_item(conn, opened).await
    }

    async fn open_channel(
        self: Arc<Self>,
        initial: Payload,
        outbound: PayloadStream,
        options: CallOptions,
    ) -> Result<PayloadStream, UpstreamError> {
        let outbound = SharedOutbound::new(outbound);
        let first = self.select(&options.hint).await?;
        match self.start_channel(&first, initial.clone(), outbound.attach(), &options).await {
            Err(e) if e.is_retryable() && !outbound.was_polled() => {
                let retry = self.select(&options.hint).await?;
                debug!(service = %self.service, failed = %first.uri(), retry = %retry.uri(), error = %e, "retrying channel");
                self.start_channel(&retry, initial, outbound.attach(), &options).await
            }
            other => other,
        }
    }

    async fn start_channel(
        self: &Arc<Self>,
        conn: &Arc<UpstreamConnection>,
        initial: Payload,
        outbound: PayloadStream,
        options: &CallOptions,
    ) -> Result<PayloadStream, UpstreamError> {
        let opened = self.call_once(conn, options, conn.request_channel(initial, outbound)).await?;
        self.await_first_item(conn, opened).await
    }

    /// Holds the stream back until its first item so an immediate connection failure
    /// can still be retried; after that, failures are surfaced downstream.
    async fn await_first_item(
        self: &Arc<Self>,
        conn: &Arc<UpstreamConnection>,
        mut opened: PayloadStream,
    ) -> Result<PayloadStream, UpstreamError> {
        match opened.next().await {
            Some(Err(e)) => {
                if e.is_connection_error() {
                    self.balancer.record_error(conn.uri());
                    self.on_connection_failure(conn, &e);
                }
                Err(e)
            }
            first => {
                let weak = Arc::downgrade(self);
                let conn = conn.clone();
                Ok(stream::iter(first)
                    .chain(opened)
                    .inspect(move |item| {
                        if let Err(e) = item {
                            if e.is_connection_error() {
                                if let Some(inner) = weak.upgrade() {
                                    inner.on_connection_failure(&conn, e);
                                }
                            }
                        }
                    })
                    .boxed())
            }
        }
    }

    async fn broadcast<F, Fut>(self: &Arc<Self>, op: F) -> Result<BroadcastOutcome, UpstreamError>
    where
        F: Fn(Arc<UpstreamConnection>) -> Fut,
        Fut: Future<Output = Result<(), UpstreamError>>,
    {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        let snapshot = self.active.load_full();
        let options = CallOptions::default();
        let sends = snapshot.values().map(|conn| {
            let attempt = op(conn.clone());
            let options = &options;
            async move { (conn.uri().to_string(), self.call_once(conn, options, attempt).await) }
        });

        let mut outcome = BroadcastOutcome::default();
        for (uri, result) in join_all(sends).await {
            match result {
                Ok(()) => outcome.delivered.push(uri),
                Err(e) => {
                    debug!(service = %self.service, uri = %uri, error = %e, "broadcast send failed");
                    outcome.failed.push((uri, e));
                }
            }
        }
        Ok(outcome)
    }

    fn dispose_active(&self) {
        let previous = self.active.swap(Arc::new(BTreeMap::new()));
        for conn in previous.values() {
            conn.dispose();
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(service = %self.service, "disposing requester");
        self.shutdown.cancel();
        self.tasks.close();
        self.dispose_active();
        self.unhealthy.clear();
        self.reconnecting.clear();
        self.connecting.clear();
        self.removal_epochs.clear();
        self.initialized.send_replace(true);
    }
}

impl Drop for RequesterInner {
    fn drop(&mut self) {
        self.dispose();
    }
}
