//! Scripted transport whose nodes fail on command.

use std::sync::{
    atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{stream, StreamExt};
use mesh_core::{
    protocol::RoutingMetadataCodec,
    service::{health::health_routing_key, HealthStatus},
    transport::{Payload, PayloadStream, RpcSession, Transport},
    upstream::UpstreamError,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Behaviour and call log of one remote URI.
///
/// Successful calls answer with the node's URI as a JSON string, so tests can tell
/// which connection served a call.
pub struct ScriptedNode {
    uri: String,
    refuse: AtomicBool,
    hang: AtomicBool,
    close_reason: Mutex<Option<UpstreamError>>,
    probe_status: AtomicU8,
    failure: Mutex<Option<UpstreamError>>,
    connect_times: Mutex<Vec<Instant>>,
    sessions: Mutex<Vec<CancellationToken>>,
    disposes: AtomicUsize,
    calls: Mutex<Vec<Bytes>>,
    pushes: Mutex<Vec<Bytes>>,
}

impl ScriptedNode {
    fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            refuse: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            probe_status: AtomicU8::new(HealthStatus::Serving.code()),
            failure: Mutex::new(None),
            connect_times: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            disposes: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Makes future connects fail with `ConnectionRefused`.
    pub fn refuse_connects(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Makes future connects never complete, like a blackholed address.
    pub fn hang_connects(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Status answered to health probes.
    pub fn set_probe_status(&self, status: HealthStatus) {
        self.probe_status.store(status.code(), Ordering::SeqCst);
    }

    /// Makes every non-probe call fail with `error`. A connection-class error also
    /// closes the session it happened on.
    pub fn fail_calls(&self, error: Option<UpstreamError>) {
        *self.failure.lock() = error;
    }

    /// Closes every open session, as if the remote went away.
    pub fn close_sessions(&self) {
        *self.close_reason.lock() = None;
        self.cancel_sessions();
    }

    /// Ends every open session, reporting `reason` instead of a closed connection.
    pub fn end_sessions(&self, reason: UpstreamError) {
        *self.close_reason.lock() = Some(reason);
        self.cancel_sessions();
    }

    fn cancel_sessions(&self) {
        for token in self.sessions.lock().iter() {
            token.cancel();
        }
    }

    /// Connect attempts, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.connect_times.lock().len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().clone()
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().iter().filter(|token| !token.is_cancelled()).count()
    }

    pub fn disposes(&self) -> usize {
        self.disposes.load(Ordering::SeqCst)
    }

    /// Metadata of every non-probe call, in arrival order.
    pub fn recorded_metadata(&self) -> Vec<Bytes> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn pushes(&self) -> Vec<Bytes> {
        self.pushes.lock().clone()
    }

    fn answer(&self) -> Payload {
        Payload::data_only(Bytes::from(format!("\"{}\"", self.uri)))
    }
}

/// Transport over [`ScriptedNode`]s, created on first use with default behaviour.
#[derive(Default)]
pub struct ScriptedTransport {
    nodes: DashMap<String, Arc<ScriptedNode>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn node(&self, uri: &str) -> Arc<ScriptedNode> {
        self.nodes.entry(uri.to_string()).or_insert_with(|| Arc::new(ScriptedNode::new(uri))).clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn RpcSession>, UpstreamError> {
        let node = self.node(uri);
        node.connect_times.lock().push(Instant::now());
        if node.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if node.refuse.load(Ordering::SeqCst) {
            return Err(UpstreamError::ConnectionRefused(uri.to_string()));
        }
        let closed = CancellationToken::new();
        node.sessions.lock().push(closed.clone());
        Ok(Arc::new(ScriptedSession { node, closed, disposed: AtomicBool::new(false) }))
    }
}

struct ScriptedSession {
    node: Arc<ScriptedNode>,
    closed: CancellationToken,
    disposed: AtomicBool,
}

impl ScriptedSession {
    fn closed_error(&self) -> UpstreamError {
        UpstreamError::ConnectionClosed(self.node.uri.clone())
    }

    /// Records the call and applies the scripted failure, if any.
    fn admit(&self, metadata: &Bytes) -> Result<(), UpstreamError> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        self.node.calls.lock().push(metadata.clone());
        let failure = self.node.failure.lock().clone();
        match failure {
            Some(error) => {
                if error.is_connection_error() {
                    self.closed.cancel();
                }
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn is_probe(metadata: &Bytes) -> bool {
        RoutingMetadataCodec::decode_routing(metadata.clone())
            .is_ok_and(|routing| routing.handler_id == health_routing_key().handler_id)
    }
}

#[async_trait]
impl RpcSession for ScriptedSession {
    fn remote_uri(&self) -> &str {
        &self.node.uri
    }

    async fn request_response(&self, payload: Payload) -> Result<Payload, UpstreamError> {
        if Self::is_probe(&payload.metadata) {
            if self.closed.is_cancelled() {
                return Err(self.closed_error());
            }
            let status = self.node.probe_status.load(Ordering::SeqCst);
            return Ok(Payload::data_only(Bytes::from(status.to_string())));
        }
        self.admit(&payload.metadata)?;
        Ok(self.node.answer())
    }

    async fn fire_and_forget(&self, payload: Payload) -> Result<(), UpstreamError> {
        self.admit(&payload.metadata)
    }

    async fn request_stream(&self, payload: Payload) -> Result<PayloadStream, UpstreamError> {
        self.admit(&payload.metadata)?;
        let answer = self.node.answer();
        Ok(stream::iter(vec![Ok(answer.clone()), Ok(answer.clone()), Ok(answer)]).boxed())
    }

    async fn request_channel(
        &self,
        initial: Payload,
        outbound: PayloadStream,
    ) -> Result<PayloadStream, UpstreamError> {
        self.admit(&initial.metadata)?;
        Ok(stream::once(async move { Ok(Payload::data_only(initial.data)) }).chain(outbound).boxed())
    }

    async fn metadata_push(&self, metadata: Bytes) -> Result<(), UpstreamError> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        self.node.pushes.lock().push(metadata);
        Ok(())
    }

    async fn closed(&self) -> UpstreamError {
        self.closed.cancelled().await;
        let reason = self.node.close_reason.lock().clone();
        reason.unwrap_or_else(|| self.closed_error())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.node.disposes.fetch_add(1, Ordering::SeqCst);
            self.closed.cancel();
        }
    }
}
