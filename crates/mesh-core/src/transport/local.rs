//! In-process transport.
//!
//! Binds URIs to local [`RpcHandler`]s so co-located services talk through the same
//! session machinery as remote ones. Unbinding a URI closes every session opened to it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{future, stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Payload, PayloadStream, RpcHandler, RpcSession, Transport};
use crate::upstream::UpstreamError;

struct LocalEndpoint {
    handler: Arc<dyn RpcHandler>,
    shutdown: CancellationToken,
}

#[derive(Default)]
pub struct LocalTransport {
    endpoints: DashMap<String, LocalEndpoint>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `uri` to `handler`, closing sessions of any previous binding.
    pub fn bind(&self, uri: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        let uri = uri.into();
        debug!(uri = %uri, "binding local endpoint");
        let endpoint = LocalEndpoint { handler, shutdown: CancellationToken::new() };
        if let Some(previous) = self.endpoints.insert(uri, endpoint) {
            previous.shutdown.cancel();
        }
    }

    /// Removes the binding and closes its sessions. Returns `false` if nothing was bound.
    pub fn unbind(&self, uri: &str) -> bool {
        match self.endpoints.remove(uri) {
            Some((_, endpoint)) => {
                debug!(uri = %uri, "unbinding local endpoint");
                endpoint.shutdown.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_bound(&self, uri: &str) -> bool {
        self.endpoints.contains_key(uri)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn RpcSession>, UpstreamError> {
        let endpoint =
            self.endpoints.get(uri).ok_or_else(|| UpstreamError::ConnectionRefused(uri.to_string()))?;
        let session = LocalSession {
            uri: uri.to_string(),
            peer_id: uuid::Uuid::new_v4().to_string(),
            handler: endpoint.handler.clone(),
            closed: endpoint.shutdown.child_token(),
            disposed: AtomicBool::new(false),
        };
        debug!(uri = %uri, peer = %session.peer_id, "local session opened");
        Ok(Arc::new(session))
    }
}

struct LocalSession {
    uri: String,
    peer_id: String,
    handler: Arc<dyn RpcHandler>,
    closed: CancellationToken,
    disposed: AtomicBool,
}

impl LocalSession {
    fn ensure_open(&self) -> Result<(), UpstreamError> {
        if self.closed.is_cancelled() {
            return Err(UpstreamError::ConnectionClosed(self.uri.clone()));
        }
        Ok(())
    }

    fn closed_error(&self) -> UpstreamError {
        UpstreamError::ConnectionClosed(self.uri.clone())
    }

    /// Cuts `items` short when the session closes; a cut stream ends with one
    /// [`UpstreamError::ConnectionClosed`] instead of looking complete.
    fn guard_stream(&self, items: PayloadStream) -> PayloadStream {
        let closed = self.closed.clone();
        let uri = self.uri.clone();
        let trailer = stream::once(async move {
            closed.is_cancelled().then(|| Err(UpstreamError::ConnectionClosed(uri)))
        })
        .filter_map(future::ready);
        items.take_until(self.closed.clone().cancelled_owned()).chain(trailer).boxed()
    }
}

#[async_trait]
impl RpcSession for LocalSession {
    fn remote_uri(&self) -> &str {
        &self.uri
    }

    async fn request_response(&self, payload: Payload) -> Result<Payload, UpstreamError> {
        self.ensure_open()?;
        tokio::select! {
            result = self.handler.request_response(&self.peer_id, payload) => result,
            () = self.closed.cancelled() => Err(self.closed_error()),
        }
    }

    async fn fire_and_forget(&self, payload: Payload) -> Result<(), UpstreamError> {
        self.ensure_open()?;
        self.handler.fire_and_forget(&self.peer_id, payload).await
    }

    async fn request_stream(&self, payload: Payload) -> Result<PayloadStream, UpstreamError> {
        self.ensure_open()?;
        let stream = tokio::select! {
            result = self.handler.request_stream(&self.peer_id, payload) => result?,
            () = self.closed.cancelled() => return Err(self.closed_error()),
        };
        Ok(self.guard_stream(stream))
    }

    async fn request_channel(
        &self,
        initial: Payload,
        outbound: PayloadStream,
    ) -> Result<PayloadStream, UpstreamError> {
        self.ensure_open()?;
        let stream = tokio::select! {
            result = self.handler.request_channel(&self.peer_id, initial, outbound) => result?,
            () = self.closed.cancelled() => return Err(self.closed_error()),
        };
        Ok(self.guard_stream(stream))
    }

    async fn metadata_push(&self, metadata: Bytes) -> Result<(), UpstreamError> {
        self.ensure_open()?;
        self.handler.metadata_push(&self.peer_id, metadata).await
    }

    async fn closed(&self) -> UpstreamError {
        self.closed.cancelled().await;
        self.closed_error()
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn dispose(&self) {
        self.closed.cancel();
        // The token may already be cancelled by unbind; the handler still hears about it once.
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.handler.peer_closed(&self.peer_id);
        }
    }
}
