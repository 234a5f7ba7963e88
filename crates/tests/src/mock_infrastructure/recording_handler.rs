//! Handler wrapper that records what arrives on the wire.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_core::{
    transport::{Payload, PayloadStream, RpcHandler},
    upstream::UpstreamError,
};
use parking_lot::Mutex;

/// Delegates to `inner`, keeping the metadata of every inbound call and push.
pub struct RecordingHandler {
    inner: Arc<dyn RpcHandler>,
    metadata: Mutex<Vec<Bytes>>,
}

impl RecordingHandler {
    pub fn new(inner: Arc<dyn RpcHandler>) -> Arc<Self> {
        Arc::new(Self { inner, metadata: Mutex::new(Vec::new()) })
    }

    pub fn recorded(&self) -> Vec<Bytes> {
        self.metadata.lock().clone()
    }

    fn record(&self, metadata: &Bytes) {
        self.metadata.lock().push(metadata.clone());
    }
}

#[async_trait]
impl RpcHandler for RecordingHandler {
    async fn request_response(&self, peer: &str, payload: Payload) -> Result<Payload, UpstreamError> {
        self.record(&payload.metadata);
        self.inner.request_response(peer, payload).await
    }

    async fn fire_and_forget(&self, peer: &str, payload: Payload) -> Result<(), UpstreamError> {
        self.record(&payload.metadata);
        self.inner.fire_and_forget(peer, payload).await
    }

    async fn request_stream(&self, peer: &str, payload: Payload) -> Result<PayloadStream, UpstreamError> {
        self.record(&payload.metadata);
        self.inner.request_stream(peer, payload).await
    }

    async fn request_channel(
        &self,
        peer: &str,
        initial: Payload,
        inbound: PayloadStream,
    ) -> Result<PayloadStream, UpstreamError> {
        self.record(&initial.metadata);
        self.inner.request_channel(peer, initial, inbound).await
    }

    async fn metadata_push(&self, peer: &str, metadata: Bytes) -> Result<(), UpstreamError> {
        self.record(&metadata);
        self.inner.metadata_push(peer, metadata).await
    }

    fn peer_closed(&self, peer: &str) {
        self.inner.peer_closed(peer);
    }
}
