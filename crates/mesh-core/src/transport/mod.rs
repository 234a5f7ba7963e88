//! Transport seam.
//!
//! The mesh assumes a multiplexed duplex transport supplied from outside. It only needs
//! to open a session to a URI ([`Transport`]), issue the four interaction models over
//! it ([`RpcSession`]), and hand inbound calls to a local dispatcher ([`RpcHandler`]).

pub mod local;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::upstream::UpstreamError;

/// A single frame: composite metadata plus an opaque body.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub metadata: Bytes,
    pub data: Bytes,
}

impl Payload {
    pub fn new(metadata: Bytes, data: Bytes) -> Self {
        Self { metadata, data }
    }

    pub fn data_only(data: Bytes) -> Self {
        Self { metadata: Bytes::new(), data }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("metadata_len", &self.metadata.len())
            .field("data_len", &self.data.len())
            .finish()
    }
}

pub type PayloadStream = BoxStream<'static, Result<Payload, UpstreamError>>;

/// An open session to one remote URI.
#[async_trait]
pub trait RpcSession: Send + Sync + 'static {
    fn remote_uri(&self) -> &str;

    async fn request_response(&self, payload: Payload) -> Result<Payload, UpstreamError>;

    async fn fire_and_forget(&self, payload: Payload) -> Result<(), UpstreamError>;

    async fn request_stream(&self, payload: Payload) -> Result<PayloadStream, UpstreamError>;

    async fn request_channel(
        &self,
        initial: Payload,
        outbound: PayloadStream,
    ) -> Result<PayloadStream, UpstreamError>;

    async fn metadata_push(&self, metadata: Bytes) -> Result<(), UpstreamError>;

    /// Resolves once the session has ended, with the reason it ended.
    ///
    /// Must also resolve after [`RpcSession::dispose`].
    async fn closed(&self) -> UpstreamError;

    fn is_closed(&self) -> bool;

    /// Releases transport resources. Idempotent.
    fn dispose(&self);
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn RpcSession>, UpstreamError>;
}

/// Receiving side of a session. `peer` identifies the session the call arrived on.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn request_response(&self, peer: &str, payload: Payload) -> Result<Payload, UpstreamError>;

    async fn fire_and_forget(&self, peer: &str, payload: Payload) -> Result<(), UpstreamError>;

    async fn request_stream(&self, peer: &str, payload: Payload) -> Result<PayloadStream, UpstreamError>;

    async fn request_channel(
        &self,
        peer: &str,
        initial: Payload,
        inbound: PayloadStream,
    ) -> Result<PayloadStream, UpstreamError>;

    async fn metadata_push(&self, peer: &str, metadata: Bytes) -> Result<(), UpstreamError>;

    /// Called once when a session from `peer` ends.
    fn peer_closed(&self, _peer: &str) {}
}
