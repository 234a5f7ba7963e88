//! One logical session to one remote URI.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::trace;

use super::UpstreamError;
use crate::{
    service::health::{health_check_payload, HealthStatus},
    transport::{Payload, PayloadStream, RpcSession},
};

/// Wraps a transport session with a dispose-once guard and the health probe.
pub struct UpstreamConnection {
    uri: Arc<str>,
    session: Arc<dyn RpcSession>,
    disposed: AtomicBool,
    connected_at: DateTime<Utc>,
}

impl UpstreamConnection {
    pub fn new(uri: impl Into<Arc<str>>, session: Arc<dyn RpcSession>) -> Self {
        Self { uri: uri.into(), session, disposed: AtomicBool::new(false), connected_at: Utc::now() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Not disposed and the session has not reported closed.
    pub fn is_available(&self) -> bool {
        !self.is_disposed() && !self.session.is_closed()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), UpstreamError> {
        if self.is_disposed() {
            return Err(UpstreamError::ConnectionClosed(self.uri.to_string()));
        }
        Ok(())
    }

    pub async fn request_response(&self, payload: Payload) -> Result<Payload, UpstreamError> {
        self.ensure_open()?;
        self.session.request_response(payload).await
    }

    pub async fn fire_and_forget(&self, payload: Payload) -> Result<(), UpstreamError> {
        self.ensure_open()?;
        self.session.fire_and_forget(payload).await
    }

    pub async fn request_stream(&self, payload: Payload) -> Result<PayloadStream, UpstreamError> {
        self.ensure_open()?;
        self.session.request_stream(payload).await
    }

    pub async fn request_channel(
        &self,
        initial: Payload,
        outbound: PayloadStream,
    ) -> Result<PayloadStream, UpstreamError> {
        self.ensure_open()?;
        self.session.request_channel(initial, outbound).await
    }

    pub async fn metadata_push(&self, metadata: Bytes) -> Result<(), UpstreamError> {
        self.ensure_open()?;
        self.session.metadata_push(metadata).await
    }

    /// Sends the reserved health call and expects a SERVING status within `timeout`.
    ///
    /// # Errors
    ///
    /// Every failure (timeout, transport error, wrong status) is reported as
    /// [`UpstreamError::HealthCheckFailed`].
    pub async fn health_check(&self, timeout: Duration) -> Result<(), UpstreamError> {
        let failed = |reason: String| UpstreamError::HealthCheckFailed {
            uri: self.uri.to_string(),
            reason,
        };

        let payload = health_check_payload().map_err(|e| failed(e.to_string()))?;
        let response = match tokio::time::timeout(timeout, self.request_response(payload)).await {
            Err(_) => return Err(failed(format!("no answer within {timeout:?}"))),
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Ok(Ok(response)) => response,
        };

        match HealthStatus::decode(&response.data) {
            Some(HealthStatus::Serving) => {
                trace!(uri = %self.uri, "health check passed");
                Ok(())
            }
            Some(status) => Err(failed(format!("status {status:?}"))),
            None => Err(failed("malformed health response".to_string())),
        }
    }

    /// Resolves when the session ends, including after [`UpstreamConnection::dispose`].
    pub async fn closed(&self) -> UpstreamError {
        self.session.closed().await
    }

    /// Releases the session. Returns `true` only for the call that actually disposed it.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        trace!(uri = %self.uri, "disposing connection");
        self.session.dispose();
        true
    }
}

impl fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("uri", &self.uri)
            .field("disposed", &self.is_disposed())
            .field("closed", &self.session.is_closed())
            .finish()
    }
}

impl Drop for UpstreamConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}
