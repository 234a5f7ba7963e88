//! One logical service and the requester that backs it.

use bytes::Bytes;

use super::{
    requester::{BroadcastOutcome, LoadBalancedRequester, RequesterContext, RequesterStats},
    UpstreamError,
};
use crate::{service::ServiceLocator, transport::Payload};

/// Name of the fallback cluster's locator.
pub const BROKER_SERVICE_NAME: &str = "broker";

/// The remote connections serving one service identity, or the broker.
pub struct UpstreamCluster {
    locator: ServiceLocator,
    requester: LoadBalancedRequester,
    broker: bool,
}

impl UpstreamCluster {
    /// # Panics
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(locator: ServiceLocator, context: &RequesterContext) -> Self {
        let requester = LoadBalancedRequester::new(locator.gsv(), context);
        Self { locator, requester, broker: false }
    }

    /// Creates the fallback cluster used for services without a dedicated route.
    pub fn broker(context: &RequesterContext) -> Self {
        let locator = ServiceLocator::new("", BROKER_SERVICE_NAME, "");
        let requester = LoadBalancedRequester::new(locator.gsv(), context);
        Self { locator, requester, broker: true }
    }

    pub fn locator(&self) -> &ServiceLocator {
        &self.locator
    }

    pub fn service_id(&self) -> u32 {
        self.locator.id()
    }

    pub fn is_broker(&self) -> bool {
        self.broker
    }

    pub fn requester(&self) -> &LoadBalancedRequester {
        &self.requester
    }

    pub async fn refresh_uris<I, S>(&self, uris: I) -> Result<(), UpstreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requester.refresh_uris(uris).await
    }

    pub fn submit_uris<I, S>(&self, uris: I) -> Result<(), UpstreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requester.submit_uris(uris)
    }

    pub async fn broadcast_fire_and_forget(&self, payload: Payload) -> Result<BroadcastOutcome, UpstreamError> {
        self.requester.broadcast_fire_and_forget(payload).await
    }

    pub async fn broadcast_metadata_push(&self, metadata: Bytes) -> Result<BroadcastOutcome, UpstreamError> {
        self.requester.broadcast_metadata_push(metadata).await
    }

    pub fn stats(&self) -> RequesterStats {
        self.requester.stats()
    }

    pub fn is_disposed(&self) -> bool {
        self.requester.is_disposed()
    }

    pub fn dispose(&self) {
        self.requester.dispose();
    }
}

impl std::fmt::Debug for UpstreamCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCluster")
            .field("service", &self.locator.gsv())
            .field("broker", &self.broker)
            .field("active", &self.requester.active_uris())
            .finish()
    }
}

impl Drop for UpstreamCluster {
    fn drop(&mut self) {
        self.requester.dispose();
    }
}
