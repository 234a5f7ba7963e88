//! Routing table from service id to upstream cluster.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use arc_swap::ArcSwapOption;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    cluster::UpstreamCluster, discovery::DiscoveryEvent, requester::RequesterContext, UpstreamError,
};
use crate::service::ServiceLocator;

/// Owns every [`UpstreamCluster`] of the process plus the optional broker fallback.
///
/// Clusters are keyed by the routing id of their service identity; a call for a
/// service without a dedicated cluster goes to the broker.
pub struct UpstreamClusterManager {
    clusters: DashMap<u32, Arc<UpstreamCluster>>,
    broker: ArcSwapOption<UpstreamCluster>,
    context: RequesterContext,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl UpstreamClusterManager {
    pub fn new(context: RequesterContext) -> Self {
        Self {
            clusters: DashMap::new(),
            broker: ArcSwapOption::empty(),
            context,
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn builder() -> super::UpstreamClusterManagerBuilder {
        super::UpstreamClusterManagerBuilder::new()
    }

    pub fn context(&self) -> &RequesterContext {
        &self.context
    }

    /// Returns the cluster registered for `service_id`, falling back to the broker.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::NoRoute`] when neither exists, [`UpstreamError::Disposed`] after
    /// [`Self::dispose`].
    pub fn select(&self, service_id: u32) -> Result<Arc<UpstreamCluster>, UpstreamError> {
        self.ensure_active()?;
        if let Some(cluster) = self.clusters.get(&service_id) {
            return Ok(cluster.value().clone());
        }
        self.broker
            .load_full()
            .ok_or_else(|| UpstreamError::NoRoute(format!("{service_id:#010x}")))
    }

    /// Like [`Self::select`], with the service identity in the error message.
    pub fn select_locator(&self, locator: &ServiceLocator) -> Result<Arc<UpstreamCluster>, UpstreamError> {
        self.select(locator.id()).map_err(|e| match e {
            UpstreamError::NoRoute(_) => UpstreamError::NoRoute(locator.gsv().to_string()),
            other => other,
        })
    }

    /// Registered cluster for `service_id`, without broker fallback.
    #[must_use]
    pub fn cluster(&self, service_id: u32) -> Option<Arc<UpstreamCluster>> {
        self.clusters.get(&service_id).map(|cluster| cluster.value().clone())
    }

    #[must_use]
    pub fn clusters(&self) -> Vec<Arc<UpstreamCluster>> {
        let mut clusters: Vec<_> = self.clusters.iter().map(|entry| entry.value().clone()).collect();
        clusters.sort_by(|a, b| a.locator().gsv().cmp(b.locator().gsv()));
        clusters
    }

    #[must_use]
    pub fn broker(&self) -> Option<Arc<UpstreamCluster>> {
        self.broker.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Registers a cluster for `locator` and queues `uris` on it. If the service already
    /// has a cluster, only the address set is updated.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::RouteConflict`] if another identity owns the same routing id.
    pub fn add<I, S>(&self, locator: ServiceLocator, uris: I) -> Result<Arc<UpstreamCluster>, UpstreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cluster = self.upsert(locator)?;
        cluster.submit_uris(uris)?;
        Ok(cluster)
    }

    /// Upserts the cluster for `locator` and waits until `uris` have been applied.
    /// Re-sending the current set is a no-op.
    pub async fn refresh<I, S>(&self, locator: ServiceLocator, uris: I) -> Result<Arc<UpstreamCluster>, UpstreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cluster = self.upsert(locator)?;
        cluster.refresh_uris(uris).await?;
        Ok(cluster)
    }

    /// Applies a discovery event; the textual identity is parsed into a locator.
    pub async fn apply(&self, event: DiscoveryEvent) -> Result<(), UpstreamError> {
        let locator = ServiceLocator::parse(&event.service_id)
            .map_err(|e| UpstreamError::NoRoute(format!("{}: {e}", event.service_id)))?;
        self.refresh(locator, event.uris).await.map(drop)
    }

    /// Unregisters and disposes the cluster for `service_id`.
    pub fn remove(&self, service_id: u32) -> bool {
        match self.clusters.remove(&service_id) {
            Some((_, cluster)) => {
                info!(service = %cluster.locator(), "removing upstream cluster");
                cluster.dispose();
                true
            }
            None => false,
        }
    }

    /// Installs the broker cluster if needed and queues `uris` on it.
    pub fn install_broker<I, S>(&self, uris: I) -> Result<Arc<UpstreamCluster>, UpstreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let broker = self.broker_cluster()?;
        broker.submit_uris(uris)?;
        Ok(broker)
    }

    /// Installs or updates the broker cluster's addresses and waits until applied.
    pub async fn set_broker<I, S>(&self, uris: I) -> Result<Arc<UpstreamCluster>, UpstreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let broker = self.broker_cluster()?;
        broker.refresh_uris(uris).await?;
        Ok(broker)
    }

    fn broker_cluster(&self) -> Result<Arc<UpstreamCluster>, UpstreamError> {
        self.ensure_active()?;
        if let Some(broker) = self.broker.load_full() {
            return Ok(broker);
        }
        let created = Arc::new(UpstreamCluster::broker(&self.context));
        let previous = self.broker.compare_and_swap(&None::<Arc<UpstreamCluster>>, Some(created.clone()));
        match &*previous {
            Some(winner) => Ok(winner.clone()),
            None => {
                info!("broker cluster installed");
                Ok(created)
            }
        }
    }

    /// Drops the broker fallback, disposing its connections.
    pub fn clear_broker(&self) -> bool {
        match self.broker.swap(None) {
            Some(broker) => {
                broker.dispose();
                true
            }
            None => false,
        }
    }

    /// Consumes discovery events until the channel closes or the manager is disposed.
    pub fn spawn_discovery_listener(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<DiscoveryEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(manager) = manager.upgrade() else { break };
                let service = event.service_id.clone();
                if let Err(e) = manager.apply(event).await {
                    warn!(service = %service, error = %e, "failed to apply discovery event");
                }
            }
            debug!("discovery listener stopped");
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Disposes every cluster and the broker. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(clusters = self.clusters.len(), "disposing upstream clusters");
        self.shutdown.cancel();
        let ids: Vec<u32> = self.clusters.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, cluster)) = self.clusters.remove(&id) {
                cluster.dispose();
            }
        }
        self.clear_broker();
    }

    fn ensure_active(&self) -> Result<(), UpstreamError> {
        if self.is_disposed() {
            return Err(UpstreamError::Disposed("upstream cluster manager".to_string()));
        }
        Ok(())
    }

    fn upsert(&self, locator: ServiceLocator) -> Result<Arc<UpstreamCluster>, UpstreamError> {
        self.ensure_active()?;
        let id = locator.id();
        let cluster = match self.clusters.entry(id) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                if existing.locator() != &locator {
                    return Err(UpstreamError::RouteConflict {
                        id,
                        existing: existing.locator().gsv().to_string(),
                        incoming: locator.gsv().to_string(),
                    });
                }
                return Ok(existing.clone());
            }
            Entry::Vacant(entry) => {
                info!(service = %locator, id, "registering upstream cluster");
                let cluster = Arc::new(UpstreamCluster::new(locator, &self.context));
                entry.insert(cluster.clone());
                cluster
            }
        };
        // A concurrent dispose may have drained the table before this insert landed.
        if self.is_disposed() {
            self.clusters.remove_if(&id, |_, current| Arc::ptr_eq(current, &cluster));
            cluster.dispose();
            return Err(UpstreamError::Disposed("upstream cluster manager".to_string()));
        }
        Ok(cluster)
    }
}

impl Drop for UpstreamClusterManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
