//! Builder pattern for constructing `UpstreamClusterManager` from code or settings.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::{
    load_balancer::LoadBalanceKind,
    manager::UpstreamClusterManager,
    requester::{RequesterConfig, RequesterContext},
};
use crate::{
    config::UpstreamSettings,
    service::{LocatorError, ServiceLocator, ServiceRegistry},
    transport::Transport,
};

/// Errors that can occur during upstream cluster manager construction.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuilderError {
    /// A transport is required but was not provided
    #[error("A transport is required but was not provided")]
    MissingTransport,

    /// Background tasks need a running Tokio runtime
    #[error("UpstreamClusterManager must be built inside a Tokio runtime")]
    NoRuntime,

    #[error("Invalid route '{route}': {source}")]
    InvalidRoute {
        route: String,
        #[source]
        source: LocatorError,
    },

    #[error("Invalid load balance strategy: {0}")]
    InvalidStrategy(String),
}

/// Builder for an [`UpstreamClusterManager`].
///
/// Static routes and broker addresses are queued on their clusters at build time;
/// connections are opened by each requester's refresh worker.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use mesh_core::{transport::local::LocalTransport, upstream::UpstreamClusterManager};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = UpstreamClusterManager::builder()
///     .transport(Arc::new(LocalTransport::new()))
///     .broker_uris(["local://broker"])
///     .route("shop!Cart:1", ["local://cart-1", "local://cart-2"])
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct UpstreamClusterManagerBuilder {
    transport: Option<Arc<dyn Transport>>,
    config: RequesterConfig,
    load_balance: LoadBalanceKind,
    registry: Option<Arc<ServiceRegistry>>,
    instance_id: Option<String>,
    brokers: Vec<String>,
    routes: Vec<(String, Vec<String>)>,
}

impl UpstreamClusterManagerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            transport: None,
            config: RequesterConfig::default(),
            load_balance: LoadBalanceKind::default(),
            registry: None,
            instance_id: None,
            brokers: Vec::new(),
            routes: Vec::new(),
        }
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn config(mut self, config: RequesterConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the selection strategy (default: round-robin).
    #[must_use]
    pub fn load_balance(mut self, kind: LoadBalanceKind) -> Self {
        self.load_balance = kind;
        self
    }

    /// Local services to announce to every upstream. Also switches removals to the
    /// provider grace delay while any service is exposed.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    #[must_use]
    pub fn broker_uris<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.brokers = uris.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a static route; `service` is a `[group!]name[:version]` identity.
    #[must_use]
    pub fn route<I, S>(mut self, service: impl Into<String>, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes.push((service.into(), uris.into_iter().map(Into::into).collect()));
        self
    }

    /// Applies every field of the `[upstream]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`BuilderError::InvalidStrategy`] for an unknown strategy name.
    pub fn settings(mut self, settings: &UpstreamSettings) -> Result<Self, BuilderError> {
        self.load_balance = settings.load_balance.parse().map_err(BuilderError::InvalidStrategy)?;
        self.config = settings.requester_config();
        self.brokers.clone_from(&settings.brokers);
        for route in &settings.routes {
            self.routes.push((route.service.clone(), route.uris.clone()));
        }
        Ok(self)
    }

    /// Builds the manager and queues the configured addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if no transport was set, a route identity does not parse, or
    /// no Tokio runtime is running.
    pub fn build(self) -> Result<Arc<UpstreamClusterManager>, BuilderError> {
        let transport = self.transport.ok_or(BuilderError::MissingTransport)?;
        tokio::runtime::Handle::try_current().map_err(|_| BuilderError::NoRuntime)?;

        let routes = self
            .routes
            .into_iter()
            .map(|(route, uris)| match ServiceLocator::parse(&route) {
                Ok(locator) => Ok((locator, uris)),
                Err(source) => Err(BuilderError::InvalidRoute { route, source }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut context = RequesterContext::new(transport)
            .with_config(self.config)
            .with_load_balance(self.load_balance);
        if let Some(registry) = self.registry {
            context = context.with_registry(registry);
        }
        if let Some(instance_id) = self.instance_id {
            context = context.with_instance_id(instance_id);
        }

        let manager = Arc::new(UpstreamClusterManager::new(context));
        for (locator, uris) in routes {
            // Only a routing id collision between two static routes can fail here.
            if let Err(e) = manager.add(locator.clone(), uris) {
                warn!(service = %locator, error = %e, "skipping static route");
            }
        }
        if !self.brokers.is_empty() {
            if let Err(e) = manager.install_broker(self.brokers) {
                warn!(error = %e, "broker cluster not installed");
            }
        }

        info!(
            clusters = manager.len(),
            broker = manager.broker().is_some(),
            strategy = %self.load_balance,
            "upstream cluster manager built"
        );
        Ok(manager)
    }
}

impl Default for UpstreamClusterManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
