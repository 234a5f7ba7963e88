//! Upstream connection pooling and load balancing.
//!
//! For every remote service this module keeps a set of healthy sessions, picks one
//! per call, and recovers from failures without involving the caller:
//!
//! - [`UpstreamConnection`] wraps one transport session with dispose-once semantics
//!   and the reserved health probe
//! - [`LoadBalancer`] applies endpoint and sticky hints on top of a pluggable
//!   [`LoadBalanceStrategy`] (random, round-robin, weighted latency)
//! - [`LoadBalancedRequester`] reconciles discovery updates, runs health and reconnect
//!   timers, and retries connection failures once on another connection
//! - [`UpstreamClusterManager`] maps service ids to [`UpstreamCluster`]s with a broker
//!   fallback
//!
//! ## Call Flow
//!
//! ```text
//! ServiceStub ─► manager.select(service_id) ─► cluster (or broker)
//!                                                 │
//!                                        requester.request_response
//!                                                 │
//!                     snapshot of active map ─► LoadBalancer.select(hint)
//!                                                 │
//!                               connection error? ─► mark unhealthy, retry once
//! ```

pub mod builder;
pub mod cluster;
pub mod connection;
pub mod discovery;
pub mod errors;
pub mod load_balancer;
pub mod manager;
pub mod requester;

pub use builder::{BuilderError, UpstreamClusterManagerBuilder};
pub use cluster::{UpstreamCluster, BROKER_SERVICE_NAME};
pub use connection::UpstreamConnection;
pub use discovery::DiscoveryEvent;
pub use errors::{error_codes, UpstreamError};
pub use load_balancer::{
    LoadBalanceKind, LoadBalanceStrategy, LoadBalancer, RandomStrategy, RoundRobinStrategy,
    SelectionHint, WeightedLatencyConfig, WeightedLatencyStrategy,
};
pub use manager::UpstreamClusterManager;
pub use requester::{
    BroadcastOutcome, CallOptions, LoadBalancedRequester, RequesterConfig, RequesterContext,
    RequesterStats,
};
