//! # Mesh Core
//!
//! Upstream connection management and routing protocol for an RPC service mesh.
//!
//! This crate provides:
//!
//! - **[`service`]**: Service identities (`[group!]name[:version]` hashed to 32-bit ids),
//!   the local service registry, inbound dispatch and the reserved health service.
//!
//! - **[`protocol`]**: Composite routing metadata carried on every call: binary routing
//!   block, data and accept encodings, bearer token, trace context and service exposure.
//!
//! - **[`upstream`]**: Per-service connection pools with pluggable load balancing, health
//!   probing, reconnect campaigns, graceful removal and retry-once failover, plus the
//!   cluster manager with broker fallback.
//!
//! - **[`client`]**: Typed stubs that pre-encode routing metadata per method.
//!
//! - **[`transport`]**: The session abstraction the core runs on, and an in-process
//!   implementation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    UpstreamClusterManager                     │
//! │   service id ──► UpstreamCluster ──► LoadBalancedRequester    │
//! │   (no route) ──► broker cluster                               │
//! │                                 ┌──────────────────────────┐  │
//! │                                 │ active (copy-on-write)   │  │
//! │                                 │ unhealthy / reconnecting │  │
//! │                                 │ health + sweep timers    │  │
//! │                                 └────────────┬─────────────┘  │
//! └──────────────────────────────────────────────┼────────────────┘
//!                                                │ RpcSession
//!                                                ▼
//!                               remote ServiceDispatcher ──► ServiceRegistry
//! ```
//!
//! ## Call Flow
//!
//! ```text
//! MethodStub ──► CallMetadata (cached) ──► manager.select(service id)
//!                                               │
//!                                               ▼
//!                            LoadBalancer.select(active snapshot, hint)
//!                                               │
//!                          ┌────────────────────┴─────────────┐
//!                          ▼                                  ▼
//!                       success                  connection error
//!                  record latency          mark unhealthy, reconnect,
//!                                          retry once elsewhere
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod upstream;
pub mod utils;
