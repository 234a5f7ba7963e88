//! Integration tests for the mesh core.
//!
//! This crate contains scenario suites for the upstream subsystem:
//!
//! - `identity_tests`: Routing id determinism and an end-to-end call through the real
//!   dispatcher, checking the ids carried on the wire
//! - `refresh_tests`: Address reconciliation, no-op refreshes, one session per URI and
//!   grace-delay removal
//! - `failover_tests`: Retry-once semantics for every interaction model
//! - `reconnect_tests`: Reconnect campaigns, health probes and the unhealthy sweep
//! - `broadcast_tests`: Fan-out with partial failures
//! - `cluster_manager_tests`: Broker fallback, builder settings and discovery events
//! - `mock_infrastructure`: Scripted transport and recording handler
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package tests
//! ```
//!
//! Timer-driven suites run with a paused Tokio clock, so grace delays and reconnect
//! intervals elapse instantly and deterministically.

#[cfg(test)]
mod identity_tests;

#[cfg(test)]
mod refresh_tests;

#[cfg(test)]
mod failover_tests;



#[cfg(test)]
mod cluster_manager_tests;
