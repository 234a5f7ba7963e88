//! Test Helper Functions and Utilities
//!
//! Common configs, locators and payloads for the scenario suites.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use mesh_core::{
    protocol::{CallMetadata, MimeType, RoutingKey},
    service::ServiceLocator,
    transport::{Payload, Transport},
    upstream::{LoadBalancedRequester, RequesterConfig, RequesterContext},
};

/// Requester timers scaled for tests: 1s reconnect spacing, 3 attempts, 10s grace,
/// and a sweep interval long enough to never fire unless a test asks for it.
#[must_use]
pub fn fast_config() -> RequesterConfig {
    RequesterConfig {
        call_timeout: Duration::from_secs(1),
        consumer_grace_delay: Duration::from_secs(10),
        provider_grace_delay: Duration::from_secs(30),
        reconnect_attempts: 3,
        reconnect_interval: Duration::from_secs(1),
        health_check_interval: Duration::from_secs(5),
        unhealthy_sweep_interval: Duration::from_secs(3600),
        initial_connect_timeout: Duration::from_millis(100),
    }
}

#[must_use]
pub fn echo_locator() -> ServiceLocator {
    ServiceLocator::new("", "Echo", "1.0")
}

/// Requester for [`echo_locator`] over `transport`.
pub fn requester_for(transport: Arc<dyn Transport>, config: RequesterConfig) -> LoadBalancedRequester {
    let context = RequesterContext::new(transport).with_config(config);
    LoadBalancedRequester::new(echo_locator().gsv(), &context)
}

/// Call payload for `handler` on [`echo_locator`] with a JSON body.
#[must_use]
pub fn call_payload(handler: &str, body: &str) -> Payload {
    let metadata = CallMetadata::new(RoutingKey::for_handler(&echo_locator(), handler), MimeType::APPLICATION_JSON)
        .encode()
        .expect("metadata encodes");
    Payload::new(metadata, Bytes::from(body.to_string()))
}

/// Decodes the URI a scripted node answered with.
#[must_use]
pub fn answered_by(payload: &Payload) -> String {
    serde_json::from_slice(&payload.data).expect("scripted answer is a JSON string")
}
