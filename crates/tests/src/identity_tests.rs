//! Routing identity and the end-to-end wire scenario.
//!
//! These tests verify that:
//! - Service and handler ids are a pure function of the identity text
//! - A call through the real dispatcher carries exactly the expected ids on the wire
//! - The response round-trips the request body

use std::sync::Arc;

use mesh_core::{
    protocol::RoutingMetadataCodec,
    service::{ServiceDefinition, ServiceDispatcher, ServiceLocator, ServiceRegistry},
    transport::{local::LocalTransport, Payload},
    upstream::{CallOptions, LoadBalancedRequester, RequesterContext},
    utils::murmur3_32,
};
use proptest::prelude::*;
use serde_json::Value;

use crate::mock_infrastructure::{call_payload, echo_locator, fast_config, RecordingHandler};

proptest! {
    #[test]
    fn test_identity_is_deterministic(
        group in "[a-z]{0,6}",
        name in "[A-Za-z][A-Za-z0-9]{0,12}",
        version in "([0-9]\\.[0-9])?",
    ) {
        let first = ServiceLocator::new(group.clone(), name.clone(), version.clone());
        let second = ServiceLocator::new(group, name, version);
        prop_assert_eq!(first.id(), second.id());
        prop_assert_eq!(first.id(), murmur3_32(first.gsv().as_bytes(), 0));
        prop_assert_eq!(first.handler_id("echo"), second.handler_id("echo"));
    }
}

#[test]
fn test_identity_is_stable_across_builds() {
    // Pinned values shared with every deployed peer.
    let locator = echo_locator();
    assert_eq!(locator.gsv(), "Echo:1.0");
    assert_eq!(locator.id(), murmur3_32(b"Echo:1.0", 0));
    assert_eq!(locator.handler_id("echo"), murmur3_32(b"Echo:1.0.echo", 0));
    assert_eq!(ServiceLocator::parse("Echo:1.0").unwrap(), locator);
}

#[tokio::test]
async fn test_end_to_end_echo_carries_routing_ids() {
    let registry = Arc::new(ServiceRegistry::new());
    registry
        .register(
            ServiceDefinition::untyped(echo_locator())
                .request_response("echo", |body: Value, _ctx| async move { Ok(body) })
                .build(),
        )
        .unwrap();
    let recorder = RecordingHandler::new(Arc::new(ServiceDispatcher::new(registry)));

    let transport = Arc::new(LocalTransport::new());
    transport.bind("local://echo-1", recorder.clone());
    let context = RequesterContext::new(transport).with_config(fast_config());
    let requester = LoadBalancedRequester::new(echo_locator().gsv(), &context);
    requester.refresh_uris(["local://echo-1"]).await.unwrap();

    let body = r#"{"message":"ping","n":7}"#;
    let response: Payload =
        requester.request_response(call_payload("echo", body), &CallOptions::default()).await.unwrap();

    let sent: Value = serde_json::from_str(body).unwrap();
    let received: Value = serde_json::from_slice(&response.data).unwrap();
    assert_eq!(received, sent);

    // The first recorded call is the admission health probe; the echo call is last.
    let wire = recorder.recorded().pop().unwrap();
    let routing = RoutingMetadataCodec::decode_routing(wire).unwrap();
    assert_eq!(routing.service_id, murmur3_32(b"Echo:1.0", 0));
    assert_eq!(routing.handler_id, murmur3_32(b"Echo:1.0.echo", 0));
}

#[tokio::test]
async fn test_unknown_handler_is_rejected_not_retried() {
    let registry = Arc::new(ServiceRegistry::new());
    let recorder = RecordingHandler::new(Arc::new(ServiceDispatcher::new(registry)));
    let transport = Arc::new(LocalTransport::new());
    transport.bind("local://echo-1", recorder.clone());
    let context = RequesterContext::new(transport).with_config(fast_config());
    let requester = LoadBalancedRequester::new(echo_locator().gsv(), &context);
    requester.refresh_uris(["local://echo-1"]).await.unwrap();
    let probes = recorder.recorded().len();

    let err = requester
        .request_response(call_payload("missing", "1"), &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.application_code(), Some(mesh_core::upstream::error_codes::INVALID));
    assert_eq!(recorder.recorded().len(), probes + 1);
}
