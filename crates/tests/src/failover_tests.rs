//! Retry-once failover across interaction models.
//!
//! These tests verify that:
//! - A connection-class failure is retried exactly once on a different connection
//! - With no other connection the call fails fast with "no available connection"
//! - Application errors and timeouts are never retried
//! - Streams and channels retry only before anything reached the caller
//! - A stream cut after its first item ends with a connection error

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use mesh_core::{
    service::HealthStatus,
    transport::{local::LocalTransport, Payload, PayloadStream, RpcHandler},
    upstream::{error_codes, CallOptions, UpstreamError},
};

use crate::mock_infrastructure::{answered_by, call_payload, echo_locator, fast_config, requester_for, ScriptedTransport};

fn closed(uri: &str) -> Option<UpstreamError> {
    Some(UpstreamError::ConnectionClosed(uri.to_string()))
}

#[tokio::test(start_paused = true)]
async fn test_connection_failure_retried_on_other_connection() {
    let transport = ScriptedTransport::new();
    let requester = requester_for(transport.clone(), fast_config());
    requester.refresh_uris(["mock://a", "mock://b"]).await.unwrap();
    let (a, b) = (transport.node("mock://a"), transport.node("mock://b"));
    a.fail_calls(closed("mock://a"));

    for _ in 0..2 {
        let response = requester.request_response(call_payload("echo", "1"), &CallOptions::default()).await.unwrap();
        assert_eq!(answered_by(&response), "mock://b");
    }
    assert_eq!(a.call_count(), 1);
    assert_eq!(b.call_count(), 2);
    assert_eq!(requester.active_uris(), vec!["mock://b".to_string()]);
    assert_eq!(requester.unhealthy_uris(), vec!["mock://a".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_happens_at_most_once() {
    let transport = ScriptedTransport::new();
    let requester = requester_for(transport.clone(), fast_config());
    requester.refresh_uris(["mock://a", "mock://b", "mock://c"]).await.unwrap();
    for uri in ["mock://a", "mock://b", "mock://c"] {
        transport.node(uri).fail_calls(closed(uri));
    }

    let err = requester.request_response(call_payload("echo", "1"), &CallOptions::default()).await.unwrap_err();
    assert!(err.is_connection_error());

    let attempts: usize =
        ["mock://a", "mock://b", "mock://c"].iter().map(|uri| transport.node(uri).call_count()).sum();
    assert_eq!(attempts, 2);
    assert_eq!(requester.active_uris().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sole_connection_failure_fails_fast() {
    let transport = ScriptedTransport::new();
    let requester = requester_for(transport.clone(), fast_config());
    requester.refresh_uris(["mock://a"]).await.unwrap();
    let a = transport.node("mock://a");
    a.fail_calls(closed("mock://a"));

    let err = requester.request_response(call_payload("echo", "1"), &CallOptions::default()).await.unwrap_err();
    assert_eq!(err, UpstreamError::NoAvailableConnection(echo_locator().gsv().to_string()));
    assert_eq!(a.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_application_error_not_retried() {
    let transport = ScriptedTransport::new();
    let requester = requester_for(transport.clone(), fast_config());
    requester.refresh_uris(["mock://a", "mock://b"]).await.unwrap();
    for uri in ["mock://a", "mock://b"] {
        transport.node(uri).fail_calls(Some(UpstreamError::application(error_codes::APPLICATION_ERROR, "boom")));
    }

    let err = requester.request_response(call_payload("echo", "1"), &CallOptions::default()).await.unwrap_err();
    assert_eq!(err.application_code(), Some(error_codes::APPLICATION_ERROR));
    let attempts = transport.node("mock://a").call_count() + transport.node("mock://b").call_count();
    assert_eq!(attempts, 1);
    assert_eq!(requester.active_uris().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fire_and_forget_retried_once() {
    let transport = ScriptedTransport::new();
    let requester = requester_for(transport.clone(), fast_config());
    requester.refresh_uris(["mock://a", "mock://b"]).await.unwrap();
    transport.node("mock://a").fail_calls(closed("mock://a"));
    transport.node("mock://b").fail_calls(closed("mock://b"));

    let err = requester.fire_and_forget(call_payload("log", "1"), &CallOptions::default()).await.unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(transport.node("mock://a").call_count() + transport.node("mock://b").call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stream_retried_before_first_item() {
    let transport = ScriptedTransport::new();
    let requester = requester_for(transport.clone(), fast_config());
    requester.refresh_uris(["mock://a", "mock://b"]).await.unwrap();
    transport.node("mock://a").fail_calls(closed("mock://a"));

    let items: Vec<Payload> = requester
        .request_stream(call_payload("ticks", "3"), CallOptions::default())
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|item| answered_by(item) == "mock://b"));
}

#[tokio::test(start_paused = true)]
async fn test_channel_retried_when_outbound_untouched() {
    let transport = ScriptedTransport::new();
    let requester = requester_for(transport.clone(), fast_config());
    requester.refresh_uris(["mock://a", "mock://b"]).await.unwrap();
    transport.node("mock://a").fail_calls(closed("mock://a"));

    let outbound =
        stream::iter(vec![Ok(Payload::data_only(Bytes::from("2"))), Ok(Payload::data_only(Bytes::from("3")))]).boxed();
    let echoed: Vec<Bytes> = requester
        .request_channel(call_payload("chat", "1"), outbound, CallOptions::default())
        .map(|item| item.unwrap().data)
        .collect()
        .await;
    assert_eq!(echoed, vec![Bytes::from("1"), Bytes::from("2"), Bytes::from("3")]);
    assert_eq!(transport.node("mock://b").call_count(), 1);
}

/// Answers health probes and never answers anything else.
struct Stalled;

#[async_trait]
impl RpcHandler for Stalled {
    async fn request_response(&self, _peer: &str, payload: Payload) -> Result<Payload, UpstreamError> {
        if payload.data.is_empty() {
            return Ok(Payload::data_only(HealthStatus::Serving.encode()));
        }
        std::future::pending().await
    }

    async fn fire_and_forget(&self, _peer: &str, _payload: Payload) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn request_stream(&self, _peer: &str, _payload: Payload) -> Result<PayloadStream, UpstreamError> {
        Ok(stream::empty().boxed())
    }

    async fn request_channel(
        &self,
        _peer: &str,
        _initial: Payload,
        _inbound: PayloadStream,
    ) -> Result<PayloadStream, UpstreamError> {
        Ok(stream::empty().boxed())
    }

    async fn metadata_push(&self, _peer: &str, _metadata: Bytes) -> Result<(), UpstreamError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_not_retried() {
    let transport = Arc::new(LocalTransport::new());
    transport.bind("local://slow", Arc::new(Stalled));
    transport.bind("local://also-slow", Arc::new(Stalled));
    let requester = requester_for(transport, fast_config());
    requester.refresh_uris(["local://slow", "local://also-slow"]).await.unwrap();

    let options = CallOptions::default().with_timeout(Duration::from_millis(200));
    let err = requester.request_response(call_payload("echo", "1"), &options).await.unwrap_err();
    assert_eq!(err, UpstreamError::Timeout);
    assert_eq!(requester.active_uris().len(), 2);
    assert!(requester.unhealthy_uris().is_empty());
}

/// Streams one item per call and then stays open; counts stream calls.
#[derive(Default)]
struct OneThenIdle {
    streams: AtomicUsize,
}

#[async_trait]
impl RpcHandler for OneThenIdle {
    async fn request_response(&self, _peer: &str, payload: Payload) -> Result<Payload, UpstreamError> {
        if payload.data.is_empty() {
            return Ok(Payload::data_only(HealthStatus::Serving.encode()));
        }
        Ok(payload)
    }

    async fn fire_and_forget(&self, _peer: &str, _payload: Payload) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn request_stream(&self, _peer: &str, payload: Payload) -> Result<PayloadStream, UpstreamError> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        Ok(stream::once(async move { Ok(Payload::data_only(payload.data)) }).chain(stream::pending()).boxed())
    }

    async fn request_channel(
        &self,
        _peer: &str,
        _initial: Payload,
        _inbound: PayloadStream,
    ) -> Result<PayloadStream, UpstreamError> {
        Ok(stream::pending().boxed())
    }

    async fn metadata_push(&self, _peer: &str, _metadata: Bytes) -> Result<(), UpstreamError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_stream_closed_after_first_item_errors_without_retry() {
    let transport = Arc::new(LocalTransport::new());
    let handler = Arc::new(OneThenIdle::default());
    transport.bind("local://a", handler.clone());
    transport.bind("local://b", handler.clone());
    let requester = requester_for(transport.clone(), fast_config());
    requester.refresh_uris(["local://a", "local://b"]).await.unwrap();

    let mut items = requester.request_stream(call_payload("ticks", "1"), CallOptions::default());
    let first = items.next().await.unwrap().unwrap();
    assert_eq!(first.data, Bytes::from("1"));

    transport.unbind("local://a");
    transport.unbind("local://b");
    let rest: Vec<_> = items.collect().await;
    assert_eq!(rest.len(), 1, "a cut stream ends with exactly one error");
    assert!(rest[0].as_ref().unwrap_err().is_connection_error());
    assert_eq!(handler.streams.load(Ordering::SeqCst), 1);
}
