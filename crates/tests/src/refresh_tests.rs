//! Address reconciliation scenarios.
//!
//! These tests verify that:
//! - Re-sending the same address set causes no connection churn
//! - A URI never has two live sessions, whatever the interleaving of updates and closes
//! - A dropped URI stays usable for the grace delay and is disposed exactly once after it
//! - A URI whose connect hangs does not hold up later address updates

use std::{sync::Arc, time::Duration};

use mesh_core::{
    service::{ServiceDefinition, ServiceLocator, ServiceRegistry},
    upstream::{CallOptions, LoadBalancedRequester, RequesterContext, SelectionHint},
};

use crate::mock_infrastructure::{answered_by, call_payload, fast_config, requester_for, ScriptedTransport};

#[tokio::test(start_paused = true)]
async fn test_identical_refresh_causes_no_churn() {
    let transport = ScriptedTransport::new();
    let requester = requester_for(transport.clone(), fast_config());

    requester.refresh_uris(["mock://a", "mock://b"]).await.unwrap();
    requester.refresh_uris(["mock://b", "mock://a"]).await.unwrap();
    requester.refresh_uris(vec!["mock://a".to_string(), "mock://b".to_string()]).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    for uri in ["mock://a", "mock://b"] {
        let node = transport.node(uri);
        assert_eq!(node.connect_attempts(), 1, "{uri} reconnected");
        assert_eq!(node.disposes(), 0, "{uri} disposed");
    }
    assert_eq!(requester.active_uris().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_session_per_uri() {
    let transport = ScriptedTransport::new();
    let requester = requester_for(transport.clone(), fast_config());
    let a = transport.node("mock://a");

    let check = |step: &str| assert!(a.live_sessions() <= 1, "two live sessions after {step}");

    requester.refresh_uris(["mock://a"]).await.unwrap();
    check("initial refresh");

    a.close_sessions();
    requester.refresh_uris(["mock://a", "mock://b"]).await.unwrap();
    check("refresh while reconnecting");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    check("reconnect");

    requester.refresh_uris(["mock://b"]).await.unwrap();
    a.close_sessions();
    requester.refresh_uris(["mock://a", "mock://b"]).await.unwrap();
    check("re-advertise after close");

    for _ in 0..5 {
        a.close_sessions();
        tokio::time::sleep(Duration::from_millis(300)).await;
        requester.refresh_uris(["mock://b"]).await.unwrap();
        requester.refresh_uris(["mock://a", "mock://b"]).await.unwrap();
        check("churn");
    }

    tokio::time::sleep(Duration::from_secs(20)).await;
    check("settled");
    assert_eq!(a.live_sessions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_uri_honours_grace_delay() {
    let transport = ScriptedTransport::new();
    let config = fast_config();
    let grace = config.consumer_grace_delay;
    let requester = requester_for(transport.clone(), config);
    let b = transport.node("mock://b");

    requester.refresh_uris(["mock://a", "mock://b"]).await.unwrap();
    requester.refresh_uris(["mock://a"]).await.unwrap();

    tokio::time::sleep(grace - Duration::from_secs(1)).await;
    let pinned = CallOptions::default().with_hint(SelectionHint::endpoint("mock://b"));
    let response = requester.request_response(call_payload("echo", "1"), &pinned).await.unwrap();
    assert_eq!(answered_by(&response), "mock://b");
    assert_eq!(b.disposes(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(requester.active_uris(), vec!["mock://a".to_string()]);
    assert_eq!(b.disposes(), 1);

    tokio::time::sleep(grace * 3).await;
    assert_eq!(b.disposes(), 1);
    assert_eq!(b.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_provider_uses_longer_grace() {
    let registry = Arc::new(ServiceRegistry::new());
    registry
        .register(
            ServiceDefinition::untyped(ServiceLocator::new("", "Local", ""))
                .request_response("ping", |(): (), _ctx| async move { Ok(()) })
                .build(),
        )
        .unwrap();
    let transport = ScriptedTransport::new();
    let config = fast_config();
    let (consumer, provider) = (config.consumer_grace_delay, config.provider_grace_delay);
    let context = RequesterContext::new(transport.clone()).with_config(config).with_registry(registry);
    let requester = LoadBalancedRequester::new("Echo:1.0", &context);

    requester.refresh_uris(["mock://a", "mock://b"]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Every admitted connection is told what this process exposes.
    assert_eq!(transport.node("mock://a").pushes().len(), 1);

    requester.refresh_uris(["mock://a"]).await.unwrap();
    tokio::time::sleep(consumer + Duration::from_secs(1)).await;
    assert_eq!(requester.active_uris().len(), 2);

    tokio::time::sleep(provider - consumer).await;
    assert_eq!(requester.active_uris(), vec!["mock://a".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_first_call_waits_for_initial_update() {
    let transport = ScriptedTransport::new();
    let requester = requester_for(transport.clone(), fast_config());

    let caller = {
        let requester = requester.clone();
        tokio::spawn(async move { requester.request_response(call_payload("echo", "1"), &CallOptions::default()).await })
    };
    tokio::task::yield_now().await;
    requester.submit_uris(["mock://a"]).unwrap();

    let response = caller.await.unwrap().unwrap();
    assert_eq!(answered_by(&response), "mock://a");
}

#[tokio::test(start_paused = true)]
async fn test_hanging_connect_does_not_block_later_updates() {
    let transport = ScriptedTransport::new();
    let config = fast_config();
    let connect_limit = config.health_check_interval;
    let requester = requester_for(transport.clone(), config);
    transport.node("mock://x").hang_connects(true);

    requester.submit_uris(["mock://x"]).unwrap();
    tokio::time::timeout(Duration::from_millis(500), requester.refresh_uris(["mock://x", "mock://b"]))
        .await
        .expect("second update waited on the hanging connect")
        .unwrap();
    assert_eq!(requester.active_uris(), vec!["mock://b".to_string()]);
    assert_eq!(requester.stats().connecting, vec!["mock://x".to_string()]);
    assert_eq!(transport.node("mock://x").connect_attempts(), 1);

    tokio::time::sleep(connect_limit + Duration::from_millis(100)).await;
    assert!(requester.stats().connecting.is_empty());
    assert_eq!(requester.unhealthy_uris(), vec!["mock://x".to_string()]);
    assert_eq!(requester.active_uris(), vec!["mock://b".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_uri_dropped_while_connecting_is_not_admitted() {
    let transport = ScriptedTransport::new();
    let requester = requester_for(transport.clone(), fast_config());
    let x = transport.node("mock://x");
    x.hang_connects(true);

    requester.submit_uris(["mock://x"]).unwrap();
    requester.submit_uris(["mock://b"]).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(requester.active_uris(), vec!["mock://b".to_string()]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(requester.active_uris(), vec!["mock://b".to_string()]);
    assert!(requester.unhealthy_uris().is_empty());
    assert!(requester.stats().reconnecting.is_empty());
    assert_eq!(x.connect_attempts(), 1);
}
