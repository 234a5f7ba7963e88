//! Cluster manager routing, broker fallback and discovery.
//!
//! These tests verify that:
//! - A routed service id resolves to its own cluster and anything else to the broker
//! - Without a broker an unknown service id is a routing error
//! - Builder settings flow into every requester the manager creates
//! - Discovery events create, refresh and drain clusters
//! - Disposing the manager disposes every cluster and connection

use std::{sync::Arc, time::Duration};

use mesh_core::{
    config::{RouteSettings, UpstreamSettings},
    service::ServiceLocator,
    upstream::{
        BuilderError, CallOptions, DiscoveryEvent, LoadBalanceKind, UpstreamClusterManager, UpstreamError,
        BROKER_SERVICE_NAME,
    },
};
use tokio::sync::mpsc;

use crate::mock_infrastructure::{answered_by, call_payload, echo_locator, fast_config, ScriptedTransport};

fn manager_with(transport: &Arc<ScriptedTransport>) -> Arc<UpstreamClusterManager> {
    UpstreamClusterManager::builder()
        .transport(transport.clone())
        .config(fast_config())
        .route("Echo:1.0", ["mock://echo"])
        .broker_uris(["mock://broker"])
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_routed_service_and_broker_fallback() {
    let transport = ScriptedTransport::new();
    let manager = manager_with(&transport);

    let echo = manager.select_locator(&echo_locator()).unwrap();
    assert!(!echo.is_broker());
    assert_eq!(echo.service_id(), echo_locator().id());
    let response = echo.requester().request_response(call_payload("echo", "1"), &CallOptions::default()).await.unwrap();
    assert_eq!(answered_by(&response), "mock://echo");

    let unknown = ServiceLocator::new("", "Inventory", "2.0");
    let fallback = manager.select_locator(&unknown).unwrap();
    assert!(fallback.is_broker());
    assert_eq!(fallback.locator().name(), BROKER_SERVICE_NAME);
    let response =
        fallback.requester().request_response(call_payload("echo", "1"), &CallOptions::default()).await.unwrap();
    assert_eq!(answered_by(&response), "mock://broker");

    assert_eq!(manager.len(), 1);
    assert!(manager.cluster(unknown.id()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_service_without_broker() {
    let transport = ScriptedTransport::new();
    let manager = UpstreamClusterManager::builder().transport(transport).config(fast_config()).build().unwrap();

    let err = manager.select_locator(&echo_locator()).unwrap_err();
    assert_eq!(err, UpstreamError::NoRoute("Echo:1.0".to_string()));

    manager.install_broker(["mock://broker"]).unwrap();
    assert!(manager.select_locator(&echo_locator()).unwrap().is_broker());

    assert!(manager.clear_broker());
    assert!(matches!(manager.select_locator(&echo_locator()), Err(UpstreamError::NoRoute(_))));
}

#[tokio::test(start_paused = true)]
async fn test_builder_applies_settings() {
    let settings = UpstreamSettings {
        brokers: vec!["mock://broker".to_string()],
        routes: vec![
            RouteSettings { service: "Echo:1.0".to_string(), uris: vec!["mock://a".to_string()] },
            RouteSettings { service: "shop!Cart".to_string(), uris: vec!["mock://cart".to_string()] },
        ],
        load_balance: "random".to_string(),
        reconnect_attempts: 2,
        consumer_grace_seconds: 7,
        ..UpstreamSettings::default()
    };

    let transport = ScriptedTransport::new();
    let manager = UpstreamClusterManager::builder().transport(transport).settings(&settings).unwrap().build().unwrap();

    assert_eq!(manager.context().load_balance, LoadBalanceKind::Random);
    assert_eq!(manager.context().config.reconnect_attempts, 2);
    assert_eq!(manager.context().config.consumer_grace_delay, Duration::from_secs(7));

    let services: Vec<String> = manager.clusters().iter().map(|cluster| cluster.locator().gsv().to_string()).collect();
    assert_eq!(services, vec!["Echo:1.0".to_string(), "shop!Cart".to_string()]);
    for cluster in manager.clusters() {
        assert_eq!(cluster.stats().strategy, "random");
        assert_eq!(cluster.requester().config().reconnect_attempts, 2);
    }
    assert!(manager.broker().is_some());
}

#[tokio::test]
async fn test_builder_rejects_bad_settings() {
    let bad_strategy = UpstreamSettings { load_balance: "fastest".to_string(), ..UpstreamSettings::default() };
    let result = UpstreamClusterManager::builder().settings(&bad_strategy);
    assert!(matches!(result, Err(BuilderError::InvalidStrategy(_))));

    let result = UpstreamClusterManager::builder()
        .transport(ScriptedTransport::new())
        .route("a!b!c", ["mock://a"])
        .build();
    assert!(matches!(result, Err(BuilderError::InvalidRoute { ref route, .. }) if route == "a!b!c"));

    let result = UpstreamClusterManager::builder().route("Echo:1.0", ["mock://a"]).build();
    assert!(matches!(result, Err(BuilderError::MissingTransport)));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_events_drive_clusters() {
    let transport = ScriptedTransport::new();
    let manager = UpstreamClusterManager::builder().transport(transport.clone()).config(fast_config()).build().unwrap();
    let (events, receiver) = mpsc::channel(8);
    let listener = manager.spawn_discovery_listener(receiver);

    events.send(DiscoveryEvent::new("Echo:1.0", ["mock://a", "mock://b"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let cluster = manager.select_locator(&echo_locator()).unwrap();
    assert_eq!(cluster.requester().active_uris(), vec!["mock://a".to_string(), "mock://b".to_string()]);

    events.send(DiscoveryEvent::new("Echo:1.0", ["mock://b"])).await.unwrap();
    events.send(DiscoveryEvent::new("bad!name!", Vec::<String>::new())).await.unwrap();
    tokio::time::sleep(fast_config().consumer_grace_delay + Duration::from_secs(1)).await;
    assert_eq!(cluster.requester().active_uris(), vec!["mock://b".to_string()]);
    assert_eq!(transport.node("mock://a").disposes(), 1);

    events.send(DiscoveryEvent::new("Echo:1.0", Vec::<String>::new())).await.unwrap();
    tokio::time::sleep(fast_config().consumer_grace_delay + Duration::from_secs(1)).await;
    assert!(cluster.requester().active_uris().is_empty());
    // A drained cluster stays routable.
    assert!(Arc::ptr_eq(&manager.select_locator(&echo_locator()).unwrap(), &cluster));

    drop(events);
    listener.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_remove_and_dispose_cascade() {
    let transport = ScriptedTransport::new();
    let manager = manager_with(&transport);
    let inventory = ServiceLocator::new("", "Inventory", "");
    manager.refresh(inventory.clone(), ["mock://inventory"]).await.unwrap();
    manager.select_locator(&echo_locator()).unwrap().refresh_uris(["mock://echo"]).await.unwrap();
    manager.broker().unwrap().refresh_uris(["mock://broker"]).await.unwrap();

    assert!(manager.remove(inventory.id()));
    assert!(!manager.remove(inventory.id()));
    assert_eq!(transport.node("mock://inventory").disposes(), 1);
    assert!(manager.select_locator(&inventory).unwrap().is_broker());

    let echo = manager.select_locator(&echo_locator()).unwrap();
    manager.dispose();
    manager.dispose();
    assert!(echo.is_disposed());
    for uri in ["mock://echo", "mock://broker"] {
        assert_eq!(transport.node(uri).disposes(), 1, "{uri}");
    }
    assert!(manager.select_locator(&echo_locator()).unwrap_err().is_disposed());
    assert!(manager.refresh(inventory, ["mock://inventory"]).await.unwrap_err().is_disposed());
}
