use super::super::test_support::{prelude::*, *};
use crate::{ConnectionState, HostError, ServerConfig};

#[tokio::test]
async fn initialize_all_connects_enabled_servers() {
    let (_dir_a, script_a) = write_demo_server();
    let (_dir_b, script_b) = write_demo_server();
    let mut retired = server_config(&script_b);
    retired.enabled = false;

    let registry = quick_registry(host_config(vec![
        ("alpha", server_config(&script_a)),
        ("beta", server_config(&script_b)),
        ("retired", retired),
    ]));
    registry.initialize_all().await;

    assert_eq!(registry.list(), vec!["alpha".to_string(), "beta".to_string()]);
    assert!(registry.get("alpha").is_ok());
    assert!(matches!(
        registry.get("retired"),
        Err(HostError::NotFound { .. })
    ));

    let info = registry.server_info("alpha").expect("lookup").expect("info");
    assert_eq!(info.name, "demo");

    registry.shutdown().await;
}

#[tokio::test]
async fn aggregate_health_and_tools_survive_a_dead_server() {
    let (_dir_a, script_a) = write_demo_server();
    let (_dir_b, script_b) = write_demo_server();
    let registry = quick_registry(host_config(vec![
        ("alpha", server_config(&script_a)),
        ("bravo", server_config(&script_b)),
    ]));
    registry.initialize_all().await;

    // Kill bravo's process out from under its connection.
    let _ = registry.execute_tool("bravo", "die", None).await;

    let health = registry.health().await;
    assert_eq!(health.get("alpha"), Some(&true));
    assert_eq!(health.get("bravo"), Some(&false));

    let tools = registry.all_tools().await;
    assert!(tools["alpha"].iter().any(|tool| tool.name == "ping"));
    assert!(tools["bravo"].is_empty());

    registry.shutdown().await;
}

#[tokio::test]
async fn failed_server_is_evicted_without_affecting_the_rest() {
    let (_dir, script) = write_demo_server();
    let mut ghost = ServerConfig::new("/nonexistent/mcp-server");
    ghost.timeout_ms = Some(1000);

    let registry = quick_registry(host_config(vec![
        ("alpha", server_config(&script)),
        ("ghost", ghost),
    ]));
    registry.initialize_all().await;

    assert!(registry.get("alpha").is_ok());
    // Still configured, but its connection was evicted.
    assert!(matches!(
        registry.get("ghost"),
        Err(HostError::NotReady { .. })
    ));
    assert!(registry.list().contains(&"ghost".to_string()));

    assert!(!registry.is_healthy("ghost").await);

    registry.shutdown().await;
}

#[tokio::test]
async fn add_and_remove_mutate_the_fleet() {
    let (_dir, script) = write_demo_server();
    let registry = quick_registry(host_config(vec![]));

    registry
        .add("alpha", server_config(&script))
        .await
        .expect("add");
    assert!(registry.get("alpha").is_ok());
    assert!(matches!(
        registry.add("alpha", server_config(&script)).await,
        Err(HostError::AlreadyExists { .. })
    ));

    let connection = registry.get("alpha").expect("connection");
    registry.remove("alpha").await.expect("remove");
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(
        registry.get("alpha"),
        Err(HostError::NotFound { .. })
    ));
    assert!(matches!(
        registry.remove("alpha").await,
        Err(HostError::NotFound { .. })
    ));

    // A removed id is free for re-registration.
    registry
        .add("alpha", server_config(&script))
        .await
        .expect("re-add");
    registry.shutdown().await;
}

#[tokio::test]
async fn failed_add_unwinds_the_registration() {
    let registry = quick_registry(host_config(vec![]));
    let mut ghost = ServerConfig::new("/nonexistent/mcp-server");
    ghost.timeout_ms = Some(1000);

    assert!(matches!(
        registry.add("ghost", ghost.clone()).await,
        Err(HostError::TransportStart { .. })
    ));
    assert!(matches!(
        registry.get("ghost"),
        Err(HostError::NotFound { .. })
    ));
    // The id is free to try again.
    assert!(registry.add("ghost", ghost).await.is_err());
}

#[tokio::test]
async fn add_with_unknown_transport_is_rejected() {
    let registry = quick_registry(host_config(vec![]));
    let mut config = ServerConfig::new("whatever");
    config.transport = "streamable-http".into();

    assert!(matches!(
        registry.add("web", config).await,
        Err(HostError::UnknownTransport { .. })
    ));
    assert!(matches!(
        registry.get("web"),
        Err(HostError::NotFound { .. })
    ));
}

#[tokio::test]
async fn disabled_servers_are_registered_but_not_connected() {
    let (_dir, script) = write_demo_server();
    let registry = quick_registry(host_config(vec![]));
    let mut config = server_config(&script);
    config.enabled = false;

    registry.add("dormant", config).await.expect("add");
    assert!(matches!(
        registry.get("dormant"),
        Err(HostError::NotFound { .. })
    ));
    assert!(registry.list().is_empty());
}

#[tokio::test]
async fn shutdown_closes_connections_and_clears_the_map() {
    let (_dir, script) = write_demo_server();
    let registry = quick_registry(host_config(vec![("alpha", server_config(&script))]));
    registry.initialize_all().await;

    let connection = registry.get("alpha").expect("connection");
    registry.shutdown().await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!connection.is_healthy().await);
    assert!(matches!(
        registry.get("alpha"),
        Err(HostError::NotReady { .. })
    ));
}

#[tokio::test]
async fn is_healthy_defaults_to_false_for_unknown_servers() {
    let registry = quick_registry(host_config(vec![]));
    assert!(!registry.is_healthy("nope").await);
}

#[tokio::test]
async fn notifications_reach_subscribers_through_the_registry() {
    let (_dir, script) = write_demo_server();
    let registry = quick_registry(host_config(vec![("alpha", server_config(&script))]));
    registry.initialize_all().await;

    let mut events = registry.subscribe("alpha").await.expect("subscribe");
    let _ = registry
        .execute_tool("alpha", "notify", None)
        .await
        .expect("notify tool");

    let event = time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event timeout")
        .expect("event");
    assert_eq!(event.method, "demo/event");

    registry.shutdown().await;
}
