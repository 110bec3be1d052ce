use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use super::super::test_support::{prelude::*, *};
use crate::{ToolCatalog, ToolDescriptor};

fn sample_catalog(marker: &str) -> HashMap<String, Vec<ToolDescriptor>> {
    let tool: ToolDescriptor = serde_json::from_value(json!({
        "name": marker,
        "description": "sample",
        "inputSchema": { "type": "object", "properties": {} }
    }))
    .expect("tool");
    HashMap::from([("demo".to_string(), vec![tool])])
}

#[tokio::test]
async fn serves_cached_copies_within_the_ttl() {
    let refreshes = AtomicUsize::new(0);
    let catalog = ToolCatalog::with_ttl(Duration::from_secs(60));

    for _ in 0..3 {
        let snapshot = catalog
            .get_with(|| async {
                refreshes.fetch_add(1, Ordering::SeqCst);
                sample_catalog("v1")
            })
            .await;
        assert_eq!(snapshot["demo"][0].name, "v1");
    }
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ttl_expiry_triggers_a_refresh() {
    let catalog = ToolCatalog::with_ttl(Duration::from_millis(50));

    let first = catalog.get_with(|| async { sample_catalog("v1") }).await;
    assert_eq!(first["demo"][0].name, "v1");

    time::sleep(Duration::from_millis(80)).await;
    let second = catalog.get_with(|| async { sample_catalog("v2") }).await;
    assert_eq!(second["demo"][0].name, "v2");
}

#[tokio::test]
async fn invalidate_forces_the_next_read_to_refresh() {
    let catalog = ToolCatalog::with_ttl(Duration::from_secs(60));
    catalog.get_with(|| async { sample_catalog("v1") }).await;
    assert!(catalog.age().is_some());

    catalog.invalidate();
    let snapshot = catalog.get_with(|| async { sample_catalog("v2") }).await;
    assert_eq!(snapshot["demo"][0].name, "v2");
}

#[tokio::test]
async fn concurrent_stale_reads_coalesce_into_one_refresh() {
    let catalog = Arc::new(ToolCatalog::with_ttl(Duration::from_secs(60)));
    let refreshes = Arc::new(AtomicUsize::new(0));

    let mut join_set = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let catalog = Arc::clone(&catalog);
        let refreshes = Arc::clone(&refreshes);
        join_set.spawn(async move {
            catalog
                .get_with(|| async move {
                    refreshes.fetch_add(1, Ordering::SeqCst);
                    time::sleep(Duration::from_millis(100)).await;
                    sample_catalog("v1")
                })
                .await
        });
    }

    while let Some(joined) = join_set.join_next().await {
        let snapshot = joined.expect("join");
        // Readers observe the published snapshot, never a torn value.
        assert_eq!(snapshot["demo"][0].name, "v1");
    }
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reflects_the_registry_catalog() {
    let (_dir, script) = write_demo_server();
    let registry = quick_registry(host_config(vec![("demo", server_config(&script))]));
    registry.initialize_all().await;

    let catalog = ToolCatalog::new();
    let snapshot = catalog.get(&registry).await;
    assert!(snapshot["demo"].iter().any(|tool| tool.name == "ping"));

    // The cache holds value copies: removing the server leaves the cached
    // snapshot readable until it expires.
    registry.remove("demo").await.expect("remove");
    let cached = catalog.get(&registry).await;
    assert!(cached["demo"].iter().any(|tool| tool.name == "ping"));

    registry.shutdown().await;
}
