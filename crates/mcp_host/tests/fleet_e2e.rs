//! End-to-end exercise of the public API against a real child process.

use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf};

use mcp_host::{HostConfig, ServerConfig, ServerRegistry, ToolCatalog};

const DEMO_SERVER: &str = r#"#!/usr/bin/env python3
import json
import sys

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

TOOLS = [
    {"name": "ping", "description": "Replies with pong", "inputSchema": {"type": "object", "properties": {}}}
]

for line in sys.stdin:
    if not line.strip():
        continue
    message = json.loads(line)
    method = message.get("method")
    req_id = message.get("id")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": req_id, "result": {"serverInfo": {"name": "e2e", "version": "1.0.0"}, "capabilities": {"tools": {}}}})
    elif method == "notifications/initialized":
        sys.stderr.write("client ready\n")
    elif method == "tools/list":
        send({"jsonrpc": "2.0", "id": req_id, "result": {"tools": TOOLS}})
    elif method == "tools/call":
        send({"jsonrpc": "2.0", "id": req_id, "result": {"content": [{"type": "text", "text": "pong"}], "isError": False}})
    elif req_id is not None:
        send({"jsonrpc": "2.0", "id": req_id, "error": {"code": -32601, "message": "unknown method"}})
"#;

fn write_server() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("e2e-mcp");
    fs::write(&script_path, DEMO_SERVER).expect("write script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

#[tokio::test]
async fn fleet_round_trip_over_the_public_api() {
    let (_dir, script) = write_server();

    let mut server = ServerConfig::new(script.to_string_lossy());
    server.timeout_ms = Some(5000);
    let mut config = HostConfig::default();
    config.servers.insert("demo".into(), server);

    let registry = ServerRegistry::new(config);
    registry.initialize_all().await;

    assert_eq!(registry.list(), vec!["demo".to_string()]);
    let info = registry
        .server_info("demo")
        .expect("lookup")
        .expect("cached info");
    assert_eq!(info.name, "e2e");

    let result = registry
        .execute_tool("demo", "ping", None)
        .await
        .expect("ping");
    assert!(!result.is_error);
    assert_eq!(result.content[0].text.as_deref(), Some("pong"));

    let catalog = ToolCatalog::new();
    let tools = catalog.get(&registry).await;
    assert!(tools["demo"].iter().any(|tool| tool.name == "ping"));

    let health = registry.health().await;
    assert_eq!(health.get("demo"), Some(&true));

    registry.shutdown().await;
    assert!(!registry.is_healthy("demo").await);
}

#[tokio::test]
async fn config_round_trips_through_toml() {
    let config = HostConfig::from_toml_str(
        r#"
        [defaults]
        timeout_ms = 2500

        [servers.demo]
        command = "demo-mcp-server"
        args = ["--verbose"]
        "#,
    )
    .expect("parse");

    let server = &config.servers["demo"];
    assert_eq!(server.command, "demo-mcp-server");
    assert_eq!(server.timeout_ms, Some(2500));
}
