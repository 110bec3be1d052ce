use crate::{
    config::{HostConfig, RetryPolicy, ServerConfig, TRANSPORT_STDIO},
    connection::{Dialect, McpConnection},
    registry::ServerRegistry,
    strategy::{ConnectionStrategy, StrategyRegistry},
};

pub(super) mod prelude {
    pub(crate) use serde_json::{json, Value};
    pub(crate) use std::{
        fs,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        sync::Arc,
        time::{Duration, Instant},
    };
    pub(crate) use tokio::time;
}

use prelude::*;

pub(super) fn write_script(name: &str, script: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join(name);
    fs::write(&script_path, script).expect("write script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

/// Well-behaved MCP server: tools, resources, notifications, and a few
/// misbehaving tools (`slow` never answers, `boom` errors, `die` exits).
/// `DEMO_INIT_DELAY_MS` delays the `initialize` response.
pub(super) fn write_demo_server() -> (tempfile::TempDir, PathBuf) {
    let script = r#"#!/usr/bin/env python3
import json
import os
import sys
import time

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

def log(message):
    sys.stderr.write(message + "\n")
    sys.stderr.flush()

TOOLS = [
    {"name": "ping", "description": "Replies with pong", "inputSchema": {"type": "object", "properties": {}}},
    {"name": "echo", "description": "Echoes the message argument", "inputSchema": {"type": "object", "properties": {"message": {"type": "string"}}}},
    {"name": "slow", "description": "Never answers", "inputSchema": {"type": "object", "properties": {}}},
    {"name": "boom", "description": "Always fails", "inputSchema": {"type": "object", "properties": {}}},
    {"name": "notify", "description": "Emits a notification before answering", "inputSchema": {"type": "object", "properties": {}}},
    {"name": "die", "description": "Exits without answering", "inputSchema": {"type": "object", "properties": {}}},
]
RESOURCES = [
    {"uri": "demo://greeting", "name": "greeting", "description": "A canned greeting", "mimeType": "text/plain"}
]

def handle_tools_call(req_id, params):
    name = params.get("name")
    arguments = params.get("arguments", {})
    if name == "ping":
        send({"jsonrpc": "2.0", "id": req_id, "result": {"content": [{"type": "text", "text": "pong"}], "isError": False}})
    elif name == "echo":
        send({"jsonrpc": "2.0", "id": req_id, "result": {"content": [{"type": "text", "text": arguments.get("message", "")}], "isError": False}})
    elif name == "slow":
        pass
    elif name == "boom":
        send({"jsonrpc": "2.0", "id": req_id, "error": {"code": -32000, "message": "tool exploded"}})
    elif name == "notify":
        send({"jsonrpc": "2.0", "method": "demo/event", "params": {"kind": "tool-side-effect"}})
        send({"jsonrpc": "2.0", "id": req_id, "result": {"content": [], "isError": False}})
    elif name == "die":
        log("dying on request")
        sys.exit(1)
    else:
        send({"jsonrpc": "2.0", "id": req_id, "error": {"code": -32601, "message": "unknown tool"}})

init_delay_ms = int(os.environ.get("DEMO_INIT_DELAY_MS", "0"))

for line in sys.stdin:
    if not line.strip():
        continue
    message = json.loads(line)
    method = message.get("method")
    req_id = message.get("id")
    if method == "initialize":
        if init_delay_ms:
            time.sleep(init_delay_ms / 1000.0)
        send({"jsonrpc": "2.0", "id": req_id, "result": {"serverInfo": {"name": "demo", "version": "0.1.0"}, "capabilities": {"tools": {}, "resources": {}}}})
    elif method == "notifications/initialized":
        log("client initialized")
    elif method == "tools/list":
        send({"jsonrpc": "2.0", "id": req_id, "result": {"tools": TOOLS}})
    elif method == "tools/call":
        handle_tools_call(req_id, message.get("params", {}))
    elif method == "resources/list":
        send({"jsonrpc": "2.0", "id": req_id, "result": {"resources": RESOURCES}})
    elif method == "resources/read":
        uri = message.get("params", {}).get("uri")
        if uri == "demo://greeting":
            send({"jsonrpc": "2.0", "id": req_id, "result": {"contents": [{"uri": uri, "mimeType": "text/plain", "text": "hello"}]}})
        else:
            send({"jsonrpc": "2.0", "id": req_id, "error": {"code": -32002, "message": "unknown resource"}})
    elif req_id is not None:
        send({"jsonrpc": "2.0", "id": req_id, "error": {"code": -32601, "message": "unknown method"}})
"#;
    write_script("demo-mcp", script)
}

/// Server that floods stdout with banner text before and between JSON-RPC
/// replies, the way misconfigured children leak log output.
pub(super) fn write_noisy_server() -> (tempfile::TempDir, PathBuf) {
    let script = r#"#!/usr/bin/env python3
import json
import sys

sys.stdout.write("INFO  demo server booting\n")
for index in range(150):
    sys.stdout.write("banner line %03d ================================ status=starting\n" % index)
sys.stdout.write("========\n")
sys.stdout.flush()

def send(payload):
    sys.stdout.write("INFO  about to reply\n")
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    if not line.strip():
        continue
    message = json.loads(line)
    method = message.get("method")
    req_id = message.get("id")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": req_id, "result": {"serverInfo": {"name": "noisy", "version": "0.1.0"}, "capabilities": {}}})
    elif method == "notifications/initialized":
        pass
    elif method == "tools/list":
        send({"jsonrpc": "2.0", "id": req_id, "result": {"tools": []}})
    elif method == "tools/call":
        send({"jsonrpc": "2.0", "id": req_id, "result": {"content": [{"type": "text", "text": "pong"}], "isError": False}})
    elif req_id is not None:
        send({"jsonrpc": "2.0", "id": req_id, "error": {"code": -32601, "message": "unknown method"}})
"#;
    write_script("noisy-mcp", script)
}

/// Server that reads stdin but never writes a byte.
pub(super) fn write_silent_server() -> (tempfile::TempDir, PathBuf) {
    let script = r#"#!/usr/bin/env python3
import sys

for line in sys.stdin:
    pass
"#;
    write_script("silent-mcp", script)
}

/// Server that refuses the handshake with a JSON-RPC error.
pub(super) fn write_broken_server() -> (tempfile::TempDir, PathBuf) {
    let script = r#"#!/usr/bin/env python3
import json
import sys

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    if not line.strip():
        continue
    message = json.loads(line)
    if message.get("method") == "initialize":
        send({"jsonrpc": "2.0", "id": message.get("id"), "error": {"code": -32099, "message": "refusing to initialize"}})
"#;
    write_script("broken-mcp", script)
}

pub(super) fn server_config(command: &Path) -> ServerConfig {
    let mut config = ServerConfig::new(command.to_string_lossy());
    config.timeout_ms = Some(2000);
    config
}

/// Standard-dialect policy without the warmup pause, so tests stay fast.
pub(super) fn quick_dialect() -> Dialect {
    Dialect {
        name: "standard",
        warmup: Duration::ZERO,
        handshake_attempts: 2,
        handshake_retry_delay: Duration::from_millis(100),
        handshake_timeout_floor: Duration::from_secs(2),
    }
}

pub(super) struct QuickStdioStrategy;

impl ConnectionStrategy for QuickStdioStrategy {
    fn supports(&self, transport: &str) -> bool {
        transport == TRANSPORT_STDIO
    }

    fn create(&self, server_id: &str, config: ServerConfig) -> McpConnection {
        McpConnection::new(server_id, config, quick_dialect())
    }
}

pub(super) fn host_config(servers: Vec<(&str, ServerConfig)>) -> HostConfig {
    let mut config = HostConfig::default();
    config.defaults.retry = RetryPolicy {
        max_attempts: 2,
        initial_delay_ms: 50,
        multiplier: 2.0,
    };
    for (id, server) in servers {
        config.servers.insert(id.to_string(), server);
    }
    config
}

pub(super) fn quick_registry(config: HostConfig) -> ServerRegistry {
    let mut strategies = StrategyRegistry::new();
    strategies.register(Box::new(QuickStdioStrategy));
    ServerRegistry::with_strategies(config, strategies)
}

pub(super) async fn start_demo_connection() -> (tempfile::TempDir, Arc<McpConnection>) {
    let (dir, script) = write_demo_server();
    let connection = Arc::new(McpConnection::new(
        "demo",
        server_config(&script),
        quick_dialect(),
    ));
    connection.initialize().await.expect("initialize demo server");
    (dir, connection)
}
