//! Per-server connection state machine.
//!
//! A connection moves `NEW → STARTING → HANDSHAKING → READY → CLOSING →
//! CLOSED`; `FAILED` is terminal and reachable from any pre-READY state. The
//! handshake sends one `initialize` request (retried per dialect), caches the
//! server's identity block, then emits `notifications/initialized`. Public
//! operations queue behind a FIFO gate held for the whole handshake, so a
//! caller that arrives early proceeds once READY and never observes a
//! half-initialized server.

use std::{
    cmp,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{sync::broadcast, time};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    error::HostError,
    model::{
        ClientInfo, InitializeParams, ResourceContent, ResourceDescriptor, ServerInfo,
        ToolDescriptor, ToolResult,
    },
    mux::{RequestMultiplexer, ServerNotification},
    protocol::{
        Envelope, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_RESOURCES_LIST,
        METHOD_RESOURCES_READ, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, PROTOCOL_VERSION,
    },
    transport::StdioTransport,
};

/// Budget for the `tools/list` probe behind `is_healthy`.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Voluntary-exit grace during `close` before the child is killed.
const STOP_GRACE: Duration = Duration::from_secs(8);
/// Teardown grace used when a failed handshake discards the child.
const STARTUP_TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Handshake timing and retry policy; the only thing that distinguishes wire
/// dialects. Once READY the dialects are indistinguishable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dialect {
    pub name: &'static str,
    /// Delay between spawning the child and the first `initialize`.
    pub warmup: Duration,
    /// Total `initialize` attempts before the connection fails.
    pub handshake_attempts: u32,
    /// Fixed delay between handshake attempts.
    pub handshake_retry_delay: Duration,
    /// Lower bound on the handshake deadline, whatever the server's timeout.
    pub handshake_timeout_floor: Duration,
}

impl Dialect {
    /// Policy for ordinary stdio servers.
    pub const fn standard() -> Self {
        Self {
            name: "standard",
            warmup: Duration::from_millis(500),
            handshake_attempts: 3,
            handshake_retry_delay: Duration::from_secs(2),
            handshake_timeout_floor: Duration::from_secs(10),
        }
    }

    /// Policy for servers that need a long boot before speaking JSON-RPC.
    pub const fn heavy_start() -> Self {
        Self {
            name: "heavy-start",
            warmup: Duration::from_secs(8),
            handshake_attempts: 1,
            handshake_retry_delay: Duration::ZERO,
            handshake_timeout_floor: Duration::from_secs(15),
        }
    }

    fn handshake_timeout(&self, config_timeout: Duration) -> Duration {
        cmp::max(config_timeout, self.handshake_timeout_floor)
    }
}

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Starting,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Failed,
}

#[derive(Clone)]
struct Link {
    transport: Arc<StdioTransport>,
    mux: Arc<RequestMultiplexer>,
}

/// One managed MCP server: child process, multiplexer, and handshake state.
pub struct McpConnection {
    server_id: String,
    config: ServerConfig,
    dialect: Dialect,
    state: Mutex<ConnectionState>,
    /// Held for the whole handshake; public operations queue behind it in
    /// FIFO order.
    gate: tokio::sync::Mutex<()>,
    link: Mutex<Option<Link>>,
    server_info: Mutex<Option<ServerInfo>>,
}

impl McpConnection {
    pub fn new(server_id: impl Into<String>, config: ServerConfig, dialect: Dialect) -> Self {
        Self {
            server_id: server_id.into(),
            config,
            dialect,
            state: Mutex::new(ConnectionState::New),
            gate: tokio::sync::Mutex::new(()),
            link: Mutex::new(None),
            server_info: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Spawns the child, runs the warmup and handshake, and opens the gate.
    pub async fn initialize(&self) -> Result<(), HostError> {
        let _gate = self.gate.lock().await;
        if self.state() != ConnectionState::New {
            return Err(HostError::Handshake {
                server: self.server_id.clone(),
                reason: format!("cannot initialize from state {:?}", self.state()),
            });
        }
        self.set_state(ConnectionState::Starting);

        let (transport, inbound) = match StdioTransport::spawn(&self.server_id, &self.config) {
            Ok(spawned) => spawned,
            Err(err) => {
                self.fail_startup();
                return Err(err);
            }
        };
        let transport = Arc::new(transport);
        let mux = Arc::new(RequestMultiplexer::new(
            &self.server_id,
            Arc::clone(&transport),
            inbound,
            self.config.timeout(),
        ));
        *lock(&self.link) = Some(Link {
            transport: Arc::clone(&transport),
            mux: Arc::clone(&mux),
        });

        if !self.dialect.warmup.is_zero() {
            time::sleep(self.dialect.warmup).await;
        }
        self.set_state(ConnectionState::Handshaking);

        let startup = async {
            let result = self.handshake_with_retry(&mux).await?;
            let info = ServerInfo::from_handshake(&self.server_id, &result);
            mux.notify(METHOD_INITIALIZED, Some(json!({})))?;
            Ok::<ServerInfo, HostError>(info)
        };

        match startup.await {
            Ok(info) => {
                *lock(&self.server_info) = Some(info);
                self.set_state(ConnectionState::Ready);
                info!(server = %self.server_id, dialect = self.dialect.name, "MCP server ready");
                Ok(())
            }
            Err(err) => {
                warn!(server = %self.server_id, %err, "handshake failed");
                *lock(&self.link) = None;
                mux.shutdown();
                transport.stop(STARTUP_TEARDOWN_GRACE).await;
                self.fail_startup();
                Err(HostError::Handshake {
                    server: self.server_id.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn handshake_with_retry(&self, mux: &RequestMultiplexer) -> Result<Value, HostError> {
        let params = serde_json::to_value(InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({ "roots": { "listChanged": true }, "sampling": {} }),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })?;
        let timeout = self.dialect.handshake_timeout(self.config.timeout());
        let attempts = cmp::max(self.dialect.handshake_attempts, 1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match mux
                .call(METHOD_INITIALIZE, Some(params.clone()), timeout)
                .await
            {
                Ok(result) => return Ok(result),
                Err(err) if attempt < attempts => {
                    debug!(server = %self.server_id, attempt, %err, "retrying handshake");
                    time::sleep(self.dialect.handshake_retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// `tools/list`. An empty list is a valid success.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, HostError> {
        self.await_ready().await?;
        let link = self.link()?;
        let value = link
            .mux
            .call(METHOD_TOOLS_LIST, Some(json!({})), self.config.timeout())
            .await?;
        let tools = value
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| self.protocol_error("`tools/list` response lacks a `tools` array"))?;
        tools
            .iter()
            .cloned()
            .map(|tool| {
                serde_json::from_value(tool)
                    .map_err(|err| self.protocol_error(format!("malformed tool descriptor: {err}")))
            })
            .collect()
    }

    /// `tools/call`. A server-reported error comes back as an error-flagged
    /// result rather than a failure; transport and decode faults still fail.
    pub async fn execute_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<ToolResult, HostError> {
        self.await_ready().await?;
        let link = self.link()?;
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });
        match link
            .mux
            .call(METHOD_TOOLS_CALL, Some(params), self.config.timeout())
            .await
        {
            Ok(value) => serde_json::from_value(value)
                .map_err(|err| self.protocol_error(format!("malformed tool result: {err}"))),
            Err(HostError::Server { message, .. }) => Ok(ToolResult::from_server_error(message)),
            Err(err) => Err(err),
        }
    }

    /// `resources/list`.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, HostError> {
        self.await_ready().await?;
        let link = self.link()?;
        let value = link
            .mux
            .call(METHOD_RESOURCES_LIST, Some(json!({})), self.config.timeout())
            .await?;
        let resources = value.get("resources").and_then(Value::as_array).ok_or_else(|| {
            self.protocol_error("`resources/list` response lacks a `resources` array")
        })?;
        resources
            .iter()
            .cloned()
            .map(|resource| {
                serde_json::from_value(resource).map_err(|err| {
                    self.protocol_error(format!("malformed resource descriptor: {err}"))
                })
            })
            .collect()
    }

    /// `resources/read`. Server-reported errors surface as error text content.
    pub async fn read_resource(&self, uri: &str) -> Result<ResourceContent, HostError> {
        self.await_ready().await?;
        let link = self.link()?;
        match link
            .mux
            .call(
                METHOD_RESOURCES_READ,
                Some(json!({ "uri": uri })),
                self.config.timeout(),
            )
            .await
        {
            Ok(value) => {
                // Servers answer with either the content object itself or a
                // `contents` list; take the first entry of the latter.
                let content = value
                    .get("contents")
                    .and_then(Value::as_array)
                    .and_then(|contents| contents.first())
                    .cloned()
                    .unwrap_or(value);
                serde_json::from_value(content)
                    .map_err(|err| self.protocol_error(format!("malformed resource content: {err}")))
            }
            Err(HostError::Server { message, .. }) => {
                Ok(ResourceContent::from_server_error(uri, message))
            }
            Err(err) => Err(err),
        }
    }

    /// Raw passthrough: injects an envelope and returns the matching response.
    ///
    /// Requests are re-issued under a fresh id (ids are never reused on a
    /// connection); notifications are fire-and-forget and yield `None`.
    pub async fn send_message(&self, envelope: Envelope) -> Result<Option<Envelope>, HostError> {
        self.await_ready().await?;
        let link = self.link()?;
        match envelope {
            Envelope::Request { method, params, .. } => {
                let (id, outcome) = link
                    .mux
                    .call_raw(&method, params, self.config.timeout())
                    .await?;
                Ok(Some(Envelope::Response { id, outcome }))
            }
            Envelope::Notification { method, params } => {
                link.mux.notify(&method, params)?;
                Ok(None)
            }
            Envelope::Response { .. } => {
                Err(self.protocol_error("cannot inject a response envelope"))
            }
        }
    }

    /// Identity block cached from the handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        lock(&self.server_info).clone()
    }

    /// Liveness probe: alive process, READY state, and a `tools/list` answer
    /// within a short budget.
    pub async fn is_healthy(&self) -> bool {
        if self.state() != ConnectionState::Ready {
            return false;
        }
        let Ok(link) = self.link() else {
            return false;
        };
        if !link.transport.is_alive() {
            return false;
        }
        link.mux
            .call(METHOD_TOOLS_LIST, Some(json!({})), HEALTH_PROBE_TIMEOUT)
            .await
            .is_ok()
    }

    /// Subscribes to server notifications. Late subscribers do not see past
    /// notifications; slow subscribers drop rather than block the reader.
    pub async fn notifications(
        &self,
    ) -> Result<broadcast::Receiver<ServerNotification>, HostError> {
        self.await_ready().await?;
        let link = self.link()?;
        Ok(link.mux.subscribe())
    }

    /// Tears the connection down. Each step is bounded so close cannot hang:
    /// pending calls fail with `ConnectionClosed`, the janitor and dispatcher
    /// stop, stdin closes, and the child is waited on then killed.
    pub async fn close(&self) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }

        let link = lock(&self.link).take();
        if let Some(link) = link {
            link.mux.shutdown();
            link.transport.stop(STOP_GRACE).await;
        }

        self.set_state(ConnectionState::Closed);
    }

    /// FIFO gate: queue behind any in-flight handshake, then require READY.
    async fn await_ready(&self) -> Result<(), HostError> {
        let _gate = self.gate.lock().await;
        match self.state() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::New | ConnectionState::Starting | ConnectionState::Handshaking => {
                Err(HostError::NotReady {
                    server: self.server_id.clone(),
                })
            }
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                Err(HostError::ConnectionClosed {
                    server: self.server_id.clone(),
                })
            }
        }
    }

    fn link(&self) -> Result<Link, HostError> {
        lock(&self.link)
            .clone()
            .ok_or_else(|| HostError::ConnectionClosed {
                server: self.server_id.clone(),
            })
    }

    fn set_state(&self, next: ConnectionState) {
        *lock(&self.state) = next;
    }

    /// Marks the startup as failed unless a concurrent `close` already won.
    fn fail_startup(&self) {
        let mut state = lock(&self.state);
        if matches!(
            *state,
            ConnectionState::Starting | ConnectionState::Handshaking
        ) {
            *state = ConnectionState::Failed;
        }
    }

    fn protocol_error(&self, detail: impl Into<String>) -> HostError {
        HostError::Protocol {
            server: self.server_id.clone(),
            detail: detail.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_requests(&self) -> usize {
        self.link().map(|link| link.mux.pending_len()).unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialects_differ_only_in_handshake_policy() {
        let standard = Dialect::standard();
        assert_eq!(standard.warmup, Duration::from_millis(500));
        assert_eq!(standard.handshake_attempts, 3);
        assert_eq!(standard.handshake_retry_delay, Duration::from_secs(2));

        let heavy = Dialect::heavy_start();
        assert_eq!(heavy.warmup, Duration::from_secs(8));
        assert_eq!(heavy.handshake_attempts, 1);
    }

    #[test]
    fn handshake_timeout_respects_the_floor() {
        let standard = Dialect::standard();
        assert_eq!(
            standard.handshake_timeout(Duration::from_secs(1)),
            Duration::from_secs(10)
        );
        assert_eq!(
            standard.handshake_timeout(Duration::from_secs(30)),
            Duration::from_secs(30)
        );

        let heavy = Dialect::heavy_start();
        assert_eq!(
            heavy.handshake_timeout(Duration::from_secs(1)),
            Duration::from_secs(15)
        );
    }
}
