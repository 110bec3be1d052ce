//! Multi-server registry: owns the fleet and fans operations across it.

use std::{
    cmp,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tokio::{sync::broadcast, task::JoinSet, time};
use tracing::{info, warn};

use crate::{
    config::{HostConfig, RetryPolicy, ServerConfig},
    connection::McpConnection,
    error::HostError,
    model::{ResourceContent, ResourceDescriptor, ServerInfo, ToolDescriptor, ToolResult},
    mux::ServerNotification,
    strategy::StrategyRegistry,
};

/// Global bound on closing the whole fleet.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type ConnectionMap = Arc<Mutex<HashMap<String, Arc<McpConnection>>>>;

/// Owns `{server id → connection}` and the configured server table.
///
/// Aggregate operations (`health`, `all_tools`) never propagate a per-server
/// failure; a broken server degrades to `false` or an empty list.
pub struct ServerRegistry {
    strategies: Arc<StrategyRegistry>,
    configs: Mutex<BTreeMap<String, ServerConfig>>,
    connections: ConnectionMap,
    retry: RetryPolicy,
}

impl ServerRegistry {
    pub fn new(config: HostConfig) -> Self {
        Self::with_strategies(config, StrategyRegistry::with_defaults())
    }

    pub fn with_strategies(config: HostConfig, strategies: StrategyRegistry) -> Self {
        Self {
            strategies: Arc::new(strategies),
            configs: Mutex::new(config.servers),
            connections: Arc::new(Mutex::new(HashMap::new())),
            retry: config.defaults.retry,
        }
    }

    /// Connects every enabled server concurrently. A failed handshake evicts
    /// that server from the connection map and is logged; it never fails the
    /// startup of the other connections.
    pub async fn initialize_all(&self) {
        let targets: Vec<(String, ServerConfig)> = {
            lock(&self.configs)
                .iter()
                .filter(|(_, config)| config.enabled)
                .map(|(id, config)| (id.clone(), config.clone()))
                .collect()
        };

        let mut join_set = JoinSet::new();
        for (server_id, config) in targets {
            let strategies = Arc::clone(&self.strategies);
            let connections = Arc::clone(&self.connections);
            let retry = self.retry.clone();
            join_set.spawn(async move {
                let result =
                    connect_with_retry(&strategies, &connections, &retry, &server_id, config)
                        .await;
                (server_id, result)
            });
        }

        let mut connected = 0usize;
        let mut attempted = 0usize;
        while let Some(joined) = join_set.join_next().await {
            let Ok((server_id, result)) = joined else {
                continue;
            };
            attempted += 1;
            match result {
                Ok(()) => connected += 1,
                Err(err) => warn!(server = %server_id, %err, "failed to initialize MCP server"),
            }
        }
        info!(connected, attempted, "MCP registry initialized");
    }

    /// Closes every connection concurrently within a global deadline and
    /// clears the map.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<McpConnection>> = {
            lock(&self.connections)
                .drain()
                .map(|(_, connection)| connection)
                .collect()
        };

        let mut join_set = JoinSet::new();
        for connection in connections {
            join_set.spawn(async move { connection.close().await });
        }
        let drain = async {
            while join_set.join_next().await.is_some() {}
        };
        if time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("registry shutdown exceeded its deadline; abandoning stragglers");
        }
    }

    /// Enabled configured server ids, a superset of currently connected ids;
    /// callers pick healthy ones via [`health`](Self::health).
    pub fn list(&self) -> Vec<String> {
        lock(&self.configs)
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns the live connection for `server_id`.
    pub fn get(&self, server_id: &str) -> Result<Arc<McpConnection>, HostError> {
        if let Some(connection) = lock(&self.connections).get(server_id) {
            return Ok(Arc::clone(connection));
        }
        let configured_enabled = lock(&self.configs)
            .get(server_id)
            .map(|config| config.enabled);
        match configured_enabled {
            Some(true) => Err(HostError::NotReady {
                server: server_id.to_string(),
            }),
            _ => Err(HostError::NotFound {
                server: server_id.to_string(),
            }),
        }
    }

    /// Registers and connects a server at runtime. A connect failure unwinds
    /// the registration so the caller can `add` again.
    pub async fn add(&self, server_id: &str, config: ServerConfig) -> Result<(), HostError> {
        {
            let mut configs = lock(&self.configs);
            if configs.contains_key(server_id) {
                return Err(HostError::AlreadyExists {
                    server: server_id.to_string(),
                });
            }
            configs.insert(server_id.to_string(), config.clone());
        }
        if !config.enabled {
            return Ok(());
        }

        let result = connect_with_retry(
            &self.strategies,
            &self.connections,
            &self.retry,
            server_id,
            config,
        )
        .await;
        if result.is_err() {
            lock(&self.configs).remove(server_id);
        }
        result
    }

    /// Closes and forgets a server.
    pub async fn remove(&self, server_id: &str) -> Result<(), HostError> {
        let configured = lock(&self.configs).remove(server_id).is_some();
        let connection = lock(&self.connections).remove(server_id);
        let connected = connection.is_some();
        if let Some(connection) = connection {
            connection.close().await;
        }
        if configured || connected {
            Ok(())
        } else {
            Err(HostError::NotFound {
                server: server_id.to_string(),
            })
        }
    }

    /// Per-server liveness, probed concurrently; failures degrade to `false`.
    pub async fn health(&self) -> HashMap<String, bool> {
        let mut join_set = JoinSet::new();
        for (server_id, connection) in self.snapshot() {
            join_set.spawn(async move { (server_id, connection.is_healthy().await) });
        }

        let mut health = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((server_id, healthy)) => {
                    health.insert(server_id, healthy);
                }
                Err(err) => warn!(%err, "health probe task failed"),
            }
        }
        health
    }

    /// Tool catalogs per server, fetched concurrently; a failing server yields
    /// an empty list, never an error.
    pub async fn all_tools(&self) -> HashMap<String, Vec<ToolDescriptor>> {
        let mut join_set = JoinSet::new();
        for (server_id, connection) in self.snapshot() {
            join_set.spawn(async move {
                let tools = match connection.list_tools().await {
                    Ok(tools) => tools,
                    Err(err) => {
                        warn!(server = %server_id, %err, "listing tools failed; substituting an empty catalog");
                        Vec::new()
                    }
                };
                (server_id, tools)
            });
        }

        let mut catalogs = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((server_id, tools)) => {
                    catalogs.insert(server_id, tools);
                }
                Err(err) => warn!(%err, "tool listing task failed"),
            }
        }
        catalogs
    }

    /// `tools/list` against one server.
    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolDescriptor>, HostError> {
        self.get(server_id)?.list_tools().await
    }

    /// `tools/call` against one server.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<ToolResult, HostError> {
        self.get(server_id)?.execute_tool(name, arguments).await
    }

    /// `resources/list` against one server.
    pub async fn list_resources(
        &self,
        server_id: &str,
    ) -> Result<Vec<ResourceDescriptor>, HostError> {
        self.get(server_id)?.list_resources().await
    }

    /// `resources/read` against one server.
    pub async fn read_resource(
        &self,
        server_id: &str,
        uri: &str,
    ) -> Result<ResourceContent, HostError> {
        self.get(server_id)?.read_resource(uri).await
    }

    /// Identity block cached from one server's handshake.
    pub fn server_info(&self, server_id: &str) -> Result<Option<ServerInfo>, HostError> {
        Ok(self.get(server_id)?.server_info())
    }

    /// Liveness of one server; unknown or unconnected ids report `false`.
    pub async fn is_healthy(&self, server_id: &str) -> bool {
        match self.get(server_id) {
            Ok(connection) => connection.is_healthy().await,
            Err(_) => false,
        }
    }

    /// Subscribes to one server's notification broadcast.
    pub async fn subscribe(
        &self,
        server_id: &str,
    ) -> Result<broadcast::Receiver<ServerNotification>, HostError> {
        self.get(server_id)?.notifications().await
    }

    fn snapshot(&self) -> Vec<(String, Arc<McpConnection>)> {
        lock(&self.connections)
            .iter()
            .map(|(id, connection)| (id.clone(), Arc::clone(connection)))
            .collect()
    }
}

/// Builds and initializes one connection, retrying transient transport-start
/// failures per the registry policy. The connection is inserted into the map
/// before its handshake starts and evicted again if the handshake fails.
async fn connect_with_retry(
    strategies: &StrategyRegistry,
    connections: &ConnectionMap,
    retry: &RetryPolicy,
    server_id: &str,
    config: ServerConfig,
) -> Result<(), HostError> {
    let max_attempts = cmp::max(retry.max_attempts, 1);
    let mut attempt = 0;
    loop {
        let connection = strategies.create(server_id, config.clone())?;
        lock(connections).insert(server_id.to_string(), Arc::clone(&connection));

        match connection.initialize().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                lock(connections).remove(server_id);
                attempt += 1;
                let transient = matches!(err, HostError::TransportStart { .. });
                if transient && attempt < max_attempts {
                    let delay = retry.delay_before(attempt - 1);
                    warn!(server = %server_id, attempt, ?delay, %err, "retrying server start");
                    time::sleep(delay).await;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
