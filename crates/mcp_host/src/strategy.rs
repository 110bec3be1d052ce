//! Transport-type detection, kept out of the connection itself.

use std::sync::Arc;

use crate::{
    config::{ServerConfig, TRANSPORT_STDIO, TRANSPORT_STDIO_HEAVY},
    connection::{Dialect, McpConnection},
    error::HostError,
};

/// Builds connections for the transport types it recognizes.
pub trait ConnectionStrategy: Send + Sync {
    fn supports(&self, transport: &str) -> bool;
    fn create(&self, server_id: &str, config: ServerConfig) -> McpConnection;
}

/// Standard stdio servers: short warmup, retried handshake.
pub struct StdioStrategy;

impl ConnectionStrategy for StdioStrategy {
    fn supports(&self, transport: &str) -> bool {
        transport == TRANSPORT_STDIO
    }

    fn create(&self, server_id: &str, config: ServerConfig) -> McpConnection {
        McpConnection::new(server_id, config, Dialect::standard())
    }
}

/// Slow-booting stdio servers: long warmup, single handshake attempt.
pub struct HeavyStartStrategy;

impl ConnectionStrategy for HeavyStartStrategy {
    fn supports(&self, transport: &str) -> bool {
        transport == TRANSPORT_STDIO_HEAVY
    }

    fn create(&self, server_id: &str, config: ServerConfig) -> McpConnection {
        McpConnection::new(server_id, config, Dialect::heavy_start())
    }
}

/// Ordered strategy lookup; the first `supports` match wins.
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn ConnectionStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Registry preloaded with the built-in stdio dialects.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(StdioStrategy));
        registry.register(Box::new(HeavyStartStrategy));
        registry
    }

    pub fn register(&mut self, strategy: Box<dyn ConnectionStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn create(
        &self,
        server_id: &str,
        config: ServerConfig,
    ) -> Result<Arc<McpConnection>, HostError> {
        match self
            .strategies
            .iter()
            .find(|strategy| strategy.supports(&config.transport))
        {
            Some(strategy) => Ok(Arc::new(strategy.create(server_id, config))),
            None => Err(HostError::UnknownTransport {
                server: server_id.to_string(),
                transport: config.transport,
            }),
        }
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_dialect_by_transport_type() {
        let registry = StrategyRegistry::with_defaults();

        let standard = registry
            .create("a", ServerConfig::new("server"))
            .expect("stdio strategy");
        assert_eq!(standard.dialect(), Dialect::standard());

        let mut heavy_config = ServerConfig::new("server");
        heavy_config.transport = TRANSPORT_STDIO_HEAVY.into();
        let heavy = registry.create("b", heavy_config).expect("heavy strategy");
        assert_eq!(heavy.dialect(), Dialect::heavy_start());
    }

    #[test]
    fn unknown_transport_is_an_error() {
        let registry = StrategyRegistry::with_defaults();
        let mut config = ServerConfig::new("server");
        config.transport = "streamable-http".into();
        assert!(matches!(
            registry.create("a", config),
            Err(HostError::UnknownTransport { transport, .. }) if transport == "streamable-http"
        ));
    }

    #[test]
    fn first_matching_strategy_wins() {
        struct PinnedDialect;
        impl ConnectionStrategy for PinnedDialect {
            fn supports(&self, transport: &str) -> bool {
                transport == TRANSPORT_STDIO
            }
            fn create(&self, server_id: &str, config: ServerConfig) -> McpConnection {
                McpConnection::new(server_id, config, Dialect::heavy_start())
            }
        }

        let mut registry = StrategyRegistry::new();
        registry.register(Box::new(PinnedDialect));
        registry.register(Box::new(StdioStrategy));

        let connection = registry
            .create("a", ServerConfig::new("server"))
            .expect("create");
        assert_eq!(connection.dialect(), Dialect::heavy_start());
    }
}
