//! Typed configuration records consumed by the registry.
//!
//! The outer application owns configuration policy; this module defines the
//! per-server record it hands the core, plus a thin TOML loader for the
//! `[defaults]` / `[servers.<id>]` table shape.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default per-call deadline when neither the server entry nor the host
/// defaults set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Transport type string handled by the standard stdio strategy.
pub const TRANSPORT_STDIO: &str = "stdio";
/// Transport type string for stdio servers that need a long warmup before the
/// handshake.
pub const TRANSPORT_STDIO_HEAVY: &str = "stdio-heavy";

/// Launch configuration for a single MCP server.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Transport type; the strategy registry picks a dialect off this string.
    #[serde(rename = "type", default = "default_transport")]
    pub transport: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Merged into the inherited environment, never replacing it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_transport() -> String {
    TRANSPORT_STDIO.to_string()
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            transport: default_transport(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_ms: None,
            enabled: true,
        }
    }

    /// Default per-call deadline for this server.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }
}

/// Backoff policy the registry wraps around transient transport failures.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given zero-based retry attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let millis = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(millis as u64)
    }
}

/// Host-wide defaults applied across server entries.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HostDefaults {
    /// Per-call deadline for servers that do not set `timeout_ms` themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Typed view over the host's server table.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    #[serde(default)]
    pub defaults: HostDefaults,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// Errors surfaced while loading host configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },
}

impl HostConfig {
    /// Parses the TOML table shape and resolves per-server timeouts against
    /// the host defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: HostConfig =
            toml::from_str(raw).map_err(|source| ConfigError::Parse { source })?;
        config.resolve_defaults();
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&raw)
    }

    /// Server entries that are enabled, in stable id order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &ServerConfig)> {
        self.servers.iter().filter(|(_, config)| config.enabled)
    }

    fn resolve_defaults(&mut self) {
        if let Some(default_timeout) = self.defaults.timeout_ms {
            for server in self.servers.values_mut() {
                server.timeout_ms.get_or_insert(default_timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_full_table_shape() {
        let config = HostConfig::from_toml_str(
            r#"
            [defaults]
            timeout_ms = 4000

            [defaults.retry]
            max_attempts = 2
            initial_delay_ms = 100
            multiplier = 3.0

            [servers.files]
            command = "files-mcp"
            args = ["--root", "/tmp"]
            timeout_ms = 9000

            [servers.files.env]
            RUST_LOG = "debug"

            [servers.slowpoke]
            type = "stdio-heavy"
            command = "slowpoke-mcp"

            [servers.retired]
            command = "retired-mcp"
            enabled = false
            "#,
        )
        .expect("parse");

        let files = &config.servers["files"];
        assert_eq!(files.transport, TRANSPORT_STDIO);
        assert_eq!(files.args, vec!["--root", "/tmp"]);
        assert_eq!(files.env["RUST_LOG"], "debug");
        assert_eq!(files.timeout(), Duration::from_millis(9000));

        let slowpoke = &config.servers["slowpoke"];
        assert_eq!(slowpoke.transport, TRANSPORT_STDIO_HEAVY);
        // No per-server timeout: the [defaults] one applies.
        assert_eq!(slowpoke.timeout(), Duration::from_millis(4000));

        assert!(!config.servers["retired"].enabled);
        let enabled: Vec<_> = config.enabled_servers().map(|(id, _)| id.as_str()).collect();
        assert_eq!(enabled, vec!["files", "slowpoke"]);

        assert_eq!(config.defaults.retry.max_attempts, 2);
    }

    #[test]
    fn falls_back_to_the_built_in_timeout() {
        let config = HostConfig::from_toml_str(
            r#"
            [servers.bare]
            command = "bare-mcp"
            "#,
        )
        .expect("parse");
        assert_eq!(
            config.servers["bare"].timeout(),
            Duration::from_millis(DEFAULT_TIMEOUT_MS)
        );
    }

    #[test]
    fn retry_delays_grow_by_the_multiplier() {
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 100,
            multiplier: 2.0,
        };
        assert_eq!(retry.delay_before(0), Duration::from_millis(100));
        assert_eq!(retry.delay_before(1), Duration::from_millis(200));
        assert_eq!(retry.delay_before(2), Duration::from_millis(400));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            HostConfig::from_toml_str("servers = 3"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
