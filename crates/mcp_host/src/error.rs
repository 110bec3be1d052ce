use std::{io, time::Duration};

use serde_json::Value;
use thiserror::Error;

use crate::protocol::RequestId;

/// Errors surfaced by the host-side MCP client.
///
/// Every variant names the offending server; request-scoped variants also
/// carry the method (and where useful the request id) so callers can log a
/// failure without re-deriving context. Tool-level failures reported by a
/// server (`isError: true` results) are data, not errors, and never appear
/// here.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("server `{server}`: failed to start `{command}`: {source}")]
    TransportStart {
        server: String,
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("server `{server}`: handshake failed: {reason}")]
    Handshake { server: String, reason: String },
    #[error("server `{server}`: `{method}` timed out after {timeout:?}")]
    Timeout {
        server: String,
        method: String,
        timeout: Duration,
    },
    #[error("server `{server}`: request {request_id} for `{method}` expired after {age:?}")]
    Expired {
        server: String,
        method: String,
        request_id: RequestId,
        age: Duration,
    },
    #[error("server `{server}`: connection closed")]
    ConnectionClosed { server: String },
    #[error("server `{server}`: protocol violation: {detail}")]
    Protocol { server: String, detail: String },
    #[error("server `{server}`: `{method}` returned error {code}: {message}")]
    Server {
        server: String,
        method: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("server `{server}` is not configured")]
    NotFound { server: String },
    #[error("server `{server}` is configured but not connected")]
    NotReady { server: String },
    #[error("server `{server}` is already registered")]
    AlreadyExists { server: String },
    #[error("server `{server}`: unknown transport type `{transport}`")]
    UnknownTransport { server: String, transport: String },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
