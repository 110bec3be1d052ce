//! MCP catalog and payload types exchanged with servers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One item inside a tool result or resource payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 payload for binary media types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: Some(text.into()),
            data: None,
            mime_type: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: "error".into(),
            text: Some(text.into()),
            data: None,
            mime_type: None,
        }
    }
}

/// Schema-described capability advertised by a server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl ToolDescriptor {
    /// Argument names the tool expects, read off `inputSchema.properties`.
    pub fn expected_arguments(&self) -> Vec<String> {
        self.input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|properties| properties.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Outcome of a tool invocation. A server-side tool failure is flagged with
/// `is_error` rather than surfaced as a client error.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub(crate) fn from_server_error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::error(message)],
            is_error: true,
        }
    }
}

/// URI-addressable blob advertised by a server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Retrieved resource payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ResourceContent {
    pub(crate) fn from_server_error(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mime_type: Some("text/plain".into()),
            text: Some(message.into()),
            data: None,
            metadata: None,
        }
    }
}

/// Identity block cached from the handshake response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl ServerInfo {
    /// Builds the cached block from an `initialize` result, substituting
    /// server-id-tagged placeholders for absent fields.
    pub fn from_handshake(server_id: &str, result: &Value) -> Self {
        let info = result.get("serverInfo").unwrap_or(&Value::Null);
        let field = |key: &str| info.get(key).and_then(Value::as_str).map(str::to_owned);
        Self {
            name: field("name").unwrap_or_else(|| server_id.to_string()),
            version: field("version").unwrap_or_else(|| format!("{server_id}-unversioned")),
            description: field("description").unwrap_or_else(|| format!("MCP server `{server_id}`")),
            vendor: field("vendor").unwrap_or_else(|| "unknown".to_string()),
            capabilities: result
                .get("capabilities")
                .cloned()
                .unwrap_or_else(|| json!({})),
            metadata: info.get("metadata").cloned().unwrap_or_else(|| json!({})),
        }
    }
}

/// Client metadata attached to the `initialize` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Parameters for the `initialize` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_uses_wire_field_names() {
        let result: ToolResult = serde_json::from_value(json!({
            "content": [{ "type": "text", "text": "pong" }],
            "isError": false
        }))
        .expect("decode");
        assert!(!result.is_error);
        assert_eq!(result.content[0].kind, "text");
        assert_eq!(result.content[0].text.as_deref(), Some("pong"));

        let encoded = serde_json::to_value(&result).expect("encode");
        assert_eq!(encoded.get("isError"), Some(&json!(false)));
    }

    #[test]
    fn tool_result_defaults_are_lenient() {
        let result: ToolResult = serde_json::from_value(json!({})).expect("decode");
        assert!(result.content.is_empty());
        assert!(!result.is_error);
    }

    #[test]
    fn expected_arguments_reads_schema_properties() {
        let tool: ToolDescriptor = serde_json::from_value(json!({
            "name": "echo",
            "description": "Echoes input",
            "inputSchema": {
                "type": "object",
                "properties": { "message": { "type": "string" } }
            }
        }))
        .expect("decode");
        assert_eq!(tool.expected_arguments(), vec!["message".to_string()]);

        let bare: ToolDescriptor =
            serde_json::from_value(json!({ "name": "ping" })).expect("decode");
        assert!(bare.expected_arguments().is_empty());
    }

    #[test]
    fn server_info_falls_back_to_server_id_placeholders() {
        let info = ServerInfo::from_handshake(
            "demo",
            &json!({ "serverInfo": { "name": "real", "version": "1.2.3" } }),
        );
        assert_eq!(info.name, "real");
        assert_eq!(info.version, "1.2.3");
        assert_eq!(info.description, "MCP server `demo`");
        assert_eq!(info.vendor, "unknown");

        let bare = ServerInfo::from_handshake("demo", &json!({}));
        assert_eq!(bare.name, "demo");
        assert_eq!(bare.version, "demo-unversioned");
    }

    #[test]
    fn initialize_params_serialize_camel_case() {
        let params = InitializeParams {
            protocol_version: "2024-11-05".into(),
            capabilities: json!({}),
            client_info: ClientInfo {
                name: "mcp_host".into(),
                version: "0.1.0".into(),
            },
        };
        let encoded = serde_json::to_value(&params).expect("encode");
        assert_eq!(encoded.get("protocolVersion"), Some(&json!("2024-11-05")));
        assert!(encoded.get("clientInfo").is_some());
    }
}
