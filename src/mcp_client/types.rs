//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol payloads and server configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::McpError;

/// JSON-RPC protocol version carried on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision requested during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// A JSON-RPC message id. Outgoing requests always use integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One line of the wire protocol, discriminated at the parse boundary.
///
/// - `method` + `id` → request
/// - `method` without `id` → notification
/// - `id` + `error` → error response
/// - `id` + `result` → success response
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: Value,
    },
    Error {
        id: RequestId,
        error: JsonRpcError,
    },
}

impl JsonRpcMessage {
    /// Build an outgoing request.
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        JsonRpcMessage::Request {
            id: RequestId::Number(id),
            method: method.to_string(),
            params,
        }
    }

    /// Build an outgoing notification.
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification {
            method: method.to_string(),
            params,
        }
    }

    /// Parse and validate one framed line.
    pub fn parse(line: &str) -> Result<Self, McpError> {
        let value: Value = serde_json::from_str(line).map_err(|e| McpError::InvalidMessage {
            reason: format!("malformed JSON: {e}"),
        })?;
        Self::from_value(value)
    }

    /// Validate an already-decoded JSON value as a JSON-RPC message.
    pub fn from_value(value: Value) -> Result<Self, McpError> {
        let Value::Object(mut obj) = value else {
            return Err(invalid("message is not a JSON object"));
        };

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            other => {
                return Err(invalid(format!("unsupported jsonrpc version: {other:?}")));
            }
        }

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw)
                    .map_err(|_| invalid("id must be an unsigned integer or a string"))?,
            ),
        };

        if let Some(method) = obj.remove("method") {
            let method = method
                .as_str()
                .ok_or_else(|| invalid("method must be a string"))?
                .to_string();
            let params = obj.remove("params");
            return Ok(match id {
                Some(id) => JsonRpcMessage::Request { id, method, params },
                None => JsonRpcMessage::Notification { method, params },
            });
        }

        let id = id.ok_or_else(|| invalid("response without id"))?;

        if let Some(error) = obj.remove("error").filter(|e| !e.is_null()) {
            let error: JsonRpcError = serde_json::from_value(error)
                .map_err(|e| invalid(format!("malformed error object: {e}")))?;
            return Ok(JsonRpcMessage::Error { id, error });
        }

        match obj.remove("result") {
            Some(result) => Ok(JsonRpcMessage::Response { id, result }),
            None => Err(invalid("response carries neither result nor error")),
        }
    }

    /// The message id, if it has one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request { id, .. }
            | JsonRpcMessage::Response { id, .. }
            | JsonRpcMessage::Error { id, .. } => Some(id),
            JsonRpcMessage::Notification { .. } => None,
        }
    }

    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } | JsonRpcMessage::Notification { method, .. } => {
                Some(method)
            }
            _ => None,
        }
    }

    /// Encode as a JSON value with the `jsonrpc` marker.
    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            JsonRpcMessage::Request { id, method, params } => {
                obj.insert("id".into(), id_value(id));
                obj.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            JsonRpcMessage::Notification { method, params } => {
                obj.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            JsonRpcMessage::Response { id, result } => {
                obj.insert("id".into(), id_value(id));
                obj.insert("result".into(), result.clone());
            }
            JsonRpcMessage::Error { id, error } => {
                obj.insert("id".into(), id_value(id));
                obj.insert(
                    "error".into(),
                    serde_json::to_value(error).unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(obj)
    }

    /// Encode as one newline-terminated wire line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(&self.to_value())?;
        line.push('\n');
        Ok(line)
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::from(s.as_str()),
    }
}

fn invalid(reason: impl Into<String>) -> McpError {
    McpError::InvalidMessage {
        reason: reason.into(),
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Name/version pair identifying a client or server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Capabilities announced by the client in `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default)]
    pub tools: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            tools: Value::Object(serde_json::Map::new()),
            resources: None,
            prompts: None,
        }
    }
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

impl InitializeParams {
    pub fn new(client_info: Implementation) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info,
        }
    }
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<Implementation>,
}

/// One property in a tool's input schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    /// Declared JSON type: a single name or a list of names.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl PropertySchema {
    /// A property with a single declared type.
    pub fn of_type(type_name: &str) -> Self {
        Self {
            property_type: Some(Value::from(type_name)),
            ..Self::default()
        }
    }

    /// The declared type names (empty when the schema leaves the type open).
    pub fn type_names(&self) -> Vec<&str> {
        match &self.property_type {
            Some(Value::String(name)) => vec![name.as_str()],
            Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

fn default_schema_type() -> String {
    "object".to_string()
}

/// A tool's input schema (always an object schema).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(rename = "type", default = "default_schema_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for ToolInputSchema {
    fn default() -> Self {
        Self {
            schema_type: default_schema_type(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: ToolInputSchema,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpTool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// `tools/call` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// One content block of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: Some(text.into()),
            data: None,
            uri: None,
            mime_type: None,
        }
    }
}

/// `tools/call` response payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenate the text blocks, one per line.
    pub fn text(&self) -> String {
        join_text(&self.content)
    }
}

fn join_text(content: &[ToolContent]) -> String {
    content
        .iter()
        .filter_map(|c| c.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Server Configuration ────────────────────────────────────────────────────

/// Identity and launch recipe for one tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique registry key.
    pub id: String,
    /// Display name (falls back to the id when empty).
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides layered on top of the parent process environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub disabled: bool,
}

impl ServerConfig {
    pub fn new(id: &str, command: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            disabled: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// The human-readable name, or the id when no name was given.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

// ─── Connection & Call Results ───────────────────────────────────────────────

/// Snapshot of a transport's connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub initialized: bool,
    pub protocol_version: Option<String>,
    pub server_info: Option<Implementation>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Metadata attached to every client-level tool call result.
#[derive(Debug, Clone, Serialize)]
pub struct CallMetadata {
    pub tool_name: String,
    pub arguments: Value,
    pub timestamp: DateTime<Utc>,
    pub execution_time_ms: u64,
}

/// Uniform result of a tool call through [`super::McpClient`].
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub success: bool,
    pub content: Vec<ToolContent>,
    pub error: Option<String>,
    pub metadata: CallMetadata,
}

impl ToolCallResult {
    /// Concatenated text content.
    pub fn text(&self) -> String {
        join_text(&self.content)
    }
}

// ─── Standard JSON-RPC Error Codes ───────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
