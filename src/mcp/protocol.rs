//! MCP Protocol Core
//!
//! JSON-RPC 2.0 message structures used by the session-mode envelope, plus the
//! initialize handshake payloads.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use uuid::Uuid;

use super::errors::{McpError, McpResult};

/// JSON-RPC version string carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision identifier (a date such as `2025-06-18`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(String);

impl ProtocolVersion {
    /// Revision requested by this client
    pub const LATEST: &'static str = "2025-06-18";

    /// Revisions this client can speak
    pub const SUPPORTED: [&'static str; 3] = ["2024-11-05", "2025-03-26", "2025-06-18"];

    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn latest() -> Self {
        Self::new(Self::LATEST)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether the revision is one this client understands
    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(&self.0.as_str())
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::latest()
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message ID type for MCP messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    String(String),
    Number(u64),
}

impl MessageId {
    /// Generate a new random message ID
    pub fn generate() -> Self {
        Self::String(Uuid::new_v4().to_string())
    }

    /// Create from number
    pub fn from_number(n: u64) -> Self {
        Self::Number(n)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::String(s) => write!(f, "{}", s),
            MessageId::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Method name for MCP requests
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodName(String);

impl MethodName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn initialize() -> Self {
        Self("initialize".to_string())
    }

    pub fn initialized() -> Self {
        Self("notifications/initialized".to_string())
    }

    pub fn ping() -> Self {
        Self("ping".to_string())
    }

    pub fn call_tool() -> Self {
        Self("tools/call".to_string())
    }
}

impl Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// JSON-RPC error code enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
    ServerError = -32000,
}

/// JSON-RPC error object returned by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            data: None,
        }
    }
}

impl Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// JSON-RPC request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    pub id: MessageId,
    pub method: MethodName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create request with specific ID
    pub fn new(id: MessageId, method: MethodName, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method,
            params,
        }
    }
}

/// JSON-RPC response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    pub id: MessageId,
    /// Response result (success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Response error (failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: MessageId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: MessageId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Split the response into its result or its error
    pub fn into_result(self) -> Result<serde_json::Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }
}

/// JSON-RPC notification message (no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    pub method: MethodName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: MethodName, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method,
            params,
        }
    }
}

/// Any JSON-RPC message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Interpret an already-decoded JSON value as a JSON-RPC message
    ///
    /// Returns `None` when the value does not carry `"jsonrpc": "2.0"`.
    pub fn from_value(value: &serde_json::Value) -> Option<McpResult<Self>> {
        if value.get("jsonrpc").and_then(|v| v.as_str()) != Some(JSONRPC_VERSION) {
            return None;
        }
        Some(serde_json::from_value(value.clone()).map_err(|e| {
            McpError::decode(
                format!("Invalid JSON-RPC message: {}", e),
                value.to_string().as_bytes(),
            )
        }))
    }

    /// Get the message ID (for requests and responses)
    pub fn id(&self) -> Option<&MessageId> {
        match self {
            JsonRpcMessage::Request(req) => Some(&req.id),
            JsonRpcMessage::Response(res) => Some(&res.id),
            JsonRpcMessage::Notification(_) => None,
        }
    }
}

/// Client or server implementation details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// MCP initialization parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: ProtocolVersion,
    pub capabilities: serde_json::Value,
    pub client_info: Implementation,
}

/// MCP initialization result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}
