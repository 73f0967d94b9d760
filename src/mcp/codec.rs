//! Message codec
//!
//! Turns requests into wire bytes and wire bytes into JSON values. Pure and
//! synchronous: nothing here touches the network or blocks.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::{self, Display};

use super::{
    errors::{McpError, McpResult},
    protocol::{
        Implementation, InitializeParams, JsonRpcNotification, JsonRpcRequest, MessageId,
        MethodName, ProtocolVersion,
    },
    tools::ToolCallRequest,
};

/// Tool name used by the gateway envelope for the handshake
pub const GATEWAY_INITIALIZE_TOOL: &str = "initialize";

/// Wire shape of outgoing requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
    /// JSON-RPC 2.0 over streamable HTTP (`initialize`, `tools/call`)
    #[default]
    Session,
    /// Plain gateway body `{"tool": ..., "input": ...}`
    Gateway,
}

impl Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Session => f.write_str("session"),
            Envelope::Gateway => f.write_str("gateway"),
        }
    }
}

/// Encoder/decoder for one session's envelope
#[derive(Debug, Clone)]
pub struct MessageCodec {
    envelope: Envelope,
    protocol_version: ProtocolVersion,
    client_info: Implementation,
}

impl MessageCodec {
    pub fn new(
        envelope: Envelope,
        protocol_version: ProtocolVersion,
        client_info: Implementation,
    ) -> Self {
        Self {
            envelope,
            protocol_version,
            client_info,
        }
    }

    pub fn envelope(&self) -> Envelope {
        self.envelope
    }

    /// Encode a tool call
    ///
    /// `id` is only placed on the wire for the JSON-RPC envelope.
    pub fn encode(&self, id: &MessageId, request: &ToolCallRequest) -> McpResult<Vec<u8>> {
        let body = match self.envelope {
            Envelope::Gateway => json!({
                "tool": request.name(),
                "input": request.arguments(),
            }),
            Envelope::Session => serde_json::to_value(JsonRpcRequest::new(
                id.clone(),
                MethodName::call_tool(),
                Some(json!({
                    "name": request.name(),
                    "arguments": request.arguments(),
                })),
            ))?,
        };
        Ok(serde_json::to_vec(&body)?)
    }

    /// Encode the handshake request
    pub fn encode_initialize(&self, id: &MessageId) -> McpResult<Vec<u8>> {
        let body = match self.envelope {
            Envelope::Gateway => json!({"tool": GATEWAY_INITIALIZE_TOOL, "input": {}}),
            Envelope::Session => {
                let params = InitializeParams {
                    protocol_version: self.protocol_version.clone(),
                    capabilities: json!({}),
                    client_info: self.client_info.clone(),
                };
                serde_json::to_value(JsonRpcRequest::new(
                    id.clone(),
                    MethodName::initialize(),
                    Some(serde_json::to_value(params)?),
                ))?
            }
        };
        Ok(serde_json::to_vec(&body)?)
    }

    /// Encode the post-handshake notification, if the envelope has one
    pub fn encode_initialized(&self) -> McpResult<Option<Vec<u8>>> {
        match self.envelope {
            Envelope::Gateway => Ok(None),
            Envelope::Session => {
                let notification = JsonRpcNotification::new(MethodName::initialized(), None);
                Ok(Some(serde_json::to_vec(&notification)?))
            }
        }
    }

    /// Encode a liveness ping
    pub fn encode_ping(&self, id: &MessageId) -> McpResult<Vec<u8>> {
        match self.envelope {
            Envelope::Gateway => Err(McpError::validation(
                "ping is only available with the session envelope",
            )),
            Envelope::Session => Ok(serde_json::to_vec(&JsonRpcRequest::new(
                id.clone(),
                MethodName::ping(),
                None,
            ))?),
        }
    }

    /// Parse a JSON payload
    pub fn decode(bytes: &[u8]) -> McpResult<Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| McpError::decode(format!("Malformed JSON: {}", e), bytes))
    }

    /// Parse an encoded tool call back into a request
    ///
    /// Accepts both envelopes regardless of the codec's own.
    pub fn decode_call(bytes: &[u8]) -> McpResult<ToolCallRequest> {
        let value = Self::decode(bytes)?;

        let call_method = MethodName::call_tool();
        let (name, arguments) = if let Some(tool) = value.get("tool") {
            (tool, value.get("input"))
        } else if value.get("method").and_then(Value::as_str) == Some(call_method.as_str()) {
            let params = value.get("params").unwrap_or(&Value::Null);
            (params.get("name").unwrap_or(&Value::Null), params.get("arguments"))
        } else {
            return Err(McpError::decode("Payload is not a tool call", bytes));
        };

        let name = name
            .as_str()
            .ok_or_else(|| McpError::decode("Tool name is not a string", bytes))?;
        ToolCallRequest::new(name, arguments.cloned().unwrap_or(Value::Null))
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(
            Envelope::default(),
            ProtocolVersion::latest(),
            Implementation::default(),
        )
    }
}
