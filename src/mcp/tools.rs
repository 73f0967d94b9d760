//! Tool call requests and results
//!
//! A [`ToolCallResult`] is assembled by folding decoded payloads into it in
//! arrival order; nothing is reordered or deduplicated.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use super::errors::{McpError, McpResult};

/// Content-type tag used for payloads that carry no `type` field
pub const JSON_CONTENT_TYPE: &str = "json";

/// Tool call request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    name: String,
    arguments: Map<String, Value>,
}

impl ToolCallRequest {
    /// Create a tool call request
    ///
    /// `arguments` must be a JSON object; `null` is accepted as "no arguments".
    pub fn new(name: impl Into<String>, arguments: Value) -> McpResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(McpError::validation("Tool name cannot be empty"));
        }

        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(McpError::validation(format!(
                    "Arguments for tool '{}' must be a JSON object, got {}",
                    name, other
                )))
            }
        };

        Ok(Self { name, arguments })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &Map<String, Value> {
        &self.arguments
    }
}

/// One part of a tool result: a content-type tag plus its JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    pub content_type: String,
    pub payload: Value,
}

impl ContentPart {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            content_type: "text".to_string(),
            payload: serde_json::json!({"type": "text", "text": text}),
        }
    }

    /// Text of a `text` part
    pub fn as_text(&self) -> Option<&str> {
        if self.content_type != "text" {
            return None;
        }
        self.payload.get("text").and_then(Value::as_str)
    }
}

impl From<Value> for ContentPart {
    fn from(payload: Value) -> Self {
        let content_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(JSON_CONTENT_TYPE)
            .to_string();
        Self {
            content_type,
            payload,
        }
    }
}

/// Tool execution result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Content parts in arrival order
    pub content: Vec<ContentPart>,
    /// Set when the tool reported `isError: true`
    pub is_error: bool,
    /// `structuredContent` of the last payload that carried one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    /// Wall-clock time of the call
    #[serde(default)]
    pub duration: Duration,
}

impl ToolCallResult {
    /// Build a result from a single decoded body
    pub fn from_value(payload: Value) -> Self {
        let mut result = Self::default();
        result.absorb(payload);
        result
    }

    /// Fold one decoded payload into the result
    ///
    /// A payload shaped like an MCP result (`{"content": [...]}`) contributes
    /// each element of `content`; any other payload becomes one part.
    pub fn absorb(&mut self, payload: Value) {
        match payload {
            Value::Object(mut map) if map.get("content").map_or(false, Value::is_array) => {
                if map.get("isError").and_then(Value::as_bool) == Some(true) {
                    self.is_error = true;
                }
                if let Some(structured) = map.remove("structuredContent") {
                    self.structured_content = Some(structured);
                }
                if let Some(Value::Array(parts)) = map.remove("content") {
                    self.content.extend(parts.into_iter().map(ContentPart::from));
                }
            }
            other => self.content.push(ContentPart::from(other)),
        }
    }

    /// Text of the first text part, the human-readable result
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(ContentPart::as_text)
    }

    /// All text parts joined in order
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Set execution duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}
