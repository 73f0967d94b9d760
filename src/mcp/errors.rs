//! MCP Client Error Handling
//!
//! Error taxonomy for the gateway session protocol. Every variant carries the
//! context needed to diagnose a failure without re-running the call: the tool
//! name, the offending raw payload, or the state the session was in.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::protocol::RpcError;

/// Result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;

/// Raw payloads longer than this are truncated inside error values.
const RAW_PAYLOAD_LIMIT: usize = 4096;

/// MCP client error enumeration
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum McpError {
    /// Connect failure, timeout, bad HTTP status or mid-stream disconnect
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// HTTP status of the reply, when the gateway answered at all
        status: Option<u16>,
    },

    /// Gateway rejected or did not acknowledge the initialize handshake
    #[error("Handshake error: {message}")]
    Handshake { message: String },

    /// Malformed JSON in a response body or event payload
    #[error("Decode error: {message} (payload: {raw})")]
    Decode { message: String, raw: String },

    /// Stream ended before the terminal event arrived
    #[error("Incomplete stream: call to '{tool}' ended without a terminal event")]
    IncompleteStream { tool: String },

    /// Operation attempted after close or during teardown
    #[error("Session closed")]
    SessionClosed,

    /// Operation not valid in the current session state
    #[error("Protocol state error: cannot {operation} while session is {state}")]
    ProtocolState { state: String, operation: String },

    /// Operation exceeded its deadline
    #[error("Timeout error: {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Call was cancelled before it completed
    #[error("Call to '{tool}' was cancelled")]
    Cancelled { tool: String },

    /// Gateway answered the call with a JSON-RPC error object
    #[error("Gateway error from '{tool}': {error}")]
    Gateway { tool: String, error: RpcError },

    /// A single message or event exceeded the configured size limit
    #[error("Message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// Invalid request built by the caller
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Invalid client configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl McpError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: None,
        }
    }

    /// Create a transport error for a non-success HTTP reply
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Create a handshake error
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Create a decode error, keeping the offending payload
    pub fn decode(message: impl Into<String>, raw: &[u8]) -> Self {
        let mut raw = String::from_utf8_lossy(raw).into_owned();
        if raw.len() > RAW_PAYLOAD_LIMIT {
            let mut cut = RAW_PAYLOAD_LIMIT;
            while !raw.is_char_boundary(cut) {
                cut -= 1;
            }
            raw.truncate(cut);
            raw.push_str("...");
        }
        Self::Decode {
            message: message.into(),
            raw,
        }
    }

    /// Create an incomplete stream error
    pub fn incomplete_stream(tool: impl Into<String>) -> Self {
        Self::IncompleteStream { tool: tool.into() }
    }

    /// Create a protocol state error
    pub fn protocol_state(state: impl ToString, operation: impl Into<String>) -> Self {
        Self::ProtocolState {
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(tool: impl Into<String>) -> Self {
        Self::Cancelled { tool: tool.into() }
    }

    /// Create a gateway error
    pub fn gateway(tool: impl Into<String>, error: RpcError) -> Self {
        Self::Gateway {
            tool: tool.into(),
            error,
        }
    }

    /// Create a message too large error
    pub fn message_too_large(size: usize, limit: usize) -> Self {
        Self::MessageTooLarge { size, limit }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            McpError::Transport { .. } => ErrorCategory::Transport,
            McpError::Handshake { .. } => ErrorCategory::Handshake,
            McpError::Decode { .. } => ErrorCategory::Decode,
            McpError::IncompleteStream { .. } => ErrorCategory::Stream,
            McpError::MessageTooLarge { .. } => ErrorCategory::Stream,
            McpError::SessionClosed => ErrorCategory::Session,
            McpError::ProtocolState { .. } => ErrorCategory::Session,
            McpError::Cancelled { .. } => ErrorCategory::Session,
            McpError::Timeout { .. } => ErrorCategory::Timeout,
            McpError::Gateway { .. } => ErrorCategory::Gateway,
            McpError::Validation { .. } => ErrorCategory::Client,
            McpError::Configuration { .. } => ErrorCategory::Client,
        }
    }

    /// Check if the operation may succeed when repeated on a fresh session
    ///
    /// The client itself never retries.
    pub fn is_retryable(&self) -> bool {
        let transient = matches!(
            self,
            McpError::Transport { .. }
                | McpError::Timeout { .. }
                | McpError::IncompleteStream { .. }
        );
        transient && !self.is_rejection()
    }

    /// Check if the gateway refused the request itself (HTTP 4xx)
    ///
    /// Connection failures, timeouts and 5xx replies are not rejections.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            McpError::Transport {
                status: Some(400..=499),
                ..
            }
        )
    }

    /// Check if the error takes the whole session down
    ///
    /// Codec and framing errors stay local to one call; losing the connection
    /// or the handshake does not.
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            McpError::Transport { .. } | McpError::Handshake { .. } | McpError::SessionClosed
        )
    }
}

/// Error category for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transport,
    Handshake,
    Decode,
    Stream,
    Session,
    Timeout,
    Gateway,
    Client,
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::validation(format!("JSON serialization failed: {}", err))
    }
}
