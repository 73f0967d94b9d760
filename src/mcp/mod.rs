//! Model Context Protocol (MCP) gateway client
//!
//! Calls tools exposed by an MCP gateway over HTTP and collects their
//! results, whether the gateway answers with one JSON body or with a stream
//! of server-sent events.
//!
//! Key components:
//! - Transport moving bytes over HTTP (unary or event-stream replies)
//! - Codec for the JSON-RPC session envelope and the plain gateway envelope
//! - Event stream reader
//! - Session driving the handshake, tool calls and teardown

pub mod codec;
pub mod errors;
pub mod protocol;
pub mod session;
pub mod sse;
pub mod tools;
pub mod transport;

pub use codec::{Envelope, MessageCodec};
pub use errors::{ErrorCategory, McpError, McpResult};
pub use protocol::{Implementation, InitializeResult, MessageId, ProtocolVersion, RpcError};
pub use session::{PendingCall, Session, SessionState, SessionStats};
pub use sse::{SseReader, StreamEvent};
pub use tools::{ContentPart, ToolCallRequest, ToolCallResult};
pub use transport::{
    ConnectionStatus, FrameStream, GatewayTransport, HttpTransport, Reply, TransportConfig,
    TransportFactory, TransportStats,
};
