//! MCP Transport Layer
//!
//! Moves bytes between the client and a gateway endpoint. The transport knows
//! nothing about the protocol: it posts a payload and hands back either a full
//! body or the raw chunks of an event stream.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, pin::Pin, time::Duration};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use super::errors::{McpError, McpResult};

/// Session header assigned by streamable-HTTP gateways
pub const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Content type of server-sent-event bodies
pub const CONTENT_TYPE_SSE: &str = "text/event-stream";

/// Accept header sent with every request
pub const ACCEPT_VALUE: &str = "application/json, text/event-stream";

/// Error bodies are cut to this many bytes before being put in an error
const ERROR_BODY_LIMIT: usize = 512;

/// Raw chunks of a streamed response body
pub type FrameStream = Pin<Box<dyn Stream<Item = McpResult<Bytes>> + Send>>;

/// What the gateway sent back for one request
pub enum Reply {
    /// One complete body
    Unary(Bytes),
    /// An incrementally flushed event stream
    Stream(FrameStream),
    /// Request acknowledged without a body (e.g. `202 Accepted`)
    Accepted,
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Unary(body) => f.debug_tuple("Unary").field(&body.len()).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
            Reply::Accepted => f.write_str("Accepted"),
        }
    }
}

/// Connection status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Not opened yet
    Disconnected,
    /// Open and usable
    Connected,
    /// Last request failed at the transport level
    Failed(String),
    /// Released; terminal
    Closed,
}

/// Transport statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    /// Bytes of unary bodies; streamed bodies are not counted here
    pub bytes_received: u64,
    pub streams_opened: u64,
    pub connection_attempts: u64,
    pub failed_requests: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl TransportStats {
    /// Update statistics for sent message
    pub fn update_sent(&mut self, message_size: usize) {
        self.messages_sent += 1;
        self.bytes_sent += message_size as u64;
        self.last_activity = Some(Utc::now());
    }

    /// Update statistics for received message
    pub fn update_received(&mut self, message_size: usize) {
        self.messages_received += 1;
        self.bytes_received += message_size as u64;
        self.last_activity = Some(Utc::now());
    }

    /// Update statistics for an opened event stream
    pub fn update_stream(&mut self) {
        self.messages_received += 1;
        self.streams_opened += 1;
        self.last_activity = Some(Utc::now());
    }

    pub fn update_failure(&mut self) {
        self.failed_requests += 1;
        self.last_activity = Some(Utc::now());
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Gateway endpoint URL
    pub endpoint: String,
    /// Time allowed to establish a TCP/TLS connection
    pub connect_timeout: Duration,
    /// Time allowed until response headers arrive
    pub request_timeout: Duration,
    /// Maximum unary body / outgoing payload size
    pub max_message_size: usize,
    /// Additional headers sent with every request
    pub headers: HashMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8811/mcp".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_message_size: 4 * 1024 * 1024,
            headers: HashMap::new(),
        }
    }
}

/// Gateway transport trait
///
/// A transport is owned by exactly one session. `send` issues one request and
/// `receive` hands back its reply; a second `send` before `receive` discards
/// the unread reply.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GatewayTransport: Send {
    /// Prepare the transport for requests
    async fn open(&mut self) -> McpResult<()>;

    /// Send one encoded message
    async fn send(&mut self, payload: Vec<u8>) -> McpResult<()>;

    /// Take the reply to the last message sent
    async fn receive(&mut self) -> McpResult<Reply>;

    /// Release the connection; further use fails
    async fn close(&mut self) -> McpResult<()>;

    /// Get connection status
    fn status(&self) -> ConnectionStatus;

    /// Get transport statistics
    fn stats(&self) -> TransportStats;

    /// Probe the gateway's health endpoint
    async fn health_check(&self) -> McpResult<bool>;
}

/// HTTP transport: one POST per message, unary JSON or SSE replies
pub struct HttpTransport {
    config: TransportConfig,
    endpoint: Url,
    client: reqwest::Client,
    status: ConnectionStatus,
    stats: TransportStats,
    /// Assigned by the gateway on the first reply, echoed afterwards
    session_id: Option<String>,
    in_flight: Option<reqwest::Response>,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(config: TransportConfig) -> McpResult<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            McpError::configuration(format!("Invalid gateway URL '{}': {}", config.endpoint, e))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(McpError::configuration(format!(
                "Unsupported URL scheme '{}' for gateway endpoint",
                endpoint.scheme()
            )));
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                McpError::configuration(format!("Invalid header key '{}': {}", key, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                McpError::configuration(format!("Invalid header value for '{}': {}", key, e))
            })?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| McpError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            endpoint,
            client,
            status: ConnectionStatus::Disconnected,
            stats: TransportStats::default(),
            session_id: None,
            in_flight: None,
        })
    }

    fn ensure_open(&self) -> McpResult<()> {
        match &self.status {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Closed => Err(McpError::transport("Transport is closed")),
            ConnectionStatus::Disconnected => Err(McpError::transport("Transport is not open")),
            ConnectionStatus::Failed(reason) => {
                Err(McpError::transport(format!("Transport failed earlier: {}", reason)))
            }
        }
    }

    fn fail(&mut self, error: McpError) -> McpError {
        self.stats.update_failure();
        self.status = ConnectionStatus::Failed(error.to_string());
        error
    }

    fn remember_session_id(&mut self, response: &reqwest::Response) {
        let assigned = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok());
        if let Some(id) = assigned {
            if self.session_id.as_deref() != Some(id) {
                debug!("Gateway assigned session id {}", id);
                self.session_id = Some(id.to_string());
            }
        }
    }
}

#[async_trait]
impl GatewayTransport for HttpTransport {
    async fn open(&mut self) -> McpResult<()> {
        if self.status == ConnectionStatus::Closed {
            return Err(McpError::transport("Transport is closed"));
        }
        self.stats.connection_attempts += 1;
        self.status = ConnectionStatus::Connected;
        info!("HTTP transport ready for {}", self.endpoint);
        Ok(())
    }

    async fn send(&mut self, payload: Vec<u8>) -> McpResult<()> {
        self.ensure_open()?;

        if payload.len() > self.config.max_message_size {
            return Err(McpError::message_too_large(
                payload.len(),
                self.config.max_message_size,
            ));
        }
        if self.in_flight.take().is_some() {
            warn!("Discarding unread reply from previous request");
        }

        let size = payload.len();
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, ACCEPT_VALUE)
            .body(payload);
        if let Some(id) = &self.session_id {
            request = request.header(MCP_SESSION_ID_HEADER, id.as_str());
        }

        let response = match timeout(self.config.request_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(self.fail(McpError::transport(format!(
                    "HTTP request to {} failed: {}",
                    self.endpoint, e
                ))))
            }
            Err(_) => {
                return Err(self.fail(McpError::transport(format!(
                    "No response from {} within {}ms",
                    self.endpoint,
                    self.config.request_timeout.as_millis()
                ))))
            }
        };

        let status = response.status();
        if !status.is_success() {
            let read = read_capped(response, ERROR_BODY_LIMIT);
            let body = match timeout(self.config.request_timeout, read).await {
                Ok(Ok((body, _))) => String::from_utf8_lossy(&body).into_owned(),
                _ => String::new(),
            };
            return Err(self.fail(McpError::http_status(
                status.as_u16(),
                format!("Gateway returned {}: {}", status, body),
            )));
        }

        self.remember_session_id(&response);
        self.stats.update_sent(size);
        self.in_flight = Some(response);
        Ok(())
    }

    async fn receive(&mut self) -> McpResult<Reply> {
        self.ensure_open()?;
        let response = self
            .in_flight
            .take()
            .ok_or_else(|| McpError::transport("No reply pending; send a message first"))?;

        if response.status() == reqwest::StatusCode::ACCEPTED
            || response.content_length() == Some(0)
        {
            return Ok(Reply::Accepted);
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.starts_with(CONTENT_TYPE_SSE));

        if is_stream {
            self.stats.update_stream();
            let frames = response.bytes_stream().map(|chunk| {
                chunk.map_err(|e| McpError::transport(format!("Event stream interrupted: {}", e)))
            });
            return Ok(Reply::Stream(Box::pin(frames)));
        }

        let limit = self.config.max_message_size;
        if let Some(length) = response.content_length() {
            if length > limit as u64 {
                return Err(McpError::message_too_large(length as usize, limit));
            }
        }

        let (body, truncated) = read_capped(response, limit).await.map_err(|e| {
            self.fail(McpError::transport(format!("Failed to read response body: {}", e)))
        })?;
        if truncated {
            // Reading stopped at the cap, so only a lower bound is known
            return Err(McpError::message_too_large(limit + 1, limit));
        }
        self.stats.update_received(body.len());

        if body.iter().all(u8::is_ascii_whitespace) {
            Ok(Reply::Accepted)
        } else {
            Ok(Reply::Unary(body))
        }
    }

    async fn close(&mut self) -> McpResult<()> {
        if self.status == ConnectionStatus::Closed {
            return Ok(());
        }
        self.in_flight = None;

        if let Some(id) = self.session_id.take() {
            let request = self
                .client
                .delete(self.endpoint.clone())
                .header(MCP_SESSION_ID_HEADER, id.as_str())
                .send();
            match timeout(self.config.request_timeout, request).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    debug!("Gateway session {} terminated", id);
                }
                Ok(Ok(response))
                    if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED =>
                {
                    debug!("Gateway does not support explicit session termination");
                }
                Ok(Ok(response)) => {
                    warn!("Gateway answered session termination with {}", response.status());
                }
                Ok(Err(e)) => warn!("Failed to terminate gateway session: {}", e),
                Err(_) => warn!("Gateway session termination timed out"),
            }
        }

        self.status = ConnectionStatus::Closed;
        info!("HTTP transport closed");
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.status.clone()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    async fn health_check(&self) -> McpResult<bool> {
        let health_endpoint = self
            .endpoint
            .join("/health")
            .map_err(|e| McpError::configuration(format!("Invalid health URL: {}", e)))?;

        let probe = self.client.get(health_endpoint).send();
        match timeout(Duration::from_secs(5), probe).await {
            Ok(Ok(response)) => Ok(response.status().is_success()),
            _ => Ok(false),
        }
    }
}

/// Read at most `limit` bytes of a body; the flag reports whether more followed
async fn read_capped(response: reqwest::Response, limit: usize) -> reqwest::Result<(Bytes, bool)> {
    let mut body = BytesMut::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        let room = limit - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            return Ok((body.freeze(), true));
        }
        body.extend_from_slice(&chunk);
    }
    Ok((body.freeze(), false))
}

/// Transport factory
pub struct TransportFactory;

impl TransportFactory {
    /// Create the transport for a configuration
    pub fn create_transport(config: TransportConfig) -> McpResult<Box<dyn GatewayTransport>> {
        Ok(Box::new(HttpTransport::new(config)?))
    }

    /// Create HTTP transport with URL
    pub fn create_http(url: impl Into<String>) -> McpResult<Box<dyn GatewayTransport>> {
        let config = TransportConfig {
            endpoint: url.into(),
            ..Default::default()
        };
        Self::create_transport(config)
    }
}
