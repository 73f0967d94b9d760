//! MCP Session
//!
//! A [`Session`] owns one transport and walks it through the lifecycle
//! `Uninitialized -> Initializing -> Ready -> Closed`. Tool calls are only
//! accepted while `Ready`; they are serialized on the transport, so at most
//! one call is on the wire at a time.
//!
//! Every wait inside a call races the session's shutdown signal, so
//! [`Session::close`] from another task fails a suspended call with
//! [`McpError::SessionClosed`] instead of leaving it hanging.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use super::{
    codec::{Envelope, MessageCodec},
    errors::{McpError, McpResult},
    protocol::{InitializeResult, JsonRpcMessage, JsonRpcResponse, MessageId},
    sse::SseReader,
    tools::{ToolCallRequest, ToolCallResult},
    transport::{FrameStream, GatewayTransport, HttpTransport, Reply, TransportStats},
};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, handshake not started
    Uninitialized,
    /// Handshake in progress
    Initializing,
    /// Accepting tool calls
    Ready,
    /// Terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "Uninitialized",
            SessionState::Initializing => "Initializing",
            SessionState::Ready => "Ready",
            SessionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// A call that has been sent and not yet completed
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub id: MessageId,
    pub tool: String,
    pub started_at: DateTime<Utc>,
    /// Stream events seen so far
    pub events_received: u64,
}

/// In-flight calls keyed by call id
#[derive(Debug, Default)]
struct PendingCalls {
    calls: Mutex<HashMap<MessageId, PendingCall>>,
}

impl PendingCalls {
    fn register(self: &Arc<Self>, id: MessageId, tool: &str) -> PendingGuard {
        self.calls.lock().insert(
            id.clone(),
            PendingCall {
                id: id.clone(),
                tool: tool.to_string(),
                started_at: Utc::now(),
                events_received: 0,
            },
        );
        PendingGuard {
            table: Arc::clone(self),
            id,
        }
    }

    fn record_event(&self, id: &MessageId) {
        if let Some(call) = self.calls.lock().get_mut(id) {
            call.events_received += 1;
        }
    }

    fn snapshot(&self) -> Vec<PendingCall> {
        self.calls.lock().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

/// Removes its call from the table on every exit path
struct PendingGuard {
    table: Arc<PendingCalls>,
    id: MessageId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.calls.lock().remove(&self.id);
    }
}

/// Session statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub calls_started: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub events_received: u64,
    pub total_call_time: Duration,
    pub initialized_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl SessionStats {
    fn record_start(&mut self) {
        self.calls_started += 1;
        self.last_activity = Some(Utc::now());
    }

    fn record_finish(&mut self, succeeded: bool, elapsed: Duration) {
        if succeeded {
            self.calls_succeeded += 1;
        } else {
            self.calls_failed += 1;
        }
        self.total_call_time += elapsed;
        self.last_activity = Some(Utc::now());
    }

    /// Mean wall-clock time of finished calls
    pub fn average_call_time(&self) -> Duration {
        let finished = self.calls_succeeded + self.calls_failed;
        if finished == 0 {
            return Duration::ZERO;
        }
        self.total_call_time / finished as u32
    }
}

/// How a decoded payload relates to the call being read
enum Fold {
    /// Part of the result
    Part(Value),
    /// The final answer; nothing more belongs to this call
    Final(Value),
    /// Unrelated traffic
    Skip,
}

struct SessionInner {
    config: ClientConfig,
    codec: MessageCodec,
    transport: AsyncMutex<Box<dyn GatewayTransport>>,
    state: RwLock<SessionState>,
    pending: Arc<PendingCalls>,
    stats: RwLock<SessionStats>,
    server_info: RwLock<Option<InitializeResult>>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if *self.state.get_mut() != SessionState::Closed {
            debug!("Session dropped without close; releasing transport");
        }
    }
}

/// Client session with an MCP gateway
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.inner.config.endpoint)
            .field("envelope", &self.inner.codec.envelope())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Create a session over HTTP for `config`
    pub fn new(config: ClientConfig) -> McpResult<Self> {
        config.validate()?;
        let transport = HttpTransport::new(config.transport_config())?;
        Ok(Self::with_transport(config, Box::new(transport)))
    }

    /// Create a session over an existing transport
    pub fn with_transport(config: ClientConfig, transport: Box<dyn GatewayTransport>) -> Self {
        let codec = MessageCodec::new(
            config.mode,
            config.protocol_version.clone(),
            config.client_info.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(SessionInner {
                config,
                codec,
                transport: AsyncMutex::new(transport),
                state: RwLock::new(SessionState::Uninitialized),
                pending: Arc::new(PendingCalls::default()),
                stats: RwLock::new(SessionStats::default()),
                server_info: RwLock::new(None),
                shutdown,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create and initialize a session
    pub async fn connect(config: ClientConfig) -> McpResult<Self> {
        let session = Self::new(config)?;
        session.initialize().await?;
        Ok(session)
    }

    /// Run `f` against a fresh, initialized session and close it afterwards
    ///
    /// The session is closed whether `f` succeeds, fails or initialization
    /// itself fails.
    pub async fn scoped<F, Fut, T>(config: ClientConfig, f: F) -> McpResult<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        Self::new(config)?.run_scoped(f).await
    }

    /// Initialize this session, run `f`, then close
    pub async fn run_scoped<F, Fut, T>(self, f: F) -> McpResult<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        let outcome = match self.initialize().await {
            Ok(()) => f(self.clone()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = self.close().await {
            warn!("Failed to close session: {}", e);
        }
        outcome
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Handshake result; `None` for the gateway envelope
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.inner.server_info.read().clone()
    }

    /// Session statistics
    pub fn stats(&self) -> SessionStats {
        self.inner.stats.read().clone()
    }

    /// Calls currently on the wire
    pub fn in_flight(&self) -> Vec<PendingCall> {
        self.inner.pending.snapshot()
    }

    /// Transport statistics; waits for any in-flight call
    pub async fn transport_stats(&self) -> TransportStats {
        self.inner.transport.lock().await.stats()
    }

    /// Probe the gateway's health endpoint
    pub async fn health_check(&self) -> McpResult<bool> {
        self.inner.transport.lock().await.health_check().await
    }

    /// Perform the handshake
    ///
    /// Valid only while `Uninitialized`. A transport failure leaves the
    /// session `Uninitialized` so the handshake may be retried; a rejected or
    /// unacknowledged handshake closes it.
    pub async fn initialize(&self) -> McpResult<()> {
        self.transition(SessionState::Uninitialized, SessionState::Initializing, "initialize")?;
        info!(
            "Initializing MCP session with {} ({} envelope)",
            self.inner.config.endpoint,
            self.inner.codec.envelope()
        );

        let closed = wait_closed(self.inner.shutdown.subscribe());
        tokio::pin!(closed);

        let mut transport = tokio::select! {
            biased;
            _ = &mut closed => return Err(McpError::SessionClosed),
            guard = self.inner.transport.lock() => guard,
        };

        if let Err(e) = transport.open().await {
            error!("Failed to open transport: {}", e);
            let _ = self.transition(
                SessionState::Initializing,
                SessionState::Uninitialized,
                "initialize",
            );
            return Err(e);
        }

        let deadline = self.inner.config.request_timeout();
        let outcome = tokio::select! {
            biased;
            _ = &mut closed => Err(McpError::SessionClosed),
            result = tokio::time::timeout(deadline, self.handshake(&mut **transport)) => {
                result.unwrap_or_else(|_| {
                    Err(McpError::handshake(format!(
                        "No acknowledgement within {}ms",
                        deadline.as_millis()
                    )))
                })
            }
        };

        match outcome {
            Ok(server_info) => {
                self.transition(SessionState::Initializing, SessionState::Ready, "initialize")?;
                match &server_info {
                    Some(info) => info!(
                        "MCP session ready: {} {} (protocol {})",
                        info.server_info.name, info.server_info.version, info.protocol_version
                    ),
                    None => info!("MCP session ready"),
                }
                *self.inner.server_info.write() = server_info;
                self.inner.stats.write().initialized_at = Some(Utc::now());
                Ok(())
            }
            Err(e @ McpError::SessionClosed) => Err(e),
            Err(e @ McpError::Transport { .. }) if !e.is_rejection() => {
                warn!("Transport failed during handshake: {}", e);
                let _ = self.transition(
                    SessionState::Initializing,
                    SessionState::Uninitialized,
                    "initialize",
                );
                Err(e)
            }
            Err(e) => {
                let e = match e {
                    McpError::Handshake { .. } => e,
                    McpError::Transport { message, .. } => {
                        McpError::handshake(format!("Gateway rejected initialize: {}", message))
                    }
                    other => McpError::handshake(other.to_string()),
                };
                error!("MCP handshake failed: {}", e);
                if self.mark_closed() {
                    self.inner.shutdown.send_replace(true);
                    release(&mut **transport).await;
                }
                Err(e)
            }
        }
    }

    /// Call a tool and wait for its complete result
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        let request = ToolCallRequest::new(name, arguments)?;
        self.call(request).await
    }

    /// Call the configured default tool with the configured default arguments
    pub async fn call_default_tool(&self) -> McpResult<ToolCallResult> {
        let tool = self
            .inner
            .config
            .default_tool
            .clone()
            .ok_or_else(|| McpError::configuration("No default tool configured"))?;
        self.call_tool(&tool, self.inner.config.default_arguments.clone())
            .await
    }

    /// Call a tool
    pub async fn call(&self, request: ToolCallRequest) -> McpResult<ToolCallResult> {
        self.call_until(request, std::future::pending()).await
    }

    /// Call a tool, giving up with [`McpError::Cancelled`] once `cancel` completes
    pub async fn call_until<F>(
        &self,
        request: ToolCallRequest,
        cancel: F,
    ) -> McpResult<ToolCallResult>
    where
        F: Future<Output = ()> + Send,
    {
        self.ensure_ready("call tool")?;
        let tool = request.name().to_string();

        let closed = wait_closed(self.inner.shutdown.subscribe());
        tokio::pin!(closed);
        tokio::pin!(cancel);

        let mut transport = tokio::select! {
            biased;
            _ = &mut closed => return Err(McpError::SessionClosed),
            _ = &mut cancel => return Err(McpError::cancelled(&tool)),
            guard = self.inner.transport.lock() => guard,
        };
        // Closed while queued behind another call
        self.ensure_ready("call tool")?;

        let id = self.next_message_id();
        let _pending = self.inner.pending.register(id.clone(), &tool);
        self.inner.stats.write().record_start();
        let started = Instant::now();
        debug!(tool = %tool, call_id = %id, "Calling tool");

        let deadline = self.inner.config.call_timeout();
        let outcome = tokio::select! {
            biased;
            _ = &mut closed => Err(McpError::SessionClosed),
            _ = &mut cancel => Err(McpError::cancelled(&tool)),
            result = tokio::time::timeout(
                deadline,
                self.exchange(&mut **transport, &id, &request),
            ) => {
                result.unwrap_or_else(|_| {
                    Err(McpError::timeout(
                        format!("call to '{}'", tool),
                        deadline.as_millis() as u64,
                    ))
                })
            }
        };

        let elapsed = started.elapsed();
        self.inner.stats.write().record_finish(outcome.is_ok(), elapsed);

        match outcome {
            Ok(result) => {
                info!(
                    tool = %tool,
                    call_id = %id,
                    parts = result.content.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Tool call completed"
                );
                Ok(result.with_duration(elapsed))
            }
            Err(e) => {
                warn!(tool = %tool, call_id = %id, "Tool call failed: {}", e);
                if matches!(e, McpError::Transport { .. }) && self.mark_closed() {
                    error!("Lost connection to gateway, closing session");
                    self.inner.shutdown.send_replace(true);
                    release(&mut **transport).await;
                }
                Err(e)
            }
        }
    }

    /// Round-trip a JSON-RPC `ping`
    pub async fn ping(&self) -> McpResult<Duration> {
        self.ensure_ready("ping")?;

        let closed = wait_closed(self.inner.shutdown.subscribe());
        tokio::pin!(closed);

        let mut transport = tokio::select! {
            biased;
            _ = &mut closed => return Err(McpError::SessionClosed),
            guard = self.inner.transport.lock() => guard,
        };
        self.ensure_ready("ping")?;

        let id = self.next_message_id();
        let payload = self.inner.codec.encode_ping(&id)?;
        let started = Instant::now();
        let deadline = self.inner.config.request_timeout();

        let exchange = async {
            transport.send(payload).await?;
            let reply = transport.receive().await?;
            self.read_reply(reply, &id).await
        };
        let reply = tokio::select! {
            biased;
            _ = &mut closed => Err(McpError::SessionClosed),
            result = tokio::time::timeout(deadline, exchange) => {
                result.unwrap_or_else(|_| {
                    Err(McpError::timeout("ping", deadline.as_millis() as u64))
                })
            }
        }?;

        if let Some(value) = reply {
            let response: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| McpError::decode(format!("Invalid ping response: {}", e), b""))?;
            response
                .into_result()
                .map_err(|rpc| McpError::gateway("ping", rpc))?;
        }

        let elapsed = started.elapsed();
        debug!("Ping round trip took {:?}", elapsed);
        Ok(elapsed)
    }

    /// Close the session
    ///
    /// Idempotent. Suspended calls fail with [`McpError::SessionClosed`] and
    /// the transport is closed exactly once.
    pub async fn close(&self) -> McpResult<()> {
        if !self.mark_closed() {
            debug!("Session already closed");
            return Ok(());
        }

        info!(in_flight = self.inner.pending.len(), "Closing MCP session");
        self.inner.shutdown.send_replace(true);

        let mut transport = self.inner.transport.lock().await;
        transport.close().await
    }

    async fn handshake(
        &self,
        transport: &mut dyn GatewayTransport,
    ) -> McpResult<Option<InitializeResult>> {
        let id = self.next_message_id();
        transport.send(self.inner.codec.encode_initialize(&id)?).await?;
        let reply = transport.receive().await?;
        let ack = self.read_reply(reply, &id).await?;

        if self.inner.codec.envelope() == Envelope::Gateway {
            if let Some(ack) = ack.as_ref().filter(|ack| is_error_ack(ack)) {
                return Err(McpError::handshake(format!("Gateway rejected initialize: {}", ack)));
            }
            debug!("Gateway acknowledged initialize");
            return Ok(None);
        }

        let ack = ack.ok_or_else(|| McpError::handshake("Gateway sent no initialize result"))?;
        let response: JsonRpcResponse = serde_json::from_value(ack)
            .map_err(|e| McpError::handshake(format!("Invalid initialize response: {}", e)))?;
        let result = response
            .into_result()
            .map_err(|e| McpError::handshake(format!("Gateway rejected initialize: {}", e)))?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::handshake(format!("Invalid initialize result: {}", e)))?;

        if !init.protocol_version.is_supported() {
            return Err(McpError::handshake(format!(
                "Gateway negotiated unsupported protocol version {}",
                init.protocol_version
            )));
        }

        if let Some(notification) = self.inner.codec.encode_initialized()? {
            transport.send(notification).await?;
            match transport.receive().await? {
                Reply::Accepted => {}
                other => debug!("Ignoring reply to initialized notification: {:?}", other),
            }
        }

        Ok(Some(init))
    }

    async fn exchange(
        &self,
        transport: &mut dyn GatewayTransport,
        id: &MessageId,
        request: &ToolCallRequest,
    ) -> McpResult<ToolCallResult> {
        let payload = self.inner.codec.encode(id, request)?;
        transport.send(payload).await?;

        match transport.receive().await? {
            Reply::Unary(body) => {
                let value = MessageCodec::decode(&body)?;
                match self.classify(value, id, request.name())? {
                    Fold::Part(value) | Fold::Final(value) => Ok(ToolCallResult::from_value(value)),
                    Fold::Skip => Err(McpError::decode("Reply does not answer the call", &body)),
                }
            }
            Reply::Stream(frames) => self.fold_stream(frames, id, request.name()).await,
            Reply::Accepted => Err(McpError::incomplete_stream(request.name())),
        }
    }

    /// Fold stream events into one result until the terminal event
    async fn fold_stream(
        &self,
        frames: FrameStream,
        id: &MessageId,
        tool: &str,
    ) -> McpResult<ToolCallResult> {
        let mut reader = self.reader(frames);
        let mut result = ToolCallResult::default();

        while let Some(event) = reader.next_event().await? {
            self.inner.pending.record_event(id);
            self.inner.stats.write().events_received += 1;

            if event.name == self.inner.config.terminal_event {
                debug!(tool, call_id = %id, "Terminal event received");
                return Ok(result);
            }
            if event.data.trim().is_empty() {
                debug!(tool, event = %event.name, "Skipping event without data");
                continue;
            }

            let value = MessageCodec::decode(event.data.as_bytes())?;
            debug!(tool, call_id = %id, event = %event.name, "Folding event");
            match self.classify(value, id, tool)? {
                Fold::Part(value) => result.absorb(value),
                Fold::Final(value) => {
                    result.absorb(value);
                    return Ok(result);
                }
                Fold::Skip => {}
            }
        }

        Err(McpError::incomplete_stream(tool))
    }

    fn classify(&self, value: Value, id: &MessageId, tool: &str) -> McpResult<Fold> {
        if self.inner.codec.envelope() == Envelope::Gateway {
            return Ok(Fold::Part(value));
        }

        match JsonRpcMessage::from_value(&value) {
            None => Ok(Fold::Part(value)),
            Some(Err(e)) => Err(e),
            Some(Ok(JsonRpcMessage::Response(response))) if &response.id == id => {
                match response.into_result() {
                    Ok(result) => Ok(Fold::Final(result)),
                    Err(rpc) => Err(McpError::gateway(tool, rpc)),
                }
            }
            Some(Ok(JsonRpcMessage::Response(response))) => {
                warn!("Received response for unknown call ID: {}", response.id);
                Ok(Fold::Skip)
            }
            Some(Ok(JsonRpcMessage::Notification(notification))) => {
                debug!(tool, "Gateway notification: {}", notification.method);
                Ok(Fold::Skip)
            }
            Some(Ok(JsonRpcMessage::Request(request))) => {
                warn!("Ignoring gateway request '{}' during tool call", request.method);
                Ok(Fold::Skip)
            }
        }
    }

    /// First payload of `reply` that answers `id`
    async fn read_reply(&self, reply: Reply, id: &MessageId) -> McpResult<Option<Value>> {
        match reply {
            Reply::Accepted => Ok(None),
            Reply::Unary(body) => self.match_reply(MessageCodec::decode(&body)?, id),
            Reply::Stream(frames) => {
                let mut reader = self.reader(frames);
                while let Some(event) = reader.next_event().await? {
                    if event.name == self.inner.config.terminal_event {
                        break;
                    }
                    if event.data.trim().is_empty() {
                        continue;
                    }
                    let value = MessageCodec::decode(event.data.as_bytes())?;
                    if let Some(value) = self.match_reply(value, id)? {
                        return Ok(Some(value));
                    }
                }
                Ok(None)
            }
        }
    }

    fn match_reply(&self, value: Value, id: &MessageId) -> McpResult<Option<Value>> {
        if self.inner.codec.envelope() == Envelope::Gateway {
            return Ok(Some(value));
        }

        match JsonRpcMessage::from_value(&value) {
            Some(Ok(JsonRpcMessage::Response(response))) if &response.id == id => Ok(Some(value)),
            Some(Ok(message)) => {
                debug!("Skipping unrelated message (id {:?})", message.id());
                Ok(None)
            }
            Some(Err(e)) => Err(e),
            None => Err(McpError::decode(
                "Expected a JSON-RPC response",
                value.to_string().as_bytes(),
            )),
        }
    }

    fn reader(&self, frames: FrameStream) -> SseReader {
        SseReader::new(
            frames,
            self.inner.config.terminal_event.clone(),
            self.inner.config.max_message_size,
        )
        .with_idle_timeout(self.inner.config.read_timeout())
    }

    fn next_message_id(&self) -> MessageId {
        match self.inner.codec.envelope() {
            Envelope::Session => {
                MessageId::from_number(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
            }
            Envelope::Gateway => MessageId::generate(),
        }
    }

    fn ensure_ready(&self, operation: &str) -> McpResult<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(McpError::SessionClosed),
            other => Err(McpError::protocol_state(other, operation)),
        }
    }

    fn transition(&self, from: SessionState, to: SessionState, operation: &str) -> McpResult<()> {
        let mut state = self.inner.state.write();
        if *state == from {
            debug!("Session state {} -> {}", from, to);
            *state = to;
            Ok(())
        } else if *state == SessionState::Closed {
            Err(McpError::SessionClosed)
        } else {
            Err(McpError::protocol_state(*state, operation))
        }
    }

    /// Move to `Closed`; true only for the caller that made the change
    fn mark_closed(&self) -> bool {
        let mut state = self.inner.state.write();
        if *state == SessionState::Closed {
            false
        } else {
            *state = SessionState::Closed;
            true
        }
    }
}

/// Resolves once the session's shutdown signal is raised
async fn wait_closed(mut shutdown: watch::Receiver<bool>) {
    loop {
        let closed = *shutdown.borrow_and_update();
        if closed {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// A gateway-envelope acknowledgement that reports a failure
fn is_error_ack(ack: &Value) -> bool {
    ack.get("isError").and_then(Value::as_bool) == Some(true)
        || ack.get("error").map_or(false, |error| !error.is_null())
}

async fn release(transport: &mut dyn GatewayTransport) {
    if let Err(e) = transport.close().await {
        warn!("Failed to close transport: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::MockGatewayTransport;
    use bytes::Bytes;
    use futures_util::{stream, StreamExt};
    use serde_json::json;
    use std::collections::VecDeque;

    fn unary(value: Value) -> McpResult<Reply> {
        Ok(Reply::Unary(Bytes::from(serde_json::to_vec(&value).unwrap())))
    }

    fn sse(chunks: &[&str]) -> McpResult<Reply> {
        let chunks: Vec<McpResult<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        Ok(Reply::Stream(Box::pin(stream::iter(chunks))))
    }

    /// Stream that yields `chunks` and then never ends
    fn sse_then_stall(chunks: &[&str]) -> McpResult<Reply> {
        let chunks: Vec<McpResult<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        Ok(Reply::Stream(Box::pin(
            stream::iter(chunks).chain(stream::pending()),
        )))
    }

    fn initialize_ack(id: u64) -> McpResult<Reply> {
        unary(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2025-06-18",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "docker-mcp-gateway", "version": "1.0.0"}
            }
        }))
    }

    fn gateway_config() -> ClientConfig {
        ClientConfig {
            mode: Envelope::Gateway,
            ..ClientConfig::default()
        }
    }

    /// Mock that opens, accepts every send and plays back `replies` in order
    fn scripted(replies: Vec<McpResult<Reply>>) -> MockGatewayTransport {
        let mut queue = VecDeque::from(replies);
        let mut mock = MockGatewayTransport::new();
        mock.expect_open().returning(|| Ok(()));
        mock.expect_send().returning(|_| Ok(()));
        mock.expect_receive().returning(move || {
            queue
                .pop_front()
                .unwrap_or_else(|| Err(McpError::transport("no scripted reply")))
        });
        mock
    }

    #[tokio::test]
    async fn test_call_before_initialize_is_rejected() {
        let session =
            Session::with_transport(gateway_config(), Box::new(MockGatewayTransport::new()));

        let err = session.call_tool("search", json!({"query": "Docker"})).await.unwrap_err();
        assert!(matches!(err, McpError::ProtocolState { .. }));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_gateway_unary_search() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut queue = VecDeque::from(vec![
            unary(json!({})),
            unary(json!({"content": [{"type": "text", "text": "<results>"}]})),
        ]);

        let mut mock = MockGatewayTransport::new();
        mock.expect_open().times(1).returning(|| Ok(()));
        let log = Arc::clone(&sent);
        mock.expect_send().returning(move |payload| {
            log.lock().push(payload);
            Ok(())
        });
        mock.expect_receive()
            .returning(move || queue.pop_front().unwrap());

        let session = Session::with_transport(gateway_config(), Box::new(mock));
        session.initialize().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.server_info().is_none());

        let result = session
            .call_tool("search", json!({"query": "Docker"}))
            .await
            .unwrap();
        assert_eq!(result.first_text(), Some("<results>"));

        let sent = sent.lock();
        assert_eq!(sent.len(), 2);
        let handshake: Value = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(handshake, json!({"tool": "initialize", "input": {}}));
        let call: Value = serde_json::from_slice(&sent[1]).unwrap();
        assert_eq!(call, json!({"tool": "search", "input": {"query": "Docker"}}));
    }

    #[tokio::test]
    async fn test_session_mode_streamed_fetch() {
        let mock = scripted(vec![
            initialize_ack(1),
            Ok(Reply::Accepted),
            sse(&[
                "event: message\ndata: {\"content\":[{\"type\":\"text\",\"text\":\"OK\"}]}\n\n",
                "event: done\ndata: {}\n\n",
            ]),
        ]);

        let session = Session::with_transport(ClientConfig::default(), Box::new(mock));
        session.initialize().await.unwrap();

        let info = session.server_info().unwrap();
        assert_eq!(info.server_info.name, "docker-mcp-gateway");

        let result = session
            .call_tool("fetch", json!({"url": "https://example.org"}))
            .await
            .unwrap();
        assert_eq!(result.first_text(), Some("OK"));
        assert_eq!(session.stats().calls_succeeded, 1);
        assert!(session.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_progress_events_folded_in_order() {
        let mock = scripted(vec![
            unary(json!({})),
            sse_then_stall(&[
                "event: progress\ndata: {\"p\":1}\n\n",
                "event: progress\ndata: {\"p\":2}\n\n",
                "event: done\ndata: {}\n\n",
            ]),
        ]);

        let session = Session::with_transport(gateway_config(), Box::new(mock));
        session.initialize().await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            session.call_tool("query", json!({"sql": "SELECT 1"})),
        )
        .await
        .expect("call must finish at the terminal event")
        .unwrap();

        let payloads: Vec<_> = result.content.iter().map(|c| c.payload.clone()).collect();
        assert_eq!(payloads, vec![json!({"p": 1}), json!({"p": 2})]);
        assert_eq!(session.stats().events_received, 3);
    }

    #[tokio::test]
    async fn test_stream_without_terminal_event() {
        let mock = scripted(vec![unary(json!({})), sse(&[]), sse(&["data: {\"p\":1}\n\n"])]);

        let session = Session::with_transport(gateway_config(), Box::new(mock));
        session.initialize().await.unwrap();

        let err = session.call_tool("query", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::IncompleteStream { ref tool } if tool == "query"));

        let err = session.call_tool("query", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::IncompleteStream { .. }));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_decode_error_leaves_session_usable() {
        let mock = scripted(vec![
            unary(json!({})),
            sse(&["data: {\"content\": [\n\n", "event: done\ndata: {}\n\n"]),
            unary(json!({"content": [{"type": "text", "text": "second"}]})),
        ]);

        let session = Session::with_transport(gateway_config(), Box::new(mock));
        session.initialize().await.unwrap();

        let err = session.call_tool("search", json!({})).await.unwrap_err();
        match err {
            McpError::Decode { raw, .. } => assert_eq!(raw, "{\"content\": ["),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(session.is_ready());

        let result = session.call_tool("search", json!({})).await.unwrap();
        assert_eq!(result.first_text(), Some("second"));
        assert_eq!(session.stats().calls_failed, 1);
    }

    #[tokio::test]
    async fn test_transport_error_closes_session() {
        let mut mock = MockGatewayTransport::new();
        mock.expect_open().returning(|| Ok(()));
        let mut sends = 0;
        mock.expect_send().returning(move |_| {
            sends += 1;
            if sends == 1 {
                Ok(())
            } else {
                Err(McpError::transport("connection reset by peer"))
            }
        });
        mock.expect_receive().times(1).returning(|| unary(json!({})));
        mock.expect_close().times(1).returning(|| Ok(()));

        let session = Session::with_transport(gateway_config(), Box::new(mock));
        session.initialize().await.unwrap();

        let err = session.call_tool("search", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
        assert_eq!(session.state(), SessionState::Closed);

        let err = session.call_tool("search", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::SessionClosed));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_suspended_call() {
        let mut mock = scripted(vec![
            unary(json!({})),
            sse_then_stall(&["event: progress\ndata: {\"p\":1}\n\n"]),
        ]);
        mock.expect_close().times(1).returning(|| Ok(()));

        let session = Session::with_transport(gateway_config(), Box::new(mock));
        session.initialize().await.unwrap();

        let caller = session.clone();
        let call = tokio::spawn(async move { caller.call_tool("query", json!({})).await });

        for _ in 0..200 {
            let suspended = session
                .in_flight()
                .first()
                .map_or(false, |call| call.events_received >= 1);
            if suspended {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.in_flight().len(), 1);

        session.close().await.unwrap();
        session.close().await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("suspended call must fail promptly after close")
            .unwrap();
        assert!(matches!(outcome, Err(McpError::SessionClosed)));
        assert!(session.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_rejection_closes_session() {
        let mut mock = scripted(vec![unary(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32602, "message": "unsupported protocol version"}
        }))]);
        mock.expect_close().times(1).returning(|| Ok(()));

        let session = Session::with_transport(ClientConfig::default(), Box::new(mock));
        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, McpError::Handshake { .. }));
        assert_eq!(session.state(), SessionState::Closed);

        assert!(matches!(session.initialize().await, Err(McpError::SessionClosed)));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_error_status_during_handshake_closes_session() {
        let mut mock = MockGatewayTransport::new();
        mock.expect_open().returning(|| Ok(()));
        mock.expect_send().times(1).returning(|_| {
            Err(McpError::http_status(
                400,
                "Gateway returned 400 Bad Request: No server names provided",
            ))
        });
        mock.expect_close().times(1).returning(|| Ok(()));

        let session = Session::with_transport(gateway_config(), Box::new(mock));
        let err = session.initialize().await.unwrap_err();
        match &err {
            McpError::Handshake { message } => assert!(message.contains("No server names")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_gateway_error_ack_fails_handshake() {
        for ack in [
            json!({
                "content": [{"type": "text", "text": "unknown tool initialize"}],
                "isError": true
            }),
            json!({"error": "initialize not supported"}),
        ] {
            let mut mock = scripted(vec![unary(ack)]);
            mock.expect_close().times(1).returning(|| Ok(()));

            let session = Session::with_transport(gateway_config(), Box::new(mock));
            let err = session.initialize().await.unwrap_err();
            match &err {
                McpError::Handshake { message } => assert!(message.contains("initialize")),
                other => panic!("unexpected error: {:?}", other),
            }
            assert_eq!(session.state(), SessionState::Closed);
        }
    }

    #[tokio::test]
    async fn test_gateway_ack_with_explicit_success_is_accepted() {
        let ack = json!({"content": [], "isError": false, "error": null});
        let mock = scripted(vec![unary(ack)]);
        let session = Session::with_transport(gateway_config(), Box::new(mock));
        session.initialize().await.unwrap();
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes_session() {
        let config = ClientConfig {
            request_timeout_ms: 50,
            ..ClientConfig::default()
        };
        let mut mock = scripted(vec![sse_then_stall(&[])]);
        mock.expect_close().times(1).returning(|| Ok(()));

        let session = Session::with_transport(config, Box::new(mock));
        let err = tokio::time::timeout(Duration::from_secs(1), session.initialize())
            .await
            .expect("handshake must give up at its deadline")
            .unwrap_err();
        assert!(matches!(err, McpError::Handshake { .. }));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_session_uninitialized() {
        let mut mock = MockGatewayTransport::new();
        mock.expect_open()
            .times(1)
            .returning(|| Err(McpError::transport("connection refused")));

        let session = Session::with_transport(gateway_config(), Box::new(mock));
        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_initialize_twice_is_a_state_error() {
        let mock = scripted(vec![unary(json!({}))]);
        let session = Session::with_transport(gateway_config(), Box::new(mock));
        session.initialize().await.unwrap();

        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, McpError::ProtocolState { .. }));
    }

    #[tokio::test]
    async fn test_gateway_error_response() {
        let mock = scripted(vec![
            initialize_ack(1),
            Ok(Reply::Accepted),
            unary(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "error": {"code": -32601, "message": "Unknown tool: nope"}
            })),
        ]);

        let session = Session::with_transport(ClientConfig::default(), Box::new(mock));
        session.initialize().await.unwrap();

        let err = session.call_tool("nope", json!({})).await.unwrap_err();
        match err {
            McpError::Gateway { tool, error } => {
                assert_eq!(tool, "nope");
                assert_eq!(error.code, -32601);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_json_rpc_stream_with_notifications() {
        let mock = scripted(vec![
            initialize_ack(1),
            Ok(Reply::Accepted),
            sse_then_stall(&[
                concat!(
                    "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",",
                    "\"params\":{\"progress\":1}}\n\n",
                ),
                concat!(
                    "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":",
                    "{\"content\":[{\"type\":\"text\",\"text\":\"rows: 3\"}]}}\n\n",
                ),
            ]),
        ]);

        let session = Session::with_transport(ClientConfig::default(), Box::new(mock));
        session.initialize().await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            session.call_tool("query", json!({"sql": "SELECT datname FROM pg_database;"})),
        )
        .await
        .expect("response for the call ends the stream")
        .unwrap();
        assert_eq!(result.text(), "rows: 3");
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let config = ClientConfig {
            call_timeout_ms: 50,
            ..gateway_config()
        };
        let mock = scripted(vec![unary(json!({})), sse_then_stall(&[])]);

        let session = Session::with_transport(config, Box::new(mock));
        session.initialize().await.unwrap();

        let err = session.call_tool("query", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { timeout_ms: 50, .. }));
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_call_cancellation() {
        let mock = scripted(vec![unary(json!({})), sse_then_stall(&[])]);
        let session = Session::with_transport(gateway_config(), Box::new(mock));
        session.initialize().await.unwrap();

        let request = ToolCallRequest::new("query", json!({})).unwrap();
        let err = session
            .call_until(request, tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Cancelled { ref tool } if tool == "query"));
    }

    #[tokio::test]
    async fn test_default_tool() {
        let config = ClientConfig {
            default_tool: Some("search".to_string()),
            default_arguments: json!({"query": "Docker"}),
            ..gateway_config()
        };
        let mock = scripted(vec![
            unary(json!({})),
            unary(json!({"content": [{"type": "text", "text": "hit"}]})),
        ]);

        let session = Session::with_transport(config, Box::new(mock));
        session.initialize().await.unwrap();
        assert_eq!(session.call_default_tool().await.unwrap().first_text(), Some("hit"));

        let bare = Session::with_transport(gateway_config(), Box::new(MockGatewayTransport::new()));
        assert!(matches!(
            bare.call_default_tool().await,
            Err(McpError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_ping() {
        let mock = scripted(vec![
            initialize_ack(1),
            Ok(Reply::Accepted),
            unary(json!({"jsonrpc": "2.0", "id": 2, "result": {}})),
        ]);

        let session = Session::with_transport(ClientConfig::default(), Box::new(mock));
        session.initialize().await.unwrap();
        assert!(session.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_run_scoped_closes_on_error() {
        let mut mock = scripted(vec![unary(json!({}))]);
        mock.expect_close().times(1).returning(|| Ok(()));

        let session = Session::with_transport(gateway_config(), Box::new(mock));
        let observer = session.clone();
        let outcome: McpResult<()> = session
            .run_scoped(|s| async move {
                assert!(s.is_ready());
                Err(McpError::validation("caller gave up"))
            })
            .await;

        assert!(matches!(outcome, Err(McpError::Validation { .. })));
        assert_eq!(observer.state(), SessionState::Closed);
    }

    #[test]
    fn test_session_stats_average() {
        let mut stats = SessionStats::default();
        assert_eq!(stats.average_call_time(), Duration::ZERO);
        stats.record_start();
        stats.record_finish(true, Duration::from_millis(30));
        stats.record_start();
        stats.record_finish(false, Duration::from_millis(10));
        assert_eq!(stats.average_call_time(), Duration::from_millis(20));
        assert_eq!(stats.calls_failed, 1);
    }
}
