//! Event stream reader
//!
//! Turns the raw chunks of a `text/event-stream` body into discrete events.
//! Chunk boundaries carry no meaning: a line may be split across any number
//! of chunks, including in the middle of a multi-byte character.

use bytes::{Buf, BytesMut};
use futures_util::{stream, Stream, StreamExt};
use std::time::Duration;
use tracing::{debug, trace};

use super::{
    errors::{McpError, McpResult},
    transport::FrameStream,
};

/// Event name used when an event carries no `event:` field
pub const DEFAULT_EVENT_NAME: &str = "message";

/// Event name that ends a tool call's stream
pub const TERMINAL_EVENT: &str = "done";

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub name: String,
    /// `data:` lines joined with `\n`
    pub data: String,
    /// Last `id:` seen on the stream, if any
    pub id: Option<String>,
}

impl StreamEvent {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            id: None,
        }
    }
}

/// Incremental SSE parser over a [`FrameStream`]
///
/// Once the terminal event has been returned, or the stream has ended or
/// failed, the underlying stream is dropped and every later read yields
/// `Ok(None)`.
pub struct SseReader {
    frames: Option<FrameStream>,
    terminal_event: String,
    max_event_size: usize,
    idle_timeout: Option<Duration>,
    buffer: BytesMut,
    /// A `\r` ended the previous chunk; a leading `\n` belongs to it
    skip_lf: bool,
    event_name: Option<String>,
    data: Option<String>,
    last_id: Option<String>,
}

impl SseReader {
    pub fn new(
        frames: FrameStream,
        terminal_event: impl Into<String>,
        max_event_size: usize,
    ) -> Self {
        Self {
            frames: Some(frames),
            terminal_event: terminal_event.into(),
            max_event_size,
            idle_timeout: None,
            buffer: BytesMut::new(),
            skip_lf: false,
            event_name: None,
            data: None,
            last_id: None,
        }
    }

    /// Fail the read when no chunk arrives for `timeout`
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// True once the stream has been released
    pub fn is_finished(&self) -> bool {
        self.frames.is_none()
    }

    /// Read the next event
    ///
    /// Returns `Ok(None)` at end of stream and after the terminal event. An
    /// event left incomplete by end of stream is discarded.
    pub async fn next_event(&mut self) -> McpResult<Option<StreamEvent>> {
        loop {
            while let Some(line) = self.next_line() {
                let line = String::from_utf8_lossy(&line).into_owned();
                if let Some(event) = self.process_line(&line)? {
                    if event.name == self.terminal_event {
                        trace!("Terminal event received");
                        self.finish();
                    }
                    return Ok(Some(event));
                }
            }

            // Whatever is left is one unterminated line
            if self.buffer.len() > self.max_event_size {
                let size = self.buffer.len();
                self.finish();
                return Err(McpError::message_too_large(size, self.max_event_size));
            }

            let Some(frames) = self.frames.as_mut() else {
                return Ok(None);
            };

            let next = match self.idle_timeout {
                Some(idle) => match tokio::time::timeout(idle, frames.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.finish();
                        return Err(McpError::transport(format!(
                            "No stream data received for {}ms",
                            idle.as_millis()
                        )));
                    }
                },
                None => frames.next().await,
            };

            match next {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.finish();
                    return Err(e);
                }
                None => {
                    // A final line without a terminator still counts as a line,
                    // but the event it belongs to never got its blank line.
                    if !self.buffer.is_empty() {
                        let rest = self.buffer.split();
                        let line = String::from_utf8_lossy(&rest).into_owned();
                        self.process_line(&line)?;
                    }
                    if self.event_name.is_some() || self.data.is_some() {
                        debug!("Discarding incomplete event at end of stream");
                    }
                    self.finish();
                    return Ok(None);
                }
            }
        }
    }

    /// Consume the reader as a stream of events
    pub fn into_stream(self) -> impl Stream<Item = McpResult<StreamEvent>> + Send {
        stream::unfold(self, |mut reader| async move {
            match reader.next_event().await {
                Ok(Some(event)) => Some((Ok(event), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
    }

    fn finish(&mut self) {
        self.frames = None;
        self.buffer.clear();
        self.event_name = None;
        self.data = None;
    }

    /// Split one complete line off the buffer, without its terminator
    fn next_line(&mut self) -> Option<BytesMut> {
        if self.skip_lf {
            match self.buffer.first() {
                Some(b'\n') => {
                    self.buffer.advance(1);
                    self.skip_lf = false;
                }
                Some(_) => self.skip_lf = false,
                None => return None,
            }
        }

        let pos = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r')?;
        let terminator = self.buffer[pos];
        let line = self.buffer.split_to(pos);
        self.buffer.advance(1);

        if terminator == b'\r' {
            match self.buffer.first() {
                Some(b'\n') => self.buffer.advance(1),
                Some(_) => {}
                None => self.skip_lf = true,
            }
        }
        Some(line)
    }

    fn process_line(&mut self, line: &str) -> McpResult<Option<StreamEvent>> {
        if line.is_empty() {
            return Ok(self.dispatch());
        }
        if line.starts_with(':') {
            return Ok(None);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => {
                match self.data.as_mut() {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => self.data = Some(value.to_string()),
                }
                let size = self.data.as_ref().map_or(0, String::len);
                if size > self.max_event_size {
                    self.finish();
                    return Err(McpError::message_too_large(size, self.max_event_size));
                }
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_id = Some(value.to_string());
                }
            }
            "retry" => {}
            other => trace!("Ignoring unknown event field '{}'", other),
        }
        Ok(None)
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        if self.event_name.is_none() && self.data.is_none() {
            return None;
        }
        let name = self
            .event_name
            .take()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string());
        Some(StreamEvent {
            name,
            data: self.data.take().unwrap_or_default(),
            id: self.last_id.clone(),
        })
    }
}
