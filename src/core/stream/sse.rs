//! Incremental `text/event-stream` decoding.
//!
//! [`SseDecoder`] turns raw body chunks into named events; [`StreamFrame`]
//! classifies those events into the three frames the chat service emits.

use memchr::memchr;
use serde_json::Value;
use tracing::warn;

use crate::api::client::summarize_error_body;

const DEFAULT_EVENT: &str = "message";

/// One dispatched server-sent event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Typed frame carried by the chat event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamFrame {
    /// Incremental assistant content.
    Delta(String),
    /// Generation finished successfully.
    Complete,
    /// Generation failed on the server side.
    Error(String),
}

impl StreamFrame {
    /// Classify an event, returning `None` for events that carry no frame
    /// (greetings, keep-alives, unknown event names).
    pub fn from_event(event: &SseEvent) -> Option<Self> {
        match event.event.as_str() {
            "complete" | "done" => Some(StreamFrame::Complete),
            "error" => Some(StreamFrame::Error(error_text(&event.data))),
            DEFAULT_EVENT => Self::from_message_data(&event.data),
            _ => None,
        }
    }

    fn from_message_data(data: &str) -> Option<Self> {
        let data = data.trim();
        if data == "[DONE]" {
            return Some(StreamFrame::Complete);
        }

        let value: Value = serde_json::from_str(data).ok()?;
        let object = value.as_object()?;
        let content = || {
            object
                .get("content")
                .and_then(Value::as_str)
                .map(|content| StreamFrame::Delta(content.to_string()))
        };

        match object.get("type").and_then(Value::as_str) {
            Some("chunk") | Some("content") | Some("delta") => content(),
            Some("complete") | Some("done") => Some(StreamFrame::Complete),
            Some("error") => Some(StreamFrame::Error(error_text(data))),
            Some(_) => None,
            None if object.contains_key("error") => Some(StreamFrame::Error(error_text(data))),
            None => content(),
        }
    }
}

fn error_text(data: &str) -> String {
    if data.trim().is_empty() {
        return "the chat service reported an error".to_string();
    }
    summarize_error_body(data)
}

/// Line-oriented SSE decoder that tolerates events split across chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a body chunk and return every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line = match std::str::from_utf8(&self.buffer[..newline_pos]) {
                Ok(line) => Some(line.trim_end_matches('\r').to_string()),
                Err(err) => {
                    warn!(error = %err, "dropping invalid UTF-8 line in event stream");
                    None
                }
            };
            self.buffer.drain(..=newline_pos);
            if let Some(event) = line.and_then(|line| self.process_line(&line)) {
                events.push(event);
            }
        }

        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            if let Ok(line) = String::from_utf8(rest) {
                if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                    return Some(event);
                }
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
        })
    }
}
