//! Server-sent events wire codec.
//!
//! Frames are blocks of `field: value` lines terminated by a blank line:
//!
//! ```text
//! event: item
//! data: {"id":"42","timestamp":"2024-01-01T00:00:00Z",...}
//!
//! event: heartbeat
//! data: {"scan_counter":500,"timestamp":"2024-01-01T00:00:03Z"}
//!
//! event: close
//! data:
//! ```
//!
//! Frames without an `event:` field are items. Multi-line `data:` values
//! are joined with `\n`. Comment lines (leading `:`) and unknown fields
//! are ignored.

use super::PushEvent;
use crate::error::DecodeError;
use crate::model::Heartbeat;
use tracing::trace;

/// Incremental line-oriented decoder for one event stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// `event:` field of the frame being assembled.
    event: Option<String>,
    /// `data:` lines of the frame being assembled.
    data: Vec<String>,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub const fn new() -> Self {
        Self {
            event: None,
            data: Vec::new(),
        }
    }

    /// Feed one line (without its terminator).
    ///
    /// Returns an event when the line completes a frame.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if a completed frame carries a malformed
    /// heartbeat. The decoder stays usable.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<PushEvent>, DecodeError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return Ok(None);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            other => trace!(target: "backscroll::sse", field = other, "ignoring field"),
        }
        Ok(None)
    }

    /// Flush a frame left open at end of stream.
    ///
    /// # Errors
    ///
    /// Same as [`SseDecoder::feed_line`].
    pub fn finish(&mut self) -> Result<Option<PushEvent>, DecodeError> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Result<Option<PushEvent>, DecodeError> {
        let event = self.event.take();
        if event.is_none() && self.data.is_empty() {
            return Ok(None);
        }
        let data = std::mem::take(&mut self.data).join("\n");

        match event.as_deref().unwrap_or("item") {
            "item" | "message" => Ok(Some(PushEvent::Item(data))),
            "heartbeat" => Ok(Some(PushEvent::Heartbeat(parse_heartbeat(&data)?))),
            "close" => {
                let heartbeat = if data.trim().is_empty() {
                    None
                } else {
                    Some(parse_heartbeat(&data)?)
                };
                Ok(Some(PushEvent::Close { heartbeat }))
            }
            "error" => Ok(Some(PushEvent::Error(data))),
            other => {
                trace!(target: "backscroll::sse", event = other, "ignoring event");
                Ok(None)
            }
        }
    }
}

fn parse_heartbeat(data: &str) -> Result<Heartbeat, DecodeError> {
    serde_json::from_str(data).map_err(|e| DecodeError::Heartbeat(e.to_string()))
}
