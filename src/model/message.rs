//! Message: The immutable record streamed from the log store.
//!
//! Messages arrive over a subscription as raw encoded payloads and are
//! decoded defensively: a malformed payload yields a [`DecodeError`] for
//! that one item and never affects the subscription itself.

use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Search direction relative to an anchor point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Scanning strictly before the anchor (toward the past).
    Previous,
    /// Scanning strictly after the anchor (toward the future).
    Next,
}

impl Direction {
    /// Wire name used in subscription requests.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Previous => "previous",
            Self::Next => "next",
        }
    }

    /// Whether the server streams this direction newest-first.
    ///
    /// A backwards scan starts at the anchor and walks toward the past, so
    /// its items arrive in descending time order.
    pub const fn arrives_descending(self) -> bool {
        matches!(self, Self::Previous)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque message identifier assigned by the log store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create an identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Message body, opaque to the streaming engine.
///
/// The store may attach a structured rendering next to the raw text; the
/// two shapes are distinct variants so consumers match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageBody {
    /// Raw payload only.
    Raw {
        /// Payload text as captured.
        raw: String,
    },
    /// Raw payload plus the store's parsed fields.
    Parsed {
        /// Payload text as captured.
        raw: String,
        /// Structured fields extracted by the store.
        fields: serde_json::Value,
    },
}

impl MessageBody {
    /// Create a raw body.
    pub fn raw(raw: impl Into<String>) -> Self {
        Self::Raw { raw: raw.into() }
    }

    /// The captured payload text, whichever variant carries it.
    pub fn raw_text(&self) -> &str {
        match self {
            Self::Raw { raw } | Self::Parsed { raw, .. } => raw,
        }
    }

    /// Parsed fields, if the store supplied them.
    pub const fn fields(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Raw { .. } => None,
            Self::Parsed { fields, .. } => Some(fields),
        }
    }
}

/// One captured log message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned identifier, unique across the timeline.
    pub id: MessageId,
    /// Capture time; the ordering key.
    pub timestamp: DateTime<Utc>,
    /// Originating session or stream.
    pub session: String,
    /// Direction tag of the traffic (e.g. inbound/outbound), as reported.
    #[serde(default)]
    pub tag: Option<String>,
    /// Message payload.
    pub body: MessageBody,
}

impl Message {
    /// Create a message with a raw body.
    pub fn new(
        id: impl Into<MessageId>,
        timestamp: DateTime<Utc>,
        session: impl Into<String>,
        body: MessageBody,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            session: session.into(),
            tag: None,
            body,
        }
    }

    /// Decode a single pushed item payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the payload is not a valid message.
    pub fn decode(payload: &str) -> Result<Self, DecodeError> {
        let message: Self = serde_json::from_str(payload)?;
        if message.id.as_str().is_empty() {
            return Err(DecodeError::MissingId);
        }
        Ok(message)
    }

    /// Encode this message the way the store pushes it.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if serialization fails.
    pub fn encode(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
