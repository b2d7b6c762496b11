//! Subscription request parameters and scan-progress markers.

use super::message::{Direction, MessageId};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Server-reported scan progress.
///
/// Advances even when nothing matched, so a client can tell "no data
/// exists" from "no matches yet, still scanning".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Number of records the server has scanned in this subscription.
    pub scan_counter: u64,
    /// Timeline position the scan has reached.
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    /// Create a heartbeat.
    pub const fn new(scan_counter: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            scan_counter,
            timestamp,
        }
    }
}

/// Where a subscription starts scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// Point in time the scan starts from.
    pub timestamp: DateTime<Utc>,
    /// Resume strictly past this message, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<MessageId>,
}

impl Anchor {
    /// Anchor at a point in time.
    pub const fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            resume_from: None,
        }
    }

    /// Anchor just past an already-seen message.
    pub const fn after(timestamp: DateTime<Utc>, id: MessageId) -> Self {
        Self {
            timestamp,
            resume_from: Some(id),
        }
    }
}

/// Filters applied server-side to the scanned traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamQuery {
    /// Sessions/streams to include (empty = all).
    #[serde(default)]
    pub sessions: Vec<String>,
    /// Free-text match on the payload.
    #[serde(default)]
    pub text: Option<String>,
    /// Structured `field = value` constraints.
    #[serde(default)]
    pub fields: Vec<(String, String)>,
}

impl StreamQuery {
    /// Restrict the query to one session.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.sessions.push(session.into());
        self
    }

    /// Add a free-text filter.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Add a structured field constraint.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }
}

/// Everything a transport needs to open one directional subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Scan direction.
    pub direction: Direction,
    /// Scan start.
    pub anchor: Anchor,
    /// Server-side filters.
    pub query: StreamQuery,
    /// Maximum number of items the server should push.
    pub limit: usize,
}

impl SubscriptionRequest {
    /// Key/value pairs as an endpoint receives them.
    ///
    /// Session and field filters repeat their key once per value.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("direction".to_string(), self.direction.as_str().to_string()),
            (
                "anchor".to_string(),
                self.anchor
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            ("limit".to_string(), self.limit.to_string()),
        ];
        if let Some(id) = &self.anchor.resume_from {
            pairs.push(("resume_from".to_string(), id.to_string()));
        }
        for session in &self.query.sessions {
            pairs.push(("session".to_string(), session.clone()));
        }
        if let Some(text) = &self.query.text {
            pairs.push(("q".to_string(), text.clone()));
        }
        for (field, value) in &self.query.fields {
            pairs.push(("field".to_string(), format!("{field}={value}")));
        }
        pairs
    }
}
