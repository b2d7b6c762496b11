//! Heartbeat tracking: server-side scan progress for one subscription.

use crate::model::Heartbeat;
use chrono::{DateTime, Utc};
use tracing::trace;

/// Records the latest scan progress of the current subscription.
///
/// The scan counter only moves forward within one subscription; a report
/// that goes backwards is ignored.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatTracker {
    /// Anchor timestamp the current subscription scans from.
    anchor: Option<DateTime<Utc>>,
    /// Latest accepted heartbeat.
    latest: Option<Heartbeat>,
}

impl HeartbeatTracker {
    /// Create an empty tracker.
    pub const fn new() -> Self {
        Self {
            anchor: None,
            latest: None,
        }
    }

    /// Start tracking a new subscription anchored at `anchor`.
    pub fn reset(&mut self, anchor: DateTime<Utc>) {
        self.anchor = Some(anchor);
        self.latest = None;
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.anchor = None;
        self.latest = None;
    }

    /// Record a heartbeat. Returns `true` if it was accepted.
    pub fn record(&mut self, heartbeat: Heartbeat) -> bool {
        if let Some(latest) = self.latest {
            if heartbeat.scan_counter < latest.scan_counter {
                trace!(
                    target: "backscroll::channel",
                    latest = latest.scan_counter,
                    got = heartbeat.scan_counter,
                    "ignoring regressing heartbeat"
                );
                return false;
            }
        }
        self.latest = Some(heartbeat);
        true
    }

    /// Latest accepted heartbeat.
    pub const fn latest(&self) -> Option<Heartbeat> {
        self.latest
    }

    /// Whether the scan moved past the anchor.
    ///
    /// True when the server scanned at least one record and reported a
    /// position other than the one the subscription started from.
    pub fn advanced(&self) -> bool {
        match (self.latest, self.anchor) {
            (Some(latest), Some(anchor)) => latest.scan_counter > 0 && latest.timestamp != anchor,
            (Some(latest), None) => latest.scan_counter > 0,
            (None, _) => false,
        }
    }
}
