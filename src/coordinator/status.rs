//! Observable coordinator state handed to listeners.

use crate::channel::{ChannelPhase, ChannelState};
use crate::error::TransportError;
use crate::model::{Direction, Heartbeat};

/// What the presentation layer needs to know about one direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectionStatus {
    /// A load is waiting for its first chunk.
    pub is_loading: bool,
    /// The direction's subscription failed; a new load retries.
    pub is_error: bool,
    /// Nothing further exists in this direction.
    pub is_end_reached: bool,
    /// The last scan matched nothing but progressed; offer "keep loading".
    pub no_matching_messages: bool,
    /// Items are being delivered live as they arrive.
    pub is_live: bool,
    /// Latest scan progress ("scanned up to T").
    pub last_heartbeat: Option<Heartbeat>,
    /// Failure behind `is_error`.
    pub last_error: Option<TransportError>,
    /// Sequence number of the newest channel state folded in.
    applied_seq: u64,
}

impl DirectionStatus {
    /// Accept states from a freshly built channel, whose sequence starts over.
    pub(crate) fn restart_sequence(&mut self) {
        self.applied_seq = 0;
    }

    /// Fold a channel state change into this status. States older than
    /// the last one applied are dropped.
    pub(crate) fn apply(&mut self, state: &ChannelState) {
        if state.seq < self.applied_seq {
            return;
        }
        self.applied_seq = state.seq;
        if state.phase == ChannelPhase::Connecting || !state.is_error {
            self.last_error = None;
        }
        self.is_loading = state.is_loading;
        self.is_error = state.is_error;
        self.is_end_reached = state.is_end_reached;
        self.no_matching_messages = state.no_matching_messages;
        self.is_live = state.is_live;
        if state.last_heartbeat.is_some() || state.phase == ChannelPhase::Idle {
            self.last_heartbeat = state.last_heartbeat;
        }
    }
}

/// Immutable snapshot of a coordinator, emitted on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    /// Status of the next (newer) direction.
    pub next: DirectionStatus,
    /// Status of the previous (older) direction.
    pub previous: DirectionStatus,
    /// The next direction is live-tailing.
    pub is_live: bool,
    /// Logical index of the first buffered message.
    pub start_index: i64,
    /// Number of buffered messages.
    pub len: usize,
}

impl CoordinatorSnapshot {
    /// Status of one direction.
    pub const fn status(&self, direction: Direction) -> &DirectionStatus {
        match direction {
            Direction::Next => &self.next,
            Direction::Previous => &self.previous,
        }
    }

    /// Whether `direction` is loading.
    pub const fn is_loading(&self, direction: Direction) -> bool {
        self.status(direction).is_loading
    }

    /// Whether `direction` should offer "keep loading".
    pub const fn no_matching_messages(&self, direction: Direction) -> bool {
        self.status(direction).no_matching_messages
    }
}
