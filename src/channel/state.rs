//! Observable channel state.

use crate::model::Heartbeat;

/// Lifecycle phase of a [`StreamChannel`](super::StreamChannel).
///
/// ```text
/// Idle ──load──▶ Connecting ──first event──▶ Streaming ──close──▶ Closed
///                    │                           │                  │
///                    └────────── error ──────────┴──▶ Errored       └──load──▶ Connecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelPhase {
    /// No subscription has been opened since construction or `stop()`.
    #[default]
    Idle,
    /// Subscription opened, nothing received yet.
    Connecting,
    /// At least one item or heartbeat received.
    Streaming,
    /// The server finished the scan.
    Closed,
    /// The subscription failed; the instance cannot load again.
    Errored,
}

impl ChannelPhase {
    /// Whether a subscription is currently open.
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming)
    }
}

/// Snapshot of a channel's flags.
///
/// `is_loading` and `is_end_reached` are never both set, and `is_error`
/// forces `is_loading` off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelState {
    /// Lifecycle phase.
    pub phase: ChannelPhase,
    /// A `load()` is waiting for its first chunk.
    pub is_loading: bool,
    /// The subscription failed.
    pub is_error: bool,
    /// The server confirmed there is nothing further in this direction.
    pub is_end_reached: bool,
    /// The last scan matched nothing but made progress; more can be scanned.
    pub no_matching_messages: bool,
    /// The live scheduler is delivering items as they arrive.
    pub is_live: bool,
    /// Latest scan progress reported by the server.
    pub last_heartbeat: Option<Heartbeat>,
    /// Emission order within one channel, stamped under the channel lock.
    ///
    /// State callbacks run on several threads and can arrive out of order;
    /// an observer keeps the state with the highest `seq` it has seen.
    pub seq: u64,
}

impl ChannelState {
    /// Whether this state was emitted after `other`.
    pub const fn supersedes(&self, other: &Self) -> bool {
        self.seq >= other.seq
    }

    /// Check the flag invariants.
    pub const fn is_consistent(&self) -> bool {
        !(self.is_loading && self.is_end_reached) && !(self.is_error && self.is_loading)
    }
}
