//! Channel: One directional server-push subscription.
//!
//! This module contains:
//! - [`StreamChannel`]: subscription ownership, the timeout race and live delivery
//! - [`ChannelState`]: observable flags and lifecycle phase
//! - [`HeartbeatTracker`]: scan progress of the current subscription
//!
//! Worker threads (the subscription pump and the live scheduler) are
//! private to the channel and released on every exit path.

mod heartbeat;
mod scheduler;
mod state;
mod stream;
mod worker;

pub use heartbeat::HeartbeatTracker;
pub use state::{ChannelPhase, ChannelState};
pub use stream::{ChannelCallbacks, ChannelCanceller, StreamChannel};
