//! Transport: Server-push subscriptions feeding the stream channels.
//!
//! A [`Transport`] opens one [`Subscription`] per directional request. The
//! subscription hands out a receiver of [`PushEvent`]s and closes its
//! server side when dropped, so whoever owns it owns the connection.
//!
//! # Event Protocol
//!
//! ```text
//!   Item(payload)*  Heartbeat*  ──▶  Close { heartbeat }   (scan finished)
//!                                ├▶  Error(detail)         (server failure)
//!                                └▶  Failed(error)         (stream failure)
//! ```
//!
//! Items and heartbeats may interleave freely. A receiver that disconnects
//! without `Close`, `Error` or `Failed` counts as a transport failure.

pub mod memory;
mod reader;
pub mod sse;

pub use memory::{MemoryTransport, ScriptStep, ServerHandle};
pub use reader::{ReaderTransport, StreamOpener};

use crate::error::TransportError;
use crate::model::{Heartbeat, SubscriptionRequest};
use crossbeam_channel::Receiver;

/// Events pushed by the server over one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// One encoded message payload.
    Item(String),

    /// Scan progress report.
    Heartbeat(Heartbeat),

    /// The server finished scanning for this subscription.
    Close {
        /// Final scan progress, if the server attached one.
        heartbeat: Option<Heartbeat>,
    },

    /// The server reported a failure.
    Error(String),

    /// The client side of the transport failed (the stream broke).
    Failed(TransportError),
}

/// An open server-push subscription.
///
/// Dropping the subscription closes it.
pub struct Subscription {
    /// Pushed events, in server delivery order.
    events: Receiver<PushEvent>,
    /// Runs once when the subscription is closed.
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap an event receiver.
    pub fn new(events: Receiver<PushEvent>) -> Self {
        Self {
            events,
            on_close: None,
        }
    }

    /// Register a hook that tells the server side the client went away.
    #[must_use]
    pub fn with_close_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Receiver of pushed events.
    #[inline]
    pub const fn events(&self) -> &Receiver<PushEvent> {
        &self.events
    }

    /// Close the subscription explicitly.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pending", &self.events.len())
            .finish_non_exhaustive()
    }
}

/// Opens directional subscriptions against a log store.
///
/// Implementations may feed a subscription from their own threads. Those
/// threads are not joined by the channel: dropping the [`Subscription`]
/// only runs its close hook, and a producer blocked on I/O exits when its
/// source next yields or ends.
pub trait Transport: Send + Sync {
    /// Open a subscription for the request.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the subscription cannot be opened.
    fn open(&self, request: &SubscriptionRequest) -> Result<Subscription, TransportError>;
}
