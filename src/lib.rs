//! # Backscroll
//!
//! Bidirectional pagination and live tail over server-push log streams.
//!
//! A log viewer anchored at some point in time needs to load older history
//! when the user scrolls up, newer history when the user scrolls down, and,
//! at the newest end, follow messages as they are written. Backscroll does
//! this with one server-push subscription per direction.
//!
//! ## Core Concepts
//!
//! - **Retrieval race**: a load returns when the server closes the
//!   subscription, or when a response timeout fires first; then the channel
//!   goes live and keeps delivering on an interval
//! - **Heartbeats**: scan progress that lets a search which matched nothing
//!   be resumed from where the server stopped
//! - **Stable logical indices**: prepending older messages never renumbers
//!   what is already on screen
//!
//! ## Example
//!
//! ```rust,ignore
//! use backscroll::{CoordinatorConfig, MemoryTransport, StreamCoordinator};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let mut coordinator = StreamCoordinator::new(CoordinatorConfig::default(), transport)?;
//!
//! let newer = coordinator.load_next()?;
//! let older = coordinator.load_previous()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod buffer;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod transport;

// Re-exports for convenience
pub use buffer::MessageBuffer;
pub use channel::{ChannelCallbacks, ChannelCanceller, ChannelPhase, ChannelState, StreamChannel};
pub use config::{ChannelConfig, CoordinatorConfig};
pub use coordinator::{CoordinatorSnapshot, DirectionStatus, StreamCoordinator};
pub use error::{DecodeError, Error, Result, TransportError};
pub use model::{Anchor, Direction, Heartbeat, Message, MessageBody, MessageId, StreamQuery, SubscriptionRequest};
pub use transport::{MemoryTransport, PushEvent, ReaderTransport, ScriptStep, Subscription, Transport};
