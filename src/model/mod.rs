//! Model: Data types shared by channels, the coordinator and transports.
//!
//! This module contains:
//! - [`Message`]: One captured log record with a tagged [`MessageBody`]
//! - [`Heartbeat`]: Server-side scan progress
//! - [`SubscriptionRequest`]: Parameters for opening a directional subscription

mod message;
mod request;

pub use message::{Direction, Message, MessageBody, MessageId};
pub use request::{Anchor, Heartbeat, StreamQuery, SubscriptionRequest};
