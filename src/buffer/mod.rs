//! Buffer module: The merged message timeline and its virtualization anchor.
//!
//! This module contains:
//! - [`MessageBuffer`]: Ordered, deduplicated messages addressed by stable
//!   logical indices

mod message_buffer;

pub use message_buffer::MessageBuffer;
