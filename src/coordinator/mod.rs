//! Coordinator: Merges both directions into one scrollable timeline.
//!
//! - [`StreamCoordinator`]: owns the channels and the buffer
//! - [`CoordinatorSnapshot`]: what listeners observe after every change

mod status;
mod stream_coordinator;

pub use status::{CoordinatorSnapshot, DirectionStatus};
pub use stream_coordinator::StreamCoordinator;
