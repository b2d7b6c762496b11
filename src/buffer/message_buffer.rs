//! Message buffer: The merged, ordered timeline shown by a virtualized list.
//!
//! Items are addressed by a *logical* index `start_index + position`.
//! Prepending lowers `start_index` instead of renumbering, so every item
//! already on screen keeps its logical index when older history loads.
//!
//! ```text
//!   logical:   -3   -2   -1  │  0    1    2
//!              ───────────── │ ──────────────
//!              prepended     │ first load
//! ```

use crate::model::{Direction, Message, MessageId};
use std::collections::{HashSet, VecDeque};

/// Chronologically ordered, deduplicated sequence of messages.
#[derive(Debug, Clone, Default)]
pub struct MessageBuffer {
    /// Messages in timestamp order (ties in arrival order).
    items: VecDeque<Message>,
    /// Identifiers present in `items`.
    ids: HashSet<MessageId>,
    /// Logical index of `items[0]`.
    start_index: i64,
}

impl MessageBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Logical index of the first buffered message.
    pub const fn start_index(&self) -> i64 {
        self.start_index
    }

    /// Logical index one past the last buffered message.
    pub fn end_index(&self) -> i64 {
        self.start_index + self.items.len() as i64
    }

    /// Oldest buffered message.
    pub fn first(&self) -> Option<&Message> {
        self.items.front()
    }

    /// Newest buffered message.
    pub fn last(&self) -> Option<&Message> {
        self.items.back()
    }

    /// Message at a position from the front of the buffer.
    pub fn get(&self, position: usize) -> Option<&Message> {
        self.items.get(position)
    }

    /// Message at a logical index.
    pub fn get_logical(&self, index: i64) -> Option<&Message> {
        let position = usize::try_from(index - self.start_index).ok()?;
        self.items.get(position)
    }

    /// Logical index of a message, if buffered.
    pub fn index_of(&self, id: &MessageId) -> Option<i64> {
        if !self.ids.contains(id) {
            return None;
        }
        self.items
            .iter()
            .position(|m| &m.id == id)
            .map(|p| self.start_index + p as i64)
    }

    /// Whether a message is buffered.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Iterate over buffered messages, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.items.iter()
    }

    /// Messages whose logical index falls in `[from, from + count)`.
    ///
    /// This is what a virtualized list asks for when it renders a window.
    pub fn window(&self, from: i64, count: usize) -> impl Iterator<Item = &Message> {
        let total = self.items.len();
        let start = usize::try_from(from - self.start_index).unwrap_or(0).min(total);
        let skipped = usize::try_from(self.start_index - from).unwrap_or(0);
        let end = start + count.saturating_sub(skipped);
        self.items.range(start..end.min(total))
    }

    /// Merge a chronological chunk delivered by a channel.
    ///
    /// Chunks from the previous direction go in at the front, ties placed
    /// before existing equal timestamps; chunks from the next direction go
    /// in at the back, ties after. Returns the newly inserted messages in
    /// chronological order.
    pub fn merge(&mut self, direction: Direction, chunk: Vec<Message>) -> Vec<Message> {
        match direction {
            Direction::Previous => self.merge_front(chunk),
            Direction::Next => self.merge_back(chunk),
        }
    }

    /// Merge a chunk toward the newest end.
    pub fn merge_back(&mut self, chunk: Vec<Message>) -> Vec<Message> {
        let mut inserted = Vec::new();
        for message in chunk {
            if self.ids.contains(&message.id) {
                continue;
            }
            let position = self
                .items
                .partition_point(|m| m.timestamp <= message.timestamp);
            self.insert_at(position, message.clone());
            inserted.push(message);
        }
        inserted
    }

    /// Merge a chunk toward the oldest end.
    pub fn merge_front(&mut self, chunk: Vec<Message>) -> Vec<Message> {
        let mut inserted = Vec::new();
        for message in chunk.into_iter().rev() {
            if self.ids.contains(&message.id) {
                continue;
            }
            let position = self
                .items
                .partition_point(|m| m.timestamp < message.timestamp);
            self.insert_at(position, message.clone());
            inserted.push(message);
        }
        inserted.reverse();
        inserted
    }

    /// Clear all content and reset the anchor.
    pub fn clear(&mut self) {
        self.items.clear();
        self.ids.clear();
        self.start_index = 0;
    }

    fn insert_at(&mut self, position: usize, message: Message) {
        // A new head extends the timeline backwards; everything already
        // buffered keeps its logical index.
        if position == 0 && !self.items.is_empty() {
            self.start_index -= 1;
        }
        self.ids.insert(message.id.clone());
        self.items.insert(position, message);
    }
}
