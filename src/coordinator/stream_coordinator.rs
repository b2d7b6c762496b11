//! Stream coordinator: Two channels feeding one message buffer.
//!
//! The coordinator owns a next (newer) and a previous (older) channel and
//! merges their chunks into a single [`MessageBuffer`]. Results arrive two
//! ways: as the return value of a load, and through channel callbacks once
//! a channel has gone live. Both paths funnel into the same merge.
//!
//! Observers receive a [`CoordinatorSnapshot`] on every change. Snapshots
//! are published with `try_send`; a listener that falls behind misses
//! intermediate snapshots rather than stalling a channel worker.
//!
//! The coordinator lock is never held while a channel is loaded or
//! stopped. Channel callbacks take that lock from worker threads, and
//! stopping a channel joins those threads.

use super::status::{CoordinatorSnapshot, DirectionStatus};
use crate::buffer::MessageBuffer;
use crate::channel::{ChannelCallbacks, ChannelCanceller, StreamChannel};
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::model::{Anchor, Direction, Message, StreamQuery};
use crate::transport::Transport;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Capacity of each listener queue.
const LISTENER_CAPACITY: usize = 64;

/// State shared with channel callbacks.
#[derive(Default)]
struct Inner {
    buffer: MessageBuffer,
    next: DirectionStatus,
    previous: DirectionStatus,
    listeners: Vec<Sender<CoordinatorSnapshot>>,
}

impl Inner {
    fn status(&self, direction: Direction) -> &DirectionStatus {
        match direction {
            Direction::Next => &self.next,
            Direction::Previous => &self.previous,
        }
    }

    fn status_mut(&mut self, direction: Direction) -> &mut DirectionStatus {
        match direction {
            Direction::Next => &mut self.next,
            Direction::Previous => &mut self.previous,
        }
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            next: self.next.clone(),
            previous: self.previous.clone(),
            is_live: self.next.is_live,
            start_index: self.buffer.start_index(),
            len: self.buffer.len(),
        }
    }

    fn publish(&mut self) {
        if self.listeners.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        self.listeners.retain(|tx| {
            !matches!(
                tx.try_send(snapshot.clone()),
                Err(TrySendError::Disconnected(_))
            )
        });
    }

    fn merge(&mut self, direction: Direction, chunk: Vec<Message>) -> Vec<Message> {
        if chunk.is_empty() {
            return chunk;
        }
        let offered = chunk.len();
        let inserted = self.buffer.merge(direction, chunk);
        trace!(
            target: "backscroll::coordinator",
            %direction,
            offered,
            inserted = inserted.len(),
            start_index = self.buffer.start_index(),
            "merged chunk"
        );
        if !inserted.is_empty() {
            self.publish();
        }
        inserted
    }
}

/// Bidirectional pagination and live tail over one message buffer.
pub struct StreamCoordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    inner: Arc<Mutex<Inner>>,
    next: StreamChannel,
    previous: StreamChannel,
}

impl StreamCoordinator {
    /// Create a coordinator with an empty buffer and idle channels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the channel settings are invalid.
    pub fn new(config: CoordinatorConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.channel.validate()?;
        let inner = Arc::new(Mutex::new(Inner::default()));
        let next = Self::make_channel(Direction::Next, &config, &transport, &inner);
        let previous = Self::make_channel(Direction::Previous, &config, &transport, &inner);
        Ok(Self {
            config,
            transport,
            inner,
            next,
            previous,
        })
    }

    /// Load messages newer than the newest buffered one.
    ///
    /// With an empty buffer the configured anchor is used. If the channel
    /// goes live, later messages are merged as they are delivered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the subscription cannot be opened.
    pub fn load_next(&mut self) -> Result<Vec<Message>> {
        let anchor = self.edge_anchor(Direction::Next);
        self.load(Direction::Next, anchor)
    }

    /// Load messages older than the oldest buffered one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the subscription cannot be opened.
    pub fn load_previous(&mut self) -> Result<Vec<Message>> {
        let anchor = self.edge_anchor(Direction::Previous);
        self.load(Direction::Previous, anchor)
    }

    /// Continue a scan that matched nothing, from its last heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoHeartbeat`] if the direction has not reported
    /// scan progress, and [`Error::Transport`] if the subscription cannot
    /// be opened.
    pub fn keep_loading(&mut self, direction: Direction) -> Result<Vec<Message>> {
        let heartbeat = self
            .inner
            .lock()
            .status(direction)
            .last_heartbeat
            .ok_or(Error::NoHeartbeat(direction))?;
        info!(
            target: "backscroll::coordinator",
            %direction,
            scanned_to = %heartbeat.timestamp,
            scan_counter = heartbeat.scan_counter,
            "continuing scan from heartbeat"
        );
        self.load(direction, Anchor::at(heartbeat.timestamp))
    }

    /// Start tailing new messages. A no-op if already live.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the subscription cannot be opened.
    pub fn enter_live_mode(&mut self) -> Result<Vec<Message>> {
        if self.is_live() {
            return Ok(Vec::new());
        }
        self.load_next()
    }

    /// Stop tailing. Buffered messages are kept.
    pub fn exit_live_mode(&mut self) {
        info!(target: "backscroll::coordinator", "leaving live mode");
        self.next.stop();
    }

    /// Whether the next direction is delivering live.
    pub fn is_live(&self) -> bool {
        self.inner.lock().next.is_live
    }

    /// Stop both channels. Buffered messages are kept.
    pub fn stop_all(&mut self) {
        self.next.stop();
        self.previous.stop();
    }

    /// Replace the filters, discarding everything loaded so far.
    pub fn set_query(&mut self, query: StreamQuery) {
        self.stop_all();
        self.next.set_query(query.clone());
        self.previous.set_query(query.clone());
        self.config.query = query;

        let mut inner = self.inner.lock();
        inner.buffer.clear();
        inner.next = DirectionStatus::default();
        inner.previous = DirectionStatus::default();
        inner.publish();
        debug!(target: "backscroll::coordinator", "query replaced, buffer cleared");
    }

    /// Merge a chunk delivered by the next channel. Returns the messages
    /// that were not already buffered.
    pub fn on_next_channel_response(&self, chunk: Vec<Message>) -> Vec<Message> {
        self.inner.lock().merge(Direction::Next, chunk)
    }

    /// Merge a chunk delivered by the previous channel. Returns the
    /// messages that were not already buffered.
    pub fn on_prev_channel_response(&self, chunk: Vec<Message>) -> Vec<Message> {
        self.inner.lock().merge(Direction::Previous, chunk)
    }

    /// Current observable state.
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        self.inner.lock().snapshot()
    }

    /// Receive a snapshot on every change, starting with the current one.
    pub fn subscribe(&self) -> Receiver<CoordinatorSnapshot> {
        let (tx, rx) = bounded(LISTENER_CAPACITY);
        let mut inner = self.inner.lock();
        let _ = tx.try_send(inner.snapshot());
        inner.listeners.push(tx);
        rx
    }

    /// Run `f` against the buffer.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&MessageBuffer) -> R) -> R {
        f(&self.inner.lock().buffer)
    }

    /// Copy of every buffered message, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().buffer.iter().cloned().collect()
    }

    /// Handle that cancels the current subscription of `direction` from
    /// another thread. A channel rebuilt after a failure gets a new handle.
    pub fn canceller(&self, direction: Direction) -> ChannelCanceller {
        self.channel(direction).canceller()
    }

    /// Active configuration.
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn load(&mut self, direction: Direction, anchor: Anchor) -> Result<Vec<Message>> {
        self.ensure_channel(direction);
        let chunk = self.channel_mut(direction).load(anchor)?;
        Ok(self.inner.lock().merge(direction, chunk))
    }

    fn edge_anchor(&self, direction: Direction) -> Anchor {
        let inner = self.inner.lock();
        let edge = match direction {
            Direction::Next => inner.buffer.last(),
            Direction::Previous => inner.buffer.first(),
        };
        edge.map_or_else(
            || self.config.anchor.clone(),
            |m| Anchor::after(m.timestamp, m.id.clone()),
        )
    }

    /// Replace a channel that failed, so a new load can retry.
    fn ensure_channel(&mut self, direction: Direction) {
        if !self.channel(direction).is_terminated() {
            return;
        }
        debug!(target: "backscroll::coordinator", %direction, "rebuilding failed channel");
        let channel = Self::make_channel(direction, &self.config, &self.transport, &self.inner);
        // The old channel joins its workers on drop, so none of its states
        // can land after the sequence restarts.
        drop(std::mem::replace(self.channel_mut(direction), channel));
        self.inner.lock().status_mut(direction).restart_sequence();
    }

    const fn channel(&self, direction: Direction) -> &StreamChannel {
        match direction {
            Direction::Next => &self.next,
            Direction::Previous => &self.previous,
        }
    }

    fn channel_mut(&mut self, direction: Direction) -> &mut StreamChannel {
        match direction {
            Direction::Next => &mut self.next,
            Direction::Previous => &mut self.previous,
        }
    }

    fn make_channel(
        direction: Direction,
        config: &CoordinatorConfig,
        transport: &Arc<dyn Transport>,
        inner: &Arc<Mutex<Inner>>,
    ) -> StreamChannel {
        let on_response = inner.clone();
        let on_state = inner.clone();
        let on_error = inner.clone();
        let callbacks = ChannelCallbacks::new()
            .on_response(move |chunk| {
                on_response.lock().merge(direction, chunk);
            })
            .on_state(move |state| {
                let mut inner = on_state.lock();
                inner.status_mut(direction).apply(state);
                inner.publish();
            })
            .on_error(move |error| {
                warn!(target: "backscroll::coordinator", %direction, %error, "channel failed");
                let mut inner = on_error.lock();
                inner.status_mut(direction).last_error = Some(error.clone());
                inner.publish();
            });

        let mut channel =
            StreamChannel::new(direction, config.channel.clone(), transport.clone(), callbacks);
        channel.set_query(config.query.clone());
        channel
    }
}

impl Drop for StreamCoordinator {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::error::TransportError;
    use crate::model::{Heartbeat, MessageBody, MessageId};
    use crate::transport::{MemoryTransport, ScriptStep};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, secs: i64) -> Message {
        Message::new(id, at(secs), "s", MessageBody::raw(id))
    }

    fn coordinator(transport: &MemoryTransport) -> StreamCoordinator {
        let config = CoordinatorConfig {
            channel: ChannelConfig {
                response_timeout_ms: 1_000,
                live_interval_ms: 10,
                chunk_size: 50,
            },
            anchor: Anchor::at(at(0)),
            query: StreamQuery::default(),
        };
        StreamCoordinator::new(config, Arc::new(transport.clone())).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = CoordinatorConfig::default();
        config.channel.chunk_size = 0;
        let result = StreamCoordinator::new(config, Arc::new(MemoryTransport::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_next_anchors_after_newest() {
        let transport = MemoryTransport::new();
        transport.push_script(vec![
            ScriptStep::Item(msg("a", 1)),
            ScriptStep::Item(msg("b", 2)),
            ScriptStep::Close(None),
        ]);
        transport.push_script(vec![ScriptStep::Close(None)]);
        let mut coordinator = coordinator(&transport);

        let first = coordinator.load_next().unwrap();
        assert_eq!(first.len(), 2);
        coordinator.load_next().unwrap();

        let requests = transport.requests();
        assert_eq!(requests[0].anchor, Anchor::at(at(0)));
        assert_eq!(requests[1].anchor, Anchor::after(at(2), MessageId::new("b")));
    }

    #[test]
    fn test_load_previous_anchors_before_oldest() {
        let transport = MemoryTransport::new();
        transport.push_script(vec![ScriptStep::Item(msg("m", 10)), ScriptStep::Close(None)]);
        transport.push_script(vec![
            ScriptStep::Item(msg("l", 9)),
            ScriptStep::Item(msg("k", 8)),
            ScriptStep::Close(None),
        ]);
        let mut coordinator = coordinator(&transport);

        coordinator.load_next().unwrap();
        let older = coordinator.load_previous().unwrap();

        assert_eq!(older.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["k", "l"]);
        let requests = transport.requests();
        assert_eq!(requests[1].direction, Direction::Previous);
        assert_eq!(requests[1].anchor, Anchor::after(at(10), MessageId::new("m")));
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.start_index, -2);
        assert_eq!(snapshot.len, 3);
    }

    #[test]
    fn test_response_handlers_dedupe() {
        let coordinator = coordinator(&MemoryTransport::new());
        let inserted = coordinator.on_next_channel_response(vec![msg("a", 1), msg("b", 2)]);
        assert_eq!(inserted.len(), 2);
        let inserted = coordinator.on_prev_channel_response(vec![msg("a", 1)]);
        assert!(inserted.is_empty());
        assert_eq!(coordinator.with_buffer(MessageBuffer::len), 2);
    }

    #[test]
    fn test_keep_loading_without_heartbeat() {
        let mut coordinator = coordinator(&MemoryTransport::new());
        assert!(matches!(
            coordinator.keep_loading(Direction::Previous),
            Err(Error::NoHeartbeat(Direction::Previous))
        ));
    }

    #[test]
    fn test_failed_channel_is_rebuilt() {
        let transport = MemoryTransport::new();
        transport.fail_next_open(TransportError::Connect("refused".into()));
        transport.push_script(vec![ScriptStep::Item(msg("a", 1)), ScriptStep::Close(None)]);
        let mut coordinator = coordinator(&transport);

        assert!(coordinator.load_next().is_err());
        let snapshot = coordinator.snapshot();
        assert!(snapshot.next.is_error);
        assert!(snapshot.next.last_error.is_some());

        let chunk = coordinator.load_next().unwrap();
        assert_eq!(chunk.len(), 1);
        assert!(!coordinator.snapshot().next.is_error);
    }

    #[test]
    fn test_set_query_clears_everything() {
        let transport = MemoryTransport::new();
        transport.push_script(vec![
            ScriptStep::Heartbeat(Heartbeat::new(3, at(5))),
            ScriptStep::Item(msg("a", 1)),
            ScriptStep::Close(None),
        ]);
        transport.push_script(vec![ScriptStep::Close(None)]);
        let mut coordinator = coordinator(&transport);
        coordinator.load_next().unwrap();

        let query = StreamQuery::default().with_session("web-1");
        coordinator.set_query(query.clone());
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.len, 0);
        assert_eq!(snapshot.start_index, 0);
        assert_eq!(snapshot.next, DirectionStatus::default());

        coordinator.load_next().unwrap();
        let requests = transport.requests();
        assert_eq!(requests[1].query, query);
        assert_eq!(requests[1].anchor, Anchor::at(at(0)));
    }

    #[test]
    fn test_subscribe_starts_with_current_snapshot() {
        let coordinator = coordinator(&MemoryTransport::new());
        coordinator.on_next_channel_response(vec![msg("a", 1)]);
        let rx = coordinator.subscribe();
        assert_eq!(rx.try_recv().unwrap().len, 1);

        coordinator.on_next_channel_response(vec![msg("b", 2)]);
        assert_eq!(rx.try_recv().unwrap().len, 2);
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let coordinator = coordinator(&MemoryTransport::new());
        drop(coordinator.subscribe());
        coordinator.on_next_channel_response(vec![msg("a", 1)]);
        assert!(coordinator.inner.lock().listeners.is_empty());
    }
}
