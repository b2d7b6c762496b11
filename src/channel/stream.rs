//! Stream channel: One server-push subscription in one search direction.
//!
//! # Retrieval Race
//!
//! `load()` opens a subscription and then waits on two things at once:
//!
//! 1. **Completion**: the server closes (or fails) the subscription. The
//!    accumulated items are returned as the chunk.
//! 2. **Timeout**: the fixed response timeout elapses first. Whatever has
//!    accumulated is returned, and the channel switches to live delivery:
//!    a scheduler flushes newly accumulated items through the response
//!    callback until the subscription closes, `stop()` is called, or a new
//!    `load()` supersedes it.
//!
//! ```text
//!  load() ──open──▶ pump thread ── items ──▶ accumulated
//!    │                   │
//!    ├─ done_rx ◀─ close/error                (completion wins)
//!    └─ after(timeout) ──▶ LiveScheduler ──▶ on_response  (timeout wins)
//! ```
//!
//! All channel state lives behind one lock and carries a generation
//! number. Every worker is tagged with the generation it was started for;
//! `stop()` and `load()` bump it, so a worker that wakes late finds itself
//! stale and leaves the state alone.

use super::heartbeat::HeartbeatTracker;
use super::scheduler::LiveScheduler;
use super::state::{ChannelPhase, ChannelState};
use super::worker::Worker;
use crate::config::ChannelConfig;
use crate::error::{Error, Result, TransportError};
use crate::model::{Anchor, Direction, Message, StreamQuery, SubscriptionRequest};
use crate::transport::{PushEvent, Subscription, Transport};
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

type ResponseFn = dyn Fn(Vec<Message>) + Send + Sync;
type ErrorFn = dyn Fn(&TransportError) + Send + Sync;
type StateFn = dyn Fn(&ChannelState) + Send + Sync;

/// Callbacks through which a channel reports asynchronous activity.
///
/// They run on the channel's worker threads (or on the caller of
/// `load()`/`stop()`), never while the channel's lock is held. State
/// callbacks from different threads may interleave; see
/// [`ChannelState::seq`].
pub struct ChannelCallbacks {
    /// Items delivered outside `load()` (live flushes).
    on_response: Box<ResponseFn>,
    /// Subscription failure, invoked once per failed subscription.
    on_error: Box<ErrorFn>,
    /// Every observable state change.
    on_state: Box<StateFn>,
}

impl ChannelCallbacks {
    /// Callbacks that ignore everything.
    pub fn new() -> Self {
        Self {
            on_response: Box::new(|_| {}),
            on_error: Box::new(|_| {}),
            on_state: Box::new(|_| {}),
        }
    }

    /// Set the live delivery callback.
    #[must_use]
    pub fn on_response(mut self, f: impl Fn(Vec<Message>) + Send + Sync + 'static) -> Self {
        self.on_response = Box::new(f);
        self
    }

    /// Set the error callback.
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.on_error = Box::new(f);
        self
    }

    /// Set the state change callback.
    #[must_use]
    pub fn on_state(mut self, f: impl Fn(&ChannelState) + Send + Sync + 'static) -> Self {
        self.on_state = Box::new(f);
        self
    }
}

impl Default for ChannelCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

/// Side effects decided under the lock, run after releasing it.
#[derive(Debug, Default)]
struct Effects {
    deliver: Vec<Message>,
    error: Option<TransportError>,
    state: Option<ChannelState>,
}

impl Effects {
    fn run(self, callbacks: &ChannelCallbacks) {
        if !self.deliver.is_empty() {
            (callbacks.on_response)(self.deliver);
        }
        if let Some(error) = &self.error {
            (callbacks.on_error)(error);
        }
        if let Some(state) = &self.state {
            (callbacks.on_state)(state);
        }
    }
}

/// Outcome of feeding one event to the state machine.
#[derive(Debug, Default)]
struct Step {
    effects: Effects,
    /// The subscription is finished (or stale); the pump should exit.
    done: bool,
}

impl Step {
    fn stale() -> Self {
        Self {
            effects: Effects::default(),
            done: true,
        }
    }
}

/// Channel state shared with the worker threads.
struct Shared {
    direction: Direction,
    /// Item limit of each request.
    limit: usize,
    /// Bumped whenever the current subscription is abandoned.
    generation: u64,
    /// Last sequence number stamped onto an emitted state.
    seq: u64,
    state: ChannelState,
    /// Items received and not yet handed out, in arrival order.
    accumulated: VecDeque<Message>,
    /// Items received over the current subscription.
    received: usize,
    heartbeat: HeartbeatTracker,
    /// Signals the pending `load()`; `None` once the race is settled.
    completion: Option<Sender<()>>,
    /// Dropping this wakes the pump so it can exit.
    cancel: Option<Sender<()>>,
}

impl Shared {
    fn new(direction: Direction, limit: usize) -> Self {
        Self {
            direction,
            limit,
            generation: 0,
            seq: 0,
            state: ChannelState::default(),
            accumulated: VecDeque::new(),
            received: 0,
            heartbeat: HeartbeatTracker::new(),
            completion: None,
            cancel: None,
        }
    }

    /// Copy of the state for a callback, stamped with the next sequence
    /// number. Must be taken under the lock that orders the mutations.
    fn stamp(&mut self) -> ChannelState {
        self.seq += 1;
        self.state.seq = self.seq;
        self.state
    }

    /// Start a new subscription lifetime.
    fn begin(&mut self, anchor: &Anchor, completion: Sender<()>, cancel: Sender<()>) -> (u64, ChannelState) {
        self.generation += 1;
        self.accumulated.clear();
        self.received = 0;
        self.heartbeat.reset(anchor.timestamp);
        self.completion = Some(completion);
        self.cancel = Some(cancel);
        self.state = ChannelState {
            phase: ChannelPhase::Connecting,
            is_loading: true,
            ..ChannelState::default()
        };
        (self.generation, self.stamp())
    }

    /// Abandon the current subscription. Its workers become stale.
    fn release(&mut self) {
        self.generation += 1;
        self.completion = None;
        self.cancel = None;
        self.state.is_live = false;
        self.state.is_loading = false;
    }

    /// Abandon the current subscription and return to initial values.
    ///
    /// An errored channel stays errored.
    fn reset(&mut self) {
        self.release();
        self.accumulated.clear();
        self.received = 0;
        self.heartbeat.clear();
        let errored = self.state.phase == ChannelPhase::Errored;
        self.state = ChannelState::default();
        if errored {
            self.state.phase = ChannelPhase::Errored;
            self.state.is_error = true;
        }
    }

    /// Remove up to `limit` items from the front, in chronological order.
    fn take_chunk(&mut self, limit: Option<usize>) -> Vec<Message> {
        let n = limit.map_or(self.accumulated.len(), |l| l.min(self.accumulated.len()));
        let mut chunk: Vec<Message> = self.accumulated.drain(..n).collect();
        if self.direction.arrives_descending() {
            chunk.reverse();
        }
        chunk
    }

    fn apply(&mut self, generation: u64, event: PushEvent) -> Step {
        if generation != self.generation {
            return Step::stale();
        }
        let mut step = Step::default();

        match event {
            PushEvent::Item(payload) => match Message::decode(&payload) {
                Ok(message) => {
                    self.accumulated.push_back(message);
                    self.received += 1;
                    if self.mark_streaming() {
                        step.effects.state = Some(self.stamp());
                    }
                }
                Err(e) => {
                    warn!(
                        target: "backscroll::channel",
                        direction = %self.direction,
                        error = %e,
                        "dropping malformed item"
                    );
                }
            },
            PushEvent::Heartbeat(heartbeat) => {
                self.mark_streaming();
                if self.heartbeat.record(heartbeat) {
                    self.state.last_heartbeat = Some(heartbeat);
                }
                step.effects.state = Some(self.stamp());
            }
            PushEvent::Close { heartbeat } => {
                if let Some(heartbeat) = heartbeat {
                    if self.heartbeat.record(heartbeat) {
                        self.state.last_heartbeat = Some(heartbeat);
                    }
                }
                self.finish_closed(&mut step.effects);
                step.done = true;
            }
            PushEvent::Error(detail) => {
                self.fail(TransportError::Server(detail), &mut step.effects);
                step.done = true;
            }
            PushEvent::Failed(error) => {
                self.fail(error, &mut step.effects);
                step.done = true;
            }
        }
        step
    }

    fn apply_failure(&mut self, generation: u64, error: TransportError) -> Step {
        if generation != self.generation {
            return Step::stale();
        }
        let mut step = Step {
            done: true,
            ..Step::default()
        };
        self.fail(error, &mut step.effects);
        step
    }

    fn mark_streaming(&mut self) -> bool {
        if self.state.phase == ChannelPhase::Connecting {
            self.state.phase = ChannelPhase::Streaming;
            return true;
        }
        false
    }

    fn finish_closed(&mut self, effects: &mut Effects) {
        let no_match = self.received == 0 && self.heartbeat.advanced();
        self.state.phase = ChannelPhase::Closed;
        self.state.is_loading = false;
        self.state.no_matching_messages = no_match;
        self.state.is_end_reached = !no_match && self.received < self.limit;

        if let Some(completion) = self.completion.take() {
            let _ = completion.send(());
        } else if self.state.is_live {
            self.state.is_live = false;
            effects.deliver = self.take_chunk(None);
        }
        self.cancel = None;

        debug!(
            target: "backscroll::channel",
            direction = %self.direction,
            received = self.received,
            end_reached = self.state.is_end_reached,
            no_match,
            "subscription closed"
        );
        effects.state = Some(self.stamp());
    }

    fn fail(&mut self, error: TransportError, effects: &mut Effects) {
        let was_live = self.state.is_live;
        self.state.phase = ChannelPhase::Errored;
        self.state.is_error = true;
        self.state.is_loading = false;
        self.state.is_live = false;
        self.state.is_end_reached = false;
        self.state.no_matching_messages = false;

        // A pending load() resolves with what accumulated; a live channel
        // flushes it so nothing received is lost.
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(());
        } else if was_live {
            effects.deliver = self.take_chunk(None);
        }
        self.cancel = None;

        warn!(
            target: "backscroll::channel",
            direction = %self.direction,
            error = %error,
            "subscription failed"
        );
        effects.error = Some(error);
        effects.state = Some(self.stamp());
    }

    /// The timeout won the race: switch to live delivery.
    fn go_live(&mut self, generation: u64) -> Option<(Vec<Message>, ChannelState)> {
        if generation != self.generation {
            return None;
        }
        // Completion already signalled: the close/error path won after all
        self.completion.take()?;
        self.state.is_live = true;
        self.state.is_loading = false;
        let chunk = self.take_chunk(None);
        Some((chunk, self.stamp()))
    }

    /// One scheduler tick. Returns the items to flush and whether to keep
    /// ticking.
    fn live_tick(&mut self, generation: u64) -> (Vec<Message>, bool) {
        if generation != self.generation || !self.state.is_live {
            return (Vec::new(), false);
        }
        (self.take_chunk(None), true)
    }

    fn collect(&mut self, generation: u64) -> Vec<Message> {
        if generation != self.generation {
            return Vec::new();
        }
        self.take_chunk(None)
    }
}

/// One directional server-push subscription with chunked retrieval.
pub struct StreamChannel {
    direction: Direction,
    config: ChannelConfig,
    query: StreamQuery,
    transport: Arc<dyn Transport>,
    callbacks: Arc<ChannelCallbacks>,
    shared: Arc<Mutex<Shared>>,
    /// Drains the subscription.
    pump: Option<Worker>,
    /// Live delivery, armed when the timeout wins.
    scheduler: Option<LiveScheduler>,
    /// Number of worker threads still running.
    active: Arc<AtomicUsize>,
}

impl StreamChannel {
    /// Create an idle channel.
    pub fn new(
        direction: Direction,
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
        callbacks: ChannelCallbacks,
    ) -> Self {
        Self {
            direction,
            shared: Arc::new(Mutex::new(Shared::new(direction, config.chunk_size))),
            config,
            query: StreamQuery::default(),
            transport,
            callbacks: Arc::new(callbacks),
            pump: None,
            scheduler: None,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Search direction of this channel.
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state snapshot.
    pub fn state(&self) -> ChannelState {
        self.shared.lock().state
    }

    /// Whether the channel failed and must be replaced to retry.
    pub fn is_terminated(&self) -> bool {
        self.shared.lock().state.phase == ChannelPhase::Errored
    }

    /// Number of worker threads (pump, scheduler) still running.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of received items not yet handed out.
    pub fn pending(&self) -> usize {
        self.shared.lock().accumulated.len()
    }

    /// Filters used by subsequent loads.
    pub fn set_query(&mut self, query: StreamQuery) {
        self.query = query;
    }

    /// Handle that can cancel this channel from another thread.
    pub fn canceller(&self) -> ChannelCanceller {
        ChannelCanceller {
            shared: self.shared.clone(),
            callbacks: self.callbacks.clone(),
        }
    }

    /// Remove up to `limit` accumulated items (all if `None`), in
    /// chronological order.
    pub fn take_chunk(&self, limit: Option<usize>) -> Vec<Message> {
        self.shared.lock().take_chunk(limit)
    }

    /// Open a subscription at `anchor` and wait for the first chunk.
    ///
    /// Any subscription still open is closed first. Returns once the server
    /// closes the subscription, or once the response timeout elapses; in
    /// the latter case the channel continues in live mode and later items
    /// arrive through the response callback.
    ///
    /// A failure after items arrived still resolves with those items; the
    /// failure is reported through the state and the error callback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Terminated`] if the channel already failed, and
    /// [`Error::Transport`] if the subscription cannot be opened.
    pub fn load(&mut self, anchor: Anchor) -> Result<Vec<Message>> {
        if self.is_terminated() {
            return Err(Error::Terminated(self.direction));
        }

        self.shared.lock().release();
        self.release_workers();

        let (done_tx, done_rx) = bounded(1);
        let (cancel_tx, cancel_rx) = bounded(1);
        let (generation, state) = self.shared.lock().begin(&anchor, done_tx, cancel_tx);
        (self.callbacks.on_state)(&state);

        let request = SubscriptionRequest {
            direction: self.direction,
            anchor,
            query: self.query.clone(),
            limit: self.config.chunk_size,
        };
        debug!(
            target: "backscroll::channel",
            direction = %self.direction,
            anchor = %request.anchor.timestamp,
            generation,
            "opening subscription"
        );

        let subscription = match self.transport.open(&request) {
            Ok(subscription) => subscription,
            Err(error) => return Err(self.fail_local(generation, error)),
        };
        if let Err(e) = self.spawn_pump(generation, subscription, cancel_rx) {
            return Err(self.fail_local(generation, TransportError::Connect(e.to_string())));
        }

        select! {
            recv(done_rx) -> _ => {}
            recv(after(self.config.response_timeout())) -> _ => {
                let live = self.shared.lock().go_live(generation);
                if let Some((chunk, state)) = live {
                    info!(
                        target: "backscroll::channel",
                        direction = %self.direction,
                        items = chunk.len(),
                        "no close before timeout, switching to live delivery"
                    );
                    (self.callbacks.on_state)(&state);
                    if let Err(e) = self.spawn_scheduler(generation) {
                        self.fail_local(generation, TransportError::Connect(e.to_string()));
                    }
                    return Ok(chunk);
                }
            }
        }

        Ok(self.shared.lock().collect(generation))
    }

    /// Close the subscription, stop all workers and reset to initial
    /// values. Idempotent.
    pub fn stop(&mut self) {
        let state = {
            let mut shared = self.shared.lock();
            shared.reset();
            shared.stamp()
        };
        self.release_workers();
        debug!(target: "backscroll::channel", direction = %self.direction, "channel stopped");
        (self.callbacks.on_state)(&state);
    }

    fn fail_local(&self, generation: u64, error: TransportError) -> Error {
        let step = self.shared.lock().apply_failure(generation, error.clone());
        step.effects.run(&self.callbacks);
        Error::Transport {
            direction: self.direction,
            source: error,
        }
    }

    fn release_workers(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.join();
        }
        if let Some(pump) = self.pump.take() {
            pump.join();
        }
    }

    fn spawn_pump(
        &mut self,
        generation: u64,
        subscription: Subscription,
        cancel_rx: Receiver<()>,
    ) -> std::io::Result<()> {
        let shared = self.shared.clone();
        let callbacks = self.callbacks.clone();
        let worker = Worker::spawn(
            format!("backscroll-pump-{}", self.direction),
            &self.active,
            move |_| pump_loop(&shared, &callbacks, generation, &subscription, &cancel_rx),
        )?;
        self.pump = Some(worker);
        Ok(())
    }

    fn spawn_scheduler(&mut self, generation: u64) -> std::io::Result<()> {
        let shared = self.shared.clone();
        let callbacks = self.callbacks.clone();
        let scheduler = LiveScheduler::spawn(
            format!("backscroll-live-{}", self.direction),
            self.config.live_interval(),
            &self.active,
            move |_frame| {
                let (chunk, keep_going) = shared.lock().live_tick(generation);
                if !chunk.is_empty() {
                    (callbacks.on_response)(chunk);
                }
                keep_going
            },
        )?;
        self.scheduler = Some(scheduler);
        Ok(())
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.shared.lock().release();
        self.release_workers();
    }
}

/// Drain one subscription until it closes, fails, or is cancelled.
///
/// The subscription is closed when the pump's closure returns.
fn pump_loop(
    shared: &Mutex<Shared>,
    callbacks: &ChannelCallbacks,
    generation: u64,
    subscription: &Subscription,
    cancel_rx: &Receiver<()>,
) {
    loop {
        let step = select! {
            recv(subscription.events()) -> event => match event {
                Ok(event) => shared.lock().apply(generation, event),
                Err(_) => shared.lock().apply_failure(generation, TransportError::Dropped),
            },
            recv(cancel_rx) -> _ => break,
        };
        let done = step.done;
        step.effects.run(callbacks);
        if done {
            break;
        }
    }
}

/// Cancels a channel's in-flight work from any thread.
///
/// Cancelling has the effect of `stop()` on the channel state; worker
/// threads exit on their own shortly after and are joined by the owner.
#[derive(Clone)]
pub struct ChannelCanceller {
    shared: Arc<Mutex<Shared>>,
    callbacks: Arc<ChannelCallbacks>,
}

impl ChannelCanceller {
    /// Cancel. A `load()` in progress returns an empty chunk.
    pub fn cancel(&self) {
        let state = {
            let mut shared = self.shared.lock();
            shared.reset();
            shared.stamp()
        };
        (self.callbacks.on_state)(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Heartbeat, MessageBody};
    use crate::transport::{MemoryTransport, ScriptStep};
    use chrono::{DateTime, TimeZone, Utc};
    use std::thread;
    use std::time::{Duration, Instant};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, secs: i64) -> Message {
        Message::new(id, at(secs), "session", MessageBody::raw(format!("payload {id}")))
    }

    fn item(id: &str, secs: i64) -> ScriptStep {
        ScriptStep::Item(msg(id, secs))
    }

    fn ids(chunk: &[Message]) -> Vec<&str> {
        chunk.iter().map(|m| m.id.as_str()).collect()
    }

    fn config(timeout_ms: u64, chunk_size: usize) -> ChannelConfig {
        ChannelConfig {
            response_timeout_ms: timeout_ms,
            live_interval_ms: 20,
            chunk_size,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn encoded(message: &Message) -> PushEvent {
        PushEvent::Item(message.encode().unwrap())
    }

    // State machine, no threads

    #[test]
    fn test_take_chunk_reverses_previous() {
        let mut shared = Shared::new(Direction::Previous, 10);
        let (done_tx, _done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, _) = shared.begin(&Anchor::at(at(100)), done_tx, cancel_tx);

        for (id, secs) in [("c", 30), ("b", 20), ("a", 10)] {
            shared.apply(generation, encoded(&msg(id, secs)));
        }
        assert_eq!(ids(&shared.take_chunk(Some(2))), vec!["b", "c"]);
        assert_eq!(ids(&shared.take_chunk(None)), vec!["a"]);
    }

    #[test]
    fn test_take_chunk_keeps_next_order() {
        let mut shared = Shared::new(Direction::Next, 10);
        let (done_tx, _done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, _) = shared.begin(&Anchor::at(at(0)), done_tx, cancel_tx);

        for (id, secs) in [("a", 1), ("b", 2), ("c", 3)] {
            shared.apply(generation, encoded(&msg(id, secs)));
        }
        assert_eq!(ids(&shared.take_chunk(None)), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_close_with_heartbeat_progress_is_no_match() {
        let mut shared = Shared::new(Direction::Next, 10);
        let (done_tx, done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, _) = shared.begin(&Anchor::at(at(0)), done_tx, cancel_tx);

        shared.apply(generation, PushEvent::Heartbeat(Heartbeat::new(100, at(10))));
        let step = shared.apply(
            generation,
            PushEvent::Close {
                heartbeat: Some(Heartbeat::new(500, at(50))),
            },
        );

        assert!(step.done);
        assert!(done_rx.try_recv().is_ok());
        let state = step.effects.state.unwrap();
        assert!(state.no_matching_messages);
        assert!(!state.is_end_reached);
        assert!(!state.is_loading);
        assert_eq!(state.last_heartbeat.unwrap().scan_counter, 500);
    }

    #[test]
    fn test_close_without_progress_is_end_reached() {
        let mut shared = Shared::new(Direction::Next, 10);
        let (done_tx, _done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, _) = shared.begin(&Anchor::at(at(0)), done_tx, cancel_tx);

        let step = shared.apply(generation, PushEvent::Close { heartbeat: None });
        let state = step.effects.state.unwrap();
        assert!(state.is_end_reached);
        assert!(!state.no_matching_messages);
    }

    #[test]
    fn test_close_with_full_chunk_is_not_end_reached() {
        let mut shared = Shared::new(Direction::Next, 2);
        let (done_tx, _done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, _) = shared.begin(&Anchor::at(at(0)), done_tx, cancel_tx);

        shared.apply(generation, encoded(&msg("a", 1)));
        shared.apply(generation, encoded(&msg("b", 2)));
        let step = shared.apply(generation, PushEvent::Close { heartbeat: None });
        assert!(!step.effects.state.unwrap().is_end_reached);
    }

    #[test]
    fn test_stale_generation_ignored() {
        let mut shared = Shared::new(Direction::Next, 10);
        let (done_tx, _done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, _) = shared.begin(&Anchor::at(at(0)), done_tx, cancel_tx);
        shared.release();

        let step = shared.apply(generation, encoded(&msg("a", 1)));
        assert!(step.done);
        assert_eq!(shared.accumulated.len(), 0);
    }

    #[test]
    fn test_malformed_item_dropped() {
        let mut shared = Shared::new(Direction::Next, 10);
        let (done_tx, _done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, _) = shared.begin(&Anchor::at(at(0)), done_tx, cancel_tx);

        let step = shared.apply(generation, PushEvent::Item("{broken".into()));
        assert!(!step.done);
        assert!(step.effects.error.is_none());
        assert_eq!(shared.state.phase, ChannelPhase::Connecting);

        shared.apply(generation, encoded(&msg("a", 1)));
        assert_eq!(shared.accumulated.len(), 1);
    }

    #[test]
    fn test_live_close_flushes() {
        let mut shared = Shared::new(Direction::Next, 10);
        let (done_tx, _done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, _) = shared.begin(&Anchor::at(at(0)), done_tx, cancel_tx);

        shared.apply(generation, encoded(&msg("a", 1)));
        let (chunk, state) = shared.go_live(generation).unwrap();
        assert_eq!(ids(&chunk), vec!["a"]);
        assert!(state.is_live);
        assert!(!state.is_loading);

        shared.apply(generation, encoded(&msg("b", 2)));
        let step = shared.apply(generation, PushEvent::Close { heartbeat: None });
        assert_eq!(ids(&step.effects.deliver), vec!["b"]);
        assert!(!step.effects.state.unwrap().is_live);
        assert_eq!(shared.live_tick(generation), (Vec::new(), false));
    }

    #[test]
    fn test_reset_keeps_errored() {
        let mut shared = Shared::new(Direction::Next, 10);
        let (done_tx, _done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, _) = shared.begin(&Anchor::at(at(0)), done_tx, cancel_tx);
        shared.apply(generation, PushEvent::Error("boom".into()));

        shared.reset();
        assert_eq!(shared.state.phase, ChannelPhase::Errored);
        assert!(shared.state.is_error);
        assert!(shared.state.is_consistent());
    }

    #[test]
    fn test_live_error_flushes_accumulated() {
        let mut shared = Shared::new(Direction::Next, 10);
        let (done_tx, _done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, _) = shared.begin(&Anchor::at(at(0)), done_tx, cancel_tx);

        shared.apply(generation, encoded(&msg("a", 1)));
        shared.go_live(generation).unwrap();
        shared.apply(generation, encoded(&msg("b", 2)));
        shared.apply(generation, encoded(&msg("c", 3)));

        let step = shared.apply(generation, PushEvent::Error("reset".into()));
        assert!(step.done);
        assert_eq!(ids(&step.effects.deliver), vec!["b", "c"]);
        assert_eq!(step.effects.error, Some(TransportError::Server("reset".into())));
        let state = step.effects.state.unwrap();
        assert!(state.is_error);
        assert!(!state.is_live);
        assert!(shared.accumulated.is_empty());
    }

    #[test]
    fn test_stream_failure_keeps_its_kind() {
        let mut shared = Shared::new(Direction::Previous, 10);
        let (done_tx, done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, _) = shared.begin(&Anchor::at(at(0)), done_tx, cancel_tx);

        let failure = TransportError::Io("connection reset".into());
        let step = shared.apply(generation, PushEvent::Failed(failure.clone()));
        assert!(step.done);
        assert!(done_rx.try_recv().is_ok());
        assert_eq!(step.effects.error, Some(failure));
        assert_eq!(shared.state.phase, ChannelPhase::Errored);
    }

    #[test]
    fn test_emitted_states_are_sequenced() {
        let mut shared = Shared::new(Direction::Next, 10);
        let (done_tx, _done_rx) = bounded(1);
        let (cancel_tx, _cancel_rx) = bounded(1);
        let (generation, connecting) = shared.begin(&Anchor::at(at(0)), done_tx, cancel_tx);

        let streaming = shared
            .apply(generation, encoded(&msg("a", 1)))
            .effects
            .state
            .unwrap();
        let (_, live) = shared.go_live(generation).unwrap();
        let closed = shared
            .apply(generation, PushEvent::Close { heartbeat: None })
            .effects
            .state
            .unwrap();

        let seqs = [connecting.seq, streaming.seq, live.seq, closed.seq];
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
        assert!(closed.supersedes(&live));
        assert_eq!(shared.state.seq, closed.seq);

        shared.reset();
        assert!(shared.stamp().seq > closed.seq);
    }

    // Threaded channel behaviour

    #[test]
    fn test_cold_start_resolves_on_close() {
        let transport = Arc::new(MemoryTransport::new());
        let mut script: Vec<ScriptStep> = (1..=5).map(|i| item(&format!("m{i}"), i)).collect();
        script.push(ScriptStep::Wait(Duration::from_millis(500)));
        script.push(ScriptStep::Close(None));
        transport.push_script(script);

        let mut channel = StreamChannel::new(
            Direction::Next,
            config(2000, 12),
            transport.clone(),
            ChannelCallbacks::new(),
        );

        let started = Instant::now();
        let chunk = channel.load(Anchor::at(at(0))).unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(1500));
        assert_eq!(ids(&chunk), vec!["m1", "m2", "m3", "m4", "m5"]);

        let state = channel.state();
        assert!(state.is_end_reached);
        assert!(!state.is_loading);
        assert!(!state.is_live);
        assert_eq!(state.phase, ChannelPhase::Closed);
        assert!(wait_until(|| channel.active_workers() == 0));
    }

    #[test]
    fn test_timeout_switches_to_live_delivery() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_script(vec![
            item("m1", 1),
            item("m2", 2),
            item("m3", 3),
            ScriptStep::Wait(Duration::from_millis(600)),
            item("m4", 4),
            item("m5", 5),
            ScriptStep::Close(None),
        ]);

        let (tx, rx) = crossbeam_channel::unbounded();
        let callbacks = ChannelCallbacks::new().on_response(move |chunk| {
            let _ = tx.send(chunk);
        });
        let mut channel = StreamChannel::new(Direction::Next, config(300, 12), transport, callbacks);

        let started = Instant::now();
        let chunk = channel.load(Anchor::at(at(0))).unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(600));
        assert_eq!(ids(&chunk), vec!["m1", "m2", "m3"]);
        assert!(channel.state().is_live);

        let mut live = Vec::new();
        while live.len() < 2 {
            let delivered = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            live.extend(delivered);
        }
        assert_eq!(ids(&live), vec!["m4", "m5"]);

        assert!(wait_until(|| !channel.state().is_live));
        assert_eq!(channel.state().phase, ChannelPhase::Closed);
        assert!(wait_until(|| channel.active_workers() == 0));
    }

    #[test]
    fn test_timeout_lower_bound_with_no_items() {
        let transport = Arc::new(MemoryTransport::new());
        let mut channel = StreamChannel::new(
            Direction::Previous,
            config(250, 12),
            transport.clone(),
            ChannelCallbacks::new(),
        );

        let started = Instant::now();
        let chunk = channel.load(Anchor::at(at(0))).unwrap();
        assert!(chunk.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(250));

        let server = transport.accept(Duration::from_millis(100)).unwrap();
        assert!(!server.is_closed());
        channel.stop();
        assert!(server.is_closed());
    }

    #[test]
    fn test_previous_chunk_is_chronological() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_script(vec![
            item("m3", 30),
            item("m2", 20),
            item("m1", 10),
            ScriptStep::Close(None),
        ]);
        let mut channel = StreamChannel::new(
            Direction::Previous,
            config(2000, 12),
            transport,
            ChannelCallbacks::new(),
        );

        let chunk = channel.load(Anchor::at(at(100))).unwrap();
        assert_eq!(ids(&chunk), vec!["m1", "m2", "m3"]);
        assert!(chunk.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_error_during_streaming() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_script(vec![
            item("m1", 1),
            item("m2", 2),
            ScriptStep::Error("upstream reset".into()),
        ]);

        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let callbacks = ChannelCallbacks::new().on_error(move |error| {
            assert_eq!(error, &TransportError::Server("upstream reset".into()));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut channel = StreamChannel::new(Direction::Next, config(2000, 12), transport, callbacks);

        let chunk = channel.load(Anchor::at(at(0))).unwrap();
        assert_eq!(ids(&chunk), vec!["m1", "m2"]);

        let state = channel.state();
        assert!(state.is_error);
        assert!(!state.is_loading);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(wait_until(|| channel.active_workers() == 0));

        assert!(matches!(
            channel.load(Anchor::at(at(0))),
            Err(Error::Terminated(Direction::Next))
        ));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_failure_reports_error() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_open(TransportError::Connect("refused".into()));

        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let callbacks = ChannelCallbacks::new().on_error(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut channel = StreamChannel::new(Direction::Next, config(2000, 12), transport, callbacks);

        let err = channel.load(Anchor::at(at(0))).unwrap_err();
        assert!(matches!(err, Error::Transport { direction: Direction::Next, .. }));
        assert!(channel.state().is_error);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_subscription_is_error() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_script(vec![item("m1", 1)]);
        let mut channel = StreamChannel::new(
            Direction::Next,
            config(2000, 12),
            transport,
            ChannelCallbacks::new(),
        );

        let chunk = channel.load(Anchor::at(at(0))).unwrap();
        assert_eq!(ids(&chunk), vec!["m1"]);
        assert!(channel.state().is_error);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        let mut channel = StreamChannel::new(
            Direction::Next,
            config(50, 12),
            transport.clone(),
            ChannelCallbacks::new(),
        );
        channel.load(Anchor::at(at(0))).unwrap();
        assert!(channel.state().is_live);

        channel.stop();
        let once = channel.state();
        channel.stop();
        assert_eq!(channel.state(), once);
        assert_eq!(once, ChannelState::default());
        assert_eq!(channel.active_workers(), 0);
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn test_new_load_supersedes_open_subscription() {
        let transport = Arc::new(MemoryTransport::new());
        let mut channel = StreamChannel::new(
            Direction::Next,
            config(50, 12),
            transport.clone(),
            ChannelCallbacks::new(),
        );

        channel.load(Anchor::at(at(0))).unwrap();
        let first = transport.accept(Duration::from_millis(100)).unwrap();

        channel.load(Anchor::at(at(5))).unwrap();
        let second = transport.accept(Duration::from_millis(100)).unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(second.request().anchor.timestamp, at(5));
        channel.stop();
    }

    #[test]
    fn test_canceller_interrupts_load() {
        let transport = Arc::new(MemoryTransport::new());
        let mut channel = StreamChannel::new(
            Direction::Next,
            config(5000, 12),
            transport.clone(),
            ChannelCallbacks::new(),
        );
        let canceller = channel.canceller();

        let server = thread::spawn(move || {
            let handle = transport.accept(Duration::from_secs(1)).unwrap();
            handle.push(&msg("m1", 1));
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
            handle
        });

        let started = Instant::now();
        let chunk = channel.load(Anchor::at(at(0))).unwrap();
        assert!(chunk.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(channel.state(), ChannelState::default());

        let handle = server.join().unwrap();
        assert!(wait_until(|| handle.is_closed()));
        channel.stop();
    }

    #[test]
    fn test_late_items_after_stop_ignored() {
        let transport = Arc::new(MemoryTransport::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let callbacks = ChannelCallbacks::new().on_response(move |chunk| {
            let _ = tx.send(chunk);
        });
        let mut channel = StreamChannel::new(Direction::Next, config(50, 12), transport.clone(), callbacks);

        channel.load(Anchor::at(at(0))).unwrap();
        let server = transport.accept(Duration::from_millis(100)).unwrap();
        channel.stop();

        assert!(!server.push(&msg("late", 1)));
        thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn test_close_right_after_timeout_keeps_newest_state() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_script(vec![
            item("m1", 1),
            ScriptStep::Wait(Duration::from_millis(160)),
            ScriptStep::Close(None),
        ]);

        // A slow observer: the live notification is still in flight when
        // the close notification arrives from the pump thread.
        let observed: Arc<Mutex<Option<ChannelState>>> = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        let callbacks = ChannelCallbacks::new().on_state(move |state| {
            if state.is_live {
                thread::sleep(Duration::from_millis(150));
            }
            let mut last = sink.lock();
            if last.map_or(true, |prev| state.supersedes(&prev)) {
                *last = Some(*state);
            }
        });
        let mut channel = StreamChannel::new(Direction::Next, config(100, 12), transport, callbacks);

        let chunk = channel.load(Anchor::at(at(0))).unwrap();
        assert_eq!(ids(&chunk), vec!["m1"]);

        assert!(wait_until(|| channel.state().phase == ChannelPhase::Closed));
        assert!(wait_until(|| channel.active_workers() == 0));

        let last = (*observed.lock()).unwrap();
        assert!(!last.is_live);
        assert_eq!(last.phase, ChannelPhase::Closed);
        assert_eq!(last, channel.state());
    }

    #[test]
    fn test_error_while_live_delivers_everything() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_script(vec![
            item("m1", 1),
            ScriptStep::Wait(Duration::from_millis(200)),
            item("m2", 2),
            item("m3", 3),
            ScriptStep::Error("upstream reset".into()),
        ]);

        let (tx, rx) = crossbeam_channel::unbounded();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let callbacks = ChannelCallbacks::new()
            .on_response(move |chunk| {
                let _ = tx.send(chunk);
            })
            .on_error(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let mut channel = StreamChannel::new(Direction::Next, config(50, 12), transport, callbacks);

        let chunk = channel.load(Anchor::at(at(0))).unwrap();
        assert_eq!(ids(&chunk), vec!["m1"]);
        assert!(channel.state().is_live);

        assert!(wait_until(|| channel.state().is_error));
        assert!(wait_until(|| channel.active_workers() == 0));

        // Scheduler ticks and the failure flush run on different threads
        let mut live: Vec<Message> = rx.try_iter().flatten().collect();
        live.sort_by_key(|m| m.timestamp);
        assert_eq!(ids(&live), vec!["m2", "m3"]);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!channel.state().is_live);
    }
}
