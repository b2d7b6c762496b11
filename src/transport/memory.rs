//! In-process transport whose server side is driven from code.
//!
//! Each `open()` either plays the next queued script on its own thread or,
//! when no script is queued, hands a [`ServerHandle`] to whoever calls
//! [`MemoryTransport::accept`]. Used by the demo and the test suites.

use super::{PushEvent, Subscription, Transport};
use crate::error::TransportError;
use crate::model::{Heartbeat, Message, SubscriptionRequest};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// One step of a scripted server response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Push a message.
    Item(Message),
    /// Push a raw payload verbatim (e.g. a malformed one).
    Raw(String),
    /// Report scan progress.
    Heartbeat(Heartbeat),
    /// Pause before the next step.
    Wait(Duration),
    /// Finish the scan.
    Close(Option<Heartbeat>),
    /// Fail the subscription.
    Error(String),
}

/// Server side of one in-memory subscription.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    /// The request the client opened with.
    request: SubscriptionRequest,
    /// Event sender toward the client.
    tx: Sender<PushEvent>,
    /// Set when the client closes the subscription.
    closed: Arc<AtomicBool>,
}

impl ServerHandle {
    /// The request the client opened with.
    pub const fn request(&self) -> &SubscriptionRequest {
        &self.request
    }

    /// Whether the client has closed the subscription.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push a message. Returns `false` if the client is gone.
    pub fn push(&self, message: &Message) -> bool {
        match message.encode() {
            Ok(payload) => self.push_raw(payload),
            Err(_) => false,
        }
    }

    /// Push a raw payload. Returns `false` if the client is gone.
    pub fn push_raw(&self, payload: impl Into<String>) -> bool {
        self.send(PushEvent::Item(payload.into()))
    }

    /// Report scan progress.
    pub fn heartbeat(&self, heartbeat: Heartbeat) -> bool {
        self.send(PushEvent::Heartbeat(heartbeat))
    }

    /// Finish the scan.
    pub fn close(&self, heartbeat: Option<Heartbeat>) -> bool {
        self.send(PushEvent::Close { heartbeat })
    }

    /// Fail the subscription.
    pub fn fail(&self, detail: impl Into<String>) -> bool {
        self.send(PushEvent::Error(detail.into()))
    }

    /// Play a script on the calling thread, stopping early if the client
    /// closes.
    pub fn play(&self, script: &[ScriptStep]) {
        for step in script {
            if self.is_closed() {
                debug!(target: "backscroll::transport", "client closed, script abandoned");
                return;
            }
            let delivered = match step {
                ScriptStep::Item(message) => self.push(message),
                ScriptStep::Raw(payload) => self.push_raw(payload.clone()),
                ScriptStep::Heartbeat(heartbeat) => self.heartbeat(*heartbeat),
                ScriptStep::Wait(duration) => {
                    thread::sleep(*duration);
                    true
                }
                ScriptStep::Close(heartbeat) => self.close(*heartbeat),
                ScriptStep::Error(detail) => self.fail(detail.clone()),
            };
            if !delivered {
                return;
            }
        }
    }

    fn send(&self, event: PushEvent) -> bool {
        !self.is_closed() && self.tx.send(event).is_ok()
    }
}

#[derive(Default)]
struct MemoryInner {
    /// Every request ever opened, in order.
    requests: Vec<SubscriptionRequest>,
    /// Scripts consumed by successive opens.
    scripts: VecDeque<Vec<ScriptStep>>,
    /// Failure returned by the next open instead of a subscription.
    fail_next: Option<TransportError>,
}

/// In-memory [`Transport`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
    accept_tx: Sender<ServerHandle>,
    accept_rx: Receiver<ServerHandle>,
}

impl MemoryTransport {
    /// Create a transport with no queued scripts.
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = unbounded();
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            accept_tx,
            accept_rx,
        }
    }

    /// Queue a script for the next unscripted open.
    pub fn push_script(&self, script: Vec<ScriptStep>) {
        self.inner.lock().scripts.push_back(script);
    }

    /// Make the next open fail.
    pub fn fail_next_open(&self, error: TransportError) {
        self.inner.lock().fail_next = Some(error);
    }

    /// Wait for a client to open an unscripted subscription.
    pub fn accept(&self, timeout: Duration) -> Option<ServerHandle> {
        self.accept_rx.recv_timeout(timeout).ok()
    }

    /// All requests opened so far.
    pub fn requests(&self) -> Vec<SubscriptionRequest> {
        self.inner.lock().requests.clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn open(&self, request: &SubscriptionRequest) -> Result<Subscription, TransportError> {
        let script = {
            let mut inner = self.inner.lock();
            if let Some(error) = inner.fail_next.take() {
                return Err(error);
            }
            inner.requests.push(request.clone());
            inner.scripts.pop_front()
        };

        let (tx, rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        let handle = ServerHandle {
            request: request.clone(),
            tx,
            closed: closed.clone(),
        };

        match script {
            Some(steps) => {
                thread::Builder::new()
                    .name("backscroll-memory-server".to_string())
                    .spawn(move || handle.play(&steps))
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
            }
            None => {
                self.accept_tx
                    .send(handle)
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
            }
        }

        Ok(Subscription::new(rx).with_close_hook(move || closed.store(true, Ordering::SeqCst)))
    }
}
