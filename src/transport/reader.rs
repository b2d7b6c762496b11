//! Transport over any byte stream carrying server-sent events.
//!
//! The opener turns a request into a readable stream (an HTTP response
//! body, a socket, a file replay). A reader thread decodes SSE frames and
//! forwards them as [`PushEvent`]s.

use super::sse::SseDecoder;
use super::{PushEvent, Subscription, Transport};
use crate::error::TransportError;
use crate::model::SubscriptionRequest;
use crossbeam_channel::{unbounded, Sender};
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Opens the byte stream for one subscription request.
pub trait StreamOpener: Send + Sync {
    /// Open the stream.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the stream cannot be opened.
    fn open_stream(&self, request: &SubscriptionRequest) -> io::Result<Box<dyn BufRead + Send>>;
}

impl<F> StreamOpener for F
where
    F: Fn(&SubscriptionRequest) -> io::Result<Box<dyn BufRead + Send>> + Send + Sync,
{
    fn open_stream(&self, request: &SubscriptionRequest) -> io::Result<Box<dyn BufRead + Send>> {
        self(request)
    }
}

/// [`Transport`] decoding SSE frames from streams produced by an opener.
///
/// Each subscription gets a detached reader thread. Closing the
/// subscription stops forwarding at the next line boundary; a reader
/// blocked inside `read` holds its stream until the stream yields or
/// ends, then releases it. Openers that need prompt teardown should hand
/// out streams with a read timeout.
pub struct ReaderTransport<O> {
    opener: O,
}

impl<O: StreamOpener> ReaderTransport<O> {
    /// Create a transport around an opener.
    pub const fn new(opener: O) -> Self {
        Self { opener }
    }
}

/// Reader loop.
fn run_loop(stream: Box<dyn BufRead + Send>, tx: &Sender<PushEvent>, closed: &AtomicBool) {
    let mut decoder = SseDecoder::new();
    for line in stream.lines() {
        if closed.load(Ordering::Relaxed) {
            return;
        }
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(target: "backscroll::sse", error = %e, "stream read failed");
                let _ = tx.send(PushEvent::Failed(e.into()));
                return;
            }
        };
        match decoder.feed_line(&line) {
            Ok(Some(event)) => {
                let terminal = matches!(
                    event,
                    PushEvent::Close { .. } | PushEvent::Error(_) | PushEvent::Failed(_)
                );
                if tx.send(event).is_err() || terminal {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(target: "backscroll::sse", error = %e, "dropping malformed frame"),
        }
    }
    if let Ok(Some(event)) = decoder.finish() {
        let _ = tx.send(event);
    }
    debug!(target: "backscroll::sse", "stream ended");
}

impl<O: StreamOpener> Transport for ReaderTransport<O> {
    fn open(&self, request: &SubscriptionRequest) -> Result<Subscription, TransportError> {
        let stream = self
            .opener
            .open_stream(request)
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (tx, rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        let closed_clone = closed.clone();

        thread::Builder::new()
            .name(format!("backscroll-sse-{}", request.direction))
            .spawn(move || run_loop(stream, &tx, &closed_clone))
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Subscription::new(rx).with_close_hook(move || closed.store(true, Ordering::Relaxed)))
    }
}
