//! Worker: A named background thread owned by a channel.
//!
//! Workers are scoped resources. Dropping one signals shutdown and joins
//! the thread, unless the drop happens on that same thread (a callback
//! running on the worker tearing down its own channel).

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Handle to a running worker thread.
#[derive(Debug)]
pub(crate) struct Worker {
    /// Handle to the worker thread.
    handle: Option<JoinHandle<()>>,
    /// Flag to signal shutdown.
    shutdown: Arc<AtomicBool>,
}

/// Decrements the live-worker count when the thread exits, even on panic.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Worker {
    /// Spawn a worker thread.
    ///
    /// `active` counts the owner's live workers. The closure receives the
    /// shutdown flag it should poll.
    pub(crate) fn spawn<F>(name: String, active: &Arc<AtomicUsize>, run: F) -> io::Result<Self>
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(active.clone());

        let handle = thread::Builder::new().name(name).spawn(move || {
            let _guard = guard;
            run(&shutdown_clone);
        })?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    /// Signal the worker to shutdown.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for the worker thread to finish.
    pub(crate) fn join(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.join_inner();
    }
}
