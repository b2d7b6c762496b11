//! Live scheduler: Periodic delivery for a channel in live-tail mode.
//!
//! Once the initial-response timeout has fired, the channel stops handing
//! out chunks through `load()` and instead flushes whatever accumulated on
//! a fixed interval. The scheduler only paces the flushes; the tick
//! closure decides what to deliver and when to stop.

use super::worker::Worker;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Granularity at which a sleeping scheduler notices shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(5);

/// Background scheduler invoking a tick closure at a regular interval.
#[derive(Debug)]
pub(crate) struct LiveScheduler {
    worker: Worker,
}

impl LiveScheduler {
    /// Spawn a scheduler.
    ///
    /// `tick` receives the frame number (monotonically increasing) and
    /// returns `false` to stop the scheduler.
    pub(crate) fn spawn<F>(
        name: String,
        interval: Duration,
        active: &Arc<AtomicUsize>,
        tick: F,
    ) -> io::Result<Self>
    where
        F: FnMut(u64) -> bool + Send + 'static,
    {
        let worker = Worker::spawn(name, active, move |shutdown| {
            Self::run_loop(shutdown, interval, tick);
        })?;
        Ok(Self { worker })
    }

    /// Stop the scheduler and wait for its thread.
    pub(crate) fn join(self) {
        self.worker.join();
    }

    /// Main scheduler loop.
    fn run_loop<F>(shutdown: &AtomicBool, interval: Duration, mut tick: F)
    where
        F: FnMut(u64) -> bool,
    {
        let start = Instant::now();
        let mut frame = 0u64;
        let mut next_tick = start + interval;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let now = Instant::now();
            if now >= next_tick {
                if !tick(frame) {
                    break;
                }

                frame += 1;
                next_tick += interval;

                // Behind schedule: skip missed ticks instead of bursting
                if next_tick < now {
                    next_tick = now + interval;
                }
            } else {
                thread::sleep((next_tick - now).min(SHUTDOWN_POLL));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_scheduler_ticks() {
        let active = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = bounded(8);
        let scheduler = LiveScheduler::spawn(
            "test-scheduler".to_string(),
            Duration::from_millis(10),
            &active,
            move |frame| tx.try_send(frame).is_ok(),
        )
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_millis(200)).unwrap(), 0);
        assert_eq!(rx.recv_timeout(Duration::from_millis(200)).unwrap(), 1);

        scheduler.join();
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_scheduler_stops_when_tick_declines() {
        let active = Arc::new(AtomicUsize::new(0));
        let scheduler = LiveScheduler::spawn(
            "test-scheduler".to_string(),
            Duration::from_millis(5),
            &active,
            |frame| frame < 2,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(active.load(Ordering::SeqCst), 0);
        scheduler.join();
    }
}
