//! Live Tail Demo: Backlog, live tail, then older history.
//!
//! An in-memory server plays a log session: it answers the first load with
//! a short backlog, keeps the subscription open so the coordinator goes
//! live, trickles a few more lines, and closes. The demo then scrolls back
//! twice, the second time into a gap with no matches, and resumes the scan
//! from the reported heartbeat.
//!
//! Run with `RUST_LOG=backscroll=debug` to watch the channel lifecycle.

use backscroll::{
    Anchor, ChannelConfig, CoordinatorConfig, Direction, Heartbeat, MemoryTransport, Message,
    MessageBody, ScriptStep, StreamCoordinator, StreamQuery,
};
use chrono::{Duration as Span, Utc};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

fn line(id: usize, offset: Span, text: &str) -> Message {
    Message::new(
        format!("m{id}"),
        Utc::now() + offset,
        "web-1",
        MessageBody::raw(text),
    )
}

fn print_buffer(coordinator: &StreamCoordinator) {
    coordinator.with_buffer(|buffer| {
        for (offset, message) in buffer.iter().enumerate() {
            let index = buffer.start_index() + offset as i64;
            println!("  {index:>4}  {}  {}", message.timestamp.format("%H:%M:%S%.3f"), message.body.raw_text());
        }
    });
}

fn main() -> backscroll::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    println!("Backscroll Live Tail Demo");
    println!("=========================\n");

    let transport = MemoryTransport::new();
    let config = CoordinatorConfig {
        channel: ChannelConfig {
            response_timeout_ms: 300,
            live_interval_ms: 100,
            chunk_size: 50,
        },
        anchor: Anchor::at(Utc::now() - Span::minutes(1)),
        query: StreamQuery::default().with_session("web-1"),
    };
    let mut coordinator = StreamCoordinator::new(config, Arc::new(transport.clone()))?;
    let snapshots = coordinator.subscribe();

    // Server side of the first (next) subscription
    let server = transport.clone();
    let tail = thread::spawn(move || {
        let Some(handle) = server.accept(Duration::from_secs(5)) else {
            return;
        };
        for id in 0..3 {
            handle.push(&line(id, Span::seconds(id as i64 - 30), "backlog"));
        }
        thread::sleep(Duration::from_millis(500));
        for id in 3..8 {
            handle.push(&line(id, Span::zero(), "live"));
            thread::sleep(Duration::from_millis(150));
        }
        handle.close(Some(Heartbeat::new(8, Utc::now())));
    });

    let backlog = coordinator.enter_live_mode()?;
    info!(count = backlog.len(), live = coordinator.is_live(), "initial load returned");

    while let Ok(snapshot) = snapshots.recv_timeout(Duration::from_secs(3)) {
        println!("snapshot: {} buffered, live={}", snapshot.len, snapshot.is_live);
        if !snapshot.is_live && snapshot.len >= 8 {
            break;
        }
    }
    let _ = tail.join();

    println!("\nAfter live tail:");
    print_buffer(&coordinator);

    // Older history arrives newest first
    transport.push_script(vec![
        ScriptStep::Item(line(101, Span::minutes(-2), "older b")),
        ScriptStep::Item(line(100, Span::minutes(-3), "older a")),
        ScriptStep::Close(None),
    ]);
    coordinator.load_previous()?;
    println!("\nAfter scrolling back:");
    print_buffer(&coordinator);

    // A gap: the server scans an hour and finds nothing
    let scanned_to = Utc::now() - Span::hours(1);
    transport.push_script(vec![
        ScriptStep::Heartbeat(Heartbeat::new(40, Utc::now() - Span::minutes(30))),
        ScriptStep::Close(Some(Heartbeat::new(90, scanned_to))),
    ]);
    coordinator.load_previous()?;
    let snapshot = coordinator.snapshot();
    if snapshot.no_matching_messages(Direction::Previous) {
        println!("\nNo matches, scanned to {scanned_to}; keep loading...");
        transport.push_script(vec![
            ScriptStep::Item(line(200, Span::hours(-2), "much older")),
            ScriptStep::Close(None),
        ]);
        coordinator.keep_loading(Direction::Previous)?;
    }

    println!("\nFinal buffer:");
    print_buffer(&coordinator);
    coordinator.stop_all();
    Ok(())
}
