//! Channel bridge integration tests.
//!
//! Tests for the async channel bridge between the Tokio runtime and a dedicated blocking
//! worker thread, exercised with a small local command/event enum standing in for the
//! domain-specific ones the server and client crates define for themselves.
//!
//! Run with: `cargo test -p common --test usb_bridge_tests`

use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
use common::{create_bridge, create_bridge_with_capacity};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug)]
enum Command {
    Echo { value: u32, response: oneshot::Sender<u32> },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Tick(u32),
}

// ============================================================================
// Bridge creation
// ============================================================================

#[test]
fn test_create_bridge() {
    let (bridge, worker) = create_bridge::<Command, Event>();
    drop(bridge);
    drop(worker);
}

#[tokio::test]
async fn test_bridge_channels_are_connected() {
    let (bridge, worker) = create_bridge::<Command, Event>();

    let handle = thread::spawn(move || {
        if let Ok(Command::Echo { value, response }) = worker.recv_command() {
            let _ = response.send(value * 2);
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(Command::Echo { value: 21, response: tx })
        .await
        .expect("failed to send command");

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, rx).await;
    assert!(result.is_ok());
    assert_eq!(result.unwrap().expect("failed to receive response"), 42);

    handle.join().expect("worker thread panicked");
}

// ============================================================================
// Command flow
// ============================================================================

#[tokio::test]
async fn test_echo_command_flow() {
    let (bridge, worker) = create_bridge::<Command, Event>();

    let handle = thread::spawn(move || {
        let cmd = worker.recv_command().expect("failed to receive command");
        if let Command::Echo { value, response } = cmd {
            response.send(value + 1).expect("failed to send response");
            true
        } else {
            false
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(Command::Echo { value: 9, response: tx })
        .await
        .expect("failed to send command");

    let result = rx.await.expect("failed to receive");
    assert_eq!(result, 10);
    assert!(handle.join().unwrap());
}

#[tokio::test]
async fn test_shutdown_command_flow() {
    let (bridge, worker) = create_bridge::<Command, Event>();
    let shutdown_received = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown_received.clone();

    let handle = thread::spawn(move || loop {
        match worker.recv_command() {
            Ok(Command::Shutdown) => {
                shutdown_flag.store(true, Ordering::Release);
                break;
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    });

    bridge
        .send_command(Command::Shutdown)
        .await
        .expect("failed to send shutdown");

    handle.join().expect("worker thread panicked");
    assert!(shutdown_received.load(Ordering::Acquire));
}

// ============================================================================
// Event flow
// ============================================================================

#[tokio::test]
async fn test_single_event_flow() {
    let (bridge, worker) = create_bridge::<Command, Event>();

    let handle = thread::spawn(move || {
        worker.send_event(Event::Tick(7)).expect("failed to send event");
    });

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event()).await;
    assert!(result.is_ok());
    assert_eq!(result.unwrap().expect("failed to receive event"), Event::Tick(7));

    handle.join().expect("worker thread panicked");
}

#[tokio::test]
async fn test_multiple_events_in_sequence() {
    let (bridge, worker) = create_bridge::<Command, Event>();

    let handle = thread::spawn(move || {
        for i in 0..8 {
            worker.send_event(Event::Tick(i)).expect("failed to send event");
        }
    });

    let mut received = Vec::new();
    for _ in 0..8 {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event()).await;
        if let Ok(Ok(Event::Tick(n))) = result {
            received.push(n);
        }
    }

    assert_eq!(received, (0..8).collect::<Vec<_>>());
    handle.join().expect("worker thread panicked");
}

// ============================================================================
// Worker thread lifecycle
// ============================================================================

#[tokio::test]
async fn test_worker_try_recv_non_blocking() {
    let (bridge, worker) = create_bridge::<Command, Event>();

    let handle = thread::spawn(move || worker.try_recv_command().is_none());

    assert!(handle.join().unwrap());
    drop(bridge);
}

#[tokio::test]
async fn test_worker_graceful_shutdown_on_bridge_drop() {
    let (bridge, worker) = create_bridge::<Command, Event>();
    let worker_finished = Arc::new(AtomicBool::new(false));
    let finished_flag = worker_finished.clone();

    let handle = thread::spawn(move || {
        let result = worker.recv_command();
        finished_flag.store(true, Ordering::Release);
        result.is_err()
    });

    drop(bridge);

    assert!(handle.join().unwrap());
    assert!(worker_finished.load(Ordering::Acquire));
}

#[tokio::test]
async fn test_bridge_graceful_shutdown_on_worker_drop() {
    let (bridge, worker) = create_bridge::<Command, Event>();

    drop(worker);

    let (tx, _rx) = oneshot::channel();
    let result = bridge.send_command(Command::Echo { value: 1, response: tx }).await;
    assert!(result.is_err());
}

// ============================================================================
// Concurrent access
// ============================================================================

#[tokio::test]
async fn test_multiple_commands_from_single_bridge() {
    let (bridge, worker) = create_bridge::<Command, Event>();
    let command_count = Arc::new(AtomicU32::new(0));
    let worker_count = command_count.clone();

    let handle = thread::spawn(move || loop {
        match worker.recv_command() {
            Ok(Command::Echo { value, response }) => {
                worker_count.fetch_add(1, Ordering::SeqCst);
                let _ = response.send(value);
            }
            Ok(Command::Shutdown) => break,
            Err(_) => break,
        }
    });

    for i in 0..10 {
        let (tx, rx) = oneshot::channel();
        bridge
            .send_command(Command::Echo { value: i, response: tx })
            .await
            .expect("failed to send");
        rx.await.expect("failed to receive");
    }

    bridge.send_command(Command::Shutdown).await.expect("failed to shutdown");

    handle.join().expect("worker panicked");
    assert_eq!(command_count.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_concurrent_commands_from_cloned_bridges() {
    let (bridge, worker) = create_bridge::<Command, Event>();
    let command_count = Arc::new(AtomicU32::new(0));
    let worker_count = command_count.clone();

    let handle = thread::spawn(move || loop {
        match worker.recv_command() {
            Ok(Command::Echo { value, response }) => {
                worker_count.fetch_add(1, Ordering::SeqCst);
                let _ = response.send(value);
            }
            Ok(Command::Shutdown) => break,
            Err(_) => break,
        }
    });

    let mut tasks = vec![];
    for _ in 0..5 {
        let bridge_clone = bridge.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                let (tx, rx) = oneshot::channel();
                bridge_clone
                    .send_command(Command::Echo { value: i, response: tx })
                    .await
                    .expect("failed to send");
                rx.await.expect("failed to receive");
            }
        }));
    }

    for task in tasks {
        task.await.expect("task panicked");
    }

    bridge.send_command(Command::Shutdown).await.expect("failed to shutdown");

    handle.join().expect("worker panicked");
    assert_eq!(command_count.load(Ordering::SeqCst), 50);
}

// ============================================================================
// Error handling
// ============================================================================

#[tokio::test]
async fn test_command_with_dropped_response_channel() {
    let (bridge, worker) = create_bridge::<Command, Event>();

    let handle = thread::spawn(move || {
        if let Ok(Command::Echo { response, .. }) = worker.recv_command() {
            response.send(0).is_err()
        } else {
            false
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(Command::Echo { value: 1, response: tx })
        .await
        .expect("failed to send");

    drop(rx);

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(handle.join().unwrap());
}

// ============================================================================
// Channel capacity
// ============================================================================

#[tokio::test]
async fn test_event_channel_capacity() {
    let (bridge, worker) = create_bridge_with_capacity::<Command, Event>(256);

    let handle = thread::spawn(move || {
        for i in 0..200 {
            if worker.send_event(Event::Tick(i)).is_err() {
                return i;
            }
        }
        200
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut received = 0;
    loop {
        let result = with_timeout(Duration::from_millis(100), bridge.recv_event()).await;
        match result {
            Ok(Ok(_)) => received += 1,
            _ => break,
        }
    }

    let sent = handle.join().unwrap();
    assert_eq!(received, sent);
    assert!(sent > 0);
}
