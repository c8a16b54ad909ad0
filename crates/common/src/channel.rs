//! Generic async/blocking channel bridge.
//!
//! Both the server's bus-adapter pump and the client's transfer-executor run on a dedicated
//! blocking OS thread (real USB I/O and vhci ioctls are blocking APIs); the tokio runtime
//! talks to that thread through a bounded [`async_channel`] pair. This module is generic over
//! the command/event types each side defines for itself.

use async_channel::{bounded, Receiver, Sender};

/// Default channel capacity between the async and blocking sides.
pub const DEFAULT_BRIDGE_CAPACITY: usize = 256;

/// Async-side handle: lives in the tokio runtime, sends commands and receives events.
#[derive(Clone)]
pub struct Bridge<Cmd, Evt> {
    cmd_tx: Sender<Cmd>,
    event_rx: Receiver<Evt>,
}

impl<Cmd, Evt> Bridge<Cmd, Evt> {
    /// Send a command to the blocking worker.
    pub async fn send_command(&self, cmd: Cmd) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event from the blocking worker.
    pub async fn recv_event(&self) -> crate::Result<Evt> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Blocking-side handle: lives on the dedicated OS thread, receives commands and sends events.
pub struct Worker<Cmd, Evt> {
    cmd_rx: Receiver<Cmd>,
    event_tx: Sender<Evt>,
}

impl<Cmd, Evt> Worker<Cmd, Evt> {
    /// Block until a command arrives or the bridge is closed.
    pub fn recv_command(&self) -> crate::Result<Cmd> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Poll for a command without blocking; used in a worker's event-pump loop so it can
    /// service both commands and device events in the same iteration.
    pub fn try_recv_command(&self) -> Option<Cmd> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event back to the async side.
    pub fn send_event(&self, event: Evt) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create a bridge pair with the default capacity.
pub fn create_bridge<Cmd, Evt>() -> (Bridge<Cmd, Evt>, Worker<Cmd, Evt>) {
    create_bridge_with_capacity(DEFAULT_BRIDGE_CAPACITY)
}

/// Create a bridge pair with an explicit channel capacity.
pub fn create_bridge_with_capacity<Cmd, Evt>(capacity: usize) -> (Bridge<Cmd, Evt>, Worker<Cmd, Evt>) {
    let (cmd_tx, cmd_rx) = bounded(capacity);
    let (event_tx, event_rx) = bounded(capacity);

    (Bridge { cmd_tx, event_rx }, Worker { cmd_rx, event_tx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestCommand {
        Ping,
    }

    #[derive(Debug, PartialEq)]
    enum TestEvent {
        Pong,
    }

    #[tokio::test]
    async fn test_bridge_roundtrip_command_and_event() {
        let (bridge, worker) = create_bridge::<TestCommand, TestEvent>();

        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            assert_eq!(cmd, TestCommand::Ping);
            worker.send_event(TestEvent::Pong).unwrap();
        });

        bridge.send_command(TestCommand::Ping).await.unwrap();
        let event = bridge.recv_event().await.unwrap();
        assert_eq!(event, TestEvent::Pong);

        handle.join().unwrap();
    }

    #[test]
    fn test_try_recv_command_on_empty_channel_is_none() {
        let (_bridge, worker) = create_bridge::<TestCommand, TestEvent>();
        assert!(worker.try_recv_command().is_none());
    }

    #[tokio::test]
    async fn test_closed_bridge_returns_channel_error() {
        let (bridge, worker) = create_bridge::<TestCommand, TestEvent>();
        drop(worker);
        assert!(bridge.send_command(TestCommand::Ping).await.is_err());
    }
}
