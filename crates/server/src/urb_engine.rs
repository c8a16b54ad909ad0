//! The URB forwarding engine: assigns `urb_id`s, tracks in-flight requests, drives the bus
//! adapter from a dedicated worker thread, and enforces at-most-once completion.
//!
//! The pending table is the single source of truth for an in-flight URB. Exactly one of
//! {peer completion, cancellation, timeout, owning-session loss} ever removes an entry —
//! whichever gets there first wins, and every other path sees nothing to do.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{create_bridge, Bridge, Worker};
use protocol::{
    Command, DeviceId, DeviceInfoRecord, Direction, SessionId, UrbCancelPayload,
    UrbCompletePayload, UrbId, UrbStatus, UrbSubmitPayload,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::bus_adapter::{AdapterError, BusAdapter, PendingUrbDescriptor};
use crate::registry::{DeviceRegistry, RegistryError};

/// Default per-URB timeout when the submitting side doesn't specify one.
pub const DEFAULT_URB_TIMEOUT_MS: u64 = 5000;
/// How often the pending table is swept for expired entries.
pub const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum UrbError {
    #[error("bus adapter worker is unavailable: {0}")]
    Bridge(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Error)]
pub enum AttachFailure {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// A message queued for a session's writer task.
#[derive(Debug)]
pub enum OutgoingFrame {
    /// A response to a specific request; the writer echoes the request's own sequence number.
    Solicited { command: Command, sequence: u32, payload: Vec<u8> },
    /// A server-initiated message (URB_SUBMIT, advisory URB_CANCEL, PING); the writer assigns
    /// the next sequence number from its own monotonic counter.
    Unsolicited { command: Command, payload: Vec<u8> },
}

/// Handle a connection hands the engine so it can push unsolicited frames to that session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<OutgoingFrame>,
}

impl SessionHandle {
    pub fn new(tx: mpsc::Sender<OutgoingFrame>) -> Self {
        Self { tx }
    }

    /// Best-effort, non-blocking enqueue. A full or closed channel is backpressure, not a bug;
    /// callers decide what that means for the in-flight request (usually `ErrorBusy`).
    fn try_send(&self, frame: OutgoingFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

#[derive(Debug)]
pub enum AdapterCommand {
    Plugin {
        device_id: DeviceId,
        info: DeviceInfoRecord,
        descriptors: Vec<u8>,
        response: oneshot::Sender<Result<(), AdapterError>>,
    },
    Unplug {
        device_id: DeviceId,
        response: oneshot::Sender<Result<(), AdapterError>>,
    },
    CompleteUrb {
        device_id: DeviceId,
        urb_id: UrbId,
        request_handle: u64,
        status: UrbStatus,
        actual_length: u32,
        data: Vec<u8>,
        response: oneshot::Sender<Result<(), AdapterError>>,
    },
    Shutdown,
}

#[derive(Debug)]
pub enum AdapterEvent {
    PendingUrb(PendingUrbDescriptor),
}

struct PendingUrb {
    device_id: DeviceId,
    session_id: SessionId,
    request_handle: u64,
    direction: Direction,
    submit_time: Instant,
    timeout_ms: u64,
}

pub struct UrbEngine {
    registry: Arc<DeviceRegistry>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    pending: Mutex<HashMap<UrbId, PendingUrb>>,
    next_urb_id: AtomicU64,
    bridge: Bridge<AdapterCommand, AdapterEvent>,
}

impl UrbEngine {
    /// Spawn the dedicated bus-adapter worker thread and build the engine that talks to it.
    pub fn spawn(
        adapter: Arc<dyn BusAdapter>,
        registry: Arc<DeviceRegistry>,
    ) -> (Arc<Self>, std::thread::JoinHandle<()>) {
        let (bridge, worker) = create_bridge::<AdapterCommand, AdapterEvent>();
        let join_handle = std::thread::Builder::new()
            .name("bus-adapter-pump".into())
            .spawn(move || run_adapter_pump(adapter, worker))
            .expect("failed to spawn bus adapter worker thread");

        let engine = Arc::new(Self {
            registry,
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_urb_id: AtomicU64::new(1),
            bridge,
        });
        (engine, join_handle)
    }

    pub async fn shutdown(&self) {
        let _ = self.bridge.send_command(AdapterCommand::Shutdown).await;
    }

    pub fn register_session(&self, session_id: SessionId, handle: SessionHandle) {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .insert(session_id, handle);
    }

    pub fn unregister_session(&self, session_id: SessionId) {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .remove(&session_id);
    }

    /// Attach a device: allocate it in the registry, then plug it into the bus adapter. Rolls
    /// the registry entry back if the adapter rejects it.
    pub async fn attach(
        &self,
        session_id: SessionId,
        info: DeviceInfoRecord,
        descriptors: Vec<u8>,
    ) -> Result<DeviceId, AttachFailure> {
        let device_id = self.registry.attach(session_id, info.clone(), descriptors.clone())?;

        let (tx, rx) = oneshot::channel();
        let sent = self
            .bridge
            .send_command(AdapterCommand::Plugin { device_id, info, descriptors, response: tx })
            .await;

        let outcome = match sent {
            Ok(()) => rx.await.unwrap_or_else(|_| {
                Err(AdapterError::Io("adapter worker dropped response channel".into()))
            }),
            Err(_) => Err(AdapterError::Io("adapter worker unavailable".into())),
        };

        match outcome {
            Ok(()) => Ok(device_id),
            Err(e) => {
                let _ = self.registry.detach(session_id, device_id);
                Err(AttachFailure::Adapter(e))
            }
        }
    }

    /// Detach a device: remove it from the registry, cancel anything still in flight for it,
    /// then unplug it from the adapter.
    pub async fn detach(&self, session_id: SessionId, device_id: DeviceId) -> Result<(), RegistryError> {
        let device = self.registry.detach(session_id, device_id)?;
        self.cancel_pending_for_device(device.local_id).await;
        self.unplug_via_adapter(device.local_id).await;
        Ok(())
    }

    /// Session-loss cascade: every device that session owned is reaped from the registry, its
    /// in-flight URBs completed `Cancelled`, and it is unplugged from the adapter.
    pub async fn reap_session(&self, session_id: SessionId) {
        self.unregister_session(session_id);
        let devices = self.registry.reap(session_id);
        for device in devices {
            self.cancel_pending_for_device(device.local_id).await;
            self.unplug_via_adapter(device.local_id).await;
        }
    }

    /// Consume adapter events forever; call this as a background task. Returns once the
    /// adapter worker thread is gone (bridge closed).
    pub async fn run_event_loop(self: Arc<Self>) {
        loop {
            match self.bridge.recv_event().await {
                Ok(AdapterEvent::PendingUrb(descriptor)) => self.handle_pending_urb(descriptor).await,
                Err(_) => break,
            }
        }
    }

    /// Sweep the pending table forever on a fixed interval; call this as a background task.
    pub async fn run_timeout_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep_timeouts().await;
        }
    }

    async fn handle_pending_urb(&self, descriptor: PendingUrbDescriptor) {
        let urb_id = UrbId(self.next_urb_id.fetch_add(1, Ordering::Relaxed));

        let Some(session_id) = self.registry.find_owner(descriptor.device_id) else {
            self.complete_via_adapter(
                descriptor.device_id,
                urb_id,
                descriptor.request_handle,
                UrbStatus::NoDevice,
                0,
                &[],
            )
            .await;
            return;
        };

        let handle = self
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .get(&session_id)
            .cloned();

        let Some(handle) = handle else {
            self.complete_via_adapter(
                descriptor.device_id,
                urb_id,
                descriptor.request_handle,
                UrbStatus::NoDevice,
                0,
                &[],
            )
            .await;
            return;
        };

        let out_data = if descriptor.direction == Direction::Out {
            descriptor.out_data.clone()
        } else {
            Vec::new()
        };
        let payload = UrbSubmitPayload {
            device_id: descriptor.device_id,
            urb_id,
            endpoint_address: descriptor.endpoint_address,
            transfer_type: descriptor.transfer_type,
            direction: descriptor.direction,
            transfer_flags: descriptor.transfer_flags,
            buffer_length: descriptor.buffer_length,
            interval: descriptor.interval,
            setup_packet: descriptor.setup_packet,
            data: out_data,
        };
        let encoded = protocol::codec::encode_urb_submit_payload(&payload);

        self.pending.lock().expect("pending table lock poisoned").insert(
            urb_id,
            PendingUrb {
                device_id: descriptor.device_id,
                session_id,
                request_handle: descriptor.request_handle,
                direction: descriptor.direction,
                submit_time: Instant::now(),
                timeout_ms: if descriptor.timeout_ms == 0 {
                    DEFAULT_URB_TIMEOUT_MS
                } else {
                    descriptor.timeout_ms
                },
            },
        );

        let sent = handle.try_send(OutgoingFrame::Unsolicited { command: Command::UrbSubmit, payload: encoded });
        if !sent {
            self.pending.lock().expect("pending table lock poisoned").remove(&urb_id);
            self.complete_via_adapter(
                descriptor.device_id,
                urb_id,
                descriptor.request_handle,
                UrbStatus::ErrorBusy,
                0,
                &[],
            )
            .await;
        }
    }

    /// Handle a URB_COMPLETE frame received from a client. A missing pending entry means the
    /// completion is stale (already cancelled, timed out, or delivered twice); that is logged
    /// and dropped, not treated as an error.
    pub async fn handle_urb_complete(&self, payload: UrbCompletePayload) {
        let entry = self.pending.lock().expect("pending table lock poisoned").remove(&payload.urb_id);
        let Some(entry) = entry else {
            debug!(urb_id = payload.urb_id.0, "stale URB_COMPLETE for unknown urb_id, dropping");
            return;
        };

        self.registry.record_completion(
            entry.device_id,
            !payload.status.is_success(),
            entry.direction,
            payload.actual_length,
        );

        let in_bytes: &[u8] = if entry.direction == Direction::In { &payload.data } else { &[] };
        self.complete_via_adapter(
            entry.device_id,
            payload.urb_id,
            entry.request_handle,
            payload.status,
            payload.actual_length,
            in_bytes,
        )
        .await;
    }

    async fn cancel_pending_for_device(&self, device_id: DeviceId) {
        let ids: Vec<UrbId> = self
            .pending
            .lock()
            .expect("pending table lock poisoned")
            .iter()
            .filter(|(_, entry)| entry.device_id == device_id)
            .map(|(id, _)| *id)
            .collect();

        for urb_id in ids {
            let entry = self.pending.lock().expect("pending table lock poisoned").remove(&urb_id);
            let Some(entry) = entry else { continue };
            self.registry.record_completion(entry.device_id, true, entry.direction, 0);
            self.complete_via_adapter(entry.device_id, urb_id, entry.request_handle, UrbStatus::Cancelled, 0, &[])
                .await;
        }
    }

    async fn sweep_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<UrbId> = self
            .pending
            .lock()
            .expect("pending table lock poisoned")
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.submit_time).as_millis() as u64 >= entry.timeout_ms)
            .map(|(id, _)| *id)
            .collect();

        for urb_id in expired {
            self.timeout_one(urb_id).await;
        }
    }

    async fn timeout_one(&self, urb_id: UrbId) {
        let entry = self.pending.lock().expect("pending table lock poisoned").remove(&urb_id);
        let Some(entry) = entry else { return };

        if let Some(handle) = self
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .get(&entry.session_id)
            .cloned()
        {
            let cancel = UrbCancelPayload { device_id: entry.device_id, urb_id };
            let encoded = protocol::codec::encode_urb_cancel_payload(&cancel);
            let _ = handle.try_send(OutgoingFrame::Unsolicited { command: Command::UrbCancel, payload: encoded });
        }

        self.registry.record_completion(entry.device_id, true, entry.direction, 0);
        self.complete_via_adapter(entry.device_id, urb_id, entry.request_handle, UrbStatus::ErrorBusy, 0, &[])
            .await;
    }

    async fn complete_via_adapter(
        &self,
        device_id: DeviceId,
        urb_id: UrbId,
        request_handle: u64,
        status: UrbStatus,
        actual_length: u32,
        in_bytes: &[u8],
    ) {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .bridge
            .send_command(AdapterCommand::CompleteUrb {
                device_id,
                urb_id,
                request_handle,
                status,
                actual_length,
                data: in_bytes.to_vec(),
                response: tx,
            })
            .await;
        if sent.is_err() {
            warn!("bus adapter worker unavailable, dropping completion for urb {}", urb_id.0);
            return;
        }
        match rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, urb_id = urb_id.0, "adapter rejected URB completion"),
            Err(_) => warn!(urb_id = urb_id.0, "adapter worker dropped completion response"),
        }
    }

    async fn unplug_via_adapter(&self, device_id: DeviceId) {
        let (tx, rx) = oneshot::channel();
        if self
            .bridge
            .send_command(AdapterCommand::Unplug { device_id, response: tx })
            .await
            .is_err()
        {
            return;
        }
        if let Ok(Err(e)) = rx.await {
            warn!(error = %e, device_id = device_id.0, "adapter rejected unplug");
        }
    }
}

fn run_adapter_pump(adapter: Arc<dyn BusAdapter>, worker: Worker<AdapterCommand, AdapterEvent>) {
    loop {
        match worker.try_recv_command() {
            Some(AdapterCommand::Plugin { device_id, info, descriptors, response }) => {
                let _ = response.send(adapter.plugin(device_id, &info, &descriptors));
                continue;
            }
            Some(AdapterCommand::Unplug { device_id, response }) => {
                let _ = response.send(adapter.unplug(device_id));
                continue;
            }
            Some(AdapterCommand::CompleteUrb { device_id, urb_id, request_handle, status, actual_length, data, response }) => {
                let _ = response.send(adapter.complete_urb(device_id, urb_id, request_handle, status, actual_length, &data));
                continue;
            }
            Some(AdapterCommand::Shutdown) => break,
            None => {}
        }

        if let Some(descriptor) = adapter.poll_pending_urb(Duration::from_millis(100)) {
            if worker.send_event(AdapterEvent::PendingUrb(descriptor)).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_adapter::LoopbackBusAdapter;
    use crate::registry::MAX_DEVICES;
    use common::test_utils::{mock_device_info, mock_setup_packet, with_timeout, DEFAULT_TEST_TIMEOUT};
    use protocol::TransferType;

    fn spawn_engine() -> (Arc<UrbEngine>, Arc<LoopbackBusAdapter>, std::thread::JoinHandle<()>) {
        let adapter = Arc::new(LoopbackBusAdapter::new());
        let registry = Arc::new(DeviceRegistry::new(MAX_DEVICES));
        let (engine, handle) = UrbEngine::spawn(adapter.clone(), registry);
        (engine, adapter, handle)
    }

    #[tokio::test]
    async fn attach_plugs_device_into_adapter() {
        let (engine, adapter, _handle) = spawn_engine();
        let device_id = engine
            .attach(SessionId(1), mock_device_info(0, 0x1234, 0x5678), vec![0u8; 18])
            .await
            .unwrap();
        assert!(adapter.is_plugged(device_id));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn detach_unplugs_device_from_adapter() {
        let (engine, adapter, _handle) = spawn_engine();
        let device_id = engine
            .attach(SessionId(1), mock_device_info(0, 0x1234, 0x5678), vec![0u8; 18])
            .await
            .unwrap();
        engine.detach(SessionId(1), device_id).await.unwrap();
        assert!(!adapter.is_plugged(device_id));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn pending_urb_with_no_owner_completes_no_device_immediately() {
        let (engine, adapter, _handle) = spawn_engine();
        let event_loop = tokio::spawn(engine.clone().run_event_loop());

        adapter.push_urb(PendingUrbDescriptor {
            device_id: DeviceId(99),
            endpoint_address: 0x80,
            transfer_type: TransferType::Control,
            direction: Direction::In,
            transfer_flags: 0,
            buffer_length: 18,
            interval: 0,
            setup_packet: mock_setup_packet(0x80, 0x06, 0x0100, 0, 18),
            out_data: Vec::new(),
            timeout_ms: 5000,
            request_handle: 7,
        });

        with_timeout(DEFAULT_TEST_TIMEOUT, async {
            loop {
                if adapter.completions().iter().any(|c| c.request_handle == 7) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("completion should arrive");

        event_loop.abort();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn urb_submitted_to_owning_session_and_completed_exactly_once() {
        let (engine, adapter, _handle) = spawn_engine();
        let event_loop = tokio::spawn(engine.clone().run_event_loop());

        let device_id = engine
            .attach(SessionId(1), mock_device_info(0, 0x1234, 0x5678), vec![0u8; 18])
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        engine.register_session(SessionId(1), SessionHandle::new(tx));

        adapter.push_urb(PendingUrbDescriptor {
            device_id,
            endpoint_address: 0x80,
            transfer_type: TransferType::Control,
            direction: Direction::In,
            transfer_flags: 0,
            buffer_length: 18,
            interval: 0,
            setup_packet: mock_setup_packet(0x80, 0x06, 0x0100, 0, 18),
            out_data: Vec::new(),
            timeout_ms: 5000,
            request_handle: 42,
        });

        let frame = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        let OutgoingFrame::Unsolicited { command, payload } = frame else {
            panic!("expected unsolicited URB_SUBMIT frame");
        };
        assert_eq!(command, Command::UrbSubmit);
        let submit = protocol::codec::decode_urb_submit_payload(&payload).unwrap();
        assert_eq!(submit.device_id, device_id);

        engine
            .handle_urb_complete(UrbCompletePayload {
                device_id,
                urb_id: submit.urb_id,
                status: UrbStatus::Success,
                actual_length: 18,
                data: vec![0u8; 18],
            })
            .await;

        with_timeout(DEFAULT_TEST_TIMEOUT, async {
            loop {
                if adapter.completions().iter().any(|c| c.urb_id == submit.urb_id) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("completion should reach adapter exactly once");

        assert_eq!(
            adapter.completions().iter().filter(|c| c.urb_id == submit.urb_id).count(),
            1
        );

        event_loop.abort();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn stale_urb_complete_is_dropped_without_adapter_call() {
        let (engine, adapter, _handle) = spawn_engine();
        engine
            .handle_urb_complete(UrbCompletePayload {
                device_id: DeviceId(1),
                urb_id: UrbId(99999),
                status: UrbStatus::Success,
                actual_length: 0,
                data: Vec::new(),
            })
            .await;
        assert!(adapter.completions().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn reap_session_cancels_pending_and_unplugs_devices() {
        let (engine, adapter, _handle) = spawn_engine();
        let event_loop = tokio::spawn(engine.clone().run_event_loop());

        let device_id = engine
            .attach(SessionId(1), mock_device_info(0, 0x1234, 0x5678), vec![0u8; 18])
            .await
            .unwrap();
        let (tx, _rx) = mpsc::channel(16);
        engine.register_session(SessionId(1), SessionHandle::new(tx));

        adapter.push_urb(PendingUrbDescriptor {
            device_id,
            endpoint_address: 0x80,
            transfer_type: TransferType::Control,
            direction: Direction::In,
            transfer_flags: 0,
            buffer_length: 18,
            interval: 0,
            setup_packet: mock_setup_packet(0x80, 0x06, 0x0100, 0, 18),
            out_data: Vec::new(),
            timeout_ms: 5000,
            request_handle: 1,
        });

        // Give the engine a moment to pull the descriptor off the adapter and register it as
        // pending before the session is reaped.
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.reap_session(SessionId(1)).await;

        with_timeout(DEFAULT_TEST_TIMEOUT, async {
            loop {
                if !adapter.is_plugged(device_id) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("device should be unplugged after session loss");

        assert!(adapter
            .completions()
            .iter()
            .any(|c| c.status == UrbStatus::Cancelled));

        event_loop.abort();
        engine.shutdown().await;
    }
}
