//! The bus adapter boundary: how the URB engine talks to whatever actually presents virtual
//! devices to a host's USB stack.
//!
//! `BusAdapter` is deliberately synchronous and object-safe — implementations back onto
//! blocking OS facilities (vhci_hcd ioctls, an in-process test queue) and are always driven
//! from the dedicated worker thread set up in [`crate::urb_engine`], never called directly
//! from an async task.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use protocol::{Direction, DeviceId, DeviceInfoRecord, TransferType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter has no device {0:?}")]
    NotFound(DeviceId),
    #[error("invalid descriptors: {0}")]
    InvalidDescriptors(String),
    #[error("adapter busy")]
    Busy,
    #[error("adapter I/O error: {0}")]
    Io(String),
}

/// A URB the adapter's underlying bus has asked to be forwarded to the owning client.
/// Carries no `urb_id` — the engine assigns that once it knows which session owns the device.
#[derive(Debug, Clone)]
pub struct PendingUrbDescriptor {
    pub device_id: DeviceId,
    pub endpoint_address: u8,
    pub transfer_type: TransferType,
    pub direction: Direction,
    pub transfer_flags: u32,
    pub buffer_length: u32,
    pub interval: u32,
    pub setup_packet: [u8; 8],
    pub out_data: Vec<u8>,
    pub timeout_ms: u64,
    /// Adapter-private correlation token (e.g. a USB/IP `seqnum`), echoed back unchanged on
    /// [`BusAdapter::complete_urb`] so the adapter can match the completion to its own
    /// in-flight request without having to guess at the engine's `urb_id` allocation order.
    pub request_handle: u64,
}

/// External collaborator that plugs/unplugs virtual devices into a real or simulated USB bus
/// and pumps URBs to/from it. Implementations must not block the caller beyond the stated
/// `poll_pending_urb` timeout.
pub trait BusAdapter: Send + Sync {
    /// Present `device_id` to the bus using the given info/descriptors. The ID is assigned by
    /// the device registry, not the adapter — the adapter just has to track it.
    fn plugin(
        &self,
        device_id: DeviceId,
        info: &DeviceInfoRecord,
        descriptors: &[u8],
    ) -> Result<(), AdapterError>;

    /// Remove a previously plugged-in device.
    fn unplug(&self, device_id: DeviceId) -> Result<(), AdapterError>;

    /// Block up to `timeout` waiting for the next URB the bus wants forwarded to a client.
    /// Returns `None` on timeout (not an error — callers should just poll again).
    fn poll_pending_urb(&self, timeout: Duration) -> Option<PendingUrbDescriptor>;

    /// Deliver a completion back to the bus for a URB it previously handed out via
    /// `poll_pending_urb`. `request_handle` is the token that descriptor carried;
    /// `in_bytes` is empty for Out-direction transfers.
    fn complete_urb(
        &self,
        device_id: DeviceId,
        urb_id: protocol::UrbId,
        request_handle: u64,
        status: protocol::UrbStatus,
        actual_length: u32,
        in_bytes: &[u8],
    ) -> Result<(), AdapterError>;
}

/// In-process adapter used by tests and by the `LoopbackBusAdapter`-only build (no `vhci`
/// feature, no real hardware). URBs are injected with [`LoopbackBusAdapter::push_urb`] and
/// completions recorded for inspection with [`LoopbackBusAdapter::completions`].
pub struct LoopbackBusAdapter {
    state: Mutex<LoopbackState>,
}

struct LoopbackState {
    devices: std::collections::HashSet<DeviceId>,
    pending: VecDeque<PendingUrbDescriptor>,
    completions: Vec<Completion>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub device_id: DeviceId,
    pub urb_id: protocol::UrbId,
    pub request_handle: u64,
    pub status: protocol::UrbStatus,
    pub actual_length: u32,
    pub in_bytes: Vec<u8>,
}

impl Default for LoopbackBusAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBusAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                devices: std::collections::HashSet::new(),
                pending: VecDeque::new(),
                completions: Vec::new(),
            }),
        }
    }

    /// Queue a URB as if the local bus had just generated it for `device_id`.
    pub fn push_urb(&self, descriptor: PendingUrbDescriptor) {
        self.state
            .lock()
            .expect("loopback adapter lock poisoned")
            .pending
            .push_back(descriptor);
    }

    /// Snapshot of every completion delivered so far, in delivery order.
    pub fn completions(&self) -> Vec<Completion> {
        self.state.lock().expect("loopback adapter lock poisoned").completions.clone()
    }

    pub fn is_plugged(&self, device_id: DeviceId) -> bool {
        self.state
            .lock()
            .expect("loopback adapter lock poisoned")
            .devices
            .contains(&device_id)
    }
}

impl BusAdapter for LoopbackBusAdapter {
    fn plugin(
        &self,
        device_id: DeviceId,
        _info: &DeviceInfoRecord,
        descriptors: &[u8],
    ) -> Result<(), AdapterError> {
        if descriptors.is_empty() {
            return Err(AdapterError::InvalidDescriptors("empty descriptor blob".into()));
        }
        self.state
            .lock()
            .expect("loopback adapter lock poisoned")
            .devices
            .insert(device_id);
        Ok(())
    }

    fn unplug(&self, device_id: DeviceId) -> Result<(), AdapterError> {
        let mut state = self.state.lock().expect("loopback adapter lock poisoned");
        if !state.devices.remove(&device_id) {
            return Err(AdapterError::NotFound(device_id));
        }
        Ok(())
    }

    fn poll_pending_urb(&self, timeout: Duration) -> Option<PendingUrbDescriptor> {
        // The loopback adapter is driven in-process: rather than blocking an OS thread on a
        // real queue, poll with a short sleep so the worker loop still observes shutdown
        // promptly.
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(urb) = self
                .state
                .lock()
                .expect("loopback adapter lock poisoned")
                .pending
                .pop_front()
            {
                return Some(urb);
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn complete_urb(
        &self,
        device_id: DeviceId,
        urb_id: protocol::UrbId,
        request_handle: u64,
        status: protocol::UrbStatus,
        actual_length: u32,
        in_bytes: &[u8],
    ) -> Result<(), AdapterError> {
        let mut state = self.state.lock().expect("loopback adapter lock poisoned");
        state.completions.push(Completion {
            device_id,
            urb_id,
            request_handle,
            status,
            actual_length,
            in_bytes: in_bytes.to_vec(),
        });
        Ok(())
    }
}

#[cfg(feature = "vhci")]
pub mod vhci;

#[cfg(feature = "vhci")]
pub use vhci::VhciBusAdapter;
