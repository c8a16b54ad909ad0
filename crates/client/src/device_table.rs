//! Client-local mirror of attached devices.
//!
//! The server is the authority on `device_id` — it assigns that value at attach time and the
//! client only ever learns it from the `DEVICE_ATTACH` response. This table maps that
//! server-assigned ID to the `local_handle` the transfer executor uses to find the real
//! hardware, so a `URB_SUBMIT` arriving with a server ID can be dispatched without a second
//! round-trip.

use std::collections::HashMap;
use std::sync::Mutex;

use protocol::DeviceId;

/// One device this client has attached to the server.
#[derive(Debug, Clone)]
pub struct LocalDevice {
    pub device_id: DeviceId,
    /// Executor-private token (e.g. a `rusb` bus/address pair packed into a `u64`).
    pub local_handle: u64,
    pub vendor_id: u16,
    pub product_id: u16,
}

pub struct DeviceTable {
    inner: Mutex<HashMap<DeviceId, LocalDevice>>,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, device: LocalDevice) {
        self.inner.lock().expect("device table lock poisoned").insert(device.device_id, device);
    }

    pub fn remove(&self, device_id: DeviceId) -> Option<LocalDevice> {
        self.inner.lock().expect("device table lock poisoned").remove(&device_id)
    }

    pub fn get(&self, device_id: DeviceId) -> Option<LocalDevice> {
        self.inner.lock().expect("device table lock poisoned").get(&device_id).cloned()
    }

    pub fn local_handles(&self) -> Vec<DeviceId> {
        self.inner.lock().expect("device table lock poisoned").keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("device table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
