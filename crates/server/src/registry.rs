//! Device registry: the server-side table of attached virtual devices.
//!
//! One lock guards the whole table. Every operation here is a handful of hash-map
//! lookups, never an `.await`, so holding the lock is always constant-time.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use protocol::{DeviceInfoRecord, DeviceId, Direction, SessionId};
use thiserror::Error;

/// Upper bound on simultaneously attached devices. Device IDs are allocated from `1..=MAX_DEVICES`.
pub const MAX_DEVICES: u32 = 16;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device registry is full ({max} devices attached)")]
    Full { max: u32 },
    #[error("device descriptors are invalid: {0}")]
    InvalidDescriptors(String),
    #[error("device {0:?} is not known to the registry")]
    Unknown(DeviceId),
    #[error("device {device} is owned by a different session than {session:?}")]
    NotOwned { device: DeviceId, session: SessionId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Attached,
    Addressed,
    Configured,
}

/// A single virtual device as tracked by the server.
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    pub local_id: DeviceId,
    pub port_number: u32,
    pub state: DeviceState,
    pub owner_session: SessionId,
    pub info: DeviceInfoRecord,
    pub descriptors: Vec<u8>,
    pub urbs_completed: u64,
    pub urbs_errored: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

struct Inner {
    devices: HashMap<DeviceId, VirtualDevice>,
    owned_by_session: HashMap<SessionId, HashSet<DeviceId>>,
}

pub struct DeviceRegistry {
    max_devices: u32,
    inner: Mutex<Inner>,
}

impl DeviceRegistry {
    pub fn new(max_devices: u32) -> Self {
        Self {
            max_devices,
            inner: Mutex::new(Inner {
                devices: HashMap::new(),
                owned_by_session: HashMap::new(),
            }),
        }
    }

    /// Attach a device owned by `session_id`, allocating the lowest free ID in `1..=max_devices`.
    ///
    /// The client's own local identifier (baked into `info.device_id` by whoever built the
    /// attach request) plays no part in allocation; the registry's ID is authoritative and is
    /// what gets written back into `info.device_id` before the record is stored.
    pub fn attach(
        &self,
        session_id: SessionId,
        mut info: DeviceInfoRecord,
        descriptors: Vec<u8>,
    ) -> Result<DeviceId, RegistryError> {
        if descriptors.is_empty() {
            return Err(RegistryError::InvalidDescriptors(
                "descriptor blob must not be empty".into(),
            ));
        }

        let mut inner = self.inner.lock().expect("registry lock poisoned");

        let device_id = (1..=self.max_devices)
            .map(DeviceId)
            .find(|id| !inner.devices.contains_key(id))
            .ok_or(RegistryError::Full { max: self.max_devices })?;

        info.device_id = device_id;

        inner.devices.insert(
            device_id,
            VirtualDevice {
                local_id: device_id,
                port_number: device_id.0,
                state: DeviceState::Attached,
                owner_session: session_id,
                info,
                descriptors,
                urbs_completed: 0,
                urbs_errored: 0,
                bytes_in: 0,
                bytes_out: 0,
            },
        );
        inner
            .owned_by_session
            .entry(session_id)
            .or_default()
            .insert(device_id);

        Ok(device_id)
    }

    /// Detach a device, failing if it isn't owned by `session_id`. Returns the removed record
    /// so the caller can cascade (cancel pending URBs, tell the bus adapter to unplug).
    pub fn detach(
        &self,
        session_id: SessionId,
        device_id: DeviceId,
    ) -> Result<VirtualDevice, RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        let device = inner
            .devices
            .get(&device_id)
            .ok_or(RegistryError::Unknown(device_id))?;
        if device.owner_session != session_id {
            return Err(RegistryError::NotOwned {
                device: device_id,
                session: session_id,
            });
        }

        let device = inner.devices.remove(&device_id).expect("checked above");
        if let Some(owned) = inner.owned_by_session.get_mut(&session_id) {
            owned.remove(&device_id);
        }
        Ok(device)
    }

    pub fn find_owner(&self, device_id: DeviceId) -> Option<SessionId> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.devices.get(&device_id).map(|d| d.owner_session)
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.devices.contains_key(&device_id)
    }

    pub fn list(&self) -> Vec<DeviceInfoRecord> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.devices.values().map(|d| d.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a URB completion against a device's counters, including the bytes actually
    /// transferred in `direction`. No-op if the device is gone by the time the completion
    /// lands (it may have been detached mid-flight).
    pub fn record_completion(&self, device_id: DeviceId, errored: bool, direction: Direction, actual_length: u32) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(device) = inner.devices.get_mut(&device_id) {
            if errored {
                device.urbs_errored += 1;
            } else {
                device.urbs_completed += 1;
            }
            match direction {
                Direction::In => device.bytes_in += actual_length as u64,
                Direction::Out => device.bytes_out += actual_length as u64,
            }
        }
    }

    /// Remove every device owned by `session_id` (session loss cascade). Returns the removed
    /// devices so the caller can cancel their pending URBs and unplug them from the adapter.
    pub fn reap(&self, session_id: SessionId) -> Vec<VirtualDevice> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(ids) = inner.owned_by_session.remove(&session_id) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|id| inner.devices.remove(&id))
            .collect()
    }
}
