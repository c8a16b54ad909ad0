//! Typed payload shapes carried by each command (§6.1).
//!
//! These are plain in-memory structs; [`crate::codec`] owns the byte-level encoding.

use crate::types::{AttachStatus, Command, ConnectStatus, DeviceId, DeviceSpeed, Direction, SessionId, TransferType, UrbId, UrbStatus};

/// Canonical device-info record (§3). 208 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoRecord {
    pub device_id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub speed: DeviceSpeed,
    pub num_configurations: u8,
    pub num_interfaces: u8,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

/// CONNECT request (client → server), 72 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub client_version: u32,
    pub capabilities: u32,
    pub client_name: String,
}

/// CONNECT response (server → client), 16 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub status: ConnectStatus,
    pub server_version: u32,
    pub capabilities: u32,
    pub session_id: SessionId,
}

/// DEVICE_ATTACH request (client → server): 208-byte info + u32 length + descriptor bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttachRequest {
    pub info: DeviceInfoRecord,
    pub descriptors: Vec<u8>,
}

/// DEVICE_ATTACH response (server → client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttachResponse {
    pub status: AttachStatus,
    pub device_id: DeviceId,
}

/// DEVICE_DETACH request (client → server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDetachRequest {
    pub device_id: DeviceId,
}

/// DEVICE_LIST response (server → client): u32 count + count × 208-byte records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceInfoRecord>,
}

/// URB_SUBMIT payload (server → client): fixed 36-byte prefix, then Out-direction bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrbSubmitPayload {
    pub device_id: DeviceId,
    pub urb_id: UrbId,
    pub endpoint_address: u8,
    pub transfer_type: TransferType,
    pub direction: Direction,
    pub transfer_flags: u32,
    pub buffer_length: u32,
    pub interval: u32,
    pub setup_packet: [u8; 8],
    /// Out-direction payload bytes; empty for In-direction URBs.
    pub data: Vec<u8>,
}

/// URB_COMPLETE payload (client → server): fixed 20-byte prefix, then In-direction bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrbCompletePayload {
    pub device_id: DeviceId,
    pub urb_id: UrbId,
    pub status: UrbStatus,
    pub actual_length: u32,
    /// In-direction payload bytes; empty for Out-direction or failed transfers.
    pub data: Vec<u8>,
}

/// URB_CANCEL payload (server → client, advisory).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbCancelPayload {
    pub device_id: DeviceId,
    pub urb_id: UrbId,
}

/// ERROR payload (either direction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub error_code: u32,
    pub orig_command: u16,
    pub orig_sequence: u32,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(error_code: u32, orig: Command, orig_sequence: u32, message: impl Into<String>) -> Self {
        Self {
            error_code,
            orig_command: orig.as_u16(),
            orig_sequence,
            message: message.into(),
        }
    }
}

/// STATUS payload: generic ack (either direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub status: u32,
}

impl StatusPayload {
    pub const OK: StatusPayload = StatusPayload { status: 0 };
}
