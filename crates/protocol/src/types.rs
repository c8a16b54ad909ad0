//! Core wire-level types: identifiers, command codes, and small enums.

use crate::error::{ProtocolError, Result};

/// Magic number at the head of every frame ("VUSB")
pub const MAGIC: u32 = 0x5655_5342;

/// Maximum payload length a header may declare
pub const MAX_PAYLOAD_LEN: u32 = 65536;

/// Fixed on-wire size of a device-info record
pub const DEVICE_INFO_SIZE: usize = 208;

/// Fixed size of a null-padded string field inside a device-info record
pub const DEVICE_STRING_FIELD_SIZE: usize = 64;

/// Server-assigned virtual-device identifier. Scope: one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

/// Server-wide monotonic URB identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UrbId(pub u64);

/// Session-scoped sequence number, assigned at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(pub u32);

/// Opaque session identifier handed to the client at handshake completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u32);

/// Wire command codes (§6.1). The "new" numbering scheme; the source's "old" scheme is not
/// implemented (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Connect = 0x0001,
    Disconnect = 0x0002,
    Ping = 0x0003,
    Pong = 0x0004,
    DeviceAttach = 0x0010,
    DeviceDetach = 0x0011,
    DeviceList = 0x0012,
    UrbSubmit = 0x0020,
    UrbComplete = 0x0021,
    UrbCancel = 0x0022,
    Status = 0x00FE,
    Error = 0x00FF,
}

impl Command {
    pub fn from_u16(raw: u16) -> Result<Self> {
        Ok(match raw {
            0x0001 => Command::Connect,
            0x0002 => Command::Disconnect,
            0x0003 => Command::Ping,
            0x0004 => Command::Pong,
            0x0010 => Command::DeviceAttach,
            0x0011 => Command::DeviceDetach,
            0x0012 => Command::DeviceList,
            0x0020 => Command::UrbSubmit,
            0x0021 => Command::UrbComplete,
            0x0022 => Command::UrbCancel,
            0x00FE => Command::Status,
            0x00FF => Command::Error,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// USB device speed, as reported by the bus adapter or captured from hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceSpeed {
    Low = 1,
    Full = 2,
    High = 3,
    Super = 4,
    SuperPlus = 5,
}

impl DeviceSpeed {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => DeviceSpeed::Low,
            2 => DeviceSpeed::Full,
            4 => DeviceSpeed::Super,
            5 => DeviceSpeed::SuperPlus,
            // Source defaults to High when hardware does not report speed; preserved here,
            // both for 3 and for any unrecognized value.
            _ => DeviceSpeed::High,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// URB transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Bulk = 1,
    Interrupt = 2,
    Isochronous = 3,
}

impl TransferType {
    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => TransferType::Control,
            1 => TransferType::Bulk,
            2 => TransferType::Interrupt,
            3 => TransferType::Isochronous,
            other => {
                return Err(ProtocolError::InvalidFieldValue { field: "transfer_type", value: other as u32 })
            }
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Transfer direction, carried separately from the endpoint address's direction bit so the
/// wire payload is self-describing without re-deriving it from `endpoint_address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => Direction::Out,
            1 => Direction::In,
            other => return Err(ProtocolError::InvalidFieldValue { field: "direction", value: other as u32 }),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Derive a direction from a USB endpoint address (high bit = IN).
    pub fn from_endpoint_address(endpoint_address: u8) -> Self {
        if endpoint_address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// URB completion status, as transmitted in URB_COMPLETE (§4.4). `Pending` is never put on
/// the wire; it exists purely as an internal bookkeeping value before a URB Entry's outcome
/// is known, so it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UrbStatus {
    Success = 0,
    Cancelled = 1,
    StallPid = 2,
    ErrorBusy = 3,
    ErrorShortXfer = 4,
    NoDevice = 5,
}

impl UrbStatus {
    pub fn from_u32(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => UrbStatus::Success,
            1 => UrbStatus::Cancelled,
            2 => UrbStatus::StallPid,
            3 => UrbStatus::ErrorBusy,
            4 => UrbStatus::ErrorShortXfer,
            5 => UrbStatus::NoDevice,
            other => return Err(ProtocolError::InvalidFieldValue { field: "urb_status", value: other }),
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        matches!(self, UrbStatus::Success)
    }
}

/// CONNECT response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnectStatus {
    Success = 0,
    VersionMismatch = 1,
    Rejected = 2,
}

impl ConnectStatus {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => ConnectStatus::Success,
            1 => ConnectStatus::VersionMismatch,
            _ => ConnectStatus::Rejected,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        matches!(self, ConnectStatus::Success)
    }
}

/// DEVICE_ATTACH response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AttachStatus {
    Success = 0,
    Full = 1,
    InvalidDescriptors = 2,
}

impl AttachStatus {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => AttachStatus::Success,
            1 => AttachStatus::Full,
            _ => AttachStatus::InvalidDescriptors,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        matches!(self, AttachStatus::Success)
    }
}
