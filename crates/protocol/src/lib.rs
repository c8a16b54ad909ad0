//! Wire protocol for the virtual-USB server/client link.
//!
//! Defines the frame header, the typed payload for each command, and the hand-rolled
//! byte-level codec for both. The format is a fixed-layout binary protocol, not a
//! self-describing one: every struct here has a single, exact wire size (or a fixed prefix
//! plus a length-delimited tail), so decoding never needs a schema beyond the command code
//! in the header.
//!
//! # Example
//!
//! ```
//! use protocol::codec::{encode_header, decode_header};
//! use protocol::types::Command;
//!
//! let frame = encode_header(Command::Ping, 0, 1);
//! let header = decode_header(&frame).unwrap();
//! assert_eq!(header.command, Command::Ping.as_u16());
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;
pub mod version;

pub use codec::{Header, decode_header, encode_header};
pub use error::{ProtocolError, Result};
pub use messages::{
    ConnectRequest, ConnectResponse, DeviceAttachRequest, DeviceAttachResponse,
    DeviceDetachRequest, DeviceInfoRecord, DeviceListResponse, ErrorPayload, StatusPayload,
    UrbCancelPayload, UrbCompletePayload, UrbSubmitPayload,
};
pub use types::{
    AttachStatus, Command, ConnectStatus, DeviceId, DeviceSpeed, Direction, SequenceNumber,
    SessionId, TransferType, UrbId, UrbStatus, MAGIC, MAX_PAYLOAD_LEN,
};
pub use version::{ProtocolVersion, CURRENT_VERSION};
