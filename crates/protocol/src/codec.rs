//! Frame and payload (de)serialization: the fixed 16-byte header plus one
//! typed encoder/decoder per command (§4.1).
//!
//! No I/O happens here — everything operates on in-memory byte slices. [`crate::codec`]
//! never partially commits: a decode either returns a complete value or an error, never a
//! half-filled one.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{ProtocolError, Result};
use crate::messages::{
    ConnectRequest, ConnectResponse, DeviceAttachRequest, DeviceAttachResponse,
    DeviceDetachRequest, DeviceInfoRecord, DeviceListResponse, ErrorPayload, StatusPayload,
    UrbCancelPayload, UrbCompletePayload, UrbSubmitPayload,
};
use crate::types::{
    AttachStatus, Command, ConnectStatus, DeviceId, DeviceSpeed, Direction, SessionId,
    TransferType, UrbId, UrbStatus, DEVICE_INFO_SIZE, DEVICE_STRING_FIELD_SIZE, MAGIC,
    MAX_PAYLOAD_LEN,
};
use crate::version::{ProtocolVersion, CURRENT_VERSION};

pub const HEADER_SIZE: usize = 16;

/// Decoded frame header (§3). The raw command code is kept un-interpreted here; callers
/// resolve it through [`Command::from_u16`] so that an unrecognized command is a dispatch
/// error rather than a header-decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    pub length: u32,
    pub sequence: u32,
}

/// Write the 16-byte header: constant magic and version, caller-supplied command/length/seq.
pub fn encode_header(command: Command, length: u32, sequence: u32) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    {
        let mut w = &mut buf[..];
        w.write_u32::<LittleEndian>(MAGIC).expect("fixed buffer");
        w.write_u16::<LittleEndian>(CURRENT_VERSION.to_u16())
            .expect("fixed buffer");
        w.write_u16::<LittleEndian>(command.as_u16())
            .expect("fixed buffer");
        w.write_u32::<LittleEndian>(length).expect("fixed buffer");
        w.write_u32::<LittleEndian>(sequence).expect("fixed buffer");
    }
    buf
}

/// Parse and validate the 16-byte header. Rejects bad magic, a major-version mismatch, or a
/// length exceeding [`MAX_PAYLOAD_LEN`].
pub fn decode_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    let mut cursor = Cursor::new(bytes);
    let magic = cursor.read_u32::<LittleEndian>()?;
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    let version = ProtocolVersion::from_u16(cursor.read_u16::<LittleEndian>()?);
    if version.major != CURRENT_VERSION.major {
        return Err(ProtocolError::BadVersion {
            expected: CURRENT_VERSION.major,
            got: version.major,
        });
    }
    let command = cursor.read_u16::<LittleEndian>()?;
    let length = cursor.read_u32::<LittleEndian>()?;
    if length > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::LengthOverflow {
            length,
            max: MAX_PAYLOAD_LEN,
        });
    }
    let sequence = cursor.read_u32::<LittleEndian>()?;
    Ok(Header {
        command,
        length,
        sequence,
    })
}

/// Encode a string into a fixed-size null-padded field: at most `len - 1` bytes are copied,
/// the remainder (including at least one byte) is zero-filled.
fn encode_fixed_string(s: &str, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len.saturating_sub(1));
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Decode a fixed-size null-padded field: the string runs up to the first zero byte.
fn decode_fixed_string(bytes: &[u8]) -> Result<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .map(|s| s.to_string())
        .map_err(|_| ProtocolError::InvalidUtf8)
}

fn require_len(bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

// ---- DeviceInfoRecord (208 bytes) ----

pub fn encode_device_info_record(info: &DeviceInfoRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DEVICE_INFO_SIZE);
    buf.write_u32::<LittleEndian>(info.device_id.0).unwrap();
    buf.write_u16::<LittleEndian>(info.vendor_id).unwrap();
    buf.write_u16::<LittleEndian>(info.product_id).unwrap();
    buf.write_u8(info.class).unwrap();
    buf.write_u8(info.subclass).unwrap();
    buf.write_u8(info.protocol).unwrap();
    buf.write_u8(info.speed.as_u8()).unwrap();
    buf.write_u8(info.num_configurations).unwrap();
    buf.write_u8(info.num_interfaces).unwrap();
    buf.extend_from_slice(&encode_fixed_string(
        &info.manufacturer,
        DEVICE_STRING_FIELD_SIZE,
    ));
    buf.extend_from_slice(&encode_fixed_string(&info.product, DEVICE_STRING_FIELD_SIZE));
    buf.extend_from_slice(&encode_fixed_string(&info.serial, DEVICE_STRING_FIELD_SIZE));
    buf.extend_from_slice(&[0u8; 2]); // reserved
    debug_assert_eq!(buf.len(), DEVICE_INFO_SIZE);
    buf
}

pub fn decode_device_info_record(bytes: &[u8]) -> Result<DeviceInfoRecord> {
    require_len(bytes, DEVICE_INFO_SIZE)?;
    let mut cursor = Cursor::new(bytes);
    let device_id = DeviceId(cursor.read_u32::<LittleEndian>()?);
    let vendor_id = cursor.read_u16::<LittleEndian>()?;
    let product_id = cursor.read_u16::<LittleEndian>()?;
    let class = cursor.read_u8()?;
    let subclass = cursor.read_u8()?;
    let protocol = cursor.read_u8()?;
    let speed = DeviceSpeed::from_u8(cursor.read_u8()?);
    let num_configurations = cursor.read_u8()?;
    let num_interfaces = cursor.read_u8()?;

    let mut field = [0u8; DEVICE_STRING_FIELD_SIZE];
    cursor.read_exact(&mut field)?;
    let manufacturer = decode_fixed_string(&field)?;
    cursor.read_exact(&mut field)?;
    let product = decode_fixed_string(&field)?;
    cursor.read_exact(&mut field)?;
    let serial = decode_fixed_string(&field)?;

    Ok(DeviceInfoRecord {
        device_id,
        vendor_id,
        product_id,
        class,
        subclass,
        protocol,
        speed,
        num_configurations,
        num_interfaces,
        manufacturer,
        product,
        serial,
    })
}

// ---- CONNECT (72-byte request, 16-byte response) ----

pub fn encode_connect_request(req: &ConnectRequest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(72);
    buf.write_u32::<LittleEndian>(req.client_version).unwrap();
    buf.write_u32::<LittleEndian>(req.capabilities).unwrap();
    buf.extend_from_slice(&encode_fixed_string(&req.client_name, 64));
    buf
}

pub fn decode_connect_request(bytes: &[u8]) -> Result<ConnectRequest> {
    require_len(bytes, 72)?;
    let mut cursor = Cursor::new(bytes);
    let client_version = cursor.read_u32::<LittleEndian>()?;
    let capabilities = cursor.read_u32::<LittleEndian>()?;
    let mut name = [0u8; 64];
    cursor.read_exact(&mut name)?;
    Ok(ConnectRequest {
        client_version,
        capabilities,
        client_name: decode_fixed_string(&name)?,
    })
}

pub fn encode_connect_response(resp: &ConnectResponse) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.write_u32::<LittleEndian>(resp.status.as_u32()).unwrap();
    buf.write_u32::<LittleEndian>(resp.server_version).unwrap();
    buf.write_u32::<LittleEndian>(resp.capabilities).unwrap();
    buf.write_u32::<LittleEndian>(resp.session_id.0).unwrap();
    buf
}

pub fn decode_connect_response(bytes: &[u8]) -> Result<ConnectResponse> {
    require_len(bytes, 16)?;
    let mut cursor = Cursor::new(bytes);
    let status = ConnectStatus::from_u32(cursor.read_u32::<LittleEndian>()?);
    let server_version = cursor.read_u32::<LittleEndian>()?;
    let capabilities = cursor.read_u32::<LittleEndian>()?;
    let session_id = SessionId(cursor.read_u32::<LittleEndian>()?);
    Ok(ConnectResponse {
        status,
        server_version,
        capabilities,
        session_id,
    })
}

// ---- DEVICE_ATTACH ----

pub fn encode_device_attach_request(req: &DeviceAttachRequest) -> Vec<u8> {
    let mut buf = encode_device_info_record(&req.info);
    buf.write_u32::<LittleEndian>(req.descriptors.len() as u32)
        .unwrap();
    buf.extend_from_slice(&req.descriptors);
    buf
}

pub fn decode_device_attach_request(bytes: &[u8]) -> Result<DeviceAttachRequest> {
    require_len(bytes, DEVICE_INFO_SIZE + 4)?;
    let info = decode_device_info_record(&bytes[..DEVICE_INFO_SIZE])?;
    let mut cursor = Cursor::new(&bytes[DEVICE_INFO_SIZE..DEVICE_INFO_SIZE + 4]);
    let desc_len = cursor.read_u32::<LittleEndian>()? as usize;
    let tail = &bytes[DEVICE_INFO_SIZE + 4..];
    require_len(tail, desc_len)?;
    Ok(DeviceAttachRequest {
        info,
        descriptors: tail[..desc_len].to_vec(),
    })
}

pub fn encode_device_attach_response(resp: &DeviceAttachResponse) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.write_u32::<LittleEndian>(resp.status.as_u32()).unwrap();
    buf.write_u32::<LittleEndian>(resp.device_id.0).unwrap();
    buf
}

pub fn decode_device_attach_response(bytes: &[u8]) -> Result<DeviceAttachResponse> {
    require_len(bytes, 8)?;
    let mut cursor = Cursor::new(bytes);
    let status = AttachStatus::from_u32(cursor.read_u32::<LittleEndian>()?);
    let device_id = DeviceId(cursor.read_u32::<LittleEndian>()?);
    Ok(DeviceAttachResponse { status, device_id })
}

// ---- DEVICE_DETACH ----

pub fn encode_device_detach_request(req: &DeviceDetachRequest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.write_u32::<LittleEndian>(req.device_id.0).unwrap();
    buf
}

pub fn decode_device_detach_request(bytes: &[u8]) -> Result<DeviceDetachRequest> {
    require_len(bytes, 4)?;
    let mut cursor = Cursor::new(bytes);
    Ok(DeviceDetachRequest {
        device_id: DeviceId(cursor.read_u32::<LittleEndian>()?),
    })
}

// ---- DEVICE_LIST response ----

pub fn encode_device_list_response(resp: &DeviceListResponse) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + resp.devices.len() * DEVICE_INFO_SIZE);
    buf.write_u32::<LittleEndian>(resp.devices.len() as u32)
        .unwrap();
    for device in &resp.devices {
        buf.extend_from_slice(&encode_device_info_record(device));
    }
    buf
}

pub fn decode_device_list_response(bytes: &[u8]) -> Result<DeviceListResponse> {
    require_len(bytes, 4)?;
    let mut cursor = Cursor::new(&bytes[..4]);
    let count = cursor.read_u32::<LittleEndian>()? as usize;
    let tail = &bytes[4..];
    require_len(tail, count * DEVICE_INFO_SIZE)?;
    let devices = (0..count)
        .map(|i| {
            let start = i * DEVICE_INFO_SIZE;
            decode_device_info_record(&tail[start..start + DEVICE_INFO_SIZE])
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(DeviceListResponse { devices })
}

// ---- URB_SUBMIT (36-byte prefix + optional Out bytes) ----

pub const URB_SUBMIT_PREFIX_SIZE: usize = 36;

pub fn encode_urb_submit_payload(urb: &UrbSubmitPayload) -> Vec<u8> {
    let mut buf = Vec::with_capacity(URB_SUBMIT_PREFIX_SIZE + urb.data.len());
    buf.write_u32::<LittleEndian>(urb.device_id.0).unwrap();
    buf.write_u64::<LittleEndian>(urb.urb_id.0).unwrap();
    buf.write_u8(urb.endpoint_address).unwrap();
    buf.write_u8(urb.transfer_type.as_u8()).unwrap();
    buf.write_u8(urb.direction.as_u8()).unwrap();
    buf.write_u8(0).unwrap(); // reserved
    buf.write_u32::<LittleEndian>(urb.transfer_flags).unwrap();
    buf.write_u32::<LittleEndian>(urb.buffer_length).unwrap();
    buf.write_u32::<LittleEndian>(urb.interval).unwrap();
    buf.extend_from_slice(&urb.setup_packet);
    debug_assert_eq!(buf.len(), URB_SUBMIT_PREFIX_SIZE);
    if urb.direction == Direction::Out {
        buf.extend_from_slice(&urb.data);
    }
    buf
}

pub fn decode_urb_submit_payload(bytes: &[u8]) -> Result<UrbSubmitPayload> {
    require_len(bytes, URB_SUBMIT_PREFIX_SIZE)?;
    let mut cursor = Cursor::new(&bytes[..URB_SUBMIT_PREFIX_SIZE]);
    let device_id = DeviceId(cursor.read_u32::<LittleEndian>()?);
    let urb_id = UrbId(cursor.read_u64::<LittleEndian>()?);
    let endpoint_address = cursor.read_u8()?;
    let transfer_type = TransferType::from_u8(cursor.read_u8()?)?;
    let direction = Direction::from_u8(cursor.read_u8()?)?;
    let _reserved = cursor.read_u8()?;
    let transfer_flags = cursor.read_u32::<LittleEndian>()?;
    let buffer_length = cursor.read_u32::<LittleEndian>()?;
    let interval = cursor.read_u32::<LittleEndian>()?;
    let mut setup_packet = [0u8; 8];
    cursor.read_exact(&mut setup_packet)?;

    let tail = &bytes[URB_SUBMIT_PREFIX_SIZE..];
    let data = if direction == Direction::Out {
        require_len(tail, buffer_length as usize)?;
        tail[..buffer_length as usize].to_vec()
    } else {
        Vec::new()
    };

    Ok(UrbSubmitPayload {
        device_id,
        urb_id,
        endpoint_address,
        transfer_type,
        direction,
        transfer_flags,
        buffer_length,
        interval,
        setup_packet,
        data,
    })
}

// ---- URB_COMPLETE (20-byte prefix + optional In bytes) ----

pub const URB_COMPLETE_PREFIX_SIZE: usize = 20;

pub fn encode_urb_complete_payload(urb: &UrbCompletePayload) -> Vec<u8> {
    let mut buf = Vec::with_capacity(URB_COMPLETE_PREFIX_SIZE + urb.data.len());
    buf.write_u32::<LittleEndian>(urb.device_id.0).unwrap();
    buf.write_u64::<LittleEndian>(urb.urb_id.0).unwrap();
    buf.write_u32::<LittleEndian>(urb.status.as_u32()).unwrap();
    buf.write_u32::<LittleEndian>(urb.actual_length).unwrap();
    debug_assert_eq!(buf.len(), URB_COMPLETE_PREFIX_SIZE);
    buf.extend_from_slice(&urb.data);
    buf
}

pub fn decode_urb_complete_payload(bytes: &[u8]) -> Result<UrbCompletePayload> {
    require_len(bytes, URB_COMPLETE_PREFIX_SIZE)?;
    let mut cursor = Cursor::new(&bytes[..URB_COMPLETE_PREFIX_SIZE]);
    let device_id = DeviceId(cursor.read_u32::<LittleEndian>()?);
    let urb_id = UrbId(cursor.read_u64::<LittleEndian>()?);
    let status = UrbStatus::from_u32(cursor.read_u32::<LittleEndian>()?)?;
    let actual_length = cursor.read_u32::<LittleEndian>()?;

    let tail = &bytes[URB_COMPLETE_PREFIX_SIZE..];
    Ok(UrbCompletePayload {
        device_id,
        urb_id,
        status,
        actual_length,
        data: tail.to_vec(),
    })
}

// ---- URB_CANCEL ----

pub fn encode_urb_cancel_payload(cancel: &UrbCancelPayload) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.write_u32::<LittleEndian>(cancel.device_id.0).unwrap();
    buf.write_u64::<LittleEndian>(cancel.urb_id.0).unwrap();
    buf
}

pub fn decode_urb_cancel_payload(bytes: &[u8]) -> Result<UrbCancelPayload> {
    require_len(bytes, 12)?;
    let mut cursor = Cursor::new(bytes);
    let device_id = DeviceId(cursor.read_u32::<LittleEndian>()?);
    let urb_id = UrbId(cursor.read_u64::<LittleEndian>()?);
    Ok(UrbCancelPayload { device_id, urb_id })
}

// ---- ERROR ----

pub const ERROR_MESSAGE_FIELD_SIZE: usize = 64;
pub const ERROR_PAYLOAD_SIZE: usize = 4 + 2 + 4 + ERROR_MESSAGE_FIELD_SIZE;

pub fn encode_error_payload(err: &ErrorPayload) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ERROR_PAYLOAD_SIZE);
    buf.write_u32::<LittleEndian>(err.error_code).unwrap();
    buf.write_u16::<LittleEndian>(err.orig_command).unwrap();
    buf.write_u32::<LittleEndian>(err.orig_sequence).unwrap();
    buf.extend_from_slice(&encode_fixed_string(
        &err.message,
        ERROR_MESSAGE_FIELD_SIZE,
    ));
    buf
}

pub fn decode_error_payload(bytes: &[u8]) -> Result<ErrorPayload> {
    require_len(bytes, ERROR_PAYLOAD_SIZE)?;
    let mut cursor = Cursor::new(bytes);
    let error_code = cursor.read_u32::<LittleEndian>()?;
    let orig_command = cursor.read_u16::<LittleEndian>()?;
    let orig_sequence = cursor.read_u32::<LittleEndian>()?;
    let mut message_field = [0u8; ERROR_MESSAGE_FIELD_SIZE];
    cursor.read_exact(&mut message_field)?;
    Ok(ErrorPayload {
        error_code,
        orig_command,
        orig_sequence,
        message: decode_fixed_string(&message_field)?,
    })
}

// ---- STATUS ----

pub fn encode_status_payload(status: &StatusPayload) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.write_u32::<LittleEndian>(status.status).unwrap();
    buf
}

pub fn decode_status_payload(bytes: &[u8]) -> Result<StatusPayload> {
    require_len(bytes, 4)?;
    let mut cursor = Cursor::new(bytes);
    Ok(StatusPayload {
        status: cursor.read_u32::<LittleEndian>()?,
    })
}
