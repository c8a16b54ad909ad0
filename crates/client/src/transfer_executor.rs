//! Local execution of URBs forwarded by the server.
//!
//! `TransferExecutor` is the client-side mirror of the server's `BusAdapter`: it is
//! deliberately synchronous and object-safe, because the only real implementation
//! (`RusbTransferExecutor`) drives libusb, which is a blocking C library. The connection
//! session runs every call through `tokio::task::spawn_blocking` rather than a dedicated
//! worker thread, since each URB is a one-shot request/response rather than a continuous
//! event loop like the server's hotplug/event pump.

use protocol::{Direction, TransferType, UrbStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no such local device")]
    NoDevice,
    #[error("device busy")]
    Busy,
    #[error("transfer I/O error: {0}")]
    Io(String),
}

/// One URB's worth of work, already stripped of session/device-registry bookkeeping the
/// connection layer handles itself.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub endpoint_address: u8,
    pub transfer_type: TransferType,
    pub direction: Direction,
    pub buffer_length: u32,
    pub setup_packet: [u8; 8],
    /// Out-direction payload; empty for In-direction transfers.
    pub out_bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub status: UrbStatus,
    pub actual_length: u32,
    /// In-direction payload; empty for Out-direction or failed transfers.
    pub in_bytes: Vec<u8>,
}

impl TransferOutcome {
    pub fn no_device() -> Self {
        Self { status: UrbStatus::NoDevice, actual_length: 0, in_bytes: Vec::new() }
    }

    pub fn busy() -> Self {
        Self { status: UrbStatus::ErrorBusy, actual_length: 0, in_bytes: Vec::new() }
    }
}

/// Executes a single transfer against a locally-attached real device. Implementations must
/// not block longer than the transfer's own USB timeout; callers are responsible for running
/// `execute` off the async runtime (see module docs).
pub trait TransferExecutor: Send + Sync {
    fn execute(&self, local_handle: u64, request: TransferRequest) -> TransferOutcome;
}

/// In-process test double: every call succeeds and echoes back a fixed-size zero buffer for
/// In-direction transfers, or the byte count for Out-direction ones.
pub struct LoopbackTransferExecutor;

impl Default for LoopbackTransferExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransferExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl TransferExecutor for LoopbackTransferExecutor {
    fn execute(&self, _local_handle: u64, request: TransferRequest) -> TransferOutcome {
        match request.direction {
            Direction::In => TransferOutcome {
                status: UrbStatus::Success,
                actual_length: request.buffer_length,
                in_bytes: vec![0u8; request.buffer_length as usize],
            },
            Direction::Out => TransferOutcome {
                status: UrbStatus::Success,
                actual_length: request.out_bytes.len() as u32,
                in_bytes: Vec::new(),
            },
        }
    }
}

#[cfg(feature = "rusb-backend")]
mod rusb_backend {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing::{debug, warn};

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Real-hardware executor. Device handles are opened once (on attach) and looked up by
    /// the same `local_handle` token the rest of the client uses to refer to the device, so
    /// the executor never has to re-enumerate the bus per transfer.
    pub struct RusbTransferExecutor {
        handles: Mutex<HashMap<u64, rusb::DeviceHandle<rusb::Context>>>,
    }

    impl Default for RusbTransferExecutor {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RusbTransferExecutor {
        pub fn new() -> Self {
            Self { handles: Mutex::new(HashMap::new()) }
        }

        pub fn register(&self, local_handle: u64, handle: rusb::DeviceHandle<rusb::Context>) {
            self.handles.lock().expect("executor lock poisoned").insert(local_handle, handle);
        }

        pub fn unregister(&self, local_handle: u64) {
            self.handles.lock().expect("executor lock poisoned").remove(&local_handle);
        }
    }

    /// One real device discovered on the local bus, ready to be attached to a server.
    pub struct DiscoveredDevice {
        pub info: protocol::DeviceInfoRecord,
        pub descriptors: Vec<u8>,
        pub local_handle: u64,
        pub handle: rusb::DeviceHandle<rusb::Context>,
    }

    /// Enumerate every device on the local bus, skipping root hubs (VID 0x1d6b, hub class)
    /// since they cannot be shared over the wire. `local_handle` is `(bus << 8) | address`,
    /// stable for the life of the process.
    pub fn enumerate_local_devices() -> Result<Vec<DiscoveredDevice>, rusb::Error> {
        let context = rusb::Context::new()?;
        let mut found = Vec::new();

        for device in context.devices()?.iter() {
            let bus = device.bus_number();
            let address = device.address();
            let local_handle = ((bus as u64) << 8) | address as u64;

            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    warn!(bus, address, error = %e, "failed to read device descriptor, skipping");
                    continue;
                }
            };
            if descriptor.vendor_id() == 0x1d6b && descriptor.class_code() == 9 {
                debug!(bus, address, "skipping root hub");
                continue;
            }

            let handle = match device.open() {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(bus, address, error = %e, "failed to open device, skipping");
                    continue;
                }
            };

            let speed = map_device_speed(device.speed());
            let manufacturer = descriptor
                .manufacturer_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
                .unwrap_or_default();
            let product = descriptor
                .product_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
                .unwrap_or_default();
            let serial = descriptor
                .serial_number_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
                .unwrap_or_default();

            let info = protocol::DeviceInfoRecord {
                device_id: protocol::DeviceId(0),
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                class: descriptor.class_code(),
                subclass: descriptor.sub_class_code(),
                protocol: descriptor.protocol_code(),
                speed,
                num_configurations: descriptor.num_configurations(),
                num_interfaces: 1,
                manufacturer,
                product,
                serial,
            };
            let descriptors = encode_device_descriptor(&descriptor);

            found.push(DiscoveredDevice { info, descriptors, local_handle, handle });
        }

        Ok(found)
    }

    /// Re-serialize a `rusb` device descriptor into the 18-byte standard USB layout, since
    /// `rusb` only exposes the parsed fields, not the raw bytes it parsed them from.
    fn encode_device_descriptor(d: &rusb::DeviceDescriptor) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18);
        buf.push(18); // bLength
        buf.push(1); // bDescriptorType: DEVICE
        buf.extend_from_slice(&bcd_version(&d.usb_version()).to_le_bytes());
        buf.push(d.class_code());
        buf.push(d.sub_class_code());
        buf.push(d.protocol_code());
        buf.push(d.max_packet_size());
        buf.extend_from_slice(&d.vendor_id().to_le_bytes());
        buf.extend_from_slice(&d.product_id().to_le_bytes());
        buf.extend_from_slice(&bcd_version(&d.device_version()).to_le_bytes());
        buf.push(d.manufacturer_string_index().unwrap_or(0));
        buf.push(d.product_string_index().unwrap_or(0));
        buf.push(d.serial_number_string_index().unwrap_or(0));
        buf.push(d.num_configurations());
        buf
    }

    fn bcd_version(version: &rusb::Version) -> u16 {
        ((version.major() as u16) << 8) | ((version.minor() as u16) << 4) | version.sub_minor() as u16
    }

    fn map_device_speed(speed: rusb::Speed) -> protocol::DeviceSpeed {
        match speed {
            rusb::Speed::Low => protocol::DeviceSpeed::Low,
            rusb::Speed::Full => protocol::DeviceSpeed::Full,
            rusb::Speed::High => protocol::DeviceSpeed::High,
            rusb::Speed::Super => protocol::DeviceSpeed::Super,
            rusb::Speed::SuperPlus => protocol::DeviceSpeed::SuperPlus,
            // Unreported speed defaults to High rather than Full.
            _ => protocol::DeviceSpeed::High,
        }
    }

    impl TransferExecutor for RusbTransferExecutor {
        fn execute(&self, local_handle: u64, request: TransferRequest) -> TransferOutcome {
            let mut handles = self.handles.lock().expect("executor lock poisoned");
            let Some(handle) = handles.get_mut(&local_handle) else {
                warn!(local_handle, "transfer for unknown local device");
                return TransferOutcome::no_device();
            };

            let result = match request.transfer_type {
                TransferType::Control => execute_control(handle, &request),
                TransferType::Bulk => execute_bulk(handle, &request),
                TransferType::Interrupt => execute_interrupt(handle, &request),
                TransferType::Isochronous => {
                    warn!("isochronous transfers are not implemented");
                    return TransferOutcome { status: UrbStatus::StallPid, actual_length: 0, in_bytes: Vec::new() };
                }
            };

            match result {
                Ok((actual_length, in_bytes)) => {
                    debug!(local_handle, actual_length, "transfer completed");
                    TransferOutcome { status: UrbStatus::Success, actual_length, in_bytes }
                }
                Err(e) => {
                    warn!(local_handle, error = %e, "transfer failed");
                    TransferOutcome { status: map_rusb_error(&e), actual_length: 0, in_bytes: Vec::new() }
                }
            }
        }
    }

    fn execute_control(
        handle: &mut rusb::DeviceHandle<rusb::Context>,
        request: &TransferRequest,
    ) -> Result<(u32, Vec<u8>), rusb::Error> {
        let [request_type, req, value_lo, value_hi, index_lo, index_hi, length_lo, length_hi] = request.setup_packet;
        let value = u16::from_le_bytes([value_lo, value_hi]);
        let index = u16::from_le_bytes([index_lo, index_hi]);
        let length = u16::from_le_bytes([length_lo, length_hi]);

        if request.direction == Direction::In {
            let mut buffer = vec![0u8; length as usize];
            let n = handle.read_control(request_type, req, value, index, &mut buffer, DEFAULT_TIMEOUT)?;
            buffer.truncate(n);
            Ok((n as u32, buffer))
        } else {
            let n = handle.write_control(request_type, req, value, index, &request.out_bytes, DEFAULT_TIMEOUT)?;
            Ok((n as u32, Vec::new()))
        }
    }

    fn execute_bulk(
        handle: &mut rusb::DeviceHandle<rusb::Context>,
        request: &TransferRequest,
    ) -> Result<(u32, Vec<u8>), rusb::Error> {
        if request.direction == Direction::In {
            let mut buffer = vec![0u8; request.buffer_length as usize];
            let n = handle.read_bulk(request.endpoint_address, &mut buffer, DEFAULT_TIMEOUT)?;
            buffer.truncate(n);
            Ok((n as u32, buffer))
        } else {
            let n = handle.write_bulk(request.endpoint_address, &request.out_bytes, DEFAULT_TIMEOUT)?;
            Ok((n as u32, Vec::new()))
        }
    }

    fn execute_interrupt(
        handle: &mut rusb::DeviceHandle<rusb::Context>,
        request: &TransferRequest,
    ) -> Result<(u32, Vec<u8>), rusb::Error> {
        if request.direction == Direction::In {
            let mut buffer = vec![0u8; request.buffer_length as usize];
            let n = handle.read_interrupt(request.endpoint_address, &mut buffer, DEFAULT_TIMEOUT)?;
            buffer.truncate(n);
            Ok((n as u32, buffer))
        } else {
            let n = handle.write_interrupt(request.endpoint_address, &request.out_bytes, DEFAULT_TIMEOUT)?;
            Ok((n as u32, Vec::new()))
        }
    }

    fn map_rusb_error(error: &rusb::Error) -> UrbStatus {
        match error {
            rusb::Error::Timeout => UrbStatus::ErrorShortXfer,
            rusb::Error::Pipe => UrbStatus::StallPid,
            rusb::Error::NoDevice | rusb::Error::NotFound => UrbStatus::NoDevice,
            rusb::Error::Busy => UrbStatus::ErrorBusy,
            _ => UrbStatus::ErrorShortXfer,
        }
    }
}

#[cfg(feature = "rusb-backend")]
pub use rusb_backend::{enumerate_local_devices, DiscoveredDevice, RusbTransferExecutor};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_in_transfer_echoes_requested_length() {
        let executor = LoopbackTransferExecutor::new();
        let outcome = executor.execute(
            1,
            TransferRequest {
                endpoint_address: 0x81,
                transfer_type: TransferType::Bulk,
                direction: Direction::In,
                buffer_length: 64,
                setup_packet: [0; 8],
                out_bytes: Vec::new(),
            },
        );
        assert_eq!(outcome.status, UrbStatus::Success);
        assert_eq!(outcome.actual_length, 64);
        assert_eq!(outcome.in_bytes.len(), 64);
    }

    #[test]
    fn loopback_out_transfer_reports_bytes_written() {
        let executor = LoopbackTransferExecutor::new();
        let outcome = executor.execute(
            1,
            TransferRequest {
                endpoint_address: 0x01,
                transfer_type: TransferType::Bulk,
                direction: Direction::Out,
                buffer_length: 0,
                setup_packet: [0; 8],
                out_bytes: vec![1, 2, 3],
            },
        );
        assert_eq!(outcome.status, UrbStatus::Success);
        assert_eq!(outcome.actual_length, 3);
        assert!(outcome.in_bytes.is_empty());
    }

    #[test]
    fn no_device_outcome_reports_no_device_status() {
        let outcome = TransferOutcome::no_device();
        assert_eq!(outcome.status, UrbStatus::NoDevice);
    }
}
