//! Test helpers shared across crates: mock device-info builders, mock URB payloads, and a
//! timeout wrapper for async tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::mock_device_info;
//!
//! let device = mock_device_info(1, 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//! ```

use protocol::{DeviceId, DeviceInfoRecord, DeviceSpeed, UrbId, UrbSubmitPayload};
use std::future::Future;
use std::time::Duration;

/// Default test timeout.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a mock device-info record with generic vendor/product IDs.
pub fn mock_device_info(id: u32, vendor_id: u16, product_id: u16) -> DeviceInfoRecord {
    mock_device_info_with_class(id, vendor_id, product_id, 0x00, 0x00, 0x00)
}

/// Build a mock device-info record with an explicit USB class/subclass/protocol.
pub fn mock_device_info_with_class(
    id: u32,
    vendor_id: u16,
    product_id: u16,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> DeviceInfoRecord {
    DeviceInfoRecord {
        device_id: DeviceId(id),
        vendor_id,
        product_id,
        class,
        subclass,
        protocol,
        speed: DeviceSpeed::High,
        num_configurations: 1,
        num_interfaces: 1,
        manufacturer: format!("Test Manufacturer {id}"),
        product: format!("Test Product {id}"),
        serial: format!("SN{id:06}"),
    }
}

/// Mock mass-storage device (Western Digital-style VID/PID, bulk-only SCSI).
pub fn mock_mass_storage_device(id: u32) -> DeviceInfoRecord {
    mock_device_info_with_class(id, 0x0781, 0x5581, 0x08, 0x06, 0x50)
}

/// Mock HID device (keyboard/mouse class).
pub fn mock_hid_device(id: u32) -> DeviceInfoRecord {
    mock_device_info_with_class(id, 0x046d, 0xc52b, 0x03, 0x00, 0x00)
}

/// Mock USB hub device.
pub fn mock_hub_device(id: u32) -> DeviceInfoRecord {
    mock_device_info_with_class(id, 0x05e3, 0x0608, 0x09, 0x00, 0x00)
}

/// Build `count` distinct mock devices with ascending IDs and VID/PID pairs.
pub fn mock_device_list(count: u32) -> Vec<DeviceInfoRecord> {
    (1..=count)
        .map(|i| mock_device_info(i, 0x1000 + i as u16, 0x2000 + i as u16))
        .collect()
}

/// Standard 18-byte USB device descriptor for a generic device.
pub fn mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Minimal 25-byte configuration descriptor with one bulk-IN interface.
pub fn mock_config_descriptor() -> Vec<u8> {
    vec![
        0x09, 0x02, 0x19, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, // configuration
        0x09, 0x04, 0x00, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00, // interface
        0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00, // endpoint
    ]
}

/// A mock control-transfer setup packet.
pub fn mock_setup_packet(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    [
        request_type,
        request,
        (value & 0xFF) as u8,
        (value >> 8) as u8,
        (index & 0xFF) as u8,
        (index >> 8) as u8,
        (length & 0xFF) as u8,
        (length >> 8) as u8,
    ]
}

/// A mock URB_SUBMIT for a GET_DESCRIPTOR(Device) control transfer on endpoint 0.
pub fn mock_get_device_descriptor_urb(device_id: DeviceId, urb_id: UrbId) -> UrbSubmitPayload {
    UrbSubmitPayload {
        device_id,
        urb_id,
        endpoint_address: 0x80,
        transfer_type: protocol::TransferType::Control,
        direction: protocol::Direction::In,
        transfer_flags: 0,
        buffer_length: 18,
        interval: 0,
        setup_packet: mock_setup_packet(0x80, 0x06, 0x0100, 0x0000, 18),
        data: Vec::new(),
    }
}

/// Run a future with a timeout, returning a [`TimeoutError`] if it doesn't resolve in time.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test future doesn't resolve within [`with_timeout`]'s budget.
#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_info_fields() {
        let device = mock_device_info(42, 0x1234, 0x5678);
        assert_eq!(device.device_id, DeviceId(42));
        assert_eq!(device.vendor_id, 0x1234);
        assert_eq!(device.product_id, 0x5678);
    }

    #[test]
    fn test_mock_device_list_has_unique_ids() {
        let devices = mock_device_list(10);
        assert_eq!(devices.len(), 10);
        let ids: std::collections::HashSet<_> = devices.iter().map(|d| d.device_id).collect();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn test_mock_mass_storage_device_class() {
        let device = mock_mass_storage_device(1);
        assert_eq!(device.class, 0x08);
        assert_eq!(device.subclass, 0x06);
        assert_eq!(device.protocol, 0x50);
    }

    #[test]
    fn test_mock_device_descriptor_shape() {
        let desc = mock_device_descriptor();
        assert_eq!(desc.len(), 18);
        assert_eq!(desc[0], 0x12);
        assert_eq!(desc[1], 0x01);
    }

    #[test]
    fn test_mock_get_device_descriptor_urb() {
        let urb = mock_get_device_descriptor_urb(DeviceId(1), UrbId(1));
        assert_eq!(urb.endpoint_address, 0x80);
        assert_eq!(urb.buffer_length, 18);
        assert_eq!(urb.direction, protocol::Direction::In);
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;
        assert!(result.is_err());
    }
}
