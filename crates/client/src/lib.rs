//! Virtual USB client core: captures local hardware, attaches it to a server over TCP, and
//! executes the URBs the server forwards back.
//!
//! `main.rs` is a thin CLI shell over this library, so it can be exercised directly from
//! integration tests without a process boundary.

pub mod config;
pub mod device_table;
pub mod network;
pub mod transfer_executor;

pub use config::ClientConfig;
pub use device_table::{DeviceTable, LocalDevice};
pub use network::{ClientSession, ConnectionError};
#[cfg(feature = "rusb-backend")]
pub use transfer_executor::{enumerate_local_devices, DiscoveredDevice, RusbTransferExecutor};
pub use transfer_executor::{ExecutorError, LoopbackTransferExecutor, TransferExecutor, TransferOutcome, TransferRequest};
