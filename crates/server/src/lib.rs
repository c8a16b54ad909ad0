//! Virtual USB server core: device registry, URB forwarding engine, and the bus adapter that
//! plugs virtual devices into the local USB stack.
//!
//! `main.rs` is a thin CLI shell over this library; the library itself has no knowledge of
//! `clap` or process lifecycle, so it can be exercised directly from integration tests.

pub mod bus_adapter;
pub mod config;
pub mod network;
pub mod registry;
pub mod urb_engine;

pub use bus_adapter::{AdapterError, BusAdapter, LoopbackBusAdapter, PendingUrbDescriptor};
#[cfg(feature = "vhci")]
pub use bus_adapter::VhciBusAdapter;
pub use config::ServerConfig;
pub use network::TcpServer;
pub use registry::{DeviceRegistry, DeviceState, RegistryError, VirtualDevice, MAX_DEVICES};
pub use urb_engine::{AttachFailure, OutgoingFrame, SessionHandle, UrbEngine, UrbError};
