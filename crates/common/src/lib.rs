//! Shared utilities used by both the server and client binaries: error types, logging setup,
//! and the async/blocking channel bridge used to drive real USB I/O from a dedicated thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{create_bridge, create_bridge_with_capacity, Bridge, Worker};
pub use error::{Error, Result};
pub use logging::setup_logging;
