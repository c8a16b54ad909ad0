//! Network subsystem: the TCP connection session to a server.

pub mod connection;

pub use connection::{ClientSession, ConnectionError};
