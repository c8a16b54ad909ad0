//! Network subsystem: TCP listener and per-client connection sessions.
//!
//! - [`server::TcpServer`] binds the listening socket and accepts connections.
//! - [`connection`] drives one accepted connection through handshake, the established-session
//!   dispatch loop, and keep-alive, until the peer disconnects or the session is torn down.

pub mod connection;
pub mod server;

pub use server::TcpServer;
