//! TCP acceptor: binds the listening socket and spawns a [`connection`] task per accepted
//! client, up to the configured client cap.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use protocol::SessionId;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::network::connection;
use crate::registry::DeviceRegistry;
use crate::urb_engine::UrbEngine;

/// Accepts TCP connections and spawns a session task for each, up to `max_clients`
/// concurrently. Connections over the cap are accepted and then dropped immediately.
pub struct TcpServer {
    listener: TcpListener,
    registry: Arc<DeviceRegistry>,
    engine: Arc<UrbEngine>,
    max_clients: u32,
    next_session_id: AtomicU32,
}

impl TcpServer {
    /// Bind the listening socket described by `config`. Address reuse is enabled so a quick
    /// server restart doesn't fail with `AddrInUse` while the old socket drains.
    pub async fn bind(
        config: &ServerConfig,
        registry: Arc<DeviceRegistry>,
        engine: Arc<UrbEngine>,
    ) -> std::io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid bind address: {e}")))?;

        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;

        info!(%addr, max_clients = config.max_clients, "listening");
        Ok(Self {
            listener,
            registry,
            engine,
            max_clients: config.max_clients,
            next_session_id: AtomicU32::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, spawning one session task per client. Returns only on a
    /// fatal listener error.
    pub async fn run(self) -> std::io::Result<()> {
        let active = Arc::new(AtomicU32::new(0));
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;

            if active.load(Ordering::Relaxed) >= self.max_clients {
                warn!(%peer_addr, max_clients = self.max_clients, "rejecting connection, at capacity");
                drop(stream);
                continue;
            }

            let session_id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
            let registry = Arc::clone(&self.registry);
            let engine = Arc::clone(&self.engine);
            let active_for_task = Arc::clone(&active);

            active.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                connection::handle_connection(stream, peer_addr, registry, engine, session_id).await;
                active_for_task.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}
