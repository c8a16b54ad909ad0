//! Per-client connection session: TCP handshake, keep-alive, and the command dispatch loop
//! for an established session.
//!
//! Framing is handled by a reader task and a writer task, coupled through a bounded `mpsc`
//! channel of [`OutgoingFrame`]s and a `broadcast` shutdown signal both tasks (and the
//! keep-alive timer) subscribe to. Either side finishing — peer disconnect, a protocol error,
//! or the keep-alive timer giving up — tears down the others at their next suspension point.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::{
    codec, AttachStatus, Command, ConnectResponse, ConnectStatus, DeviceAttachResponse,
    DeviceListResponse, ErrorPayload, ProtocolError, SessionId, StatusPayload,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::registry::{DeviceRegistry, RegistryError};
use crate::urb_engine::{AttachFailure, OutgoingFrame, SessionHandle, UrbEngine};

/// How often an idle connection sends an unprompted PING.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Missed receive-intervals tolerated before a connection is considered dead.
const KEEP_ALIVE_MISSED_LIMIT: u32 = 3;
/// Outgoing frames queued per session before further URB submissions to that session start
/// completing immediately with `ErrorBusy` instead of blocking the engine.
pub const OUTGOING_QUEUE_CAPACITY: usize = 1024;

/// Application-level version carried in the handshake payload, independent of the wire
/// protocol's own major.minor (checked by `codec::decode_header` on every frame). A future
/// server build could bump this without touching the wire format at all.
const APP_VERSION: u32 = 0x0001_0000;

#[derive(Debug, Error)]
enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Drive one accepted TCP connection from handshake through close. Never returns an error to
/// the caller — failures are logged and simply end the session.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<DeviceRegistry>,
    engine: Arc<UrbEngine>,
    session_id: SessionId,
) {
    if let Err(e) = run(stream, peer_addr, registry, engine, session_id).await {
        warn!(%peer_addr, session = session_id.0, error = %e, "connection ended with error");
    }
}

async fn run(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<DeviceRegistry>,
    engine: Arc<UrbEngine>,
    session_id: SessionId,
) -> Result<(), ConnectionError> {
    let _ = stream.set_nodelay(true);

    match perform_handshake(&mut stream, session_id).await {
        Ok(true) => {}
        Ok(false) => {
            info!(%peer_addr, "handshake rejected, closing");
            return Ok(());
        }
        Err(e) => {
            warn!(%peer_addr, error = %e, "handshake failed");
            return Ok(());
        }
    }

    info!(%peer_addr, session = session_id.0, "session established");

    let (read_half, write_half) = stream.into_split();
    let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
    let (shutdown_tx, _) = broadcast::channel(1);
    let liveness = Liveness::new();

    engine.register_session(session_id, SessionHandle::new(outgoing_tx.clone()));

    let writer_task = tokio::spawn(run_writer(write_half, outgoing_rx, Arc::clone(&liveness), shutdown_tx.subscribe()));
    let keepalive_task = tokio::spawn(run_keepalive(
        Arc::clone(&liveness),
        outgoing_tx.clone(),
        shutdown_tx.clone(),
        shutdown_tx.subscribe(),
    ));

    let reader_result = run_reader(
        read_half,
        registry,
        Arc::clone(&engine),
        session_id,
        outgoing_tx,
        liveness,
        shutdown_tx.subscribe(),
    )
    .await;

    let _ = shutdown_tx.send(());
    keepalive_task.abort();
    let _ = writer_task.await;

    engine.reap_session(session_id).await;
    info!(%peer_addr, session = session_id.0, "session closed");

    reader_result
}

/// Read the client's CONNECT frame and reply. Returns `Ok(true)` on success, `Ok(false)` if the
/// handshake was rejected (the reply was still sent), `Err` on a malformed or absent handshake.
async fn perform_handshake(stream: &mut TcpStream, session_id: SessionId) -> Result<bool, ConnectionError> {
    let (header, payload) = read_frame(stream).await?;
    let command = Command::from_u16(header.command)?;
    if command != Command::Connect {
        return Err(ConnectionError::HandshakeFailed(format!(
            "expected CONNECT, got {command:?}"
        )));
    }

    let request = codec::decode_connect_request(&payload)?;
    let status = if (request.client_version >> 16) as u16 == (APP_VERSION >> 16) as u16 {
        ConnectStatus::Success
    } else {
        ConnectStatus::VersionMismatch
    };

    let response = ConnectResponse {
        status,
        server_version: APP_VERSION,
        capabilities: 0,
        session_id,
    };
    let encoded = codec::encode_connect_response(&response);
    write_frame(stream, Command::Connect, header.sequence, &encoded).await?;

    if !status.is_success() {
        debug!(session = session_id.0, client_name = %request.client_name, "rejected handshake: version mismatch");
        return Ok(false);
    }

    debug!(session = session_id.0, client_name = %request.client_name, "handshake accepted");
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
async fn run_reader(
    mut read_half: OwnedReadHalf,
    registry: Arc<DeviceRegistry>,
    engine: Arc<UrbEngine>,
    session_id: SessionId,
    outgoing_tx: mpsc::Sender<OutgoingFrame>,
    liveness: Arc<Liveness>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ConnectionError> {
    loop {
        let (header, payload) = tokio::select! {
            result = read_frame(&mut read_half) => result?,
            _ = shutdown.recv() => return Ok(()),
        };
        liveness.mark_received();

        let command = Command::from_u16(header.command)?;
        match command {
            Command::Disconnect => {
                debug!(session = session_id.0, "peer requested disconnect");
                return Ok(());
            }
            Command::Ping => {
                let _ = outgoing_tx
                    .send(OutgoingFrame::Solicited {
                        command: Command::Pong,
                        sequence: header.sequence,
                        payload: Vec::new(),
                    })
                    .await;
            }
            Command::Pong => {
                // liveness already updated above; nothing further to do.
            }
            Command::DeviceAttach => {
                let request = codec::decode_device_attach_request(&payload)?;
                let response = match engine.attach(session_id, request.info, request.descriptors).await {
                    Ok(device_id) => DeviceAttachResponse { status: AttachStatus::Success, device_id },
                    Err(AttachFailure::Registry(RegistryError::Full { .. })) => DeviceAttachResponse {
                        status: AttachStatus::Full,
                        device_id: protocol::DeviceId(0),
                    },
                    Err(e) => {
                        warn!(session = session_id.0, error = %e, "device attach rejected");
                        DeviceAttachResponse { status: AttachStatus::InvalidDescriptors, device_id: protocol::DeviceId(0) }
                    }
                };
                let encoded = codec::encode_device_attach_response(&response);
                let _ = outgoing_tx
                    .send(OutgoingFrame::Solicited {
                        command: Command::DeviceAttach,
                        sequence: header.sequence,
                        payload: encoded,
                    })
                    .await;
            }
            Command::DeviceDetach => {
                let request = codec::decode_device_detach_request(&payload)?;
                match engine.detach(session_id, request.device_id).await {
                    Ok(()) => {
                        let encoded = codec::encode_status_payload(&StatusPayload::OK);
                        let _ = outgoing_tx
                            .send(OutgoingFrame::Solicited {
                                command: Command::Status,
                                sequence: header.sequence,
                                payload: encoded,
                            })
                            .await;
                    }
                    Err(e) => {
                        warn!(session = session_id.0, device = request.device_id.0, error = %e, "device detach rejected");
                        let error_code = match e {
                            RegistryError::NotOwned { .. } => 1,
                            RegistryError::Unknown(_) => 2,
                            _ => 3,
                        };
                        send_error(&outgoing_tx, error_code, Command::DeviceDetach, header.sequence, &e.to_string()).await;
                    }
                }
            }
            Command::DeviceList => {
                let response = DeviceListResponse { devices: registry.list() };
                let encoded = codec::encode_device_list_response(&response);
                let _ = outgoing_tx
                    .send(OutgoingFrame::Solicited {
                        command: Command::DeviceList,
                        sequence: header.sequence,
                        payload: encoded,
                    })
                    .await;
            }
            Command::UrbComplete => {
                let complete = codec::decode_urb_complete_payload(&payload)?;
                engine.handle_urb_complete(complete).await;
            }
            other => {
                warn!(session = session_id.0, command = ?other, "unexpected command from client, ignoring");
                send_error(&outgoing_tx, 1, other, header.sequence, "unexpected command for this session state").await;
            }
        }
    }
}

async fn send_error(
    outgoing_tx: &mpsc::Sender<OutgoingFrame>,
    error_code: u32,
    orig_command: Command,
    orig_sequence: u32,
    message: &str,
) {
    let payload = ErrorPayload::new(error_code, orig_command, orig_sequence, message);
    let encoded = codec::encode_error_payload(&payload);
    let _ = outgoing_tx
        .send(OutgoingFrame::Solicited { command: Command::Error, sequence: orig_sequence, payload: encoded })
        .await;
}

async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut outgoing_rx: mpsc::Receiver<OutgoingFrame>,
    liveness: Arc<Liveness>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ConnectionError> {
    let mut next_sequence: u32 = 1;
    loop {
        let frame = tokio::select! {
            frame = outgoing_rx.recv() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
            _ = shutdown.recv() => return Ok(()),
        };

        let (command, sequence, payload) = match frame {
            OutgoingFrame::Solicited { command, sequence, payload } => (command, sequence, payload),
            OutgoingFrame::Unsolicited { command, payload } => {
                let sequence = next_sequence;
                next_sequence = next_sequence.wrapping_add(1);
                (command, sequence, payload)
            }
        };

        write_frame(&mut write_half, command, sequence, &payload).await?;
        liveness.mark_sent();
    }
}

async fn run_keepalive(
    liveness: Arc<Liveness>,
    outgoing_tx: mpsc::Sender<OutgoingFrame>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.recv() => return,
        }

        let missed_limit_ms = KEEP_ALIVE_INTERVAL.as_millis() as u64 * KEEP_ALIVE_MISSED_LIMIT as u64;
        if liveness.millis_since_received() > missed_limit_ms {
            warn!("keep-alive: no traffic received for {} intervals, closing session", KEEP_ALIVE_MISSED_LIMIT);
            let _ = shutdown_tx.send(());
            return;
        }

        if liveness.millis_since_sent() >= KEEP_ALIVE_INTERVAL.as_millis() as u64 {
            let _ = outgoing_tx
                .send(OutgoingFrame::Unsolicited { command: Command::Ping, payload: Vec::new() })
                .await;
        }
    }
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<(codec::Header, Vec<u8>), ConnectionError> {
    let mut header_buf = [0u8; codec::HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = codec::decode_header(&header_buf)?;

    let mut payload = vec![0u8; header.length as usize];
    if header.length > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok((header, payload))
}

async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    command: Command,
    sequence: u32,
    payload: &[u8],
) -> Result<(), ConnectionError> {
    let header = codec::encode_header(command, payload.len() as u32, sequence);
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    Ok(())
}

/// Tracks, as milliseconds since the session started, when a frame was last sent and last
/// received. Used by the keep-alive task; cheap enough to touch on every frame.
struct Liveness {
    start: Instant,
    last_sent_ms: AtomicU64,
    last_received_ms: AtomicU64,
}

impl Liveness {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            last_sent_ms: AtomicU64::new(0),
            last_received_ms: AtomicU64::new(0),
        })
    }

    fn mark_sent(&self) {
        self.last_sent_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    fn mark_received(&self) {
        self.last_received_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    fn millis_since_sent(&self) -> u64 {
        self.elapsed_ms().saturating_sub(self.last_sent_ms.load(Ordering::Relaxed))
    }

    fn millis_since_received(&self) -> u64 {
        self.elapsed_ms().saturating_sub(self.last_received_ms.load(Ordering::Relaxed))
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_adapter::LoopbackBusAdapter;
    use crate::registry::MAX_DEVICES;
    use common::test_utils::{mock_device_info, DEFAULT_TEST_TIMEOUT};
    use protocol::{ConnectRequest, DeviceAttachRequest};
    use tokio::net::TcpListener;

    async fn spawn_test_session() -> (SocketAddr, Arc<DeviceRegistry>, Arc<UrbEngine>) {
        let registry = Arc::new(DeviceRegistry::new(MAX_DEVICES));
        let adapter = Arc::new(LoopbackBusAdapter::new());
        let (engine, _adapter_thread) = UrbEngine::spawn(adapter, Arc::clone(&registry));
        let _event_loop = tokio::spawn(Arc::clone(&engine).run_event_loop());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry_for_task = Arc::clone(&registry);
        let engine_for_task = Arc::clone(&engine);
        tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            handle_connection(stream, peer_addr, registry_for_task, engine_for_task, SessionId(1)).await;
        });

        (addr, registry, engine)
    }

    async fn send_request(
        stream: &mut TcpStream,
        command: Command,
        sequence: u32,
        payload: &[u8],
    ) -> (codec::Header, Vec<u8>) {
        write_frame(stream, command, sequence, payload).await.unwrap();
        read_frame(stream).await.unwrap()
    }

    #[tokio::test]
    async fn handshake_succeeds_and_returns_session_id() {
        let (addr, _registry, _engine) = spawn_test_session().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let request = ConnectRequest { client_version: APP_VERSION, capabilities: 0, client_name: "test".into() };
        let payload = codec::encode_connect_request(&request);
        let (header, response_payload) = common::test_utils::with_timeout(
            DEFAULT_TEST_TIMEOUT,
            send_request(&mut client, Command::Connect, 1, &payload),
        )
        .await
        .unwrap();

        assert_eq!(header.command, Command::Connect as u16);
        let response = codec::decode_connect_response(&response_payload).unwrap();
        assert_eq!(response.status, ConnectStatus::Success);
        assert_eq!(response.session_id, SessionId(1));
    }

    #[tokio::test]
    async fn handshake_rejects_incompatible_version() {
        let (addr, _registry, _engine) = spawn_test_session().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let request = ConnectRequest { client_version: 0x0099_0000, capabilities: 0, client_name: "test".into() };
        let payload = codec::encode_connect_request(&request);
        let (_header, response_payload) = common::test_utils::with_timeout(
            DEFAULT_TEST_TIMEOUT,
            send_request(&mut client, Command::Connect, 1, &payload),
        )
        .await
        .unwrap();

        let response = codec::decode_connect_response(&response_payload).unwrap();
        assert_eq!(response.status, ConnectStatus::VersionMismatch);
    }

    #[tokio::test]
    async fn ping_receives_pong_with_same_sequence() {
        let (addr, _registry, _engine) = spawn_test_session().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let request = ConnectRequest { client_version: APP_VERSION, capabilities: 0, client_name: "test".into() };
        let payload = codec::encode_connect_request(&request);
        send_request(&mut client, Command::Connect, 1, &payload).await;

        let (header, _payload) =
            common::test_utils::with_timeout(DEFAULT_TEST_TIMEOUT, send_request(&mut client, Command::Ping, 42, &[]))
                .await
                .unwrap();
        assert_eq!(header.command, Command::Pong as u16);
        assert_eq!(header.sequence, 42);
    }

    #[tokio::test]
    async fn device_attach_then_list_reflects_new_device() {
        let (addr, _registry, _engine) = spawn_test_session().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let request = ConnectRequest { client_version: APP_VERSION, capabilities: 0, client_name: "test".into() };
        let payload = codec::encode_connect_request(&request);
        send_request(&mut client, Command::Connect, 1, &payload).await;

        let attach = DeviceAttachRequest { info: mock_device_info(0, 0x1234, 0x5678), descriptors: vec![0u8; 18] };
        let payload = codec::encode_device_attach_request(&attach);
        let (_header, response_payload) = common::test_utils::with_timeout(
            DEFAULT_TEST_TIMEOUT,
            send_request(&mut client, Command::DeviceAttach, 2, &payload),
        )
        .await
        .unwrap();
        let response = codec::decode_device_attach_response(&response_payload).unwrap();
        assert_eq!(response.status, AttachStatus::Success);

        let (_header, response_payload) = common::test_utils::with_timeout(
            DEFAULT_TEST_TIMEOUT,
            send_request(&mut client, Command::DeviceList, 3, &[]),
        )
        .await
        .unwrap();
        let list = codec::decode_device_list_response(&response_payload).unwrap();
        assert_eq!(list.devices.len(), 1);
        assert_eq!(list.devices[0].device_id, response.device_id);
    }

    #[tokio::test]
    async fn detach_unknown_device_gets_error_reply() {
        let (addr, _registry, _engine) = spawn_test_session().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let request = ConnectRequest { client_version: APP_VERSION, capabilities: 0, client_name: "test".into() };
        let payload = codec::encode_connect_request(&request);
        send_request(&mut client, Command::Connect, 1, &payload).await;

        let detach = protocol::DeviceDetachRequest { device_id: protocol::DeviceId(99) };
        let payload = codec::encode_device_detach_request(&detach);
        let (header, _response_payload) = common::test_utils::with_timeout(
            DEFAULT_TEST_TIMEOUT,
            send_request(&mut client, Command::DeviceDetach, 2, &payload),
        )
        .await
        .unwrap();
        assert_eq!(header.command, Command::Error as u16);
    }

    #[test]
    fn liveness_tracks_sent_and_received_independently() {
        let liveness = Liveness::new();
        assert!(liveness.millis_since_sent() < 50);
        assert!(liveness.millis_since_received() < 50);
        std::thread::sleep(Duration::from_millis(20));
        liveness.mark_sent();
        assert!(liveness.millis_since_sent() < 10);
        assert!(liveness.millis_since_received() >= 20);
    }
}
