//! The client's TCP connection to a server: handshake, keep-alive, and the dispatch loop that
//! answers inbound `URB_SUBMIT`s against locally-attached hardware.
//!
//! Unlike the server (which fans one connection out to many concurrent peers), a client talks
//! to exactly one server over one socket, so request/response correlation is done with a
//! sequence-number table rather than a full session registry. Framing still splits into a
//! reader task and a writer task coupled through a bounded `mpsc` channel and a `broadcast`
//! shutdown signal, for the same reason the server does: either side failing should tear down
//! the other at its next suspension point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use protocol::{
    codec, Command, ConnectRequest, ConnectResponse, ConnectStatus, DeviceAttachRequest,
    DeviceAttachResponse, DeviceDetachRequest, DeviceId, DeviceInfoRecord, DeviceListResponse,
    ErrorPayload, ProtocolError, SessionId, StatusPayload, UrbCompletePayload, UrbStatus,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

use crate::device_table::DeviceTable;
use crate::transfer_executor::{TransferExecutor, TransferOutcome, TransferRequest};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEP_ALIVE_MISSED_LIMIT: u32 = 3;
const OUTGOING_QUEUE_CAPACITY: usize = 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Application-level version advertised in the handshake. Must agree with the server's own
/// `APP_VERSION` in its major 16 bits; see `server::network::connection`.
const APP_VERSION: u32 = 0x0001_0000;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("handshake rejected: {0:?}")]
    HandshakeRejected(ConnectStatus),
    #[error("request timed out waiting for a reply")]
    Timeout,
    #[error("connection closed before a reply arrived")]
    Closed,
    #[error("server returned an error: {0:?}")]
    Remote(ErrorPayload),
    #[error("unexpected reply command {0:?} for this request")]
    UnexpectedReply(Command),
}

struct Frame {
    command: Command,
    sequence: u32,
    payload: Vec<u8>,
}

type PendingTable = Arc<Mutex<HashMap<u32, oneshot::Sender<(Command, Vec<u8>)>>>>;

/// A live connection to one server. Cloning is cheap (it's a handle); every clone shares the
/// same socket and dispatch tasks.
#[derive(Clone)]
pub struct ClientSession {
    outgoing_tx: mpsc::Sender<Frame>,
    next_sequence: Arc<AtomicU32>,
    pending: PendingTable,
    shutdown_tx: broadcast::Sender<()>,
    session_id: SessionId,
}

impl ClientSession {
    /// Connect to `addr`, perform the handshake, and spawn the reader/writer/keep-alive tasks.
    /// `devices` is the table the reader consults to satisfy `URB_SUBMIT`s; callers populate it
    /// (typically via `attach_device`, which records the mapping itself) before traffic arrives.
    pub async fn connect(
        addr: SocketAddr,
        client_name: &str,
        executor: Arc<dyn TransferExecutor>,
        devices: Arc<DeviceTable>,
    ) -> Result<Self, ConnectionError> {
        let mut stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);

        let session_id = perform_handshake(&mut stream, client_name).await?;

        let (read_half, write_half) = stream.into_split();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        let liveness = Liveness::new();
        let next_sequence = Arc::new(AtomicU32::new(1));
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(run_writer(write_half, outgoing_rx, Arc::clone(&liveness), shutdown_tx.subscribe()));
        tokio::spawn(run_keepalive(
            Arc::clone(&liveness),
            outgoing_tx.clone(),
            Arc::clone(&next_sequence),
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(run_reader(
            read_half,
            executor,
            devices,
            outgoing_tx.clone(),
            Arc::clone(&next_sequence),
            Arc::clone(&pending),
            liveness,
            shutdown_tx.subscribe(),
        ));

        Ok(Self { outgoing_tx, next_sequence, pending, shutdown_tx, session_id })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub async fn attach_device(
        &self,
        info: DeviceInfoRecord,
        descriptors: Vec<u8>,
    ) -> Result<DeviceAttachResponse, ConnectionError> {
        let request = DeviceAttachRequest { info, descriptors };
        let payload = codec::encode_device_attach_request(&request);
        let (command, payload) = self.request(Command::DeviceAttach, payload).await?;
        if command == Command::Error {
            return Err(ConnectionError::Remote(codec::decode_error_payload(&payload)?));
        }
        Ok(codec::decode_device_attach_response(&payload)?)
    }

    pub async fn detach_device(&self, device_id: DeviceId) -> Result<(), ConnectionError> {
        let request = DeviceDetachRequest { device_id };
        let payload = codec::encode_device_detach_request(&request);
        let (command, payload) = self.request(Command::DeviceDetach, payload).await?;
        match command {
            Command::Status => {
                let status = codec::decode_status_payload(&payload)?;
                if status.status == StatusPayload::OK.status {
                    Ok(())
                } else {
                    Err(ConnectionError::UnexpectedReply(Command::Status))
                }
            }
            Command::Error => Err(ConnectionError::Remote(codec::decode_error_payload(&payload)?)),
            other => Err(ConnectionError::UnexpectedReply(other)),
        }
    }

    pub async fn list_devices(&self) -> Result<DeviceListResponse, ConnectionError> {
        let (command, payload) = self.request(Command::DeviceList, Vec::new()).await?;
        if command == Command::Error {
            return Err(ConnectionError::Remote(codec::decode_error_payload(&payload)?));
        }
        Ok(codec::decode_device_list_response(&payload)?)
    }

    /// Send `DISCONNECT` and tear down the local tasks. Idempotent: a second call just finds
    /// nothing left to signal.
    pub async fn close(&self) {
        let _ = self.outgoing_tx.send(Frame { command: Command::Disconnect, sequence: 0, payload: Vec::new() }).await;
        let _ = self.shutdown_tx.send(());
    }

    async fn request(&self, command: Command, payload: Vec<u8>) -> Result<(Command, Vec<u8>), ConnectionError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending table lock poisoned").insert(sequence, tx);

        if self.outgoing_tx.send(Frame { command, sequence, payload }).await.is_err() {
            self.pending.lock().expect("pending table lock poisoned").remove(&sequence);
            return Err(ConnectionError::Closed);
        }

        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                self.pending.lock().expect("pending table lock poisoned").remove(&sequence);
                Err(ConnectionError::Timeout)
            }
        }
    }
}

async fn perform_handshake(stream: &mut TcpStream, client_name: &str) -> Result<SessionId, ConnectionError> {
    let request = ConnectRequest { client_version: APP_VERSION, capabilities: 0, client_name: client_name.to_string() };
    let encoded = codec::encode_connect_request(&request);
    write_frame(stream, Command::Connect, 1, &encoded).await?;

    let (_header, payload) = read_frame(stream).await?;
    let response: ConnectResponse = codec::decode_connect_response(&payload)?;
    if !response.status.is_success() {
        return Err(ConnectionError::HandshakeRejected(response.status));
    }

    debug!(session = response.session_id.0, "handshake accepted");
    Ok(response.session_id)
}

#[allow(clippy::too_many_arguments)]
async fn run_reader(
    mut read_half: OwnedReadHalf,
    executor: Arc<dyn TransferExecutor>,
    devices: Arc<DeviceTable>,
    outgoing_tx: mpsc::Sender<Frame>,
    next_sequence: Arc<AtomicU32>,
    pending: PendingTable,
    liveness: Arc<Liveness>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let (header, payload) = tokio::select! {
            result = read_frame(&mut read_half) => match result {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "connection reader ended");
                    return;
                }
            },
            _ = shutdown.recv() => return,
        };
        liveness.mark_received();

        let command = match Command::from_u16(header.command) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "dropping frame with unknown command");
                continue;
            }
        };

        match command {
            Command::Disconnect => {
                debug!("server closed the session");
                return;
            }
            Command::Ping => {
                let _ = outgoing_tx
                    .send(Frame { command: Command::Pong, sequence: header.sequence, payload: Vec::new() })
                    .await;
            }
            Command::Pong => {}
            Command::UrbSubmit => {
                handle_urb_submit(&payload, &executor, &devices, &outgoing_tx, &next_sequence).await;
            }
            Command::UrbCancel => {
                warn!("received advisory URB_CANCEL; local cancellation is not implemented, awaiting natural completion");
            }
            Command::DeviceAttach | Command::DeviceDetach | Command::DeviceList | Command::Status | Command::Error => {
                let mut pending = pending.lock().expect("pending table lock poisoned");
                if let Some(tx) = pending.remove(&header.sequence) {
                    let _ = tx.send((command, payload));
                } else {
                    warn!(sequence = header.sequence, command = ?command, "reply with no matching request, dropping");
                }
            }
            other => {
                warn!(command = ?other, "unexpected command from server, ignoring");
            }
        }
    }
}

async fn handle_urb_submit(
    payload: &[u8],
    executor: &Arc<dyn TransferExecutor>,
    devices: &Arc<DeviceTable>,
    outgoing_tx: &mpsc::Sender<Frame>,
    next_sequence: &Arc<AtomicU32>,
) {
    let submit = match codec::decode_urb_submit_payload(payload) {
        Ok(submit) => submit,
        Err(e) => {
            warn!(error = %e, "malformed URB_SUBMIT, dropping");
            return;
        }
    };

    let outcome = match devices.get(submit.device_id) {
        None => TransferOutcome::no_device(),
        Some(device) => {
            let executor = Arc::clone(executor);
            let request = TransferRequest {
                endpoint_address: submit.endpoint_address,
                transfer_type: submit.transfer_type,
                direction: submit.direction,
                buffer_length: submit.buffer_length,
                setup_packet: submit.setup_packet,
                out_bytes: submit.data,
            };
            match tokio::task::spawn_blocking(move || executor.execute(device.local_handle, request)).await {
                Ok(outcome) => outcome,
                Err(_) => TransferOutcome { status: UrbStatus::ErrorBusy, actual_length: 0, in_bytes: Vec::new() },
            }
        }
    };

    let complete = UrbCompletePayload {
        device_id: submit.device_id,
        urb_id: submit.urb_id,
        status: outcome.status,
        actual_length: outcome.actual_length,
        data: outcome.in_bytes,
    };
    let encoded = codec::encode_urb_complete_payload(&complete);
    let sequence = next_sequence.fetch_add(1, Ordering::Relaxed);
    let _ = outgoing_tx.send(Frame { command: Command::UrbComplete, sequence, payload: encoded }).await;
}

async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut outgoing_rx: mpsc::Receiver<Frame>,
    liveness: Arc<Liveness>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let frame = tokio::select! {
            frame = outgoing_rx.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
            _ = shutdown.recv() => return,
        };

        if let Err(e) = write_frame(&mut write_half, frame.command, frame.sequence, &frame.payload).await {
            warn!(error = %e, "write failed, ending writer");
            return;
        }
        liveness.mark_sent();
    }
}

async fn run_keepalive(
    liveness: Arc<Liveness>,
    outgoing_tx: mpsc::Sender<Frame>,
    next_sequence: Arc<AtomicU32>,
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
            warn!("keep-alive: no traffic from server for {} intervals, closing", KEEP_ALIVE_MISSED_LIMIT);
            let _ = shutdown_tx.send(());
            return;
        }

        if liveness.millis_since_sent() >= KEEP_ALIVE_INTERVAL.as_millis() as u64 {
            let sequence = next_sequence.fetch_add(1, Ordering::Relaxed);
            let _ = outgoing_tx.send(Frame { command: Command::Ping, sequence, payload: Vec::new() }).await;
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

struct Liveness {
    start: Instant,
    last_sent_ms: AtomicU64,
    last_received_ms: AtomicU64,
}

impl Liveness {
    fn new() -> Arc<Self> {
        Arc::new(Self { start: Instant::now(), last_sent_ms: AtomicU64::new(0), last_received_ms: AtomicU64::new(0) })
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
    use crate::transfer_executor::LoopbackTransferExecutor;
    use protocol::{AttachStatus, DeviceSpeed};
    use tokio::net::TcpListener;

    fn mock_info() -> DeviceInfoRecord {
        DeviceInfoRecord {
            device_id: DeviceId(0),
            vendor_id: 0x1234,
            product_id: 0x5678,
            class: 0,
            subclass: 0,
            protocol: 0,
            speed: DeviceSpeed::High,
            num_configurations: 1,
            num_interfaces: 1,
            manufacturer: "test".into(),
            product: "device".into(),
            serial: "1".into(),
        }
    }

    async fn spawn_fake_server() -> (SocketAddr, tokio::sync::mpsc::Receiver<(SocketAddr, TcpStream)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            if let Ok((stream, peer)) = listener.accept().await {
                let _ = tx.send((peer, stream)).await;
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn handshake_sends_connect_and_reads_response() {
        let (addr, mut accepted) = spawn_fake_server().await;
        let executor = Arc::new(LoopbackTransferExecutor::new());
        let devices = Arc::new(DeviceTable::new());

        let connect_task = tokio::spawn(ClientSession::connect(addr, "test-client", executor, devices));

        let (_peer, mut server_stream) = accepted.recv().await.unwrap();
        let (header, payload) = read_frame(&mut server_stream).await.unwrap();
        assert_eq!(header.command, Command::Connect as u16);
        let request = codec::decode_connect_request(&payload).unwrap();
        assert_eq!(request.client_name, "test-client");

        let response = ConnectResponse {
            status: ConnectStatus::Success,
            server_version: APP_VERSION,
            capabilities: 0,
            session_id: SessionId(7),
        };
        let encoded = codec::encode_connect_response(&response);
        write_frame(&mut server_stream, Command::Connect, header.sequence, &encoded).await.unwrap();

        let session = connect_task.await.unwrap().unwrap();
        assert_eq!(session.session_id(), SessionId(7));
    }

    #[tokio::test]
    async fn attach_device_round_trips_through_server_reply() {
        let (addr, mut accepted) = spawn_fake_server().await;
        let executor = Arc::new(LoopbackTransferExecutor::new());
        let devices = Arc::new(DeviceTable::new());

        let connect_task = tokio::spawn(ClientSession::connect(addr, "test-client", executor, devices));
        let (_peer, mut server_stream) = accepted.recv().await.unwrap();
        let (header, _payload) = read_frame(&mut server_stream).await.unwrap();
        let response = ConnectResponse {
            status: ConnectStatus::Success,
            server_version: APP_VERSION,
            capabilities: 0,
            session_id: SessionId(1),
        };
        write_frame(&mut server_stream, Command::Connect, header.sequence, &codec::encode_connect_response(&response))
            .await
            .unwrap();
        let session = connect_task.await.unwrap().unwrap();

        let attach_task = tokio::spawn({
            let session = session.clone();
            async move { session.attach_device(mock_info(), vec![0u8; 18]).await }
        });

        let (header, payload) = read_frame(&mut server_stream).await.unwrap();
        assert_eq!(header.command, Command::DeviceAttach as u16);
        let _request = codec::decode_device_attach_request(&payload).unwrap();
        let reply = DeviceAttachResponse { status: AttachStatus::Success, device_id: DeviceId(3) };
        write_frame(&mut server_stream, Command::DeviceAttach, header.sequence, &codec::encode_device_attach_response(&reply))
            .await
            .unwrap();

        let result = attach_task.await.unwrap().unwrap();
        assert_eq!(result.device_id, DeviceId(3));
    }

    #[test]
    fn liveness_tracks_sent_and_received_independently() {
        let liveness = Liveness::new();
        std::thread::sleep(Duration::from_millis(20));
        liveness.mark_sent();
        assert!(liveness.millis_since_sent() < 10);
        assert!(liveness.millis_since_received() >= 20);
    }
}
