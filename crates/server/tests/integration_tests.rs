//! End-to-end tests driving `server::TcpServer` over real TCP sockets with hand-rolled frames,
//! covering the wire-level scenarios the unit tests inside the crate don't reach: the
//! connection cap and a session-loss cascade observed from outside the process.

use std::sync::Arc;
use std::time::Duration;

use common::test_utils::{mock_device_descriptor, mock_device_info};
use protocol::{codec, AttachStatus, Command, ConnectRequest, ConnectStatus, DeviceAttachRequest};
use server::{BusAdapter, DeviceRegistry, LoopbackBusAdapter, ServerConfig, TcpServer, UrbEngine, MAX_DEVICES};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn spawn_server(max_clients: u32) -> (std::net::SocketAddr, Arc<LoopbackBusAdapter>) {
    let registry = Arc::new(DeviceRegistry::new(MAX_DEVICES));
    let adapter = Arc::new(LoopbackBusAdapter::new());
    let (engine, _worker) = UrbEngine::spawn(Arc::clone(&adapter) as Arc<dyn BusAdapter>, Arc::clone(&registry));
    tokio::spawn(Arc::clone(&engine).run_event_loop());

    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1".to_string();
    config.port = 0;
    config.max_clients = max_clients;

    let server = TcpServer::bind(&config, registry, engine).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, adapter)
}

async fn write_frame(stream: &mut TcpStream, command: Command, sequence: u32, payload: &[u8]) {
    let header = codec::encode_header(command, payload.len() as u32, sequence);
    stream.write_all(&header).await.unwrap();
    if !payload.is_empty() {
        stream.write_all(payload).await.unwrap();
    }
}

async fn read_frame(stream: &mut TcpStream) -> (codec::Header, Vec<u8>) {
    let mut header_buf = [0u8; codec::HEADER_SIZE];
    stream.read_exact(&mut header_buf).await.unwrap();
    let header = codec::decode_header(&header_buf).unwrap();
    let mut payload = vec![0u8; header.length as usize];
    if header.length > 0 {
        stream.read_exact(&mut payload).await.unwrap();
    }
    (header, payload)
}

async fn handshake(stream: &mut TcpStream, name: &str) -> protocol::SessionId {
    let request = ConnectRequest { client_version: 0x0001_0000, capabilities: 0, client_name: name.to_string() };
    write_frame(stream, Command::Connect, 1, &codec::encode_connect_request(&request)).await;
    let (_header, payload) = read_frame(stream).await;
    let response = codec::decode_connect_response(&payload).unwrap();
    assert_eq!(response.status, ConnectStatus::Success);
    response.session_id
}

#[tokio::test]
async fn handshake_over_real_tcp_is_byte_exact() {
    let (addr, _adapter) = spawn_server(32).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let session_id = handshake(&mut stream, "wire-test-client").await;
    assert_ne!(session_id.0, 0);
}

#[tokio::test]
async fn connections_past_max_clients_are_closed_without_a_reply() {
    let (addr, _adapter) = spawn_server(1).await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    handshake(&mut first, "holder").await;

    // Give the acceptor a moment to count the first connection as active.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let n = second.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0, "over-capacity connection should be closed without any data");
}

#[tokio::test]
async fn attach_reaches_the_bus_adapter_and_detach_unplugs_it() {
    let (addr, adapter) = spawn_server(32).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake(&mut stream, "attach-test-client").await;

    let info = mock_device_info(1, 0x1234, 0x5678);
    let request = DeviceAttachRequest { info, descriptors: mock_device_descriptor() };
    write_frame(&mut stream, Command::DeviceAttach, 2, &codec::encode_device_attach_request(&request)).await;
    let (header, payload) = read_frame(&mut stream).await;
    assert_eq!(header.command, Command::DeviceAttach as u16);
    let response = codec::decode_device_attach_response(&payload).unwrap();
    assert_eq!(response.status, AttachStatus::Success);
    assert!(adapter.is_plugged(response.device_id));
}

#[tokio::test]
async fn dropping_the_connection_cascades_a_detach_from_the_adapter() {
    let (addr, adapter) = spawn_server(32).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake(&mut stream, "drop-test-client").await;

    let info = mock_device_info(1, 0x1234, 0x5678);
    let request = DeviceAttachRequest { info, descriptors: mock_device_descriptor() };
    write_frame(&mut stream, Command::DeviceAttach, 2, &codec::encode_device_attach_request(&request)).await;
    let (_header, payload) = read_frame(&mut stream).await;
    let response = codec::decode_device_attach_response(&payload).unwrap();
    assert!(adapter.is_plugged(response.device_id));

    drop(stream);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if !adapter.is_plugged(response.device_id) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "device should be unplugged within the cascade window");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
