//! Server and client talking over loopback

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use voltage_modbus_tcp::{
    ChangeObserver, ClientConfig, DataStore, ModbusClient, ModbusError, ModbusTcpClient,
    ModbusTcpServer, ServerConfig, ServerInfo,
};

async fn start_server(store: Arc<DataStore>) -> (ModbusTcpServer, u16) {
    let config = ServerConfig::default()
        .with_host("127.0.0.1")
        .with_port(0)
        .with_recv_timeout(Duration::from_millis(200));
    let mut server = ModbusTcpServer::with_store(config, store).unwrap();
    let addr = server.start().await.unwrap();
    (server, addr.port())
}

fn client(port: u16) -> ModbusTcpClient {
    ModbusTcpClient::new(ClientConfig::new("127.0.0.1", port).with_timeout(Duration::from_secs(2)))
        .unwrap()
}

#[derive(Default)]
struct CountingObserver {
    coils: AtomicUsize,
    registers: AtomicUsize,
    remote: AtomicUsize,
}

impl ChangeObserver for CountingObserver {
    fn on_coil_change(&self, _: u16, _: bool, _: bool, info: Option<&ServerInfo<'_>>) {
        self.coils.fetch_add(1, Ordering::SeqCst);
        if info.is_some() {
            self.remote.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_holding_register_change(&self, _: u16, _: u16, _: u16, info: Option<&ServerInfo<'_>>) {
        self.registers.fetch_add(1, Ordering::SeqCst);
        if info.is_some() {
            self.remote.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn test_read_zeroed_registers() {
    let (mut server, port) = start_server(Arc::new(DataStore::new())).await;
    let mut client = client(port);

    assert_eq!(client.read_holding_registers(0, 4).await.unwrap(), vec![0, 0, 0, 0]);
    assert!(client.is_open());

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_write_coil_then_read_back() {
    let store = Arc::new(DataStore::new());
    let observer = Arc::new(CountingObserver::default());
    store.subscribe(observer.clone());
    let (mut server, port) = start_server(store.clone()).await;
    let mut client = client(port);

    client.write_single_coil(10, true).await.unwrap();
    assert_eq!(client.read_coils(10, 1).await.unwrap(), vec![true]);
    assert_eq!(store.read_coils(10, 1).unwrap(), vec![true]);

    // same value again: no second notification
    client.write_single_coil(10, true).await.unwrap();
    assert_eq!(observer.coils.load(Ordering::SeqCst), 1);
    assert_eq!(observer.remote.load(Ordering::SeqCst), 1);

    client.write_multiple_registers(100, &[1, 2, 3]).await.unwrap();
    assert_eq!(client.read_03(100, 3).await.unwrap(), vec![1, 2, 3]);
    assert_eq!(observer.registers.load(Ordering::SeqCst), 3);

    store.write_input_registers(5, &[42]).unwrap();
    assert_eq!(client.read_input_registers(5, 1).await.unwrap(), vec![42]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_validation_before_io() {
    // nothing listens here; a validation failure must not try to connect
    let mut client = client(1);
    let err = client.read_holding_registers(0, 200).await.unwrap_err();
    assert!(matches!(err, ModbusError::InvalidData { .. }));
    assert!(!client.is_open());
    assert_eq!(client.get_stats().requests_sent, 0);
}

#[tokio::test]
async fn test_exception_from_small_store() {
    let store = Arc::new(DataStore::with_config(
        &voltage_modbus_tcp::DataStoreConfig::default().with_size(16),
    )
    .unwrap());
    let (mut server, port) = start_server(store).await;
    let mut client = client(port);

    let err = client.read_holding_registers(10, 10).await.unwrap_err();
    assert_eq!(err.exception_code(), Some(0x02));
    // connection survives an exception reply
    assert!(client.is_open());
    assert_eq!(client.read_holding_registers(0, 2).await.unwrap(), vec![0, 0]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_transaction_id_closes_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        sock.read_exact(&mut request).await.unwrap();
        let tid = u16::from_be_bytes([request[0], request[1]]).wrapping_add(1);
        let mut reply = tid.to_be_bytes().to_vec();
        reply.extend_from_slice(&[0, 0, 0, 5, request[6], 0x03, 0x02, 0x00, 0x00]);
        sock.write_all(&reply).await.unwrap();
    });

    let mut client = client(port);
    let err = client.read_holding_registers(0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Receive { .. }));
    assert!(!client.is_open());
}

#[tokio::test]
async fn test_bad_protocol_id_closes_connection() {
    let (mut server, port) = start_server(Arc::new(DataStore::new())).await;
    let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    sock.write_all(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), sock.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_clients() {
    let store = Arc::new(DataStore::new());
    let (mut server, port) = start_server(store.clone()).await;

    let mut tasks = Vec::new();
    for i in 0..8u16 {
        tasks.push(tokio::spawn(async move {
            let mut client = client(port);
            for round in 0..10u16 {
                client.write_single_register(i, round).await.unwrap();
                assert_eq!(client.read_holding_registers(i, 1).await.unwrap(), vec![round]);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(store.read_holding_registers(0, 8).unwrap(), vec![9; 8]);
    assert!(server.stats().connections_accepted >= 8);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_auto_close_reopens_per_request() {
    let (mut server, port) = start_server(Arc::new(DataStore::new())).await;
    let mut client = client(port);
    client.set_auto_close(true);

    for _ in 0..3 {
        client.read_coils(0, 8).await.unwrap();
        assert!(!client.is_open());
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_custom_request_unknown_function() {
    let (mut server, port) = start_server(Arc::new(DataStore::new())).await;
    let mut client = client(port);

    let err = client.custom_request(&[0x2B, 0x0E, 0x01, 0x00]).await.unwrap_err();
    assert_eq!(err.exception_code(), Some(0x01));

    server.stop().await.unwrap();
}
