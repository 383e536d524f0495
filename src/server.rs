//! Modbus/TCP server engine
//!
//! One tokio task per accepted connection. Each connection runs the loop
//!
//! ```text
//! AwaitingHeader -> AwaitingBody -> Dispatching -> Responding -> AwaitingHeader
//!        \______________\______________\_______________\______-> Closed
//! ```
//!
//! Receives use a short timeout as a liveness checkpoint: on every expiry the
//! worker re-checks the server's running flag, so [`ModbusTcpServer::stop`]
//! never has to interrupt a blocked read.
//!
//! The header decoder accepts MBAP lengths up to 256, but a PDU is capped at
//! 253 bytes: a frame announcing a 254-255 byte PDU is read in full, counted
//! as a frame error and the connection is closed without a reply.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::constants::MBAP_HEADER_LEN;
use crate::error::{ModbusError, ModbusResult};
use crate::handler::{DataHandler, RequestHandler};
use crate::logging::format_hex_packet;
use crate::mbap::MbapHeader;
use crate::pdu::ModbusPdu;
use crate::session::{ClientInfo, SessionData};
use crate::store::DataStore;

/// Connection state, traced on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    AwaitingHeader,
    AwaitingBody,
    Dispatching,
    Responding,
    Closed,
}

/// Server counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub active_connections: u64,
    pub requests: u64,
    pub exceptions: u64,
    pub frame_errors: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Default)]
struct ServerCounters {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    active_connections: AtomicU64,
    requests: AtomicU64,
    exceptions: AtomicU64,
    frame_errors: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ServerCounters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self, started: Option<Instant>) -> ServerStats {
        ServerStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            uptime_seconds: started.map(|t| t.elapsed().as_secs()).unwrap_or(0),
        }
    }
}

/// Settings shared by every connection worker
#[derive(Clone)]
struct Worker {
    handler: Arc<dyn RequestHandler>,
    running: Arc<AtomicBool>,
    counters: Arc<ServerCounters>,
    recv_timeout: Duration,
    send_timeout: Duration,
}

/// Modbus/TCP server
pub struct ModbusTcpServer {
    config: ServerConfig,
    handler: Arc<dyn RequestHandler>,
    store: Option<Arc<DataStore>>,
    running: Arc<AtomicBool>,
    counters: Arc<ServerCounters>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    start_time: Option<Instant>,
}

impl ModbusTcpServer {
    /// Server backed by a fresh store built from `config.data_store`
    pub fn new(config: ServerConfig) -> ModbusResult<Self> {
        let store = Arc::new(DataStore::with_config(&config.data_store)?);
        Self::with_store(config, store)
    }

    /// Server backed by an existing store
    pub fn with_store(config: ServerConfig, store: Arc<DataStore>) -> ModbusResult<Self> {
        let handler = Arc::new(DataHandler::new(store.clone()));
        let mut server = Self::with_handler(config, handler)?;
        server.store = Some(store);
        Ok(server)
    }

    /// Server answering through a custom handler
    pub fn with_handler(config: ServerConfig, handler: Arc<dyn RequestHandler>) -> ModbusResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            handler,
            store: None,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(ServerCounters::default()),
            shutdown_tx: None,
            accept_task: None,
            local_addr: None,
            start_time: None,
        })
    }

    /// Backing store, if the server was built around one
    pub fn store(&self) -> Option<&Arc<DataStore>> {
        self.store.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound address once started (resolves port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot(self.start_time)
    }

    /// Bind and serve in the background. Returns the bound address.
    pub async fn start(&mut self) -> ModbusResult<SocketAddr> {
        if self.is_running() {
            return Err(ModbusError::configuration("server is already running"));
        }

        let bind_address = self.config.bind_address();
        let listener = TcpListener::bind(&bind_address).await.map_err(|e| {
            ModbusError::connection(format!("failed to bind to {bind_address}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let limiter = self
            .config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));
        let worker = Worker {
            handler: self.handler.clone(),
            running: self.running.clone(),
            counters: self.counters.clone(),
            recv_timeout: self.config.recv_timeout(),
            send_timeout: self.config.send_timeout(),
        };

        self.running.store(true, Ordering::SeqCst);
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            worker,
            limiter,
            shutdown_rx,
        )));
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        self.start_time = Some(Instant::now());

        info!("Modbus TCP server listening on {}", local_addr);
        debug!(
            "recv timeout {:?}, send timeout {:?}, max connections {:?}",
            self.config.recv_timeout(),
            self.config.send_timeout(),
            self.config.max_connections
        );
        Ok(local_addr)
    }

    /// Start and serve until the flag returned by
    /// [`running_flag`](Self::running_flag) is cleared
    pub async fn run(&mut self) -> ModbusResult<()> {
        self.start().await?;
        if let Some(task) = self.accept_task.take() {
            task.await
                .map_err(|e| ModbusError::internal(format!("accept loop failed: {e}")))?;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Close the listener. Workers exit at their next liveness checkpoint.
    pub async fn stop(&mut self) -> ModbusResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.accept_task.take() {
            task.await
                .map_err(|e| ModbusError::internal(format!("accept loop failed: {e}")))?;
        }
        info!("Modbus TCP server stopped");
        Ok(())
    }

    /// Handle used to stop a server that is blocked in [`run`](Self::run)
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }
}

/// Pause before the next `accept()`; errors such as EMFILE persist for a while
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

async fn back_off_after_accept_error(e: &std::io::Error) {
    error!("Failed to accept connection: {}", e);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

async fn accept_loop(
    listener: TcpListener,
    worker: Worker,
    limiter: Option<Arc<Semaphore>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut liveness = tokio::time::interval(worker.recv_timeout);
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        back_off_after_accept_error(&e).await;
                        continue;
                    }
                };

                let permit = match &limiter {
                    Some(limiter) => match limiter.clone().try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            warn!("Connection limit reached, rejecting {}", addr);
                            ServerCounters::add(&worker.counters.connections_rejected, 1);
                            drop(stream);
                            continue;
                        }
                    },
                    None => None,
                };

                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {}: {}", addr, e);
                }
                ServerCounters::add(&worker.counters.connections_accepted, 1);
                info!("Client connected: {}", addr);

                let worker = worker.clone();
                tokio::spawn(async move {
                    handle_connection(stream, ClientInfo::from(addr), &worker).await;
                    drop(permit);
                });
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing listener");
                break;
            }
            _ = liveness.tick() => {
                if !worker.running.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }
}

/// Outcome of a guarded read
enum Recv {
    Done,
    Closed(&'static str),
}

/// Fill `buf`, re-checking `running` on every receive timeout
async fn recv_all<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
    worker: &Worker,
) -> ModbusResult<Recv> {
    let mut filled = 0;
    while filled < buf.len() {
        if !worker.running.load(Ordering::SeqCst) {
            return Ok(Recv::Closed("server stopping"));
        }
        match timeout(worker.recv_timeout, stream.read(&mut buf[filled..])).await {
            Err(_) => continue,
            Ok(Ok(0)) => return Ok(Recv::Closed("peer closed connection")),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    ServerCounters::add(&worker.counters.bytes_received, filled as u64);
    Ok(Recv::Done)
}

fn transition(client: &ClientInfo, state: &mut ConnectionState, next: ConnectionState) {
    debug!("{}: {:?} -> {:?}", client, state, next);
    *state = next;
}

/// Serve one connection until the peer leaves, a frame is malformed, a
/// socket error occurs or the server stops
async fn handle_connection<S>(mut stream: S, client: ClientInfo, worker: &Worker)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ServerCounters::add(&worker.counters.active_connections, 1);
    let mut state = ConnectionState::Connected;
    let mut session = SessionData::new(client);

    let reason = loop {
        session.new_request();

        transition(&client, &mut state, ConnectionState::AwaitingHeader);
        let mut header = [0u8; MBAP_HEADER_LEN];
        match recv_all(&mut stream, &mut header, worker).await {
            Ok(Recv::Done) => {}
            Ok(Recv::Closed(reason)) => break reason.to_string(),
            Err(e) => break e.to_string(),
        }
        let mbap = match MbapHeader::decode(&header) {
            Ok(mbap) => mbap,
            Err(e) => {
                ServerCounters::add(&worker.counters.frame_errors, 1);
                warn!("{}: {} [{}]", client, e, format_hex_packet(&header));
                break e.to_string();
            }
        };

        transition(&client, &mut state, ConnectionState::AwaitingBody);
        let mut body = vec![0u8; mbap.pdu_len()];
        match recv_all(&mut stream, &mut body, worker).await {
            Ok(Recv::Done) => {}
            Ok(Recv::Closed(reason)) => break reason.to_string(),
            Err(e) => break e.to_string(),
        }
        session.request.mbap = mbap;
        session.request.pdu = match ModbusPdu::from_slice(&body) {
            Ok(pdu) => pdu,
            Err(e) => {
                ServerCounters::add(&worker.counters.frame_errors, 1);
                break e.to_string();
            }
        };

        transition(&client, &mut state, ConnectionState::Dispatching);
        ServerCounters::add(&worker.counters.requests, 1);
        let function_code = session.request.pdu.function_code().unwrap_or(0);
        let response = match worker.handler.handle(&session) {
            Ok(pdu) => pdu,
            Err(e) => match e.to_exception_code() {
                Some(code) => {
                    debug!("{}: handler error {}, replying exception 0x{:02X}", client, e, code);
                    ModbusPdu::exception(function_code, code)
                }
                None => {
                    ServerCounters::add(&worker.counters.frame_errors, 1);
                    warn!("{}: {}", client, e);
                    break e.to_string();
                }
            },
        };
        if response.is_exception() {
            ServerCounters::add(&worker.counters.exceptions, 1);
        }
        session.set_response(response);

        transition(&client, &mut state, ConnectionState::Responding);
        let bytes = session.response.to_bytes();
        match timeout(worker.send_timeout, stream.write_all(&bytes)).await {
            Ok(Ok(())) => {
                ServerCounters::add(&worker.counters.bytes_sent, bytes.len() as u64);
            }
            Ok(Err(e)) => break e.to_string(),
            Err(_) => {
                warn!(
                    "{}: send timed out after {:?}, response dropped",
                    client, worker.send_timeout
                );
            }
        }
    };

    transition(&client, &mut state, ConnectionState::Closed);
    let _ = stream.shutdown().await;
    worker
        .counters
        .active_connections
        .fetch_sub(1, Ordering::Relaxed);
    info!("Client {} disconnected: {}", client, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataStoreConfig;
    use crate::pdu::PduBuilder;
    use tokio_test::io::Builder;

    fn worker_with(handler: Arc<dyn RequestHandler>) -> Worker {
        Worker {
            handler,
            running: Arc::new(AtomicBool::new(true)),
            counters: Arc::new(ServerCounters::default()),
            recv_timeout: Duration::from_millis(50),
            send_timeout: Duration::from_millis(50),
        }
    }

    fn data_worker() -> (Worker, Arc<DataStore>) {
        let store = Arc::new(
            DataStore::with_config(&DataStoreConfig::default().with_size(32)).unwrap(),
        );
        (
            worker_with(Arc::new(DataHandler::new(store.clone()))),
            store,
        )
    }

    #[tokio::test]
    async fn test_read_request_round_trip() {
        let (worker, store) = data_worker();
        store.write_holding_registers(0, &[0x1234, 0x5678], None).unwrap();

        let stream = Builder::new()
            .read(&[0x00, 0x2A, 0x00, 0x00, 0x00, 0x06, 0x09])
            .read(&[0x03, 0x00, 0x00, 0x00, 0x02])
            .write(&[
                0x00, 0x2A, 0x00, 0x00, 0x00, 0x07, 0x09, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78,
            ])
            .build();
        handle_connection(stream, ClientInfo::default(), &worker).await;

        let stats = worker.counters.snapshot(None);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.bytes_sent, 13);
        assert_eq!(stats.active_connections, 0);
    }

    #[tokio::test]
    async fn test_bad_protocol_id_closes_without_reply() {
        let (worker, _) = data_worker();
        // no .write(): any reply would fail the mock
        let stream = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01])
            .build();
        handle_connection(stream, ClientInfo::default(), &worker).await;
        assert_eq!(worker.counters.snapshot(None).frame_errors, 1);
        assert_eq!(worker.counters.snapshot(None).requests, 0);
    }

    #[tokio::test]
    async fn test_oversized_pdu_closes_without_reply() {
        let (worker, _) = data_worker();
        // length 255: header is valid, the 254-byte PDU is not
        let stream = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0xFF, 0x01])
            .read(&[0x10; 254])
            .build();
        handle_connection(stream, ClientInfo::default(), &worker).await;
        let stats = worker.counters.snapshot(None);
        assert_eq!(stats.frame_errors, 1);
        assert_eq!(stats.requests, 0);
    }

    #[tokio::test]
    async fn test_accept_error_backs_off() {
        let started = Instant::now();
        let err = std::io::Error::other("too many open files");
        back_off_after_accept_error(&err).await;
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_exception_reply_keeps_connection() {
        let (worker, _) = data_worker();
        let stream = Builder::new()
            // fc 0x2B unsupported
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x2B, 0x0E])
            .write(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0xAB, 0x01])
            // address past the end of a 32-entry store
            .read(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x1F, 0x00, 0x02])
            .write(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02])
            .build();
        handle_connection(stream, ClientInfo::default(), &worker).await;
        assert_eq!(worker.counters.snapshot(None).exceptions, 2);
    }

    #[tokio::test]
    async fn test_handler_error_mapping() {
        let failing = Arc::new(|_: &SessionData| -> ModbusResult<ModbusPdu> {
            Err(ModbusError::internal("backend offline"))
        });
        let worker = worker_with(failing);
        let stream = Builder::new()
            .read(&[0x00, 0x05, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x01, 0x00, 0x01])
            .write(&[0x00, 0x05, 0x00, 0x00, 0x00, 0x03, 0x01, 0x86, 0x04])
            .build();
        handle_connection(stream, ClientInfo::default(), &worker).await;
    }

    #[tokio::test]
    async fn test_truncated_pdu_closes() {
        let (worker, _) = data_worker();
        let stream = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x03, 0x00])
            .build();
        handle_connection(stream, ClientInfo::default(), &worker).await;
        assert_eq!(worker.counters.snapshot(None).frame_errors, 1);
    }

    #[tokio::test]
    async fn test_write_reaches_store() {
        let (worker, store) = data_worker();
        let request = PduBuilder::build_write_single_coil(10, true).unwrap();
        let mut frame = vec![0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01];
        frame.extend_from_slice(request.as_slice());
        let mut reply = frame.clone();
        reply[5] = 0x06;

        let stream = Builder::new().read(&frame).write(&reply).build();
        handle_connection(stream, ClientInfo::default(), &worker).await;
        assert_eq!(store.read_coils(10, 1).unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_stopped_worker_exits_on_timeout() {
        let (worker, _) = data_worker();
        worker.running.store(false, Ordering::SeqCst);
        let stream = Builder::new().build();
        handle_connection(stream, ClientInfo::default(), &worker).await;
        assert_eq!(worker.counters.snapshot(None).requests, 0);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let config = ServerConfig::default()
            .with_host("127.0.0.1")
            .with_port(0)
            .with_data_store(DataStoreConfig::default().with_size(8));
        let mut server = ModbusTcpServer::new(config).unwrap();
        let addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert_ne!(addr.port(), 0);
        assert!(server.start().await.is_err());
        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert_eq!(server.store().unwrap().size(crate::store::DataSpace::Coils), 8);
    }
}
