//! Client side transport
//!
//! A transport takes a request PDU, wraps it for the wire, performs one
//! request/response exchange and hands back the reply PDU. [`TcpTransport`]
//! is the Modbus/TCP implementation: MBAP header with a random transaction
//! ID, strict checking of the reply header, optional auto-open and
//! auto-close of the socket.

use std::future::Future;
use std::time::Duration;

use bytes::Buf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{validate_host, validate_port, validate_timeout, ClientConfig};
use crate::constants::{EXCEPTION_FLAG, MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MODBUS_PROTOCOL_ID};
use crate::error::{ErrorKind, ModbusError, ModbusResult};
use crate::logging::{CallbackLogger, LoggingMode};
use crate::mbap::Frame;
use crate::pdu::ModbusPdu;
use crate::protocol::UnitId;

/// One request, one reply.
///
/// Implementations own the wire encapsulation and the connection; the
/// application layer above only deals in PDUs.
pub trait ModbusTransport: Send + Sync {
    /// Send `pdu` and wait for the reply PDU.
    ///
    /// An exception reply is returned as [`ModbusError::Exception`].
    fn request(
        &mut self,
        pdu: &ModbusPdu,
    ) -> impl Future<Output = ModbusResult<ModbusPdu>> + Send;

    fn is_connected(&self) -> bool;

    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn get_stats(&self) -> TransportStats;
}

/// Client counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Modbus/TCP transport
pub struct TcpTransport {
    stream: Option<TcpStream>,
    config: ClientConfig,
    transaction_id: u16,
    stats: TransportStats,
    logger: CallbackLogger,
}

impl TcpTransport {
    /// Validate `config` without connecting. With `auto_open` the socket is
    /// opened by the first request.
    pub fn new(config: ClientConfig) -> ModbusResult<Self> {
        config.validate()?;
        let mode = if config.packet_logging {
            LoggingMode::Packets
        } else {
            LoggingMode::Normal
        };
        Ok(Self {
            stream: None,
            config,
            transaction_id: 0,
            stats: TransportStats::default(),
            logger: CallbackLogger::default().with_mode(mode),
        })
    }

    /// Validate `config` and open the socket right away
    pub async fn connect(config: ClientConfig) -> ModbusResult<Self> {
        let mut transport = Self::new(config)?;
        transport.open().await?;
        Ok(transport)
    }

    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn unit_id(&self) -> UnitId {
        self.config.unit_id
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Transaction ID of the last request sent
    pub fn last_transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// Change the target host; an open socket is closed if the value changes
    pub fn set_host(&mut self, host: impl Into<String>) -> ModbusResult<()> {
        let host = host.into();
        validate_host(&host)?;
        if self.config.host != host {
            self.drop_stream();
            self.config.host = host;
        }
        Ok(())
    }

    /// Change the target port; an open socket is closed if the value changes
    pub fn set_port(&mut self, port: u16) -> ModbusResult<()> {
        validate_port(port)?;
        if self.config.port != port {
            self.drop_stream();
            self.config.port = port;
        }
        Ok(())
    }

    /// Change the exchange timeout; an open socket is closed if the value changes
    pub fn set_timeout(&mut self, value: Duration) -> ModbusResult<()> {
        validate_timeout(value)?;
        let timeout_ms = value.as_millis() as u64;
        if self.config.timeout_ms != timeout_ms {
            self.drop_stream();
            self.config.timeout_ms = timeout_ms;
        }
        Ok(())
    }

    pub fn set_unit_id(&mut self, unit_id: UnitId) {
        self.config.unit_id = unit_id;
    }

    pub fn set_auto_open(&mut self, enabled: bool) {
        self.config.auto_open = enabled;
    }

    pub fn set_auto_close(&mut self, enabled: bool) {
        self.config.auto_close = enabled;
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.config.packet_logging = enabled;
        let mode = if enabled {
            LoggingMode::Packets
        } else {
            LoggingMode::Normal
        };
        self.logger = self.logger.clone().with_mode(mode);
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect to the configured host. An already open socket is reset first.
    pub async fn open(&mut self) -> ModbusResult<()> {
        self.drop_stream();
        let target = format!("{}:{}", self.config.host, self.config.port);
        let limit = self.config.timeout();

        let stream = match timeout(limit, TcpStream::connect(target.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ModbusError::connection(format!(
                    "failed to connect to {target}: {e}"
                )));
            }
            Err(_) => {
                return Err(ModbusError::timeout(
                    format!("connect to {target}"),
                    self.config.timeout_ms,
                ));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed on {}: {}", target, e);
        }
        debug!("connected to {}", target);
        self.stream = Some(stream);
        Ok(())
    }

    fn drop_stream(&mut self) {
        if self.stream.take().is_some() {
            debug!("socket to {}:{} closed", self.config.host, self.config.port);
        }
    }

    async fn exchange(&mut self, pdu: &ModbusPdu) -> ModbusResult<ModbusPdu> {
        if self.config.auto_open && self.stream.is_none() {
            self.open().await?;
        }

        self.transaction_id = rand::random::<u16>();
        let unit_id = self.config.unit_id;
        let request = Frame::new(self.transaction_id, unit_id, pdu.clone()).to_bytes();
        let function_code = pdu.function_code().unwrap_or_default();
        let limit = self.config.timeout();
        let timeout_ms = self.config.timeout_ms;

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("try to send on a closed socket"))?;

        match timeout(limit, stream.write_all(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ModbusError::send(e.to_string())),
            Err(_) => return Err(ModbusError::timeout("send request", timeout_ms)),
        }
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += request.len() as u64;
        self.logger.log_request(unit_id, function_code, &request);

        let mut header = [0u8; MBAP_HEADER_LEN];
        read_exact_within(stream, &mut header, limit, "read response header", timeout_ms).await?;

        let mut fields = &header[..];
        let transaction_id = fields.get_u16();
        let protocol_id = fields.get_u16();
        let length = fields.get_u16();
        let rx_unit_id = fields.get_u8();
        if transaction_id != self.transaction_id
            || protocol_id != MODBUS_PROTOCOL_ID
            || length >= MAX_MBAP_LENGTH
            || rx_unit_id != unit_id
        {
            warn!(
                "MBAP check failed: tid {} (sent {}), protocol {}, length {}, unit {} (sent {})",
                transaction_id, self.transaction_id, protocol_id, length, rx_unit_id, unit_id
            );
            return Err(ModbusError::receive("MBAP checking error"));
        }

        let mut body = vec![0u8; usize::from(length).saturating_sub(1)];
        read_exact_within(stream, &mut body, limit, "read response data", timeout_ms).await?;

        if self.config.auto_close {
            self.drop_stream();
        }

        self.stats.responses_received += 1;
        self.stats.bytes_received += (header.len() + body.len()) as u64;
        let mut raw = Vec::with_capacity(header.len() + body.len());
        raw.extend_from_slice(&header);
        raw.extend_from_slice(&body);
        self.logger.log_response(unit_id, function_code, &raw);

        if body.len() < 2 {
            return Err(ModbusError::receive("PDU length is too short"));
        }
        if body[0] & EXCEPTION_FLAG != 0 {
            return Err(ModbusError::exception(body[0], body[1]));
        }
        ModbusPdu::from_slice(&body)
    }
}

async fn read_exact_within(
    stream: &mut TcpStream,
    buf: &mut [u8],
    limit: Duration,
    operation: &str,
    timeout_ms: u64,
) -> ModbusResult<()> {
    match timeout(limit, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(ModbusError::receive(format!("{operation}: {e}"))),
        Err(_) => Err(ModbusError::timeout(operation, timeout_ms)),
    }
}

impl ModbusTransport for TcpTransport {
    async fn request(&mut self, pdu: &ModbusPdu) -> ModbusResult<ModbusPdu> {
        let result = self.exchange(pdu).await;
        if let Err(e) = &result {
            match e.kind() {
                ErrorKind::Network | ErrorKind::Frame => {
                    self.stats.errors += 1;
                    if matches!(e, ModbusError::Timeout { .. }) {
                        self.stats.timeouts += 1;
                    }
                    self.drop_stream();
                }
                ErrorKind::Exception => self.stats.errors += 1,
                _ => {}
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.is_open()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PduBuilder;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn config(port: u16) -> ClientConfig {
        ClientConfig::new("127.0.0.1", port).with_timeout(Duration::from_secs(2))
    }

    /// Serve one exchange, answering with `reply(request) -> bytes`
    fn serve_once<F>(listener: TcpListener, reply: F) -> tokio::task::JoinHandle<Vec<u8>>
    where
        F: FnOnce(&[u8]) -> Vec<u8> + Send + 'static,
    {
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut header = [0u8; MBAP_HEADER_LEN];
            sock.read_exact(&mut header).await.unwrap();
            let len = u16::from_be_bytes([header[4], header[5]]) as usize - 1;
            let mut body = vec![0u8; len];
            sock.read_exact(&mut body).await.unwrap();
            let mut request = header.to_vec();
            request.extend_from_slice(&body);
            sock.write_all(&reply(&request)).await.unwrap();
            request
        })
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (listener, port) = listener().await;
        let server = serve_once(listener, |req| {
            let mut out = req[..4].to_vec();
            out.extend_from_slice(&[0x00, 0x05, req[6], 0x03, 0x02, 0x12, 0x34]);
            out
        });

        let mut transport = TcpTransport::new(config(port)).unwrap();
        assert!(!transport.is_open());
        let pdu = PduBuilder::build_read_request(0x03, 0, 1).unwrap();
        let reply = transport.request(&pdu).await.unwrap();
        assert_eq!(reply.as_slice(), &[0x03, 0x02, 0x12, 0x34]);

        let request = server.await.unwrap();
        assert_eq!(
            u16::from_be_bytes([request[0], request[1]]),
            transport.last_transaction_id()
        );
        assert_eq!(request[6], 1);
        let stats = transport.get_stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.bytes_sent, 12);
        assert_eq!(stats.bytes_received, 11);
    }

    #[tokio::test]
    async fn test_transaction_id_mismatch_closes() {
        let (listener, port) = listener().await;
        serve_once(listener, |req| {
            let tid = u16::from_be_bytes([req[0], req[1]]).wrapping_add(1);
            let mut out = tid.to_be_bytes().to_vec();
            out.extend_from_slice(&[0x00, 0x00, 0x00, 0x05, req[6], 0x03, 0x02, 0x00, 0x00]);
            out
        });

        let mut transport = TcpTransport::new(config(port)).unwrap();
        let pdu = PduBuilder::build_read_request(0x03, 0, 1).unwrap();
        let err = transport.request(&pdu).await.unwrap_err();
        assert!(matches!(err, ModbusError::Receive { .. }));
        assert!(!transport.is_open());
        assert_eq!(transport.get_stats().errors, 1);
    }

    #[tokio::test]
    async fn test_exception_reply() {
        let (listener, port) = listener().await;
        serve_once(listener, |req| {
            let mut out = req[..4].to_vec();
            out.extend_from_slice(&[0x00, 0x03, req[6], 0x83, 0x02]);
            out
        });

        let mut transport = TcpTransport::new(config(port)).unwrap();
        let pdu = PduBuilder::build_read_request(0x03, 0xFFF0, 100).unwrap();
        let err = transport.request(&pdu).await.unwrap_err();
        assert_eq!(err.exception_code(), Some(0x02));
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_auto_close() {
        let (listener, port) = listener().await;
        serve_once(listener, |req| {
            let mut out = req[..4].to_vec();
            out.extend_from_slice(&[0x00, 0x06, req[6], 0x06, 0x00, 0x01, 0x00, 0x07]);
            out
        });

        let mut transport = TcpTransport::new(config(port).with_auto_close(true)).unwrap();
        let pdu = PduBuilder::build_write_single_register(1, 7).unwrap();
        transport.request(&pdu).await.unwrap();
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_no_auto_open_on_closed_socket() {
        let mut transport = TcpTransport::new(config(1502).with_auto_open(false)).unwrap();
        let pdu = PduBuilder::build_read_request(0x01, 0, 1).unwrap();
        let err = transport.request(&pdu).await.unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_setters_close_on_change() {
        let (listener, port) = listener().await;
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let mut transport = TcpTransport::connect(config(port)).await.unwrap();
        accept.await.unwrap().unwrap();
        assert!(transport.is_open());

        transport.set_port(port).unwrap();
        assert!(transport.is_open());
        transport.set_timeout(Duration::from_secs(2)).unwrap();
        assert!(transport.is_open());

        transport.set_timeout(Duration::from_secs(3)).unwrap();
        assert!(!transport.is_open());

        assert!(transport.set_port(0).is_err());
        assert!(transport.set_timeout(Duration::ZERO).is_err());
        assert!(transport.set_timeout(Duration::from_micros(999)).is_err());
        assert_eq!(transport.timeout(), Duration::from_secs(3));
        assert!(transport.set_host("").is_err());
        assert_eq!(transport.port(), port);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        assert!(TcpTransport::new(ClientConfig::new("127.0.0.1", 0)).is_err());
        assert!(
            TcpTransport::new(config(502).with_timeout(Duration::from_secs(3600))).is_err()
        );
    }
}
