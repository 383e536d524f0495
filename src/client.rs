//! High-level Modbus client
//!
//! The application layer (argument checks, request PDUs, reply parsing) is
//! written once in [`GenericModbusClient`] over any [`ModbusTransport`].
//! [`ModbusTcpClient`] binds it to [`TcpTransport`].
//!
//! # API Naming Convention
//!
//! | Function Code | Primary Name | Semantic Alias |
//! |---------------|--------------|----------------|
//! | 0x01 | `read_01()` | `read_coils()` |
//! | 0x02 | `read_02()` | `read_discrete_inputs()` |
//! | 0x03 | `read_03()` | `read_holding_registers()` |
//! | 0x04 | `read_04()` | `read_input_registers()` |
//! | 0x05 | `write_05()` | `write_single_coil()` |
//! | 0x06 | `write_06()` | `write_single_register()` |
//! | 0x0F | `write_0f()` | `write_multiple_coils()` |
//! | 0x10 | `write_10()` | `write_multiple_registers()` |
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use voltage_modbus_tcp::{ClientConfig, ModbusClient, ModbusResult, ModbusTcpClient};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut client = ModbusTcpClient::new(ClientConfig::new("127.0.0.1", 502))?;
//!
//!     let registers = client.read_03(0, 10).await?;
//!     println!("Registers: {:?}", registers);
//!
//!     client.write_06(100, 0x1234).await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use crate::bits::{byte_length, unpack_bits};
use crate::config::ClientConfig;
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::protocol::UnitId;
use crate::transport::{ModbusTransport, TcpTransport, TransportStats};

/// Client side of the eight classic function codes.
///
/// Every call validates its arguments before any I/O:
///
/// | Operation | Limit |
/// |-----------|-------|
/// | Read Coils / Discrete Inputs | 1-2000 bits |
/// | Read Holding / Input Registers | 1-125 registers |
/// | Write Multiple Coils | 1-1968 coils |
/// | Write Multiple Registers | 1-123 registers |
///
/// and `address + count` must not run past 65536.
pub trait ModbusClient: Send + Sync {
    /// Read coils (function code 0x01).
    fn read_01(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read discrete inputs (function code 0x02).
    fn read_02(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read holding registers (function code 0x03).
    fn read_03(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Read input registers (function code 0x04).
    fn read_04(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Write single coil (function code 0x05).
    ///
    /// `true` is sent as 0xFF00, `false` as 0x0000. The server must echo both.
    fn write_05(&mut self, address: u16, value: bool) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write single register (function code 0x06).
    fn write_06(&mut self, address: u16, value: u16) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write multiple coils (function code 0x0F).
    fn write_0f(
        &mut self,
        address: u16,
        values: &[bool],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write multiple registers (function code 0x10).
    fn write_10(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    fn is_connected(&self) -> bool;

    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn get_stats(&self) -> TransportStats;

    // ===== Semantic name aliases =====

    /// Alias for `read_01`
    #[inline]
    fn read_coils(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        self.read_01(address, quantity)
    }

    /// Alias for `read_02`
    #[inline]
    fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        self.read_02(address, quantity)
    }

    /// Alias for `read_03`
    #[inline]
    fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_03(address, quantity)
    }

    /// Alias for `read_04`
    #[inline]
    fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_04(address, quantity)
    }

    /// Alias for `write_05`
    #[inline]
    fn write_single_coil(
        &mut self,
        address: u16,
        value: bool,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_05(address, value)
    }

    /// Alias for `write_06`
    #[inline]
    fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_06(address, value)
    }

    /// Alias for `write_0f`
    #[inline]
    fn write_multiple_coils(
        &mut self,
        address: u16,
        values: &[bool],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_0f(address, values)
    }

    /// Alias for `write_10`
    #[inline]
    fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_10(address, values)
    }
}

/// `count` within `1..=max` and the range ending inside the address space
fn check_range(address: u16, count: usize, max: usize, what: &str) -> ModbusResult<()> {
    if count == 0 || count > max {
        return Err(ModbusError::invalid_data(format!(
            "{what} count {count} out of range (valid from 1 to {max})"
        )));
    }
    if usize::from(address) + count > MAX_DATA_SPACE_SIZE {
        return Err(ModbusError::invalid_data(format!(
            "{what} {address}+{count} reads after end of modbus address space"
        )));
    }
    Ok(())
}

fn check_function(reply: &ModbusPdu, fc: u8) -> ModbusResult<()> {
    match reply.function_code() {
        Some(code) if code == fc => Ok(()),
        other => Err(ModbusError::receive(format!(
            "reply function code {other:02X?} does not match request 0x{fc:02X}"
        ))),
    }
}

/// Application layer over any transport
pub struct GenericModbusClient<T: ModbusTransport> {
    transport: T,
}

impl<T: ModbusTransport> GenericModbusClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Send an arbitrary request PDU and return the reply PDU as is
    pub async fn custom_request(&mut self, pdu: &[u8]) -> ModbusResult<ModbusPdu> {
        let request = ModbusPdu::from_slice(pdu)?;
        if request.is_empty() {
            return Err(ModbusError::invalid_data("empty request PDU"));
        }
        self.transport.request(&request).await
    }

    async fn read_bits(&mut self, fc: u8, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let count = usize::from(quantity);
        check_range(address, count, MAX_READ_COILS, "bit")?;

        let request = PduBuilder::build_read_request(fc, address, quantity)?;
        let reply = self.transport.request(&request).await?;
        check_function(&reply, fc)?;

        let mut reader = reply.reader();
        let byte_count = usize::from(reader.read_u8().map_err(|_| short_reply())?);
        let data = reader.rest();
        if byte_count < byte_length(count) || byte_count != data.len() {
            return Err(ModbusError::receive("rx byte count mismatch"));
        }
        Ok(unpack_bits(data, count))
    }

    async fn read_words(&mut self, fc: u8, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let count = usize::from(quantity);
        check_range(address, count, MAX_READ_REGISTERS, "register")?;

        let request = PduBuilder::build_read_request(fc, address, quantity)?;
        let reply = self.transport.request(&request).await?;
        check_function(&reply, fc)?;

        let mut reader = reply.reader();
        let byte_count = usize::from(reader.read_u8().map_err(|_| short_reply())?);
        if byte_count < 2 * count || byte_count != reader.remaining() {
            return Err(ModbusError::receive("rx byte count mismatch"));
        }
        reader.read_registers(count)
    }

    /// Send a write request and check that the reply echoes `(address, value)`
    async fn write_echo(&mut self, request: ModbusPdu, address: u16, value: u16) -> ModbusResult<()> {
        let fc = request.function_code().unwrap_or_default();
        let reply = self.transport.request(&request).await?;
        check_function(&reply, fc)?;

        let mut reader = reply.reader();
        let (rx_address, rx_value) = match (reader.read_u16(), reader.read_u16()) {
            (Ok(a), Ok(v)) => (a, v),
            _ => return Err(short_reply()),
        };
        if rx_address != address || rx_value != value {
            return Err(ModbusError::receive("server reply does not match the request"));
        }
        Ok(())
    }
}

fn short_reply() -> ModbusError {
    ModbusError::receive("PDU length is too short for current request")
}

impl<T: ModbusTransport> ModbusClient for GenericModbusClient<T> {
    async fn read_01(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(FC_READ_COILS, address, quantity).await
    }

    async fn read_02(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(FC_READ_DISCRETE_INPUTS, address, quantity).await
    }

    async fn read_03(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_words(FC_READ_HOLDING_REGISTERS, address, quantity)
            .await
    }

    async fn read_04(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_words(FC_READ_INPUT_REGISTERS, address, quantity)
            .await
    }

    async fn write_05(&mut self, address: u16, value: bool) -> ModbusResult<()> {
        let raw = if value { COIL_ON } else { COIL_OFF };
        let request = PduBuilder::build_write_single_coil(address, value)?;
        self.write_echo(request, address, raw).await
    }

    async fn write_06(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        let request = PduBuilder::build_write_single_register(address, value)?;
        self.write_echo(request, address, value).await
    }

    async fn write_0f(&mut self, address: u16, values: &[bool]) -> ModbusResult<()> {
        check_range(address, values.len(), MAX_WRITE_COILS, "coil")?;
        let request = PduBuilder::build_write_multiple_coils(address, values)?;
        self.write_echo(request, address, values.len() as u16).await
    }

    async fn write_10(&mut self, address: u16, values: &[u16]) -> ModbusResult<()> {
        check_range(address, values.len(), MAX_WRITE_REGISTERS, "register")?;
        let request = PduBuilder::build_write_multiple_registers(address, values)?;
        self.write_echo(request, address, values.len() as u16).await
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.transport.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}

/// Modbus/TCP client
pub struct ModbusTcpClient {
    inner: GenericModbusClient<TcpTransport>,
}

impl ModbusTcpClient {
    /// Client for `config`. No socket is opened until the first request
    /// (with `auto_open`) or an explicit [`open`](Self::open).
    pub fn new(config: ClientConfig) -> ModbusResult<Self> {
        Ok(Self::from_transport(TcpTransport::new(config)?))
    }

    /// Client for `config` with the socket opened right away
    pub async fn connect(config: ClientConfig) -> ModbusResult<Self> {
        Ok(Self::from_transport(TcpTransport::connect(config).await?))
    }

    /// Client with a custom frame logger
    pub fn with_logger(config: ClientConfig, logger: CallbackLogger) -> ModbusResult<Self> {
        Ok(Self::from_transport(
            TcpTransport::new(config)?.with_logger(logger),
        ))
    }

    /// Connect to a `host:port` string
    pub async fn from_address(addr: &str, timeout: Duration) -> ModbusResult<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ModbusError::configuration(format!("Invalid address: {addr}")))?;
        let port: u16 = port
            .parse()
            .map_err(|e| ModbusError::configuration(format!("Invalid address: {e}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Self::connect(ClientConfig::new(host, port).with_timeout(timeout)).await
    }

    pub fn from_transport(transport: TcpTransport) -> Self {
        Self {
            inner: GenericModbusClient::new(transport),
        }
    }

    pub fn transport(&self) -> &TcpTransport {
        self.inner.transport()
    }

    pub fn host(&self) -> &str {
        self.inner.transport().host()
    }

    pub fn port(&self) -> u16 {
        self.inner.transport().port()
    }

    pub fn unit_id(&self) -> UnitId {
        self.inner.transport().unit_id()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.transport().timeout()
    }

    pub fn last_transaction_id(&self) -> u16 {
        self.inner.transport().last_transaction_id()
    }

    /// Closes the socket if the host changes
    pub fn set_host(&mut self, host: impl Into<String>) -> ModbusResult<()> {
        self.inner.transport_mut().set_host(host)
    }

    /// Closes the socket if the port changes
    pub fn set_port(&mut self, port: u16) -> ModbusResult<()> {
        self.inner.transport_mut().set_port(port)
    }

    /// Closes the socket if the timeout changes
    pub fn set_timeout(&mut self, timeout: Duration) -> ModbusResult<()> {
        self.inner.transport_mut().set_timeout(timeout)
    }

    pub fn set_unit_id(&mut self, unit_id: UnitId) {
        self.inner.transport_mut().set_unit_id(unit_id);
    }

    pub fn set_auto_open(&mut self, enabled: bool) {
        self.inner.transport_mut().set_auto_open(enabled);
    }

    pub fn set_auto_close(&mut self, enabled: bool) {
        self.inner.transport_mut().set_auto_close(enabled);
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.inner.transport_mut().set_packet_logging(enabled);
    }

    pub fn is_open(&self) -> bool {
        self.inner.transport().is_open()
    }

    /// Open (or reopen) the connection
    pub async fn open(&mut self) -> ModbusResult<()> {
        self.inner.transport_mut().open().await
    }

    pub async fn custom_request(&mut self, pdu: &[u8]) -> ModbusResult<ModbusPdu> {
        self.inner.custom_request(pdu).await
    }
}

impl ModbusClient for ModbusTcpClient {
    async fn read_01(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.inner.read_01(address, quantity).await
    }

    async fn read_02(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.inner.read_02(address, quantity).await
    }

    async fn read_03(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.inner.read_03(address, quantity).await
    }

    async fn read_04(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.inner.read_04(address, quantity).await
    }

    async fn write_05(&mut self, address: u16, value: bool) -> ModbusResult<()> {
        self.inner.write_05(address, value).await
    }

    async fn write_06(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        self.inner.write_06(address, value).await
    }

    async fn write_0f(&mut self, address: u16, values: &[bool]) -> ModbusResult<()> {
        self.inner.write_0f(address, values).await
    }

    async fn write_10(&mut self, address: u16, values: &[u16]) -> ModbusResult<()> {
        self.inner.write_10(address, values).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.inner.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.inner.get_stats()
    }
}
