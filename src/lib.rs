//! # Voltage Modbus TCP - Modbus/TCP server and client engine
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! An async Modbus/TCP engine in pure Rust: a server backed by an in-memory
//! data store with change notification, and a client with strict reply
//! checking.
//!
//! ## Features
//!
//! - **Server**: one task per connection, liveness timeout, graceful stop,
//!   optional connection cap
//! - **Data Store**: four independently locked address spaces, change
//!   observers called after the lock is released
//! - **Client**: argument checks before any I/O, random transaction IDs,
//!   MBAP reply validation, auto-open and auto-close
//! - **Codecs**: stack-allocated PDU, MBAP header, bit and word helpers
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_tcp::{
//!     ClientConfig, DataStore, ModbusClient, ModbusResult, ModbusTcpClient, ModbusTcpServer,
//!     ServerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let store = Arc::new(DataStore::new());
//!     let mut server = ModbusTcpServer::with_store(
//!         ServerConfig::default().with_host("127.0.0.1").with_port(0),
//!         store.clone(),
//!     )?;
//!     let addr = server.start().await?;
//!
//!     let mut client = ModbusTcpClient::new(ClientConfig::new("127.0.0.1", addr.port()))?;
//!     client.write_06(100, 0x1234).await?;
//!     assert_eq!(client.read_03(100, 1).await?, vec![0x1234]);
//!
//!     client.close().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Error types and result handling
pub mod error;

/// Modbus protocol constants
pub mod constants;

/// Function codes and exception codes
pub mod protocol;

/// Bit packing and single-bit helpers
pub mod bits;

/// Word order handling for multi-register values
pub mod bytes;

/// Stack-allocated PDU
pub mod pdu;

/// MBAP header and full TCP frame
pub mod mbap;

/// Server, client and logging configuration
pub mod config;

/// Per-request server context
pub mod session;

/// Four-space data store with change notification
pub mod store;

/// Request dispatch
pub mod handler;

/// Modbus/TCP server engine
pub mod server;

/// Client side transport
pub mod transport;

/// Modbus client implementations
pub mod client;

/// Logging system for the library
pub mod logging;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use tokio;

// === Client ===
pub use client::{GenericModbusClient, ModbusClient, ModbusTcpClient};
pub use transport::{ModbusTransport, TcpTransport, TransportStats};

// === Server ===
pub use handler::{DataHandler, RequestHandler};
pub use server::{ConnectionState, ModbusTcpServer, ServerStats};
pub use session::{ClientInfo, ServerInfo, SessionData};
pub use store::{ChangeObserver, DataSpace, DataStore};

// === Configuration ===
pub use config::{AppConfig, ClientConfig, DataStoreConfig, LogConfig, LogFormat, ServerConfig};

// === Error handling ===
pub use error::{ErrorKind, ModbusError, ModbusResult};

// === Core types ===
pub use bytes::WordOrder;
pub use mbap::{Frame, MbapHeader};
pub use pdu::{ModbusPdu, PduBuilder, PduReader};
pub use protocol::{ModbusAddress, ModbusException, ModbusFunction, UnitId};

// === Protocol limits ===
pub use constants::{
    MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

// === Logging ===
pub use logging::{
    init_logging, CallbackLogger, LogCallback, LogLevel, LoggingMode, LoggingObserver,
};

/// Default client timeout (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus TCP v{} - Modbus/TCP server and client engine", VERSION)
}
