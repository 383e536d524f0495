//! Error types for the Modbus/TCP engine
//!
//! Every fallible operation returns [`ModbusResult`]. Errors fall into a small
//! number of kinds (see [`ErrorKind`]) that decide how the server and client
//! react: validation and exception errors leave the connection alone, frame and
//! network errors close it.

use thiserror::Error;

use crate::protocol::ModbusException;
use crate::store::DataSpace;

/// Result alias used throughout the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Classification of a [`ModbusError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Argument or address range rejected before touching the wire or the store
    Validation,
    /// Malformed MBAP header or PDU
    Frame,
    /// Exception reply declared by the remote server
    Exception,
    /// Socket level failure
    Network,
    /// Bad configuration value
    Configuration,
    /// Bug or poisoned state
    Internal,
}

/// Modbus engine error
#[derive(Error, Debug)]
pub enum ModbusError {
    /// Argument outside its legal range (counts, timeouts, ports)
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Function code not served
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Store access outside `[0, size)`
    #[error("Address out of range: {space} {address}+{count} exceeds size {size}")]
    Address {
        space: DataSpace,
        address: u16,
        count: usize,
        size: usize,
    },

    /// Malformed frame (encode or decode)
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Exception reply returned by the server
    #[error("Modbus exception on function 0x{function:02X}: {exception}")]
    Exception {
        function: u8,
        exception: ModbusException,
    },

    /// Could not establish a connection
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Failed to write a frame
    #[error("Send error: {message}")]
    Send { message: String },

    /// Failed to receive a frame, or the reply did not match the request
    #[error("Receive error: {message}")]
    Receive { message: String },

    /// Operation timed out
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Configuration rejected
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Underlying socket error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal failure
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function: function & 0x7F,
            exception: ModbusException::from_u8(code),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn send(message: impl Into<String>) -> Self {
        Self::Send {
            message: message.into(),
        }
    }

    pub fn receive(message: impl Into<String>) -> Self {
        Self::Receive {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidData { .. } | Self::InvalidFunction { .. } | Self::Address { .. } => {
                ErrorKind::Validation
            }
            Self::Frame { .. } => ErrorKind::Frame,
            Self::Exception { .. } => ErrorKind::Exception,
            Self::Connection { .. }
            | Self::Send { .. }
            | Self::Receive { .. }
            | Self::Timeout { .. }
            | Self::Io(_) => ErrorKind::Network,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// True for socket level failures after which the connection is closed
    pub fn is_network(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    /// Modbus exception code carried by an exception reply
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            Self::Exception { exception, .. } => Some(exception.code()),
            _ => None,
        }
    }

    /// Exception code a server answers with when a handler fails with this error.
    ///
    /// Returns `None` for frame errors, which close the connection instead.
    pub fn to_exception_code(&self) -> Option<u8> {
        match self {
            Self::Frame { .. } => None,
            Self::Address { .. } => Some(ModbusException::IllegalDataAddress.code()),
            Self::InvalidData { .. } => Some(ModbusException::IllegalDataValue.code()),
            Self::InvalidFunction { .. } => Some(ModbusException::IllegalFunction.code()),
            Self::Exception { exception, .. } => Some(exception.code()),
            _ => Some(ModbusException::ServerDeviceFailure.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ModbusError::invalid_data("x").kind(), ErrorKind::Validation);
        assert_eq!(ModbusError::frame("x").kind(), ErrorKind::Frame);
        assert_eq!(ModbusError::exception(0x83, 2).kind(), ErrorKind::Exception);
        assert!(ModbusError::receive("tid").is_network());
        assert!(ModbusError::timeout("read", 100).is_network());
        assert!(!ModbusError::configuration("port").is_network());
    }

    #[test]
    fn test_exception_strips_high_bit() {
        let err = ModbusError::exception(0x83, 0x02);
        match err {
            ModbusError::Exception {
                function,
                exception,
            } => {
                assert_eq!(function, 0x03);
                assert_eq!(exception, ModbusException::IllegalDataAddress);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ModbusError::exception(0x83, 0x02).exception_code(), Some(0x02));
    }

    #[test]
    fn test_handler_error_mapping() {
        let addr = ModbusError::Address {
            space: DataSpace::HoldingRegisters,
            address: 65535,
            count: 2,
            size: 65536,
        };
        assert_eq!(addr.to_exception_code(), Some(0x02));
        assert_eq!(ModbusError::invalid_data("q").to_exception_code(), Some(0x03));
        assert_eq!(ModbusError::invalid_function(0x2B).to_exception_code(), Some(0x01));
        assert_eq!(ModbusError::internal("lock").to_exception_code(), Some(0x04));
        assert_eq!(ModbusError::frame("short").to_exception_code(), None);
    }

    #[test]
    fn test_display() {
        let err = ModbusError::timeout("receive header", 1000);
        assert_eq!(err.to_string(), "Timeout after 1000ms: receive header");
    }
}
