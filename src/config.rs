//! Configuration types
//!
//! All structs deserialize from YAML with per-field defaults, so a file only
//! needs the keys it overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_DATA_SPACE_SIZE;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::UnitId;
use crate::{DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS};

fn default_space_size() -> usize {
    MAX_DATA_SPACE_SIZE
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_recv_timeout_ms() -> u64 {
    1000
}

fn default_send_timeout_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_unit_id() -> UnitId {
    1
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Data store
// ============================================================================

/// Sizes and initial values of the four data spaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStoreConfig {
    #[serde(default = "default_space_size")]
    pub coils_size: usize,
    #[serde(default)]
    pub coils_default: bool,

    #[serde(default = "default_space_size")]
    pub discrete_inputs_size: usize,
    #[serde(default)]
    pub discrete_inputs_default: bool,

    #[serde(default = "default_space_size")]
    pub holding_registers_size: usize,
    #[serde(default)]
    pub holding_registers_default: u16,

    #[serde(default = "default_space_size")]
    pub input_registers_size: usize,
    #[serde(default)]
    pub input_registers_default: u16,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            coils_size: default_space_size(),
            coils_default: false,
            discrete_inputs_size: default_space_size(),
            discrete_inputs_default: false,
            holding_registers_size: default_space_size(),
            holding_registers_default: 0,
            input_registers_size: default_space_size(),
            input_registers_default: 0,
        }
    }
}

impl DataStoreConfig {
    /// Same size for every space
    pub fn with_size(mut self, size: usize) -> Self {
        self.coils_size = size;
        self.discrete_inputs_size = size;
        self.holding_registers_size = size;
        self.input_registers_size = size;
        self
    }

    pub fn with_coils_default(mut self, value: bool) -> Self {
        self.coils_default = value;
        self
    }

    pub fn with_discrete_inputs_default(mut self, value: bool) -> Self {
        self.discrete_inputs_default = value;
        self
    }

    pub fn with_holding_registers_default(mut self, value: u16) -> Self {
        self.holding_registers_default = value;
        self
    }

    pub fn with_input_registers_default(mut self, value: u16) -> Self {
        self.input_registers_default = value;
        self
    }

    pub fn validate(&self) -> ModbusResult<()> {
        for (name, size) in [
            ("coils_size", self.coils_size),
            ("discrete_inputs_size", self.discrete_inputs_size),
            ("holding_registers_size", self.holding_registers_size),
            ("input_registers_size", self.input_registers_size),
        ] {
            if size > MAX_DATA_SPACE_SIZE {
                return Err(ModbusError::configuration(format!(
                    "{name} {size} exceeds {MAX_DATA_SPACE_SIZE}"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Receive timeout; each expiry re-checks the running flag
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    /// A response that cannot be sent within this window is dropped
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Connections beyond this count are closed on accept; unbounded if unset
    #[serde(default)]
    pub max_connections: Option<usize>,

    #[serde(default)]
    pub data_store: DataStoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_port(),
            recv_timeout_ms: default_recv_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            max_connections: None,
            data_store: DataStoreConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn with_data_store(mut self, data_store: DataStoreConfig) -> Self {
        self.data_store = data_store;
        self
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.recv_timeout_ms == 0 || self.send_timeout_ms == 0 {
            return Err(ModbusError::configuration("server timeouts must be > 0"));
        }
        if self.max_connections == Some(0) {
            return Err(ModbusError::configuration("max_connections must be > 0"));
        }
        self.data_store.validate()
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_unit_id")]
    pub unit_id: UnitId,

    /// Per-exchange timeout, 0 < t < 3600 s
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Open the socket on demand before a request
    #[serde(default = "default_true")]
    pub auto_open: bool,

    /// Close the socket after every exchange
    #[serde(default)]
    pub auto_close: bool,

    /// Dump every frame through the client logger
    #[serde(default)]
    pub packet_logging: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            unit_id: default_unit_id(),
            timeout_ms: default_timeout_ms(),
            auto_open: true,
            auto_close: false,
            packet_logging: false,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_unit_id(mut self, unit_id: UnitId) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_auto_open(mut self, auto_open: bool) -> Self {
        self.auto_open = auto_open;
        self
    }

    pub fn with_auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        validate_host(&self.host)?;
        validate_port(self.port)?;
        validate_timeout(self.timeout())
    }
}

pub(crate) fn validate_host(host: &str) -> ModbusResult<()> {
    if host.trim().is_empty() {
        return Err(ModbusError::configuration("host must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_port(port: u16) -> ModbusResult<()> {
    if port == 0 {
        return Err(ModbusError::configuration("port must be in 1..=65535"));
    }
    Ok(())
}

pub(crate) fn validate_timeout(timeout: Duration) -> ModbusResult<()> {
    // stored as whole milliseconds
    if timeout.as_millis() == 0 || timeout >= Duration::from_secs(3600) {
        return Err(ModbusError::configuration(format!(
            "timeout {timeout:?} outside [1ms, 3600s)"
        )));
    }
    Ok(())
}

// ============================================================================
// Logging / application file
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_true")]
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            ansi: true,
        }
    }
}

/// Top-level file read by the `modbus-server` binary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LogConfig,
    /// Refresh holding register 0 with the time of day
    #[serde(default)]
    pub clock_register: bool,
}

impl AppConfig {
    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| ModbusError::configuration(format!("invalid YAML: {e}")))?;
        config.server.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }
}
