//! Logging helpers
//!
//! - [`init_logging`] installs a `tracing-subscriber` with an `EnvFilter`
//! - [`CallbackLogger`] dumps client frames either through `tracing` or a
//!   user callback
//! - [`LoggingObserver`] traces data store changes with the peer address

use std::fmt;
use std::sync::Arc;

use chrono::Local;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};
use crate::error::{ModbusError, ModbusResult};
use crate::session::ServerInfo;
use crate::store::ChangeObserver;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`.
pub fn init_logging(config: &LogConfig) -> ModbusResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ModbusError::configuration(format!("invalid log level: {e}")))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(true);

    let result = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    result.map_err(|e| ModbusError::configuration(format!("logger already set: {e}")))
}

/// Space separated upper-case hex
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

/// How much of each frame is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    /// Nothing
    Disabled,
    /// One line per exchange
    #[default]
    Normal,
    /// Full hex dump of every frame
    Packets,
}

pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Frame logger used by the client
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<LogCallback>,
    mode: LoggingMode,
    min_level: LogLevel,
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("callback", &self.callback.is_some())
            .field("mode", &self.mode)
            .field("min_level", &self.min_level)
            .finish()
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self {
            callback: None,
            mode: LoggingMode::Normal,
            min_level: LogLevel::Debug,
        }
    }
}

impl CallbackLogger {
    /// Route messages to `callback` instead of `tracing`
    pub fn new(callback: LogCallback) -> Self {
        Self {
            callback: Some(callback),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: LoggingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.mode == LoggingMode::Disabled || level < self.min_level {
            return;
        }
        match &self.callback {
            Some(callback) => {
                let stamped = format!("{} {}", Local::now().format("%H:%M:%S%.3f"), message);
                callback(level, &stamped);
            }
            None => match level {
                LogLevel::Trace => trace!("{}", message),
                LogLevel::Debug => debug!("{}", message),
                LogLevel::Info => info!("{}", message),
                LogLevel::Warn => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            },
        }
    }

    /// Outgoing frame
    pub fn log_request(&self, unit_id: u8, function_code: u8, frame: &[u8]) {
        self.log_frame("Tx", unit_id, function_code, frame);
    }

    /// Incoming frame
    pub fn log_response(&self, unit_id: u8, function_code: u8, frame: &[u8]) {
        self.log_frame("Rx", unit_id, function_code, frame);
    }

    fn log_frame(&self, direction: &str, unit_id: u8, function_code: u8, frame: &[u8]) {
        let message = match self.mode {
            LoggingMode::Disabled => return,
            LoggingMode::Normal => format!(
                "[MODBUS-TCP] {} unit:{} fc:0x{:02X} {} bytes",
                direction,
                unit_id,
                function_code,
                frame.len()
            ),
            LoggingMode::Packets => format!(
                "[MODBUS-TCP] {} unit:{} {}",
                direction,
                unit_id,
                format_hex_packet(frame)
            ),
        };
        self.log(LogLevel::Debug, &message);
    }
}

/// Traces every coil and holding register change.
///
/// Changes written by a network peer are logged at `info`, local writes
/// (no [`ServerInfo`]) at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl LoggingObserver {
    fn report(
        space: &str,
        address: u16,
        from: &dyn fmt::Display,
        to: &dyn fmt::Display,
        info: Option<&ServerInfo<'_>>,
    ) {
        match info {
            Some(info) => info!(
                "change in {} space [{}] = {} => {} (from {})",
                space, address, from, to, info.client
            ),
            None => debug!(
                "change in {} space [{}] = {} => {} (local)",
                space, address, from, to
            ),
        }
    }
}

impl ChangeObserver for LoggingObserver {
    fn on_coil_change(&self, address: u16, from: bool, to: bool, info: Option<&ServerInfo<'_>>) {
        Self::report("coil", address, &from, &to, info);
    }

    fn on_holding_register_change(
        &self,
        address: u16,
        from: u16,
        to: u16,
        info: Option<&ServerInfo<'_>>,
    ) {
        Self::report("hreg", address, &from, &to, info);
    }
}
