//! Modbus/TCP device server
//!
//! Serves a full data store and logs coil and holding register changes made
//! by network peers. When `clock_register` is set, holding register 0 is
//! refreshed every 5 seconds with the UTC time of day in 10 s units.
//!
//! Usage: cargo run --bin modbus-server [config.yaml]

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use tracing::{error, info};
use voltage_modbus_tcp::{
    init_logging, AppConfig, DataStore, LoggingObserver, ModbusResult, ModbusTcpServer,
};

const CLOCK_PERIOD: Duration = Duration::from_secs(5);

fn clock_value() -> u16 {
    (Utc::now().num_seconds_from_midnight() / 10) as u16
}

#[tokio::main]
async fn main() -> ModbusResult<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::from_yaml_file(path)?,
        None => AppConfig {
            clock_register: true,
            ..Default::default()
        },
    };
    init_logging(&config.logging)?;
    info!("{}", voltage_modbus_tcp::info());

    let store = Arc::new(DataStore::with_config(&config.server.data_store)?);
    store.subscribe(Arc::new(LoggingObserver));

    let mut server = ModbusTcpServer::with_store(config.server.clone(), store.clone())?;
    server.start().await?;

    let clock = config.clock_register.then(|| {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLOCK_PERIOD);
            loop {
                ticker.tick().await;
                if let Err(e) = store.write_holding_registers(0, &[clock_value()], None) {
                    error!("clock register update failed: {}", e);
                }
            }
        })
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", e);
    }
    info!("shutting down");

    if let Some(task) = clock {
        task.abort();
    }
    server.stop().await
}
