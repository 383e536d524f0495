#![no_main]

use std::sync::{Arc, OnceLock};

use libfuzzer_sys::fuzz_target;
use voltage_modbus_tcp::{DataHandler, DataStore, DataStoreConfig};

static HANDLER: OnceLock<DataHandler> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    let Some((&function_code, payload)) = data.split_first() else {
        return;
    };
    let handler = HANDLER.get_or_init(|| {
        let config = DataStoreConfig::default().with_size(1024);
        DataHandler::new(Arc::new(DataStore::with_config(&config).unwrap()))
    });

    // Either a reply (normal or exception) or a frame error; never a panic
    if let Ok(reply) = handler.dispatch(function_code, payload, None) {
        assert!(!reply.is_empty());
        assert_eq!(reply.function_code().map(|fc| fc & 0x7F), Some(function_code & 0x7F));
    }
});
