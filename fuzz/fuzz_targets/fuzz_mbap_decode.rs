#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_modbus_tcp::{Frame, MbapHeader};

fuzz_target!(|data: &[u8]| {
    if data.len() >= 7 {
        if let Ok(header) = MbapHeader::decode(&data[..7]) {
            assert_eq!(header.protocol_id, 0);
            assert!((3..=256).contains(&header.length));
            assert_eq!(MbapHeader::decode(&header.encode()).ok(), Some(header));
        }
    }

    if let Ok(frame) = Frame::from_bytes(data) {
        assert_eq!(frame.to_bytes().as_ref(), data);
    }
});
