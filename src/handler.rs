//! Request dispatch
//!
//! [`RequestHandler`] is the seam between the server engine and whatever
//! answers requests. [`DataHandler`] is the default: it serves the eight
//! classic function codes from a [`DataStore`].
//!
//! | FC | Count | Violation |
//! |----|-------|-----------|
//! | 0x01/0x02 | 1-2000 bits | 0x03, then 0x02 from the store |
//! | 0x03/0x04 | 1-125 registers | 0x03, then 0x02 |
//! | 0x05/0x06 | 1 | 0x02 |
//! | 0x0F | 1-1968 bits | 0x03 (count, byte count, payload), then 0x02 |
//! | 0x10 | 1-123 registers | 0x03 (count, byte count, payload), then 0x02 |

use std::sync::Arc;

use tracing::debug;

use crate::bits::{byte_length, unpack_bits};
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{ModbusPdu, PduBuilder, PduReader};
use crate::protocol::ModbusFunction;
use crate::session::{ServerInfo, SessionData};
use crate::store::DataStore;

/// Produces the response PDU for a request.
///
/// Errors are turned into exception replies by the server, except frame
/// errors which close the connection. See [`ModbusError::to_exception_code`].
pub trait RequestHandler: Send + Sync {
    fn handle(&self, session: &SessionData) -> ModbusResult<ModbusPdu>;
}

impl<F> RequestHandler for F
where
    F: Fn(&SessionData) -> ModbusResult<ModbusPdu> + Send + Sync,
{
    fn handle(&self, session: &SessionData) -> ModbusResult<ModbusPdu> {
        self(session)
    }
}

/// Default handler backed by a shared [`DataStore`]
#[derive(Debug, Clone)]
pub struct DataHandler {
    store: Arc<DataStore>,
}

impl DataHandler {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// Serve one request.
    ///
    /// Returns either a normal response or an exception PDU. Only a payload too
    /// short for the fixed fields yields `Err` (a frame error).
    pub fn dispatch(
        &self,
        function_code: u8,
        payload: &[u8],
        info: Option<&ServerInfo<'_>>,
    ) -> ModbusResult<ModbusPdu> {
        let function = match ModbusFunction::from_u8(function_code) {
            Ok(function) => function,
            Err(_) => {
                debug!("unsupported function code 0x{:02X}", function_code);
                return Ok(ModbusPdu::exception(
                    function_code,
                    EXCEPTION_ILLEGAL_FUNCTION,
                ));
            }
        };

        let mut reader = PduReader::new(payload);
        let result = match function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                self.read_bits(function, &mut reader)
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                self.read_words(function, &mut reader)
            }
            ModbusFunction::WriteSingleCoil => self.write_single_coil(&mut reader, info),
            ModbusFunction::WriteSingleRegister => self.write_single_register(&mut reader, info),
            ModbusFunction::WriteMultipleCoils => self.write_multiple_coils(&mut reader, info),
            ModbusFunction::WriteMultipleRegisters => {
                self.write_multiple_registers(&mut reader, info)
            }
        };

        match result {
            Ok(pdu) => Ok(pdu),
            Err(err) => match err.to_exception_code() {
                Some(code) => {
                    debug!("{} rejected: {}", function, err);
                    Ok(ModbusPdu::exception(function_code, code))
                }
                None => Err(err),
            },
        }
    }

    fn read_bits(&self, function: ModbusFunction, reader: &mut PduReader<'_>) -> ModbusResult<ModbusPdu> {
        let address = reader.read_u16()?;
        let quantity = usize::from(reader.read_u16()?);
        if !(1..=MAX_READ_COILS).contains(&quantity) {
            return Err(ModbusError::invalid_data(format!("bit quantity {quantity}")));
        }
        let bits = if function == ModbusFunction::ReadCoils {
            self.store.read_coils(address, quantity)?
        } else {
            self.store.read_discrete_inputs(address, quantity)?
        };
        PduBuilder::build_read_bits_response(function.to_u8(), &bits)
    }

    fn read_words(&self, function: ModbusFunction, reader: &mut PduReader<'_>) -> ModbusResult<ModbusPdu> {
        let address = reader.read_u16()?;
        let quantity = usize::from(reader.read_u16()?);
        if !(1..=MAX_READ_REGISTERS).contains(&quantity) {
            return Err(ModbusError::invalid_data(format!(
                "register quantity {quantity}"
            )));
        }
        let words = if function == ModbusFunction::ReadHoldingRegisters {
            self.store.read_holding_registers(address, quantity)?
        } else {
            self.store.read_input_registers(address, quantity)?
        };
        PduBuilder::build_read_registers_response(function.to_u8(), &words)
    }

    fn write_single_coil(
        &self,
        reader: &mut PduReader<'_>,
        info: Option<&ServerInfo<'_>>,
    ) -> ModbusResult<ModbusPdu> {
        let address = reader.read_u16()?;
        let raw = reader.read_u16()?;
        self.store.write_coils(address, &[raw == COIL_ON], info)?;
        PduBuilder::build_write_response(FC_WRITE_SINGLE_COIL, address, raw)
    }

    fn write_single_register(
        &self,
        reader: &mut PduReader<'_>,
        info: Option<&ServerInfo<'_>>,
    ) -> ModbusResult<ModbusPdu> {
        let address = reader.read_u16()?;
        let value = reader.read_u16()?;
        self.store.write_holding_registers(address, &[value], info)?;
        PduBuilder::build_write_response(FC_WRITE_SINGLE_REGISTER, address, value)
    }

    fn write_multiple_coils(
        &self,
        reader: &mut PduReader<'_>,
        info: Option<&ServerInfo<'_>>,
    ) -> ModbusResult<ModbusPdu> {
        let address = reader.read_u16()?;
        let quantity = reader.read_u16()?;
        let byte_count = usize::from(reader.read_u8()?);
        let data = reader.rest();

        let count = usize::from(quantity);
        if !(1..=MAX_WRITE_COILS).contains(&count)
            || byte_count < byte_length(count)
            || data.len() < byte_count
        {
            return Err(ModbusError::invalid_data(format!(
                "coil quantity {count}, byte count {byte_count}, {} data bytes",
                data.len()
            )));
        }

        let bits = unpack_bits(data, count);
        self.store.write_coils(address, &bits, info)?;
        PduBuilder::build_write_response(FC_WRITE_MULTIPLE_COILS, address, quantity)
    }

    fn write_multiple_registers(
        &self,
        reader: &mut PduReader<'_>,
        info: Option<&ServerInfo<'_>>,
    ) -> ModbusResult<ModbusPdu> {
        let address = reader.read_u16()?;
        let quantity = reader.read_u16()?;
        let byte_count = usize::from(reader.read_u8()?);

        let count = usize::from(quantity);
        if !(1..=MAX_WRITE_REGISTERS).contains(&count)
            || byte_count != count * 2
            || reader.remaining() < byte_count
        {
            return Err(ModbusError::invalid_data(format!(
                "register quantity {count}, byte count {byte_count}, {} data bytes",
                reader.remaining()
            )));
        }

        let values = reader.read_registers(count)?;
        self.store.write_holding_registers(address, &values, info)?;
        PduBuilder::build_write_response(FC_WRITE_MULTIPLE_REGISTERS, address, quantity)
    }
}

impl RequestHandler for DataHandler {
    fn handle(&self, session: &SessionData) -> ModbusResult<ModbusPdu> {
        let pdu = &session.request.pdu;
        let function_code = pdu
            .function_code()
            .ok_or_else(|| ModbusError::frame("empty request PDU"))?;
        self.dispatch(function_code, pdu.payload(), Some(&session.server_info()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataStoreConfig;
    use crate::mbap::Frame;

    fn handler(size: usize) -> DataHandler {
        let store = DataStore::with_config(&DataStoreConfig::default().with_size(size)).unwrap();
        DataHandler::new(Arc::new(store))
    }

    fn call(handler: &DataHandler, pdu: &[u8]) -> ModbusResult<Vec<u8>> {
        handler
            .dispatch(pdu[0], &pdu[1..], None)
            .map(|p| p.as_slice().to_vec())
    }

    #[test]
    fn test_read_holding_registers_zeroed() {
        let h = handler(0x10000);
        assert_eq!(
            call(&h, &[0x03, 0x00, 0x00, 0x00, 0x04]).unwrap(),
            vec![0x03, 0x08, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_unknown_function() {
        let h = handler(16);
        assert_eq!(call(&h, &[0x2B, 0x0E, 0x01]).unwrap(), vec![0xAB, 0x01]);
    }

    #[test]
    fn test_quantity_out_of_range_is_illegal_value() {
        let h = handler(0x10000);
        assert_eq!(call(&h, &[0x03, 0, 0, 0, 0]).unwrap(), vec![0x83, 0x03]);
        assert_eq!(call(&h, &[0x04, 0, 0, 0, 126]).unwrap(), vec![0x84, 0x03]);
        // 2001 bits
        assert_eq!(call(&h, &[0x01, 0, 0, 0x07, 0xD1]).unwrap(), vec![0x81, 0x03]);
        assert!(call(&h, &[0x02, 0, 0, 0x07, 0xD0]).unwrap()[0] == 0x02);
    }

    #[test]
    fn test_past_end_is_illegal_address() {
        let h = handler(0x10000);
        // address 65535, count 2
        assert_eq!(call(&h, &[0x03, 0xFF, 0xFF, 0, 2]).unwrap(), vec![0x83, 0x02]);
        assert_eq!(call(&h, &[0x06, 0xFF, 0xFF, 0, 2]).unwrap()[0], 0x06);
        let small = handler(10);
        assert_eq!(call(&small, &[0x05, 0, 10, 0xFF, 0]).unwrap(), vec![0x85, 0x02]);
    }

    #[test]
    fn test_write_single_coil_echoes_raw_value() {
        let h = handler(16);
        assert_eq!(
            call(&h, &[0x05, 0, 10, 0xFF, 0x00]).unwrap(),
            vec![0x05, 0, 10, 0xFF, 0x00]
        );
        assert_eq!(h.store().read_coils(10, 1).unwrap(), vec![true]);

        // anything but 0xFF00 switches off, raw value echoed
        assert_eq!(
            call(&h, &[0x05, 0, 10, 0x12, 0x34]).unwrap(),
            vec![0x05, 0, 10, 0x12, 0x34]
        );
        assert_eq!(h.store().read_coils(10, 1).unwrap(), vec![false]);
    }

    #[test]
    fn test_write_multiple_coils() {
        let h = handler(32);
        assert_eq!(
            call(&h, &[0x0F, 0, 0x13, 0, 0x0A, 0x02, 0xCD, 0x01]).unwrap(),
            vec![0x0F, 0, 0x13, 0, 0x0A]
        );
        assert_eq!(
            h.store().read_coils(0x13, 10).unwrap(),
            vec![true, false, true, true, false, false, true, true, true, false]
        );

        // byte count too small for 10 bits
        assert_eq!(
            call(&h, &[0x0F, 0, 0, 0, 0x0A, 0x01, 0xCD]).unwrap(),
            vec![0x8F, 0x03]
        );
        // announced bytes missing
        assert_eq!(
            call(&h, &[0x0F, 0, 0, 0, 0x0A, 0x02, 0xCD]).unwrap(),
            vec![0x8F, 0x03]
        );
        // legal count, past the end
        assert_eq!(
            call(&h, &[0x0F, 0, 30, 0, 0x0A, 0x02, 0xCD, 0x01]).unwrap(),
            vec![0x8F, 0x02]
        );
    }

    #[test]
    fn test_write_multiple_registers() {
        let h = handler(16);
        assert_eq!(
            call(&h, &[0x10, 0, 1, 0, 2, 4, 0, 0x0A, 0x01, 0x02]).unwrap(),
            vec![0x10, 0, 1, 0, 2]
        );
        assert_eq!(h.store().read_holding_registers(1, 2).unwrap(), vec![0x000A, 0x0102]);

        // byte count must be exactly 2n
        assert_eq!(
            call(&h, &[0x10, 0, 1, 0, 2, 5, 0, 0x0A, 0x01, 0x02, 0]).unwrap(),
            vec![0x90, 0x03]
        );
        // 124 registers
        assert_eq!(call(&h, &[0x10, 0, 0, 0, 124, 248]).unwrap(), vec![0x90, 0x03]);
    }

    #[test]
    fn test_truncated_payload_is_frame_error() {
        let h = handler(16);
        assert!(matches!(
            call(&h, &[0x03, 0x00]),
            Err(ModbusError::Frame { .. })
        ));
        assert!(matches!(
            call(&h, &[0x10, 0, 0, 0]),
            Err(ModbusError::Frame { .. })
        ));
    }

    #[test]
    fn test_handle_uses_session_request() {
        let h = handler(16);
        let mut session = SessionData::default();
        session.request = Frame::new(
            1,
            1,
            ModbusPdu::from_slice(&[0x06, 0, 3, 0x12, 0x34]).unwrap(),
        );
        let pdu = h.handle(&session).unwrap();
        assert_eq!(pdu.as_slice(), &[0x06, 0, 3, 0x12, 0x34]);
        assert_eq!(h.store().read_holding_registers(3, 1).unwrap(), vec![0x1234]);
    }

    #[test]
    fn test_closure_handler() {
        let busy = |session: &SessionData| -> ModbusResult<ModbusPdu> {
            Ok(ModbusPdu::exception(
                session.request.pdu.function_code().unwrap_or(0),
                EXCEPTION_SERVER_DEVICE_BUSY,
            ))
        };
        let mut session = SessionData::default();
        session.request.pdu = ModbusPdu::from_slice(&[0x03, 0, 0, 0, 1]).unwrap();
        assert_eq!(busy.handle(&session).unwrap().as_slice(), &[0x83, 0x06]);
    }
}
