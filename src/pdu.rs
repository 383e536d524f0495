//! Modbus PDU (function code + payload)
//!
//! The PDU lives in a fixed-size stack array capped at 253 bytes. Writing past
//! the cap, or reading past the end of the payload, is a frame error.

use tracing::debug;

use crate::bits::pack_bits;
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ModbusFunction;

/// PDU with stack-allocated fixed array
#[derive(Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    pub fn from_slice(data: &[u8]) -> ModbusResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::frame(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();

        match (pdu.function_code(), pdu.exception_code()) {
            (Some(fc), Some(exc)) => debug!(
                "PDU parsed: FC={:02X} (Exception: {}), exception_code={:02X}",
                fc,
                Self::function_code_description(fc),
                exc
            ),
            (Some(fc), None) => debug!(
                "PDU parsed: FC={:02X} ({}), data_len={}",
                fc,
                Self::function_code_description(fc),
                pdu.len - 1
            ),
            _ => debug!("PDU parsed: empty PDU"),
        }

        Ok(pdu)
    }

    /// Exception PDU: `fc | 0x80`, exception code
    pub fn exception(function_code: u8, exception_code: u8) -> Self {
        let mut pdu = Self::new();
        pdu.data[0] = function_code | EXCEPTION_FLAG;
        pdu.data[1] = exception_code;
        pdu.len = 2;
        pdu
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::frame("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.extend(&value.to_be_bytes())
    }

    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::frame(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First byte
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    /// Payload after the function code
    #[inline]
    pub fn payload(&self) -> &[u8] {
        if self.len > 0 {
            &self.data[1..self.len]
        } else {
            &[]
        }
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }

    /// Reader over the payload
    pub fn reader(&self) -> PduReader<'_> {
        PduReader::new(self.payload())
    }

    pub fn function_code_description(fc: u8) -> &'static str {
        ModbusFunction::from_u8(fc & !EXCEPTION_FLAG)
            .map(ModbusFunction::name)
            .unwrap_or("Unknown Function")
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ModbusPdu {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ModbusPdu {}

impl std::fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ModbusPdu").field(&self.as_slice()).finish()
    }
}

/// Cursor over a PDU payload.
///
/// Every read checks the remaining length and fails with a frame error on a
/// short buffer.
#[derive(Debug, Clone)]
pub struct PduReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PduReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> ModbusResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> ModbusResult<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_bytes(&mut self, n: usize) -> ModbusResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ModbusError::frame(format!(
                "PDU too short: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Everything not yet consumed
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// `count` big-endian registers
    pub fn read_registers(&mut self, count: usize) -> ModbusResult<Vec<u16>> {
        Ok(self
            .read_bytes(count * 2)?
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    #[inline]
    pub fn quantity(mut self, qty: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    /// Byte count field; fails when `count` does not fit in one byte
    #[inline]
    pub fn byte_count(self, count: usize) -> ModbusResult<Self> {
        let count = u8::try_from(count)
            .map_err(|_| ModbusError::frame(format!("byte count {count} does not fit in u8")))?;
        self.byte(count)
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    #[inline]
    pub fn registers(mut self, values: &[u16]) -> ModbusResult<Self> {
        for &value in values {
            self.pdu.push_u16(value)?;
        }
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            debug!(
                "PDU built: FC={:02X} ({}), total_len={}",
                fc,
                ModbusPdu::function_code_description(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }

    fn quantity_of(len: usize) -> ModbusResult<u16> {
        u16::try_from(len).map_err(|_| ModbusError::frame(format!("quantity {len} exceeds u16")))
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Read request PDU for FC01-04
    pub fn build_read_request(fc: u8, start_address: u16, quantity: u16) -> ModbusResult<ModbusPdu> {
        if !matches!(fc, FC_READ_COILS..=FC_READ_INPUT_REGISTERS) {
            return Err(ModbusError::InvalidFunction { code: fc });
        }
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(start_address)?
            .quantity(quantity)?
            .build())
    }

    /// FC05; `true` is sent as 0xFF00, `false` as 0x0000
    pub fn build_write_single_coil(address: u16, value: bool) -> ModbusResult<ModbusPdu> {
        let coil_value = if value { COIL_ON } else { COIL_OFF };
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_COIL)?
            .address(address)?
            .quantity(coil_value)?
            .build())
    }

    /// FC06
    pub fn build_write_single_register(address: u16, value: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .address(address)?
            .quantity(value)?
            .build())
    }

    /// FC15
    pub fn build_write_multiple_coils(address: u16, values: &[bool]) -> ModbusResult<ModbusPdu> {
        let coil_bytes = pack_bits(values);
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_COILS)?
            .address(address)?
            .quantity(Self::quantity_of(values.len())?)?
            .byte_count(coil_bytes.len())?
            .data(&coil_bytes)?
            .build())
    }

    /// FC16
    pub fn build_write_multiple_registers(address: u16, values: &[u16]) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(address)?
            .quantity(Self::quantity_of(values.len())?)?
            .byte_count(values.len() * 2)?
            .registers(values)?
            .build())
    }

    // ------------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------------

    /// FC01/FC02 response: byte count + packed bits
    pub fn build_read_bits_response(fc: u8, bits: &[bool]) -> ModbusResult<ModbusPdu> {
        let packed = pack_bits(bits);
        Ok(PduBuilder::new()
            .function_code(fc)?
            .byte_count(packed.len())?
            .data(&packed)?
            .build())
    }

    /// FC03/FC04 response: byte count + registers
    pub fn build_read_registers_response(fc: u8, values: &[u16]) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(fc)?
            .byte_count(values.len() * 2)?
            .registers(values)?
            .build())
    }

    /// FC05/FC06/FC15/FC16 response: address + value or quantity
    pub fn build_write_response(fc: u8, address: u16, value: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(address)?
            .quantity(value)?
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_basic_operations() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.is_empty());

        pdu.push(0x03).unwrap();
        assert_eq!(pdu.function_code(), Some(0x03));
        assert!(!pdu.is_exception());

        pdu.push_u16(0x0100).unwrap();
        pdu.push_u16(0x000A).unwrap();

        assert_eq!(pdu.as_slice(), &[0x03, 0x01, 0x00, 0x00, 0x0A]);
        assert_eq!(pdu.payload(), &[0x01, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn test_pdu_overflow_is_frame_error() {
        let mut pdu = ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE]).unwrap();
        assert!(matches!(pdu.push(1), Err(ModbusError::Frame { .. })));
        assert!(matches!(
            ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE + 1]),
            Err(ModbusError::Frame { .. })
        ));
    }

    #[test]
    fn test_exception_pdu() {
        let pdu = ModbusPdu::exception(0x03, 0x02);
        assert_eq!(pdu.as_slice(), &[0x83, 0x02]);
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x02));
        assert_eq!(ModbusPdu::function_code_description(0x83), "Read Holding Registers");
    }

    #[test]
    fn test_reader_short_payload() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x00, 0x10, 0x00]).unwrap();
        let mut reader = pdu.reader();
        assert_eq!(reader.read_u16().unwrap(), 0x0010);
        assert!(matches!(reader.read_u16(), Err(ModbusError::Frame { .. })));
    }

    #[test]
    fn test_build_read_request() {
        let pdu = PduBuilder::build_read_request(0x03, 0x006B, 3).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);
        assert!(PduBuilder::build_read_request(0x05, 0, 1).is_err());
    }

    #[test]
    fn test_build_write_single_coil() {
        let on = PduBuilder::build_write_single_coil(0x00AC, true).unwrap();
        assert_eq!(on.as_slice(), &[0x05, 0x00, 0xAC, 0xFF, 0x00]);
        let off = PduBuilder::build_write_single_coil(0x00AC, false).unwrap();
        assert_eq!(off.as_slice(), &[0x05, 0x00, 0xAC, 0x00, 0x00]);
    }

    #[test]
    fn test_build_write_multiple_coils() {
        let bits = [
            true, false, true, true, false, false, true, true, true, false,
        ];
        let pdu = PduBuilder::build_write_multiple_coils(0x0013, &bits).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );
    }

    #[test]
    fn test_build_write_multiple_registers() {
        let pdu = PduBuilder::build_write_multiple_registers(0x0001, &[0x000A, 0x0102]).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_oversized_register_write_fails() {
        let values = vec![0u16; 200];
        assert!(matches!(
            PduBuilder::build_write_multiple_registers(0, &values),
            Err(ModbusError::Frame { .. })
        ));
    }

    #[test]
    fn test_responses() {
        let bits = PduBuilder::build_read_bits_response(0x01, &[true, false, true]).unwrap();
        assert_eq!(bits.as_slice(), &[0x01, 0x01, 0x05]);

        let regs = PduBuilder::build_read_registers_response(0x03, &[0x022B, 0x0000]).unwrap();
        assert_eq!(regs.as_slice(), &[0x03, 0x04, 0x02, 0x2B, 0x00, 0x00]);

        let echo = PduBuilder::build_write_response(0x05, 10, 0xFF00).unwrap();
        assert_eq!(echo.as_slice(), &[0x05, 0x00, 0x0A, 0xFF, 0x00]);
    }
}
