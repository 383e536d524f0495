//! MBAP header and Modbus/TCP frames
//!
//! Wire layout (big-endian):
//!
//! | Field | Size |
//! |-------|------|
//! | Transaction ID | 2 |
//! | Protocol ID (0) | 2 |
//! | Length (unit ID + PDU) | 2 |
//! | Unit ID | 1 |
//! | PDU | 1-253 |

use bytes::{Buf, BufMut, BytesMut};

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MIN_MBAP_LENGTH, MODBUS_PROTOCOL_ID};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ModbusPdu;
use crate::protocol::UnitId;

/// The 7-byte Modbus Application Protocol header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit ID + PDU
    pub length: u16,
    pub unit_id: UnitId,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, length: u16, unit_id: UnitId) -> Self {
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length,
            unit_id,
        }
    }

    /// Header for a reply: transaction, protocol and unit echoed, length set
    /// for `pdu_len` bytes of PDU
    pub fn reply(&self, pdu_len: usize) -> Self {
        Self {
            length: (pdu_len + 1) as u16,
            ..*self
        }
    }

    pub fn encode(&self) -> [u8; MBAP_HEADER_LEN] {
        let mut out = [0u8; MBAP_HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
        out
    }

    /// Decode and validate a header.
    ///
    /// Rejects inputs that are not exactly 7 bytes, a non-zero protocol ID and
    /// a length field outside `[3, 256]`.
    pub fn decode(data: &[u8]) -> ModbusResult<Self> {
        if data.len() != MBAP_HEADER_LEN {
            return Err(ModbusError::frame(format!(
                "MBAP header must be {} bytes, got {}",
                MBAP_HEADER_LEN,
                data.len()
            )));
        }
        let mut buf = data;
        let header = Self {
            transaction_id: buf.get_u16(),
            protocol_id: buf.get_u16(),
            length: buf.get_u16(),
            unit_id: buf.get_u8(),
        };
        if header.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(ModbusError::frame(format!(
                "malformed MBAP header: protocol ID {}",
                header.protocol_id
            )));
        }
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&header.length) {
            return Err(ModbusError::frame(format!(
                "malformed MBAP header: length {}",
                header.length
            )));
        }
        Ok(header)
    }

    /// Number of PDU bytes that follow the header
    #[inline]
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length).saturating_sub(1)
    }
}

/// MBAP header + PDU
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub mbap: MbapHeader,
    pub pdu: ModbusPdu,
}

impl Frame {
    /// Frame whose length field matches `pdu`
    pub fn new(transaction_id: u16, unit_id: UnitId, pdu: ModbusPdu) -> Self {
        Self {
            mbap: MbapHeader::new(transaction_id, (pdu.len() + 1) as u16, unit_id),
            pdu,
        }
    }

    /// Serialize with the length field recomputed from the PDU
    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(MBAP_HEADER_LEN + self.pdu.len());
        out.put_slice(&self.mbap.reply(self.pdu.len()).encode());
        out.put_slice(self.pdu.as_slice());
        out
    }

    /// Parse a complete frame
    pub fn from_bytes(data: &[u8]) -> ModbusResult<Self> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(ModbusError::frame(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }
        let mbap = MbapHeader::decode(&data[..MBAP_HEADER_LEN])?;
        let body = &data[MBAP_HEADER_LEN..];
        if body.len() != mbap.pdu_len() {
            return Err(ModbusError::frame(format!(
                "frame body is {} bytes, MBAP length announces {}",
                body.len(),
                mbap.pdu_len()
            )));
        }
        Ok(Self {
            mbap,
            pdu: ModbusPdu::from_slice(body)?,
        })
    }
}
