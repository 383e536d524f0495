//! Modbus protocol definitions
//!
//! Function codes served by the engine and the exception codes a server can
//! answer with.

use std::fmt;

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};

/// Modbus unit identifier (0-255)
pub type UnitId = u8;

/// Modbus data address (0-65535)
pub type ModbusAddress = u16;

/// Function codes handled by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusFunction {
    ReadCoils = FC_READ_COILS,
    ReadDiscreteInputs = FC_READ_DISCRETE_INPUTS,
    ReadHoldingRegisters = FC_READ_HOLDING_REGISTERS,
    ReadInputRegisters = FC_READ_INPUT_REGISTERS,
    WriteSingleCoil = FC_WRITE_SINGLE_COIL,
    WriteSingleRegister = FC_WRITE_SINGLE_REGISTER,
    WriteMultipleCoils = FC_WRITE_MULTIPLE_COILS,
    WriteMultipleRegisters = FC_WRITE_MULTIPLE_REGISTERS,
}

impl ModbusFunction {
    /// Parse a function code, rejecting anything the engine does not serve
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            FC_READ_COILS => Ok(Self::ReadCoils),
            FC_READ_DISCRETE_INPUTS => Ok(Self::ReadDiscreteInputs),
            FC_READ_HOLDING_REGISTERS => Ok(Self::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Ok(Self::ReadInputRegisters),
            FC_WRITE_SINGLE_COIL => Ok(Self::WriteSingleCoil),
            FC_WRITE_SINGLE_REGISTER => Ok(Self::WriteSingleRegister),
            FC_WRITE_MULTIPLE_COILS => Ok(Self::WriteMultipleCoils),
            FC_WRITE_MULTIPLE_REGISTERS => Ok(Self::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ReadCoils => "Read Coils",
            Self::ReadDiscreteInputs => "Read Discrete Inputs",
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleCoil => "Write Single Coil",
            Self::WriteSingleRegister => "Write Single Register",
            Self::WriteMultipleCoils => "Write Multiple Coils",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    /// Code outside the standard table
    Unknown(u8),
}

impl ModbusException {
    pub fn from_u8(code: u8) -> Self {
        match code {
            EXCEPTION_ILLEGAL_FUNCTION => Self::IllegalFunction,
            EXCEPTION_ILLEGAL_DATA_ADDRESS => Self::IllegalDataAddress,
            EXCEPTION_ILLEGAL_DATA_VALUE => Self::IllegalDataValue,
            EXCEPTION_SERVER_DEVICE_FAILURE => Self::ServerDeviceFailure,
            EXCEPTION_ACKNOWLEDGE => Self::Acknowledge,
            EXCEPTION_SERVER_DEVICE_BUSY => Self::ServerDeviceBusy,
            EXCEPTION_NEGATIVE_ACKNOWLEDGE => Self::NegativeAcknowledge,
            EXCEPTION_MEMORY_PARITY_ERROR => Self::MemoryParityError,
            EXCEPTION_GATEWAY_PATH_UNAVAILABLE => Self::GatewayPathUnavailable,
            EXCEPTION_GATEWAY_TARGET_FAILED => Self::GatewayTargetFailedToRespond,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::IllegalFunction => EXCEPTION_ILLEGAL_FUNCTION,
            Self::IllegalDataAddress => EXCEPTION_ILLEGAL_DATA_ADDRESS,
            Self::IllegalDataValue => EXCEPTION_ILLEGAL_DATA_VALUE,
            Self::ServerDeviceFailure => EXCEPTION_SERVER_DEVICE_FAILURE,
            Self::Acknowledge => EXCEPTION_ACKNOWLEDGE,
            Self::ServerDeviceBusy => EXCEPTION_SERVER_DEVICE_BUSY,
            Self::NegativeAcknowledge => EXCEPTION_NEGATIVE_ACKNOWLEDGE,
            Self::MemoryParityError => EXCEPTION_MEMORY_PARITY_ERROR,
            Self::GatewayPathUnavailable => EXCEPTION_GATEWAY_PATH_UNAVAILABLE,
            Self::GatewayTargetFailedToRespond => EXCEPTION_GATEWAY_TARGET_FAILED,
            Self::Unknown(code) => code,
        }
    }

    /// Short text
    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::ServerDeviceFailure => "slave device failure",
            Self::Acknowledge => "acknowledge",
            Self::ServerDeviceBusy => "slave device busy",
            Self::NegativeAcknowledge => "negative acknowledge",
            Self::MemoryParityError => "memory parity error",
            Self::GatewayPathUnavailable => "gateway path unavailable",
            Self::GatewayTargetFailedToRespond => "gateway target device failed to respond",
            Self::Unknown(_) => "unknown exception",
        }
    }

    /// Long explanatory text
    pub fn details(self) -> &'static str {
        match self {
            Self::IllegalFunction => {
                "Function code received in the query is not recognized or allowed by slave."
            }
            Self::IllegalDataAddress => {
                "Data address of some or all the required entities are not allowed or do not exist in slave."
            }
            Self::IllegalDataValue => "Value is not accepted by slave.",
            Self::ServerDeviceFailure => {
                "Unrecoverable error occurred while slave was attempting to perform requested action."
            }
            Self::Acknowledge => {
                "Slave has accepted request and is processing it, but a long duration of time is \
                 required. This response is returned to prevent a timeout error from occurring in \
                 the master. Master can next issue a Poll Program Complete message to determine \
                 whether processing is completed."
            }
            Self::ServerDeviceBusy => {
                "Slave is engaged in processing a long-duration command. Master should retry later."
            }
            Self::NegativeAcknowledge => {
                "Slave cannot perform the programming functions. Master should request diagnostic \
                 or error information from slave."
            }
            Self::MemoryParityError => {
                "Slave detected a parity error in memory. Master can retry the request, but service \
                 may be required on the slave device."
            }
            Self::GatewayPathUnavailable => {
                "Specialized for Modbus gateways, this indicates a misconfiguration on gateway."
            }
            Self::GatewayTargetFailedToRespond => {
                "Specialized for Modbus gateways, sent when slave fails to respond."
            }
            Self::Unknown(_) => "Exception code outside the Modbus exception table.",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_from_u8() {
        assert_eq!(
            ModbusFunction::from_u8(0x03).unwrap(),
            ModbusFunction::ReadHoldingRegisters
        );
        assert_eq!(
            ModbusFunction::from_u8(0x0F).unwrap(),
            ModbusFunction::WriteMultipleCoils
        );
        assert!(matches!(
            ModbusFunction::from_u8(0x2B),
            Err(ModbusError::InvalidFunction { code: 0x2B })
        ));
        assert!(ModbusFunction::ReadInputRegisters.is_read());
        assert!(ModbusFunction::WriteSingleCoil.is_write());
    }

    #[test]
    fn test_exception_codes() {
        for code in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x0A, 0x0B] {
            let exc = ModbusException::from_u8(code);
            assert!(!matches!(exc, ModbusException::Unknown(_)));
            assert_eq!(exc.code(), code);
        }
        assert_eq!(ModbusException::from_u8(0x09), ModbusException::Unknown(0x09));
        assert_eq!(ModbusException::Unknown(0x09).code(), 0x09);
    }

    #[test]
    fn test_exception_display() {
        assert_eq!(
            ModbusException::IllegalDataAddress.to_string(),
            "illegal data address (0x02)"
        );
        assert!(ModbusException::NegativeAcknowledge
            .details()
            .starts_with("Slave cannot perform"));
    }
}
