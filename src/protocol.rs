/// Modbus protocol definitions and data structures
///
/// Function codes, exception codes, register kinds with their per-kind
/// capability table, and the query status taxonomy used by the executor.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BusError, BusResult};

/// Modbus address type (0-65535)
pub type BusAddress = u16;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Maximum coils/discrete inputs per read request
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum coils per multi-write request
pub const MAX_WRITE_BITS: u16 = 1968;

/// Maximum 16-bit registers per read request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum 16-bit registers per multi-write request
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Convert from u8 to FunctionCode
    pub fn from_u8(value: u8) -> BusResult<Self> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            _ => Err(BusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        !self.is_read_function()
    }

    /// Check if this is a multi-element (packed) write function
    pub fn is_multi_write(self) -> bool {
        matches!(
            self,
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters
        )
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ExceptionCode {
    /// Convert from u8 to ExceptionCode
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            0x04 => Some(ExceptionCode::ServerDeviceFailure),
            0x05 => Some(ExceptionCode::Acknowledge),
            0x06 => Some(ExceptionCode::ServerDeviceBusy),
            0x08 => Some(ExceptionCode::MemoryParityError),
            0x0A => Some(ExceptionCode::GatewayPathUnavailable),
            0x0B => Some(ExceptionCode::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "the function code is not allowed by the device",
            ExceptionCode::IllegalDataAddress => "the data address is not allowed by the device",
            ExceptionCode::IllegalDataValue => "a value in the request is not allowed by the device",
            ExceptionCode::ServerDeviceFailure => "unrecoverable error while performing the action",
            ExceptionCode::Acknowledge => "request accepted, long operation in progress",
            ExceptionCode::ServerDeviceBusy => "device busy, retry later",
            ExceptionCode::MemoryParityError => "parity error in device memory",
            ExceptionCode::GatewayPathUnavailable => "gateway could not allocate a path",
            ExceptionCode::GatewayTargetDeviceFailedToRespond => {
                "no response from gateway target device"
            }
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Outcome classification of one query execution
///
/// The executor never reports device misbehaviour through `Err`; it
/// classifies the response here and the device session turns the status
/// into register-level error bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Query has not been handed to the executor yet
    NotExecuted,
    /// Response received, validated and applied
    Ok,
    /// Response not received or not parsed (timeout, CRC, truncation)
    UnknownError,
    /// Device reported an error that may clear by itself
    TransientError,
    /// Device reported that the request itself is invalid
    PermanentError,
}

impl QueryStatus {
    /// Map a Modbus exception code onto a query status
    ///
    /// Illegal function/address/value are refusals of the request itself;
    /// everything else the device may recover from on its own. Codes
    /// outside the standard table are unknown.
    pub fn from_exception(code: u8) -> Self {
        match ExceptionCode::from_u8(code) {
            Some(ExceptionCode::IllegalFunction)
            | Some(ExceptionCode::IllegalDataAddress)
            | Some(ExceptionCode::IllegalDataValue) => QueryStatus::PermanentError,
            Some(_) => QueryStatus::TransientError,
            None => QueryStatus::UnknownError,
        }
    }

    /// Check whether this status represents a failed execution
    pub fn is_error(self) -> bool {
        !matches!(self, QueryStatus::NotExecuted | QueryStatus::Ok)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryStatus::NotExecuted => "not executed",
            QueryStatus::Ok => "ok",
            QueryStatus::UnknownError => "unknown error",
            QueryStatus::TransientError => "transient error",
            QueryStatus::PermanentError => "permanent error",
        };
        write!(f, "{}", name)
    }
}

/// Check whether an exception code may be caused by a hole inside a
/// coalesced range
///
/// An address or value rejection on a query that spans unpolled
/// addresses may be local to the hole; such queries are worth splitting.
pub fn exception_localizable_to_hole(code: u8) -> bool {
    matches!(
        ExceptionCode::from_u8(code),
        Some(ExceptionCode::IllegalDataAddress) | Some(ExceptionCode::IllegalDataValue)
    )
}

/// Register kinds addressable on a field device
///
/// A closed enumeration: each kind fixes the element width (1 bit or
/// 16 bits), the read function code and the legal write function codes.
/// The two extra holding flavours pin devices that only accept one of
/// the write encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// Single-bit, readable and writable (coil)
    Coil,
    /// Single-bit, read-only (discrete input)
    Discrete,
    /// 16-bit, readable and writable
    Holding,
    /// 16-bit, read-only (input register)
    Input,
    /// 16-bit holding that only accepts the single-write function
    HoldingSingle,
    /// 16-bit holding that only accepts the multi-write function
    HoldingMulti,
}

impl RegisterKind {
    /// Check if elements of this kind are single bits
    pub fn is_single_bit(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::Discrete)
    }

    /// Protocol ceiling on elements per read for this kind
    pub fn max_read_elements(self) -> u16 {
        if self.is_single_bit() {
            MAX_READ_BITS
        } else {
            MAX_READ_REGISTERS
        }
    }

    /// Check if this kind accepts writes at all
    pub fn is_writable(self) -> bool {
        !matches!(self, RegisterKind::Discrete | RegisterKind::Input)
    }

    /// Function code used to read this kind
    pub fn read_function(self) -> FunctionCode {
        match self {
            RegisterKind::Coil => FunctionCode::ReadCoils,
            RegisterKind::Discrete => FunctionCode::ReadDiscreteInputs,
            RegisterKind::Input => FunctionCode::ReadInputRegisters,
            RegisterKind::Holding | RegisterKind::HoldingSingle | RegisterKind::HoldingMulti => {
                FunctionCode::ReadHoldingRegisters
            }
        }
    }

    /// Function code used to write this kind
    ///
    /// `packed` selects the multi-element encoding; kinds pinned to one
    /// encoding ignore it.
    pub fn write_function(self, packed: bool) -> BusResult<FunctionCode> {
        match self {
            RegisterKind::Coil => Ok(if packed {
                FunctionCode::WriteMultipleCoils
            } else {
                FunctionCode::WriteSingleCoil
            }),
            RegisterKind::Holding => Ok(if packed {
                FunctionCode::WriteMultipleRegisters
            } else {
                FunctionCode::WriteSingleRegister
            }),
            RegisterKind::HoldingSingle => Ok(FunctionCode::WriteSingleRegister),
            RegisterKind::HoldingMulti => Ok(FunctionCode::WriteMultipleRegisters),
            RegisterKind::Discrete | RegisterKind::Input => Err(BusError::configuration(format!(
                "{} registers are read-only",
                self.name()
            ))),
        }
    }

    /// Short lowercase name for logs and query descriptions
    pub fn name(self) -> &'static str {
        match self {
            RegisterKind::Coil => "coil",
            RegisterKind::Discrete => "discrete",
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
            RegisterKind::HoldingSingle => "holding_single",
            RegisterKind::HoldingMulti => "holding_multi",
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
