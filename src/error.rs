//! # Voltage Serial Error Handling
//!
//! Error types covering every failure mode of a serial field-bus driver:
//! transport I/O, frame parsing, checksum validation, device exception
//! responses and configuration problems.
//!
//! The split matters operationally. Transport and timeout errors are
//! *recoverable* (the next poll cycle may succeed without intervention),
//! device exceptions are mapped onto query statuses by the executor, and
//! configuration errors are permanent until the caller fixes its input.
//!
//! ## Error Classification
//!
//! ```rust
//! use voltage_serial::BusError;
//!
//! let err = BusError::timeout("read frame", 500);
//! assert!(err.is_recoverable());
//! assert!(err.is_transport_error());
//!
//! let err = BusError::exception(0x03, 0x02);
//! assert!(err.is_protocol_error());
//! assert!(!err.is_recoverable());
//! ```

use thiserror::Error;

/// Result type alias for serial bus operations
///
/// Convenience alias using `BusError` as the error type throughout
/// the crate.
pub type BusResult<T> = Result<T, BusError>;

/// Comprehensive serial bus error type
///
/// Covers transport failures, protocol violations, device exception
/// responses and data validation problems. Each variant carries enough
/// context to diagnose the failure from a log line alone.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// I/O related errors (serial port access, OS-level failures)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors (port cannot be opened or was lost)
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    ///
    /// The operation exceeded its configured limit. For frame reads this
    /// means the device produced no response within the frame timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level errors
    ///
    /// Responses that parse but do not match the request: slave-id echo
    /// mismatch, function-code echo mismatch, impossible byte counts.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Invalid function code
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Invalid address range
    ///
    /// The request would exceed protocol ceilings (125 registers,
    /// 2000 bits) or wrap the 16-bit address space.
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// CRC validation failure
    ///
    /// The frame arrived but its checksum does not cover its content.
    /// Usually line noise; the port is resynchronized afterwards.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Modbus exception response
    ///
    /// The device answered with the exception bit set. The code decides
    /// whether the query is retried, split or abandoned:
    ///
    /// - 0x01 Illegal Function
    /// - 0x02 Illegal Data Address
    /// - 0x03 Illegal Data Value
    /// - 0x04 Slave Device Failure
    /// - 0x05 Acknowledge
    /// - 0x06 Slave Device Busy
    /// - 0x08 Memory Parity Error
    /// - 0x0A Gateway Path Unavailable
    /// - 0x0B Gateway Target Device Failed to Respond
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Frame parsing errors
    ///
    /// Truncated or structurally impossible frames.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error
    ///
    /// Maps standard exception codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable (retry viable on a later cycle)
    ///
    /// Transport problems and busy/acknowledge exceptions clear by
    /// themselves; everything else needs the request to change.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is a transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
impl From<tokio::time::error::Elapsed> for BusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serial port errors
impl From<tokio_serial::Error> for BusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(err.to_string())
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BusError::timeout("read_frame", 500);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());

        let err = BusError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_busy_exception_recoverable() {
        assert!(BusError::exception(0x03, 0x06).is_recoverable());
        assert!(BusError::exception(0x03, 0x05).is_recoverable());
        assert!(!BusError::exception(0x03, 0x01).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = BusError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));
    }
}
