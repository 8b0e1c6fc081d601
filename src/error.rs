//! Error handling for the Modbus engine.
//!
//! Every fallible operation in the crate returns [`ModbusResult`]. The
//! variants of [`ModbusError`] mirror the failure classes of the protocol
//! engine: transport failures (I/O, closed connections, timeouts), frame
//! integrity failures (CRC, malformed lengths), and peer-reported failures
//! (exception responses). The recovery policy in the client layer keys off
//! this classification, so the split between transport and protocol errors
//! is load-bearing, not cosmetic.

use thiserror::Error;

/// Result type alias for Modbus operations.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors produced by the Modbus engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// Low-level read/write failure on the serial device or socket.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// The peer closed the connection mid-frame or between frames.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A wait expired: either no frame started within the select window,
    /// or the inter-character silence exceeded the end-of-frame window.
    #[error("timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A function code outside the supported set.
    #[error("invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Address/quantity combination outside the target map.
    #[error("invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Malformed or inconsistent frame contents: over-long frames,
    /// quantity mismatches between request and response, bad payloads.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    /// RTU frame failed CRC verification.
    #[error("CRC mismatch: computed=0x{computed:04X}, received=0x{received:04X}")]
    CrcMismatch { computed: u16, received: u16 },

    /// An exception response carried a code outside 0x01..=0x0B.
    #[error("invalid exception code: 0x{code:02X}")]
    InvalidExceptionCode { code: u8 },

    /// The peer answered with a Modbus exception response.
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Bad session parameters (address parse failures, invalid unit id).
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn crc_mismatch(computed: u16, received: u16) -> Self {
        Self::CrcMismatch { computed, received }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Build an exception error from the original function code and the
    /// exception code reported by the peer. Codes without a meaning in the
    /// Modbus specification (0x00, 0x09) still construct: their message is
    /// the "not defined" placeholder.
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            message: exception_message(code).to_string(),
        }
    }

    /// Whether retrying the operation could plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::ConnectionClosed | Self::Timeout { .. } => true,
            // Acknowledge and busy are transient by definition.
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Transport-level failure: the connection itself is suspect and the
    /// recovery policy reconnects rather than flushes.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::ConnectionClosed)
    }

    /// Protocol-level failure: the link carried bytes we could not accept.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFunction { .. }
                | Self::InvalidData { .. }
                | Self::CrcMismatch { .. }
                | Self::InvalidExceptionCode { .. }
                | Self::Exception { .. }
        )
    }
}

/// Human-readable text for an exception code, per the Modbus application
/// protocol specification.
pub fn exception_message(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal function code",
        0x02 => "Illegal data address",
        0x03 => "Illegal data value",
        0x04 => "Slave device or server failure",
        0x05 => "Acknowledge",
        0x06 => "Slave device or server busy",
        0x07 => "Negative acknowledge",
        0x08 => "Memory parity error",
        0x0A => "Gateway path unavailable",
        0x0B => "Target device failed to respond",
        _ => "Not defined in Modbus specification",
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::ConnectionClosed
        } else {
            Self::io(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation", 0)
    }
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::io(err.to_string())
    }
}
