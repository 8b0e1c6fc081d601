//! Modbus protocol definitions and data structures.
//!
//! Function codes, exception codes, the data-type tag used by the typed
//! register reads, and the transport-independent request/response pair.
//! Everything here is PDU-level; framing (headers, CRC, MBAP) lives in
//! [`crate::frame`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535).
pub type ModbusAddress = u16;

/// Modbus register value (16-bit word).
pub type ModbusValue = u16;

/// Modbus unit/slave identifier (1-247, or 0 for broadcast).
pub type UnitId = u8;

/// The broadcast unit address. Only write requests may carry it.
pub const BROADCAST_ADDRESS: UnitId = 0;

/// Modbus function codes supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
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
    /// Read Exception Status (0x07)
    ReadExceptionStatus = 0x07,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Report Server ID (0x11)
    ReportServerId = 0x11,
}

impl ModbusFunction {
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x07 => Ok(ModbusFunction::ReadExceptionStatus),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            0x11 => Ok(ModbusFunction::ReportServerId),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Read functions that address the coil/register map.
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Functions that mutate the coil/register map.
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteSingleRegister
                | ModbusFunction::WriteMultipleCoils
                | ModbusFunction::WriteMultipleRegisters
        )
    }

    /// Functions whose request PDU is just the function code (no
    /// address/quantity words).
    pub fn is_bare_request(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadExceptionStatus | ModbusFunction::ReportServerId
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::ReadExceptionStatus => "Read Exception Status",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ModbusFunction::ReportServerId => "Report Server ID",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    NegativeAcknowledge = 0x07,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailedToRespond = 0x0B,
}

impl ModbusException {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x07 => Some(ModbusException::NegativeAcknowledge),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetFailedToRespond),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        crate::error::exception_message(self.to_u8())
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// How the raw bytes of a register read are to be interpreted.
///
/// The tag fixes both the expected response size (via
/// [`DataType::bytes_per_value`]) and the decoding applied in
/// [`decode_values`](data_utils::decode_values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl DataType {
    /// Bytes a single logical value occupies in a register-read response.
    pub fn bytes_per_value(self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::UInt16
    }
}

/// One decoded value from a typed register read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterValue {
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
}

impl RegisterValue {
    /// The raw value widened to u64 bits, for callers that post-process
    /// uniformly. Floats return their IEEE 754 bit patterns.
    pub fn as_bits(self) -> u64 {
        match self {
            RegisterValue::Int8(v) => v as u8 as u64,
            RegisterValue::UInt8(v) => v as u64,
            RegisterValue::Int16(v) => v as u16 as u64,
            RegisterValue::UInt16(v) => v as u64,
            RegisterValue::Int32(v) => v as u32 as u64,
            RegisterValue::UInt32(v) => v as u64,
            RegisterValue::Int64(v) => v as u64,
            RegisterValue::UInt64(v) => v,
            RegisterValue::Float32(v) => v.to_bits() as u64,
            RegisterValue::Float64(v) => v.to_bits(),
        }
    }
}

/// A Modbus request, transport-independent.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    /// PDU payload after address/quantity: packed coil bytes or register
    /// words for the multi-write functions, the value word for the single
    /// writes. Empty for reads.
    pub data: Vec<u8>,
    /// Interpretation of register-read responses.
    pub data_type: DataType,
}

impl ModbusRequest {
    /// A read request decoding registers as plain 16-bit words.
    pub fn new_read(
        unit_id: UnitId,
        function: ModbusFunction,
        address: ModbusAddress,
        quantity: u16,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data: Vec::new(),
            data_type: DataType::UInt16,
        }
    }

    /// A register read with an explicit data-type tag.
    pub fn new_read_typed(
        unit_id: UnitId,
        function: ModbusFunction,
        address: ModbusAddress,
        quantity: u16,
        data_type: DataType,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data: Vec::new(),
            data_type,
        }
    }

    /// A write request. `quantity` is the number of coils/registers
    /// written (1 for the single-write functions).
    pub fn new_write(
        unit_id: UnitId,
        function: ModbusFunction,
        address: ModbusAddress,
        quantity: u16,
        data: Vec<u8>,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data,
            data_type: DataType::UInt16,
        }
    }

    /// A request whose PDU is just the function code (0x07, 0x11).
    pub fn new_bare(unit_id: UnitId, function: ModbusFunction) -> Self {
        Self {
            unit_id,
            function,
            address: 0,
            quantity: 0,
            data: Vec::new(),
            data_type: DataType::UInt16,
        }
    }

    /// Validate session and quantity bounds before any I/O happens.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.unit_id > 247 {
            return Err(ModbusError::configuration(format!(
                "invalid unit id: {}",
                self.unit_id
            )));
        }
        // Broadcast makes no sense for operations that expect data back.
        if self.unit_id == BROADCAST_ADDRESS && !self.function.is_write_function() {
            return Err(ModbusError::configuration(
                "broadcast address is only valid for writes",
            ));
        }

        match self.function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::WriteMultipleCoils => {
                if self.quantity == 0 || self.quantity > crate::MAX_COILS_PER_REQUEST {
                    return Err(ModbusError::invalid_data(format!(
                        "coil quantity out of range: {}",
                        self.quantity
                    )));
                }
            }
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters
            | ModbusFunction::WriteMultipleRegisters => {
                if self.quantity == 0 || self.quantity > crate::MAX_REGISTERS_PER_REQUEST {
                    return Err(ModbusError::invalid_data(format!(
                        "register quantity out of range: {}",
                        self.quantity
                    )));
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// A Modbus response, transport-independent.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    /// PDU bytes after the function code. For reads this starts with the
    /// byte count; for writes it echoes address/quantity or the request
    /// payload.
    pub data: Vec<u8>,
    pub exception: Option<ModbusException>,
}

impl ModbusResponse {
    pub fn new_success(unit_id: UnitId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            unit_id,
            function,
            data,
            exception: None,
        }
    }

    pub fn new_exception(unit_id: UnitId, function: ModbusFunction, exception_code: u8) -> Self {
        Self {
            unit_id,
            function,
            data: vec![exception_code],
            exception: ModbusException::from_u8(exception_code),
        }
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Parse the byte-count-prefixed payload as 16-bit registers.
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        let payload = self.counted_payload()?;
        if payload.len() % 2 != 0 {
            return Err(ModbusError::invalid_data(
                "register payload length is odd",
            ));
        }
        Ok(payload
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    /// Parse the byte-count-prefixed payload as `bit_count` booleans,
    /// LSB-first per byte.
    pub fn parse_bits(&self, bit_count: usize) -> ModbusResult<Vec<bool>> {
        let payload = self.counted_payload()?;
        if payload.len() * 8 < bit_count {
            return Err(ModbusError::invalid_data(format!(
                "{} bytes cannot hold {} bits",
                payload.len(),
                bit_count
            )));
        }
        Ok(data_utils::unpack_bits(payload, bit_count))
    }

    /// Parse the payload as typed values per `data_type`.
    pub fn parse_values(&self, data_type: DataType) -> ModbusResult<Vec<RegisterValue>> {
        data_utils::decode_values(self.counted_payload()?, data_type)
    }

    fn counted_payload(&self) -> ModbusResult<&[u8]> {
        if let Some(exc) = self.exception {
            return Err(ModbusError::exception(self.function.to_u8(), exc.to_u8()));
        }
        let byte_count = *self
            .data
            .first()
            .ok_or_else(|| ModbusError::invalid_data("empty response payload"))?
            as usize;
        if self.data.len() < 1 + byte_count {
            return Err(ModbusError::invalid_data(format!(
                "byte count {} exceeds payload of {} bytes",
                byte_count,
                self.data.len() - 1
            )));
        }
        Ok(&self.data[1..1 + byte_count])
    }
}

/// PDU payload codecs shared by client and server.
pub mod data_utils {
    use super::*;

    /// Register words to big-endian bytes.
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Big-endian bytes to register words.
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data("byte array length must be even"));
        }
        Ok(bytes
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    /// Pack booleans into bytes, LSB-first; trailing bits of the final
    /// byte stay zero.
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; bits.len().div_ceil(8)];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Unpack `bit_count` booleans from LSB-first packed bytes.
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map(|b| b & (1 << (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Read a float from two registers, low word first.
    pub fn read_f32(words: &[u16]) -> ModbusResult<f32> {
        if words.len() < 2 {
            return Err(ModbusError::invalid_data("need 2 registers for f32"));
        }
        let bits = ((words[1] as u32) << 16) | words[0] as u32;
        Ok(f32::from_bits(bits))
    }

    /// Write a float into two registers, low word first.
    pub fn write_f32(value: f32) -> [u16; 2] {
        let bits = value.to_bits();
        [bits as u16, (bits >> 16) as u16]
    }

    /// Read a double from four registers, least-significant word first.
    pub fn read_f64(words: &[u16]) -> ModbusResult<f64> {
        if words.len() < 4 {
            return Err(ModbusError::invalid_data("need 4 registers for f64"));
        }
        let bits = ((words[3] as u64) << 48)
            | ((words[2] as u64) << 32)
            | ((words[1] as u64) << 16)
            | words[0] as u64;
        Ok(f64::from_bits(bits))
    }

    /// Write a double into four registers, least-significant word first.
    pub fn write_f64(value: f64) -> [u16; 4] {
        let bits = value.to_bits();
        [
            bits as u16,
            (bits >> 16) as u16,
            (bits >> 32) as u16,
            (bits >> 48) as u16,
        ]
    }

    /// Decode a register-read payload into typed values. The payload
    /// length must be an exact multiple of the per-value size.
    pub fn decode_values(payload: &[u8], data_type: DataType) -> ModbusResult<Vec<RegisterValue>> {
        let size = data_type.bytes_per_value();
        if payload.len() % size != 0 {
            return Err(ModbusError::invalid_data(format!(
                "{} payload bytes are not a multiple of the {}-byte value size",
                payload.len(),
                size
            )));
        }

        let mut values = Vec::with_capacity(payload.len() / size);
        for chunk in payload.chunks(size) {
            let value = match data_type {
                DataType::Int8 => RegisterValue::Int8(chunk[0] as i8),
                DataType::UInt8 => RegisterValue::UInt8(chunk[0]),
                DataType::Int16 => {
                    RegisterValue::Int16(i16::from_be_bytes([chunk[0], chunk[1]]))
                }
                DataType::UInt16 => {
                    RegisterValue::UInt16(u16::from_be_bytes([chunk[0], chunk[1]]))
                }
                DataType::Int32 => RegisterValue::Int32(i32::from_be_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3],
                ])),
                DataType::UInt32 => RegisterValue::UInt32(u32::from_be_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3],
                ])),
                DataType::Int64 => {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(chunk);
                    RegisterValue::Int64(i64::from_be_bytes(bytes))
                }
                DataType::UInt64 => {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(chunk);
                    RegisterValue::UInt64(u64::from_be_bytes(bytes))
                }
                DataType::Float32 => {
                    let words = bytes_to_registers(chunk)?;
                    RegisterValue::Float32(read_f32(&words)?)
                }
                DataType::Float64 => {
                    let words = bytes_to_registers(chunk)?;
                    RegisterValue::Float64(read_f64(&words)?)
                }
            };
            values.push(value);
        }
        Ok(values)
    }
}
