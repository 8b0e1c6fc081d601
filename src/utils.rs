//! Validation, formatting, and serial timing helpers.

use crate::error::{ModbusError, ModbusResult};

/// Parameter validation shared by client and server paths.
pub mod validation {
    use super::*;

    /// Unit ids are 1-247; 0 is reserved for broadcast.
    pub fn validate_unit_id(unit_id: u8, allow_broadcast: bool) -> ModbusResult<()> {
        if unit_id > 247 || (unit_id == 0 && !allow_broadcast) {
            return Err(ModbusError::configuration(format!(
                "invalid unit id: {unit_id} (must be 1-247{})",
                if allow_broadcast { ", or 0 for broadcast" } else { "" }
            )));
        }
        Ok(())
    }

    /// Address plus count must stay inside the 16-bit address space.
    pub fn validate_address_range(start: u16, count: u16) -> ModbusResult<()> {
        if count == 0 || (start as u32 + count as u32) > 65536 {
            return Err(ModbusError::invalid_address(start, count));
        }
        Ok(())
    }

    pub fn validate_register_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "invalid register count: {count} (must be 1-{})",
                crate::MAX_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }

    pub fn validate_coil_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_COILS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "invalid coil count: {count} (must be 1-{})",
                crate::MAX_COILS_PER_REQUEST
            )));
        }
        Ok(())
    }
}

/// Display helpers for frames and registers.
pub mod format {
    /// Format a byte span as spaced uppercase hex.
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register words as spaced uppercase hex.
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{r:04X}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// RTU line timing derived from the baud rate.
pub mod timing {
    /// Transmission time of one character in microseconds. A character is
    /// 11 bits: start, 8 data, parity, stop.
    pub fn character_time_us(baud: u32) -> u32 {
        (11 * 1_000_000) / baud
    }

    /// Inter-frame gap: 3.5 character times, floored at 1750us above
    /// 19200 baud where the Modbus serial line spec fixes the gap.
    pub fn frame_gap_us(baud: u32) -> u32 {
        let gap = character_time_us(baud) * 35 / 10;
        if baud > 19200 {
            gap.max(1750)
        } else {
            gap
        }
    }
}

/// Logging helpers for tests and examples.
pub mod logging {
    /// Install an env_logger instance suitable for test output; repeated
    /// calls are harmless.
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}
