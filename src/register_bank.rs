//! Server-side storage for the four Modbus data tables.
//!
//! Coils and holding registers are writable through the protocol;
//! discrete inputs and input registers are read-only on the wire and
//! mutated through the `set_*` methods by the application feeding the
//! server. Tables are sized at construction and zero-initialized.
//! Each table carries its own lock, so one bank can back several
//! concurrently accepted connections; no atomicity is promised across
//! tables.

use std::sync::RwLock;

use crate::error::{ModbusError, ModbusResult};

const DEFAULT_TABLE_SIZE: usize = 10000;

/// Thread-safe coil/register map.
#[derive(Debug)]
pub struct ModbusRegisterBank {
    coils: RwLock<Vec<bool>>,
    discrete_inputs: RwLock<Vec<bool>>,
    holding_registers: RwLock<Vec<u16>>,
    input_registers: RwLock<Vec<u16>>,
}

impl ModbusRegisterBank {
    /// A bank with the default table sizes.
    pub fn new() -> Self {
        Self::with_sizes(
            DEFAULT_TABLE_SIZE,
            DEFAULT_TABLE_SIZE,
            DEFAULT_TABLE_SIZE,
            DEFAULT_TABLE_SIZE,
        )
    }

    /// A bank with caller-chosen table sizes, all values zeroed.
    pub fn with_sizes(
        coils: usize,
        discrete_inputs: usize,
        holding_registers: usize,
        input_registers: usize,
    ) -> Self {
        Self {
            coils: RwLock::new(vec![false; coils]),
            discrete_inputs: RwLock::new(vec![false; discrete_inputs]),
            holding_registers: RwLock::new(vec![0; holding_registers]),
            input_registers: RwLock::new(vec![0; input_registers]),
        }
    }

    fn read_bits(
        table: &RwLock<Vec<bool>>,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        let bits = table.read().unwrap();
        let start = address as usize;
        let end = start + quantity as usize;
        if end > bits.len() {
            return Err(ModbusError::invalid_address(address, quantity));
        }
        Ok(bits[start..end].to_vec())
    }

    fn read_words(
        table: &RwLock<Vec<u16>>,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        let words = table.read().unwrap();
        let start = address as usize;
        let end = start + quantity as usize;
        if end > words.len() {
            return Err(ModbusError::invalid_address(address, quantity));
        }
        Ok(words[start..end].to_vec())
    }

    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        Self::read_bits(&self.coils, address, quantity)
    }

    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        Self::read_bits(&self.discrete_inputs, address, quantity)
    }

    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        Self::read_words(&self.holding_registers, address, quantity)
    }

    pub fn read_input_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        Self::read_words(&self.input_registers, address, quantity)
    }

    pub fn write_single_coil(&self, address: u16, value: bool) -> ModbusResult<()> {
        let mut coils = self.coils.write().unwrap();
        let addr = address as usize;
        if addr >= coils.len() {
            return Err(ModbusError::invalid_address(address, 1));
        }
        coils[addr] = value;
        Ok(())
    }

    pub fn write_multiple_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let mut coils = self.coils.write().unwrap();
        let start = address as usize;
        let end = start + values.len();
        if end > coils.len() {
            return Err(ModbusError::invalid_address(address, values.len() as u16));
        }
        coils[start..end].copy_from_slice(values);
        Ok(())
    }

    pub fn write_single_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        let mut registers = self.holding_registers.write().unwrap();
        let addr = address as usize;
        if addr >= registers.len() {
            return Err(ModbusError::invalid_address(address, 1));
        }
        registers[addr] = value;
        Ok(())
    }

    pub fn write_multiple_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let mut registers = self.holding_registers.write().unwrap();
        let start = address as usize;
        let end = start + values.len();
        if end > registers.len() {
            return Err(ModbusError::invalid_address(address, values.len() as u16));
        }
        registers[start..end].copy_from_slice(values);
        Ok(())
    }

    /// Set a discrete input, for the application driving the server.
    pub fn set_discrete_input(&self, address: u16, value: bool) -> ModbusResult<()> {
        let mut inputs = self.discrete_inputs.write().unwrap();
        let addr = address as usize;
        if addr >= inputs.len() {
            return Err(ModbusError::invalid_address(address, 1));
        }
        inputs[addr] = value;
        Ok(())
    }

    /// Set an input register, for the application driving the server.
    pub fn set_input_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        let mut registers = self.input_registers.write().unwrap();
        let addr = address as usize;
        if addr >= registers.len() {
            return Err(ModbusError::invalid_address(address, 1));
        }
        registers[addr] = value;
        Ok(())
    }

    pub fn stats(&self) -> RegisterBankStats {
        RegisterBankStats {
            coils_count: self.coils.read().unwrap().len(),
            discrete_inputs_count: self.discrete_inputs.read().unwrap().len(),
            holding_registers_count: self.holding_registers.read().unwrap().len(),
            input_registers_count: self.input_registers.read().unwrap().len(),
        }
    }
}

impl Default for ModbusRegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Table sizes of a register bank.
#[derive(Debug, Clone)]
pub struct RegisterBankStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_allocation() {
        let bank = ModbusRegisterBank::with_sizes(8, 8, 8, 8);
        assert_eq!(bank.read_coils(0, 8).unwrap(), vec![false; 8]);
        assert_eq!(bank.read_holding_registers(0, 8).unwrap(), vec![0; 8]);

        let stats = bank.stats();
        assert_eq!(stats.coils_count, 8);
        assert_eq!(stats.input_registers_count, 8);
    }

    #[test]
    fn test_coil_read_write() {
        let bank = ModbusRegisterBank::with_sizes(32, 0, 0, 0);
        bank.write_single_coil(10, true).unwrap();
        assert_eq!(bank.read_coils(10, 1).unwrap(), vec![true]);

        bank.write_multiple_coils(20, &[true, false, true]).unwrap();
        assert_eq!(
            bank.read_coils(20, 3).unwrap(),
            vec![true, false, true]
        );
    }

    #[test]
    fn test_register_read_write() {
        let bank = ModbusRegisterBank::with_sizes(0, 0, 128, 16);
        bank.write_single_register(5, 0xABCD).unwrap();
        assert_eq!(bank.read_holding_registers(5, 1).unwrap(), vec![0xABCD]);

        bank.write_multiple_registers(100, &[0x1111, 0x2222, 0x3333])
            .unwrap();
        assert_eq!(
            bank.read_holding_registers(100, 3).unwrap(),
            vec![0x1111, 0x2222, 0x3333]
        );

        bank.set_input_register(3, 0x5678).unwrap();
        assert_eq!(bank.read_input_registers(3, 1).unwrap(), vec![0x5678]);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let bank = ModbusRegisterBank::with_sizes(4, 4, 4, 4);
        assert!(bank.read_coils(2, 3).is_err());
        assert!(bank.read_holding_registers(4, 1).is_err());
        assert!(bank.write_single_coil(4, true).is_err());
        assert!(bank.write_multiple_registers(3, &[1, 2]).is_err());
        assert!(bank.set_discrete_input(4, true).is_err());
    }
}
