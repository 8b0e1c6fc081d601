//! Modbus RTU CRC-16.
//!
//! The checksum is computed with two precomputed 256-entry tables, one per
//! result byte, instead of the bitwise shift loop. Both bytes start at 0xFF
//! and each input byte indexes the tables through `hi ^ byte`. The result is
//! appended to the frame high byte first, and verification reads the trailing
//! two bytes back in the same order.

use crate::error::{ModbusError, ModbusResult};

#[rustfmt::skip]
const CRC_TABLE_HI: [u8; 256] = [
    0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41, 0x01, 0xC0,
    0x80, 0x41, 0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41,
    0x00, 0xC1, 0x81, 0x40, 0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0,
    0x80, 0x41, 0x01, 0xC0, 0x80, 0x41, 0x00, 0xC1, 0x81, 0x40,
    0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41, 0x00, 0xC1,
    0x81, 0x40, 0x01, 0xC0, 0x80, 0x41, 0x01, 0xC0, 0x80, 0x41,
    0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41, 0x00, 0xC1,
    0x81, 0x40, 0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41,
    0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41, 0x01, 0xC0,
    0x80, 0x41, 0x00, 0xC1, 0x81, 0x40, 0x00, 0xC1, 0x81, 0x40,
    0x01, 0xC0, 0x80, 0x41, 0x01, 0xC0, 0x80, 0x41, 0x00, 0xC1,
    0x81, 0x40, 0x01, 0xC0, 0x80, 0x41, 0x00, 0xC1, 0x81, 0x40,
    0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41, 0x01, 0xC0,
    0x80, 0x41, 0x00, 0xC1, 0x81, 0x40, 0x00, 0xC1, 0x81, 0x40,
    0x01, 0xC0, 0x80, 0x41, 0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0,
    0x80, 0x41, 0x01, 0xC0, 0x80, 0x41, 0x00, 0xC1, 0x81, 0x40,
    0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41, 0x01, 0xC0,
    0x80, 0x41, 0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41,
    0x00, 0xC1, 0x81, 0x40, 0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0,
    0x80, 0x41, 0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41,
    0x01, 0xC0, 0x80, 0x41, 0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0,
    0x80, 0x41, 0x00, 0xC1, 0x81, 0x40, 0x00, 0xC1, 0x81, 0x40,
    0x01, 0xC0, 0x80, 0x41, 0x01, 0xC0, 0x80, 0x41, 0x00, 0xC1,
    0x81, 0x40, 0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41,
    0x00, 0xC1, 0x81, 0x40, 0x01, 0xC0, 0x80, 0x41, 0x01, 0xC0,
    0x80, 0x41, 0x00, 0xC1, 0x81, 0x40,
];

#[rustfmt::skip]
const CRC_TABLE_LO: [u8; 256] = [
    0x00, 0xC0, 0xC1, 0x01, 0xC3, 0x03, 0x02, 0xC2, 0xC6, 0x06,
    0x07, 0xC7, 0x05, 0xC5, 0xC4, 0x04, 0xCC, 0x0C, 0x0D, 0xCD,
    0x0F, 0xCF, 0xCE, 0x0E, 0x0A, 0xCA, 0xCB, 0x0B, 0xC9, 0x09,
    0x08, 0xC8, 0xD8, 0x18, 0x19, 0xD9, 0x1B, 0xDB, 0xDA, 0x1A,
    0x1E, 0xDE, 0xDF, 0x1F, 0xDD, 0x1D, 0x1C, 0xDC, 0x14, 0xD4,
    0xD5, 0x15, 0xD7, 0x17, 0x16, 0xD6, 0xD2, 0x12, 0x13, 0xD3,
    0x11, 0xD1, 0xD0, 0x10, 0xF0, 0x30, 0x31, 0xF1, 0x33, 0xF3,
    0xF2, 0x32, 0x36, 0xF6, 0xF7, 0x37, 0xF5, 0x35, 0x34, 0xF4,
    0x3C, 0xFC, 0xFD, 0x3D, 0xFF, 0x3F, 0x3E, 0xFE, 0xFA, 0x3A,
    0x3B, 0xFB, 0x39, 0xF9, 0xF8, 0x38, 0x28, 0xE8, 0xE9, 0x29,
    0xEB, 0x2B, 0x2A, 0xEA, 0xEE, 0x2E, 0x2F, 0xEF, 0x2D, 0xED,
    0xEC, 0x2C, 0xE4, 0x24, 0x25, 0xE5, 0x27, 0xE7, 0xE6, 0x26,
    0x22, 0xE2, 0xE3, 0x23, 0xE1, 0x21, 0x20, 0xE0, 0xA0, 0x60,
    0x61, 0xA1, 0x63, 0xA3, 0xA2, 0x62, 0x66, 0xA6, 0xA7, 0x67,
    0xA5, 0x65, 0x64, 0xA4, 0x6C, 0xAC, 0xAD, 0x6D, 0xAF, 0x6F,
    0x6E, 0xAE, 0xAA, 0x6A, 0x6B, 0xAB, 0x69, 0xA9, 0xA8, 0x68,
    0x78, 0xB8, 0xB9, 0x79, 0xBB, 0x7B, 0x7A, 0xBA, 0xBE, 0x7E,
    0x7F, 0xBF, 0x7D, 0xBD, 0xBC, 0x7C, 0xB4, 0x74, 0x75, 0xB5,
    0x77, 0xB7, 0xB6, 0x76, 0x72, 0xB2, 0xB3, 0x73, 0xB1, 0x71,
    0x70, 0xB0, 0x50, 0x90, 0x91, 0x51, 0x93, 0x53, 0x52, 0x92,
    0x96, 0x56, 0x57, 0x97, 0x55, 0x95, 0x94, 0x54, 0x9C, 0x5C,
    0x5D, 0x9D, 0x5F, 0x9F, 0x9E, 0x5E, 0x5A, 0x9A, 0x9B, 0x5B,
    0x99, 0x59, 0x58, 0x98, 0x88, 0x48, 0x49, 0x89, 0x4B, 0x8B,
    0x8A, 0x4A, 0x4E, 0x8E, 0x8F, 0x4F, 0x8D, 0x4D, 0x4C, 0x8C,
    0x44, 0x84, 0x85, 0x45, 0x87, 0x47, 0x46, 0x86, 0x82, 0x42,
    0x43, 0x83, 0x41, 0x81, 0x80, 0x40,
];

/// Compute the CRC over a byte span. The high byte of the result is the
/// first byte on the wire.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc_hi: u8 = 0xFF;
    let mut crc_lo: u8 = 0xFF;

    for &byte in data {
        let idx = (crc_hi ^ byte) as usize;
        crc_hi = crc_lo ^ CRC_TABLE_HI[idx];
        crc_lo = CRC_TABLE_LO[idx];
    }

    ((crc_hi as u16) << 8) | crc_lo as u16
}

/// Append the CRC of `frame` to it, high byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.push((crc >> 8) as u8);
    frame.push(crc as u8);
}

/// Verify the trailing two bytes of `frame` against the CRC of the rest.
pub fn check_crc(frame: &[u8]) -> ModbusResult<()> {
    if frame.len() < 4 {
        return Err(ModbusError::invalid_data(format!(
            "frame too short for CRC check ({} bytes)",
            frame.len()
        )));
    }

    let split = frame.len() - 2;
    let computed = crc16(&frame[..split]);
    let received = u16::from_be_bytes([frame[split], frame[split + 1]]);

    if computed == received {
        Ok(())
    } else {
        Err(ModbusError::crc_mismatch(computed, received))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        // Checked against external Modbus references.
        let cases: &[(&[u8], [u8; 2])] = &[
            (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01], [0x84, 0x0A]),
            (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02], [0xC4, 0x0B]),
            (&[0x01, 0x04, 0x00, 0x00, 0x00, 0x01], [0x31, 0xCA]),
            (&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03], [0x98, 0x0B]),
            (&[0x01, 0x01, 0x00, 0x13, 0x00, 0x25], [0x0C, 0x14]),
            (&[0x01, 0x83, 0x02], [0xC0, 0xF1]),
            (&[0x01, 0x03, 0x02, 0x12, 0x34], [0xB5, 0x33]),
        ];

        for (data, wire) in cases {
            let crc = crc16(data);
            assert_eq!(
                [(crc >> 8) as u8, crc as u8],
                *wire,
                "wire bytes for {data:02X?}"
            );
        }
    }

    #[test]
    fn test_matches_registry_crate() {
        // The table pair must agree with CRC-16/MODBUS for arbitrary input;
        // the registry value is byte-swapped relative to wire order.
        let reference = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);
        let mut data = Vec::new();
        for i in 0..257u16 {
            data.push((i % 251) as u8);
            let ours = crc16(&data);
            let theirs = reference.checksum(&data);
            assert_eq!(ours, theirs.swap_bytes(), "length {}", data.len());
        }
    }

    #[test]
    fn test_append_and_check() {
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        append_crc(&mut frame);
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
        assert!(check_crc(&frame).is_ok());
    }

    #[test]
    fn test_single_byte_flips_detected() {
        let mut frame = vec![0x01, 0x03, 0x02, 0x12, 0x34];
        append_crc(&mut frame);

        for i in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[i] ^= 1 << bit;
                assert!(
                    check_crc(&corrupted).is_err(),
                    "flip of bit {bit} in byte {i} went undetected"
                );
            }
        }
    }

    #[test]
    fn test_too_short() {
        assert!(check_crc(&[0x01, 0x84, 0x0A]).is_err());
    }
}
