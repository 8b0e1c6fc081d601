//! Frame construction and length arithmetic for the two transports.
//!
//! RTU and TCP share the same PDU but differ in header, length
//! determination, and integrity check:
//!
//! | Region            | RTU             | TCP (MBAP)                  |
//! |-------------------|-----------------|-----------------------------|
//! | Header            | unit id (1)     | txn, proto, length, unit (7)|
//! | Function code at  | offset 1        | offset 7                    |
//! | Checksum          | CRC-16 (2)      | none                        |
//! | Max ADU           | 256             | 260                         |
//!
//! [`expected_response_length`] predicts the exact size of a client's
//! reply from the request just sent, and the `header_extension` /
//! `data_extension` pair drives the incremental server-side receive where
//! the inbound length is discovered from the partially-observed frame.

use crate::crc;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, UnitId};

/// Transport framing selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Rtu,
    Tcp,
}

impl FrameKind {
    /// Bytes before the function code.
    pub fn header_len(self) -> usize {
        match self {
            FrameKind::Rtu => 1,
            FrameKind::Tcp => 7,
        }
    }

    /// Trailing integrity-check bytes.
    pub fn checksum_len(self) -> usize {
        match self {
            FrameKind::Rtu => 2,
            FrameKind::Tcp => 0,
        }
    }

    /// Largest legal ADU for the transport.
    pub fn max_adu(self) -> usize {
        match self {
            FrameKind::Rtu => crate::MAX_RTU_FRAME_SIZE,
            FrameKind::Tcp => crate::MAX_TCP_FRAME_SIZE,
        }
    }

    /// Offset of the function code byte.
    pub fn fc_offset(self) -> usize {
        self.header_len()
    }

    /// Total length of an exception response: header + function + code
    /// + checksum (5 for RTU, 9 for TCP).
    pub fn exception_frame_len(self) -> usize {
        self.header_len() + 2 + self.checksum_len()
    }
}

/// Expected total reply length for a request, or `Undefined` when only
/// the reply itself can tell (report-server-id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedLength {
    Known(usize),
    Undefined,
}

/// Compute the exact number of bytes the reply to `request` will occupy
/// on the wire, checksum included.
pub fn expected_response_length(kind: FrameKind, request: &ModbusRequest) -> ExpectedLength {
    let quantity = request.quantity as usize;
    // fc + byte count, then the payload the byte count describes.
    let body = match request.function {
        ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
            2 + quantity.div_ceil(8)
        }
        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
            2 + request.data_type.bytes_per_value() * quantity
        }
        ModbusFunction::ReadExceptionStatus => 3,
        ModbusFunction::ReportServerId => return ExpectedLength::Undefined,
        // Single and multiple writes echo fc + address + quantity/value.
        _ => 5,
    };

    ExpectedLength::Known(kind.header_len() + body + kind.checksum_len())
}

/// First extension of an inbound frame of unknown length: once the
/// function byte is visible, how many more bytes belong to the fixed part
/// of the PDU.
pub fn header_extension(function_byte: u8) -> usize {
    match function_byte {
        // Reads and single writes: address + quantity/value.
        0x01..=0x06 => 4,
        // Multiple writes: address + quantity + byte count.
        0x0F | 0x10 => 5,
        // Report server id: byte count.
        0x11 => 1,
        _ => 0,
    }
}

/// Second extension: the embedded byte count (for the functions that
/// carry one) plus the checksum. `frame` must already contain the header
/// extension bytes.
pub fn data_extension(kind: FrameKind, frame: &[u8]) -> usize {
    let offset = kind.fc_offset();
    let embedded = match frame[offset] {
        0x0F | 0x10 => frame[offset + 5] as usize,
        0x11 => frame[offset + 1] as usize,
        _ => 0,
    };
    embedded + kind.checksum_len()
}

/// Write the MBAP length field: number of bytes following it (unit id
/// plus PDU).
pub fn set_mbap_length(frame: &mut [u8]) {
    let mbap_length = (frame.len() - 6) as u16;
    frame[4] = (mbap_length >> 8) as u8;
    frame[5] = mbap_length as u8;
}

/// Build the complete request ADU for a transport. For TCP the caller
/// supplies the transaction id; it is ignored for RTU.
pub fn build_request_adu(kind: FrameKind, txn_id: u16, request: &ModbusRequest) -> Vec<u8> {
    let mut frame = Vec::with_capacity(kind.header_len() + 7 + request.data.len());

    if kind == FrameKind::Tcp {
        frame.extend_from_slice(&txn_id.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00]); // protocol id
        frame.extend_from_slice(&[0x00, 0x00]); // length, fixed up below
    }
    frame.push(request.unit_id);
    frame.push(request.function.to_u8());

    match request.function {
        ModbusFunction::ReadCoils
        | ModbusFunction::ReadDiscreteInputs
        | ModbusFunction::ReadHoldingRegisters
        | ModbusFunction::ReadInputRegisters => {
            frame.extend_from_slice(&request.address.to_be_bytes());
            frame.extend_from_slice(&request.quantity.to_be_bytes());
        }
        ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
            frame.extend_from_slice(&request.address.to_be_bytes());
            if request.data.len() >= 2 {
                frame.extend_from_slice(&request.data[0..2]);
            } else {
                frame.extend_from_slice(&[0x00, 0x00]);
            }
        }
        ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
            frame.extend_from_slice(&request.address.to_be_bytes());
            frame.extend_from_slice(&request.quantity.to_be_bytes());
            frame.push(request.data.len() as u8);
            frame.extend_from_slice(&request.data);
        }
        ModbusFunction::ReadExceptionStatus | ModbusFunction::ReportServerId => {}
    }

    finish_adu(kind, &mut frame);
    frame
}

/// Start a response ADU: header bytes through the function code.
pub fn build_response_header(
    kind: FrameKind,
    txn_id: u16,
    unit_id: UnitId,
    function_byte: u8,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(kind.header_len() + 8);
    if kind == FrameKind::Tcp {
        frame.extend_from_slice(&txn_id.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&[0x00, 0x00]);
    }
    frame.push(unit_id);
    frame.push(function_byte);
    frame
}

/// Seal an ADU for transmission: append the CRC for RTU, fix up the MBAP
/// length for TCP.
pub fn finish_adu(kind: FrameKind, frame: &mut Vec<u8>) {
    match kind {
        FrameKind::Rtu => crc::append_crc(frame),
        FrameKind::Tcp => set_mbap_length(frame),
    }
}

/// Validate the fixed MBAP fields of a received TCP frame against the
/// transaction id of the request that elicited it.
pub fn check_mbap(frame: &[u8], expected_txn: u16) -> ModbusResult<()> {
    let txn = u16::from_be_bytes([frame[0], frame[1]]);
    let proto = u16::from_be_bytes([frame[2], frame[3]]);
    if proto != 0 {
        return Err(ModbusError::invalid_data(format!(
            "nonzero MBAP protocol id 0x{proto:04X}"
        )));
    }
    if txn != expected_txn {
        return Err(ModbusError::invalid_data(format!(
            "transaction id mismatch: sent {expected_txn}, got {txn}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DataType;

    #[test]
    fn test_geometry() {
        assert_eq!(FrameKind::Rtu.header_len(), 1);
        assert_eq!(FrameKind::Tcp.header_len(), 7);
        assert_eq!(FrameKind::Rtu.exception_frame_len(), 5);
        assert_eq!(FrameKind::Tcp.exception_frame_len(), 9);
        assert_eq!(FrameKind::Rtu.max_adu(), 256);
        assert_eq!(FrameKind::Tcp.max_adu(), 260);
    }

    #[test]
    fn test_expected_length_bits() {
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadCoils, 0, 10);
        // 1 + (fc + count + 2 packed bytes) + crc
        assert_eq!(
            expected_response_length(FrameKind::Rtu, &request),
            ExpectedLength::Known(1 + 2 + 2 + 2)
        );
        assert_eq!(
            expected_response_length(FrameKind::Tcp, &request),
            ExpectedLength::Known(7 + 2 + 2)
        );

        let request = ModbusRequest::new_read(1, ModbusFunction::ReadDiscreteInputs, 0, 16);
        assert_eq!(
            expected_response_length(FrameKind::Rtu, &request),
            ExpectedLength::Known(1 + 2 + 2 + 2)
        );
    }

    #[test]
    fn test_expected_length_registers_by_type() {
        for (data_type, per_value) in [
            (DataType::Int8, 1),
            (DataType::UInt8, 1),
            (DataType::Int16, 2),
            (DataType::UInt16, 2),
            (DataType::Int32, 4),
            (DataType::UInt32, 4),
            (DataType::Float32, 4),
            (DataType::Int64, 8),
            (DataType::UInt64, 8),
            (DataType::Float64, 8),
        ] {
            let request = ModbusRequest::new_read_typed(
                1,
                ModbusFunction::ReadHoldingRegisters,
                0,
                3,
                data_type,
            );
            assert_eq!(
                expected_response_length(FrameKind::Rtu, &request),
                ExpectedLength::Known(1 + 2 + 3 * per_value + 2),
                "{data_type:?}"
            );
        }
    }

    #[test]
    fn test_expected_length_other_functions() {
        let request = ModbusRequest::new_bare(1, ModbusFunction::ReadExceptionStatus);
        assert_eq!(
            expected_response_length(FrameKind::Rtu, &request),
            ExpectedLength::Known(1 + 3 + 2)
        );

        let request = ModbusRequest::new_bare(1, ModbusFunction::ReportServerId);
        assert_eq!(
            expected_response_length(FrameKind::Rtu, &request),
            ExpectedLength::Undefined
        );

        let request = ModbusRequest::new_write(
            1,
            ModbusFunction::WriteSingleRegister,
            0,
            1,
            vec![0x00, 0x03],
        );
        assert_eq!(
            expected_response_length(FrameKind::Rtu, &request),
            ExpectedLength::Known(1 + 5 + 2)
        );
        assert_eq!(
            expected_response_length(FrameKind::Tcp, &request),
            ExpectedLength::Known(7 + 5)
        );
    }

    #[test]
    fn test_header_extension() {
        for fc in 0x01..=0x06 {
            assert_eq!(header_extension(fc), 4, "fc {fc:#04x}");
        }
        assert_eq!(header_extension(0x0F), 5);
        assert_eq!(header_extension(0x10), 5);
        assert_eq!(header_extension(0x11), 1);
        assert_eq!(header_extension(0x07), 0);
        assert_eq!(header_extension(0x42), 0);
    }

    #[test]
    fn test_data_extension() {
        // RTU write-multiple-registers with byte count 4 at offset 6.
        let frame = [0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04];
        assert_eq!(data_extension(FrameKind::Rtu, &frame), 4 + 2);

        // Report-server-id reply: byte count right after the function.
        let frame = [0x01, 0x11, 0x03];
        assert_eq!(data_extension(FrameKind::Rtu, &frame), 3 + 2);

        // Read request: only the checksum remains.
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(data_extension(FrameKind::Rtu, &frame), 2);
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(data_extension(FrameKind::Tcp, &frame), 0);
    }

    #[test]
    fn test_build_rtu_read_request() {
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 1);
        let adu = build_request_adu(FrameKind::Rtu, 0, &request);
        assert_eq!(adu, [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_build_tcp_read_request() {
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadDiscreteInputs, 0, 10);
        let adu = build_request_adu(FrameKind::Tcp, 0x0001, &request);
        assert_eq!(
            adu,
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x02, 0x00, 0x00, 0x00, 0x0A]
        );
    }

    #[test]
    fn test_build_write_multiple_coils_request() {
        let request = ModbusRequest::new_write(
            1,
            ModbusFunction::WriteMultipleCoils,
            0x0013,
            10,
            vec![0xCD, 0x01],
        );
        let adu = build_request_adu(FrameKind::Rtu, 0, &request);
        assert_eq!(
            &adu[..adu.len() - 2],
            [0x01, 0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );
        assert!(crate::crc::check_crc(&adu).is_ok());
    }

    #[test]
    fn test_bare_request_pdu() {
        let request = ModbusRequest::new_bare(1, ModbusFunction::ReportServerId);
        let adu = build_request_adu(FrameKind::Rtu, 0, &request);
        assert_eq!(&adu[..2], [0x01, 0x11]);
        assert_eq!(adu.len(), 4);
    }

    #[test]
    fn test_mbap_length_fixup() {
        let mut frame = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x03, 0x02, 0x12, 0x34];
        set_mbap_length(&mut frame);
        assert_eq!(frame[4], 0x00);
        assert_eq!(frame[5], 0x05);
    }

    #[test]
    fn test_check_mbap() {
        let frame = [0x00, 0x07, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34];
        assert!(check_mbap(&frame, 7).is_ok());
        assert!(check_mbap(&frame, 8).is_err());

        let bad_proto = [0x00, 0x07, 0x00, 0x01, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34];
        assert!(check_mbap(&bad_proto, 7).is_err());
    }
}
