//! Frame assembly: the receive state machine.
//!
//! Two entry points with different contracts:
//!
//! * [`read_reply`] — the client side. The caller knows (or can compute)
//!   the exact reply length from the request it just sent. The function
//!   byte is examined as soon as it arrives: a set 0x80 bit reroutes the
//!   read to the short exception frame, so a slave that answered an error
//!   is parsed as that error instead of timing out on the longer frame.
//! * [`read_query`] — the server side. The inbound length is unknown and
//!   is discovered incrementally: first the function code, then the fixed
//!   part of the PDU it implies, then any embedded byte count.
//!
//! Two timeouts govern every read: `frame_start` bounds the silence before
//! the first byte, `inter_char` bounds the silence between bytes of one
//! frame. A connection that returns zero bytes mid-frame surfaces as
//! `ConnectionClosed`. RTU frames are CRC-checked before delivery; TCP
//! frames must have their declared MBAP length match the assembled bytes.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::crc;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{data_extension, header_extension, ExpectedLength, FrameKind};

/// Per-phase receive timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveTimeouts {
    /// Maximum silence before the first byte of a frame.
    pub frame_start: Duration,
    /// Maximum silence between consecutive bytes of one frame.
    pub inter_char: Duration,
}

impl ReceiveTimeouts {
    pub fn new(frame_start: Duration, inter_char: Duration) -> Self {
        Self {
            frame_start,
            inter_char,
        }
    }
}

impl Default for ReceiveTimeouts {
    fn default() -> Self {
        Self {
            frame_start: Duration::from_millis(crate::TIME_OUT_BEGIN_OF_FRAME_MS),
            inter_char: Duration::from_millis(crate::TIME_OUT_END_OF_FRAME_MS),
        }
    }
}

/// Read until `buf` holds `target` bytes. The first byte of the frame is
/// awaited under `frame_start`, every later read under `inter_char`.
async fn fill<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    target: usize,
    timeouts: &ReceiveTimeouts,
    operation: &str,
) -> ModbusResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; crate::MAX_TCP_FRAME_SIZE];

    while buf.len() < target {
        let wait = if buf.is_empty() {
            timeouts.frame_start
        } else {
            timeouts.inter_char
        };
        let want = target - buf.len();

        let read = timeout(wait, reader.read(&mut chunk[..want]))
            .await
            .map_err(|_| ModbusError::timeout(operation, wait.as_millis() as u64))?;
        let n = read?;
        if n == 0 {
            return Err(ModbusError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Ok(())
}

/// Receive a client reply of `expected` length.
///
/// Returns the complete ADU, checksum included, with transport integrity
/// already established (CRC for RTU). Exception frames are returned
/// as-is; classifying them is the caller's job.
pub async fn read_reply<R>(
    reader: &mut R,
    kind: FrameKind,
    expected: ExpectedLength,
    timeouts: &ReceiveTimeouts,
) -> ModbusResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if let ExpectedLength::Known(n) = expected {
        if n > kind.max_adu() {
            return Err(ModbusError::invalid_data(format!(
                "expected reply of {n} bytes exceeds the {} byte ADU limit",
                kind.max_adu()
            )));
        }
    }

    let mut buf = BytesMut::with_capacity(kind.max_adu());

    match kind {
        FrameKind::Tcp => {
            // The MBAP length field is authoritative for TCP.
            fill(reader, &mut buf, 6, timeouts, "read MBAP header").await?;
            let declared = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            let total = 6 + declared;
            if declared < 2 || total > kind.max_adu() {
                return Err(ModbusError::invalid_data(format!(
                    "MBAP length {declared} out of range"
                )));
            }
            fill(reader, &mut buf, total, timeouts, "read reply body").await?;
        }
        FrameKind::Rtu => {
            // Unit id + function code first; the function byte decides
            // whether the short exception frame or the full reply follows.
            fill(reader, &mut buf, 2, timeouts, "read reply start").await?;
            let function_byte = buf[1];

            let total = if function_byte & 0x80 != 0 {
                kind.exception_frame_len()
            } else {
                match expected {
                    ExpectedLength::Known(n) => n,
                    ExpectedLength::Undefined => {
                        // Report-server-id: the embedded byte count sizes
                        // the rest of the frame.
                        fill(reader, &mut buf, 3, timeouts, "read reply byte count").await?;
                        let total = 3 + buf[2] as usize + kind.checksum_len();
                        if total > kind.max_adu() {
                            return Err(ModbusError::invalid_data(format!(
                                "reply byte count {} overflows the ADU limit",
                                buf[2]
                            )));
                        }
                        total
                    }
                }
            };

            fill(reader, &mut buf, total, timeouts, "read reply body").await?;
            crc::check_crc(&buf)?;
        }
    }

    Ok(buf.to_vec())
}

/// Receive a query of unknown length (server side).
///
/// The expected length starts at header + 1 (through the function code)
/// and is extended twice: by the fixed PDU bytes the function implies,
/// then by any embedded byte count plus the checksum. Exceeding the
/// transport's maximum ADU at either step fails with `InvalidData`.
pub async fn read_query<R>(
    reader: &mut R,
    kind: FrameKind,
    timeouts: &ReceiveTimeouts,
) -> ModbusResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(kind.max_adu());

    // Phase 1: everything through the function code.
    let mut target = kind.header_len() + 1;
    fill(reader, &mut buf, target, timeouts, "read query start").await?;

    // Phase 2: the fixed PDU bytes this function carries.
    target += header_extension(buf[kind.fc_offset()]);
    if target > kind.max_adu() {
        return Err(ModbusError::invalid_data("query exceeds the ADU limit"));
    }
    fill(reader, &mut buf, target, timeouts, "read query header").await?;

    // Phase 3: embedded byte count plus checksum.
    target += data_extension(kind, &buf);
    if target > kind.max_adu() {
        return Err(ModbusError::invalid_data("query exceeds the ADU limit"));
    }
    fill(reader, &mut buf, target, timeouts, "read query body").await?;

    match kind {
        FrameKind::Rtu => crc::check_crc(&buf)?,
        FrameKind::Tcp => {
            let declared = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            if declared != buf.len() - 6 {
                return Err(ModbusError::invalid_data(format!(
                    "MBAP length {declared} does not match the {} received bytes",
                    buf.len() - 6
                )));
            }
        }
    }

    Ok(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn fast_timeouts() -> ReceiveTimeouts {
        ReceiveTimeouts::new(Duration::from_millis(100), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_read_known_rtu_reply() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let reply = [0x01, 0x03, 0x02, 0x12, 0x34, 0xB5, 0x33];
        tx.write_all(&reply).await.unwrap();

        let frame = read_reply(
            &mut rx,
            FrameKind::Rtu,
            ExpectedLength::Known(7),
            &fast_timeouts(),
        )
        .await
        .unwrap();
        assert_eq!(frame, reply);
    }

    #[tokio::test]
    async fn test_read_reply_in_fragments() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let reply = [0x01, 0x03, 0x02, 0x12, 0x34, 0xB5, 0x33];

        let writer = tokio::spawn(async move {
            for chunk in reply.chunks(3) {
                tx.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tx
        });

        let frame = read_reply(
            &mut rx,
            FrameKind::Rtu,
            ExpectedLength::Known(7),
            &fast_timeouts(),
        )
        .await
        .unwrap();
        assert_eq!(frame, reply);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_short_exception_reply_instead_of_data() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        // Expected 7 bytes, but the slave answered with the 5-byte
        // exception frame for illegal data address.
        tx.write_all(&[0x01, 0x83, 0x02, 0xC0, 0xF1]).await.unwrap();

        let frame = read_reply(
            &mut rx,
            FrameKind::Rtu,
            ExpectedLength::Known(7),
            &fast_timeouts(),
        )
        .await
        .unwrap();
        assert_eq!(frame, [0x01, 0x83, 0x02, 0xC0, 0xF1]);
    }

    #[tokio::test]
    async fn test_undefined_length_reply() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        // Report-server-id reply: byte count 3, then id/run/extra.
        let mut reply = vec![0x01, 0x11, 0x03, 0x42, 0xFF, 0x07];
        crate::crc::append_crc(&mut reply);
        tx.write_all(&reply).await.unwrap();

        let frame = read_reply(
            &mut rx,
            FrameKind::Rtu,
            ExpectedLength::Undefined,
            &fast_timeouts(),
        )
        .await
        .unwrap();
        assert_eq!(frame, reply);
    }

    #[tokio::test]
    async fn test_frame_start_timeout() {
        let (_tx, mut rx) = tokio::io::duplex(64);
        let err = read_reply(
            &mut rx,
            FrameKind::Rtu,
            ExpectedLength::Known(7),
            &fast_timeouts(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_inter_char_timeout() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&[0x01, 0x03, 0x02]).await.unwrap();

        let err = read_reply(
            &mut rx,
            FrameKind::Rtu,
            ExpectedLength::Known(7),
            &fast_timeouts(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_connection_closed_mid_frame() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&[0x01, 0x03, 0x02]).await.unwrap();
        drop(tx);

        let err = read_reply(
            &mut rx,
            FrameKind::Rtu,
            ExpectedLength::Known(7),
            &fast_timeouts(),
        )
        .await
        .unwrap_err();
        assert_eq!(err, ModbusError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_corrupted_reply_fails_crc() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        // Single flipped bit in the register payload of S1's reply.
        tx.write_all(&[0x01, 0x03, 0x02, 0x13, 0x34, 0xB5, 0x33])
            .await
            .unwrap();

        let err = read_reply(
            &mut rx,
            FrameKind::Rtu,
            ExpectedLength::Known(7),
            &fast_timeouts(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ModbusError::CrcMismatch { .. }));
    }

    #[tokio::test]
    async fn test_read_tcp_reply_by_mbap_length() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let reply = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x02, 0x02, 0x4D, 0x03,
        ];
        tx.write_all(&reply).await.unwrap();

        let frame = read_reply(
            &mut rx,
            FrameKind::Tcp,
            ExpectedLength::Known(11),
            &fast_timeouts(),
        )
        .await
        .unwrap();
        assert_eq!(frame, reply);
    }

    #[tokio::test]
    async fn test_read_rtu_query_incrementally() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let query = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];

        let writer = tokio::spawn(async move {
            // One byte at a time, exercising every extension step.
            for byte in query {
                tx.write_all(&[byte]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            tx
        });

        let frame = read_query(&mut rx, FrameKind::Rtu, &fast_timeouts())
            .await
            .unwrap();
        assert_eq!(frame, query);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_multi_write_query() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let mut query = vec![0x01, 0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01];
        crate::crc::append_crc(&mut query);
        tx.write_all(&query).await.unwrap();

        let frame = read_query(&mut rx, FrameKind::Rtu, &fast_timeouts())
            .await
            .unwrap();
        assert_eq!(frame, query);
    }

    #[tokio::test]
    async fn test_read_tcp_query() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let query = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x02, 0x00, 0x00, 0x00, 0x0A,
        ];
        tx.write_all(&query).await.unwrap();

        let frame = read_query(&mut rx, FrameKind::Tcp, &fast_timeouts())
            .await
            .unwrap();
        assert_eq!(frame, query);
    }

    #[tokio::test]
    async fn test_oversized_query_rejected() {
        let (mut tx, mut rx) = tokio::io::duplex(300);
        // Write-multiple-registers claiming 255 payload bytes: the second
        // extension pushes the total past the 256-byte RTU limit.
        let mut query = vec![0x01, 0x10, 0x00, 0x00, 0x00, 0x7D, 0xFF];
        query.resize(264, 0);
        tx.write_all(&query).await.unwrap();

        let err = read_query(&mut rx, FrameKind::Rtu, &fast_timeouts())
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
    }

    #[tokio::test]
    async fn test_tcp_query_length_must_match() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        // MBAP says 9 bytes follow, but the read-coils PDU only has 6.
        let query = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x01, 0x01, 0x00, 0x00, 0x00, 0x08,
        ];
        tx.write_all(&query).await.unwrap();

        let err = read_query(&mut rx, FrameKind::Tcp, &fast_timeouts())
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
    }
}
