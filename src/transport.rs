//! Transport layer: byte-oriented I/O over a TCP socket or serial device.
//!
//! Both transports implement [`ModbusTransport`]: encode a request ADU,
//! write it, hand the stream to the receive state machine, decode the
//! reply. The PDU is identical across transports; only the framing around
//! it differs, and that lives in [`crate::frame`].
//!
//! Opening is an explicit step separate from construction, and a closed
//! transport can be re-opened — the recovery policy in the client layer
//! relies on both.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{SerialPort, SerialStream};

use crate::error::{ModbusError, ModbusResult};
use crate::frame::{self, FrameKind};
use crate::protocol::{ModbusRequest, ModbusResponse, ModbusFunction};
use crate::receive::{self, ReceiveTimeouts};
use crate::utils::format::bytes_to_hex;
use crate::utils::timing;

/// IP type-of-service value requesting minimal delay.
const IPTOS_LOWDELAY: u32 = 0x10;

/// Baud rates the serial layer accepts; anything else falls back to 9600.
pub const SUPPORTED_BAUD_RATES: [u32; 11] = [
    110, 300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
];

/// Transport layer trait shared by the TCP and RTU implementations.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Open the underlying device or connection.
    async fn open(&mut self) -> ModbusResult<()>;

    /// Send a request and receive the matching reply.
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse>;

    /// Discard any bytes queued on the link, both directions where the
    /// device supports it.
    async fn flush(&mut self) -> ModbusResult<()>;

    /// Close the transport. The value stays usable for a later `open`.
    async fn close(&mut self) -> ModbusResult<()>;

    fn is_connected(&self) -> bool;

    /// Enable hex dumps of every transmitted and received frame.
    fn set_debug(&mut self, debug: bool);

    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Decode a received ADU against the request that elicited it.
///
/// Exception frames become `ModbusError::Exception` for legal codes and
/// `InvalidExceptionCode` otherwise; a reply whose function byte matches
/// neither the request nor its exception form is `InvalidData`.
fn decode_adu(
    kind: FrameKind,
    adu: &[u8],
    request: &ModbusRequest,
) -> ModbusResult<ModbusResponse> {
    let offset = kind.fc_offset();
    if adu.len() < offset + 2 {
        return Err(ModbusError::invalid_data("reply shorter than a PDU"));
    }

    let unit_id = adu[offset - 1];
    let function_byte = adu[offset];
    let request_fc = request.function.to_u8();

    if function_byte == request_fc | 0x80 {
        let code = adu[offset + 1];
        if code == 0 || code > 0x0B {
            return Err(ModbusError::InvalidExceptionCode { code });
        }
        return Err(ModbusError::exception(request_fc, code));
    }

    if function_byte != request_fc {
        return Err(ModbusError::invalid_data(format!(
            "reply function 0x{function_byte:02X} does not match request 0x{request_fc:02X}"
        )));
    }

    let data = adu[offset + 1..adu.len() - kind.checksum_len()].to_vec();
    Ok(ModbusResponse::new_success(
        unit_id,
        ModbusFunction::from_u8(function_byte)?,
        data,
    ))
}

/// Modbus TCP transport.
pub struct TcpTransport {
    address: SocketAddr,
    stream: Option<TcpStream>,
    timeouts: ReceiveTimeouts,
    write_timeout: Duration,
    transaction_id: u16,
    debug: bool,
    stats: TransportStats,
}

impl TcpTransport {
    /// Create an unopened transport for `address`. `response_timeout`
    /// bounds the wait for the start of each reply.
    pub fn new(address: SocketAddr, response_timeout: Duration) -> Self {
        Self {
            address,
            stream: None,
            timeouts: ReceiveTimeouts {
                frame_start: response_timeout,
                ..ReceiveTimeouts::default()
            },
            write_timeout: response_timeout,
            transaction_id: 0,
            debug: false,
            stats: TransportStats::default(),
        }
    }

    /// Create and immediately open a transport.
    pub async fn connect(address: SocketAddr, response_timeout: Duration) -> ModbusResult<Self> {
        let mut transport = Self::new(address, response_timeout);
        transport.open().await?;
        Ok(transport)
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Next transaction id, incremented before each request and wrapping
    /// at 0xFFFF back to 0.
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn open(&mut self) -> ModbusResult<()> {
        let stream = TcpStream::connect(self.address).await.map_err(|e| {
            ModbusError::io(format!("failed to connect to {}: {e}", self.address))
        })?;

        stream
            .set_nodelay(true)
            .map_err(|e| ModbusError::io(format!("TCP_NODELAY: {e}")))?;

        // Low-delay TOS is best effort; not every platform honors it.
        #[cfg(unix)]
        if let Err(e) = socket2::SockRef::from(&stream).set_tos(IPTOS_LOWDELAY) {
            warn!("could not set IP_TOS on {}: {e}", self.address);
        }

        self.stream = Some(stream);
        Ok(())
    }

    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let txn_id = self.next_transaction_id();
        let adu = frame::build_request_adu(FrameKind::Tcp, txn_id, request);
        let expected = frame::expected_response_length(FrameKind::Tcp, request);
        let debug_frames = self.debug;
        let write_timeout = self.write_timeout;
        let timeouts = self.timeouts;
        let stream = self.stream.as_mut().ok_or(ModbusError::ConnectionClosed)?;

        if debug_frames {
            debug!("send: {}", bytes_to_hex(&adu));
        }

        let sent = timeout(write_timeout, stream.write_all(&adu))
            .await
            .map_err(|_| {
                ModbusError::timeout("send request", write_timeout.as_millis() as u64)
            })
            .and_then(|r| r.map_err(ModbusError::from));
        if let Err(e) = sent {
            self.stats.errors += 1;
            return Err(e);
        }
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += adu.len() as u64;

        // Broadcast writes get no reply at all.
        if request.unit_id == crate::protocol::BROADCAST_ADDRESS {
            return Ok(ModbusResponse::new_success(
                request.unit_id,
                request.function,
                Vec::new(),
            ));
        }

        let reply = match receive::read_reply(stream, FrameKind::Tcp, expected, &timeouts).await {
            Ok(reply) => reply,
            Err(e) => {
                if matches!(e, ModbusError::Timeout { .. }) {
                    self.stats.timeouts += 1;
                }
                self.stats.errors += 1;
                return Err(e);
            }
        };

        if debug_frames {
            debug!("recv: {}", bytes_to_hex(&reply));
        }
        self.stats.responses_received += 1;
        self.stats.bytes_received += reply.len() as u64;

        frame::check_mbap(&reply, txn_id)?;
        decode_adu(FrameKind::Tcp, &reply, request)
    }

    async fn flush(&mut self) -> ModbusResult<()> {
        let debug_frames = self.debug;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(()),
        };

        // Drain whatever the peer left on the socket without blocking.
        let mut devnull = [0u8; crate::MAX_TCP_FRAME_SIZE];
        let mut flushed = 0usize;
        loop {
            match stream.try_read(&mut devnull) {
                Ok(0) => break,
                Ok(n) => flushed += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(ModbusError::from(e)),
            }
        }
        if debug_frames && flushed > 0 {
            debug!("{flushed} bytes flushed");
        }
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Serial parity configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialParity {
    None,
    Even,
    Odd,
}

/// Serial data bits (5-8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialDataBits {
    Five,
    Six,
    Seven,
    Eight,
}

/// Serial stop bits (1 or 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialStopBits {
    One,
    Two,
}

/// Serial line parameters for an RTU session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub device: String,
    pub baud: u32,
    pub parity: SerialParity,
    pub data_bits: SerialDataBits,
    pub stop_bits: SerialStopBits,
}

impl SerialConfig {
    /// 8N1 line settings on `device` at `baud`.
    pub fn new<S: Into<String>>(device: S, baud: u32) -> Self {
        Self {
            device: device.into(),
            baud,
            parity: SerialParity::None,
            data_bits: SerialDataBits::Eight,
            stop_bits: SerialStopBits::One,
        }
    }

    /// The baud rate actually applied: unsupported values fall back to
    /// 9600 with a warning.
    pub fn effective_baud(&self) -> u32 {
        if SUPPORTED_BAUD_RATES.contains(&self.baud) {
            self.baud
        } else {
            warn!(
                "unsupported baud rate {} on {}, using 9600",
                self.baud, self.device
            );
            9600
        }
    }

    pub(crate) fn to_builder(&self) -> tokio_serial::SerialPortBuilder {
        let parity = match self.parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Even => tokio_serial::Parity::Even,
            SerialParity::Odd => tokio_serial::Parity::Odd,
        };
        let data_bits = match self.data_bits {
            SerialDataBits::Five => tokio_serial::DataBits::Five,
            SerialDataBits::Six => tokio_serial::DataBits::Six,
            SerialDataBits::Seven => tokio_serial::DataBits::Seven,
            SerialDataBits::Eight => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.stop_bits {
            SerialStopBits::One => tokio_serial::StopBits::One,
            SerialStopBits::Two => tokio_serial::StopBits::Two,
        };

        tokio_serial::new(&self.device, self.effective_baud())
            .parity(parity)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
    }
}

/// Modbus RTU transport over a serial device.
pub struct RtuTransport {
    config: SerialConfig,
    serial: Option<SerialStream>,
    timeouts: ReceiveTimeouts,
    debug: bool,
    stats: TransportStats,
}

impl RtuTransport {
    /// Create an unopened transport. `response_timeout` bounds the wait
    /// for the start of each reply; the inter-character timeout is derived
    /// from the baud rate when the port opens.
    pub fn new(config: SerialConfig, response_timeout: Duration) -> Self {
        Self {
            config,
            serial: None,
            timeouts: ReceiveTimeouts {
                frame_start: response_timeout,
                ..ReceiveTimeouts::default()
            },
            debug: false,
            stats: TransportStats::default(),
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    async fn open(&mut self) -> ModbusResult<()> {
        let baud = self.config.effective_baud();
        let serial = SerialStream::open(&self.config.to_builder())?;

        // The frame boundary on a quiet line is 3.5 character times;
        // never let the inter-character timeout drop below that.
        let gap = Duration::from_micros(timing::frame_gap_us(baud) as u64);
        self.timeouts.inter_char = self.timeouts.inter_char.max(gap);

        self.serial = Some(serial);
        Ok(())
    }

    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let adu = frame::build_request_adu(FrameKind::Rtu, 0, request);
        let expected = frame::expected_response_length(FrameKind::Rtu, request);
        let debug_frames = self.debug;
        let write_timeout = self.timeouts.frame_start;
        let timeouts = self.timeouts;
        let serial = self.serial.as_mut().ok_or(ModbusError::ConnectionClosed)?;

        if debug_frames {
            debug!("send: {}", bytes_to_hex(&adu));
        }

        let sent = timeout(write_timeout, serial.write_all(&adu))
            .await
            .map_err(|_| {
                ModbusError::timeout("send request", write_timeout.as_millis() as u64)
            })
            .and_then(|r| r.map_err(ModbusError::from));
        if let Err(e) = sent {
            self.stats.errors += 1;
            return Err(e);
        }
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += adu.len() as u64;

        // Broadcast writes get no reply at all.
        if request.unit_id == crate::protocol::BROADCAST_ADDRESS {
            return Ok(ModbusResponse::new_success(
                request.unit_id,
                request.function,
                Vec::new(),
            ));
        }

        let reply = match receive::read_reply(serial, FrameKind::Rtu, expected, &timeouts).await {
            Ok(reply) => reply,
            Err(e) => {
                if matches!(e, ModbusError::Timeout { .. }) {
                    self.stats.timeouts += 1;
                }
                self.stats.errors += 1;
                return Err(e);
            }
        };

        if debug_frames {
            debug!("recv: {}", bytes_to_hex(&reply));
        }
        self.stats.responses_received += 1;
        self.stats.bytes_received += reply.len() as u64;

        decode_adu(FrameKind::Rtu, &reply, request)
    }

    async fn flush(&mut self) -> ModbusResult<()> {
        if let Some(serial) = self.serial.as_mut() {
            serial
                .clear(tokio_serial::ClearBuffer::All)
                .map_err(ModbusError::from)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        // Dropping the stream releases the descriptor; the driver restores
        // the saved line settings.
        self.serial.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.serial.is_some()
    }

    fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
