//! Server (slave) implementations for TCP and RTU.
//!
//! The dispatch core, [`process_query`], is a pure function from a
//! received ADU and a register bank to an optional response ADU; both
//! the TCP accept loop and the RTU serial loop feed it frames assembled
//! by the receive state machine. Queries addressed to another unit are
//! dropped silently, broadcast queries are processed but never answered,
//! and map violations come back as exception frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

use crate::error::{ModbusError, ModbusResult};
use crate::frame::{self, FrameKind};
use crate::protocol::{data_utils, ModbusException, UnitId, BROADCAST_ADDRESS};
use crate::receive::{self, ReceiveTimeouts};
use crate::register_bank::{ModbusRegisterBank, RegisterBankStats};
use crate::transport::SerialConfig;
use crate::utils::timing;
use tokio_serial::SerialStream;

/// Modbus server trait.
#[async_trait]
pub trait ModbusServer: Send + Sync {
    async fn start(&mut self) -> ModbusResult<()>;
    async fn stop(&mut self) -> ModbusResult<()>;
    fn is_running(&self) -> bool;
    fn get_stats(&self) -> ServerStats;
    fn get_register_bank(&self) -> Arc<ModbusRegisterBank>;
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub register_bank_stats: Option<RegisterBankStats>,
}

/// Dispatch one received query against the register bank.
///
/// Returns the response ADU ready for transmission, or `None` when no
/// response must be sent: the query was addressed to another unit, it was
/// a broadcast, or the function is one the server deliberately ignores.
pub fn process_query(
    kind: FrameKind,
    query: &[u8],
    unit_id: UnitId,
    bank: &ModbusRegisterBank,
) -> Option<Vec<u8>> {
    let offset = kind.fc_offset();
    let unit = query[offset - 1];

    if unit != unit_id && unit != BROADCAST_ADDRESS {
        debug!("query for unit {unit} ignored (this server is unit {unit_id})");
        return None;
    }

    let txn_id = match kind {
        FrameKind::Tcp => u16::from_be_bytes([query[0], query[1]]),
        FrameKind::Rtu => 0,
    };
    // The trailing CRC is not part of the payload being indexed.
    let query_len = query.len() - kind.checksum_len();

    let function = query[offset];
    // Bare-PDU functions (0x07, 0x11) carry no address words at all.
    let word_at = |i: usize| u16::from_be_bytes([query[i], query[i + 1]]);

    let exception = |code: ModbusException| {
        let mut response =
            frame::build_response_header(kind, txn_id, unit, function | 0x80);
        response.push(code.to_u8());
        frame::finish_adu(kind, &mut response);
        response
    };

    let response = match function {
        0x01 | 0x02 => {
            let address = word_at(offset + 1);
            let quantity = word_at(offset + 3);
            let bits = if function == 0x01 {
                bank.read_coils(address, quantity)
            } else {
                bank.read_discrete_inputs(address, quantity)
            };
            match bits {
                Ok(bits) => {
                    let mut response =
                        frame::build_response_header(kind, txn_id, unit, function);
                    let packed = data_utils::pack_bits(&bits);
                    response.push(packed.len() as u8);
                    response.extend_from_slice(&packed);
                    frame::finish_adu(kind, &mut response);
                    response
                }
                Err(_) => {
                    warn!(
                        "illegal data address {:#06X}+{quantity} in read bits",
                        address
                    );
                    exception(ModbusException::IllegalDataAddress)
                }
            }
        }

        0x03 | 0x04 => {
            let address = word_at(offset + 1);
            let quantity = word_at(offset + 3);
            let words = if function == 0x03 {
                bank.read_holding_registers(address, quantity)
            } else {
                bank.read_input_registers(address, quantity)
            };
            match words {
                Ok(words) => {
                    let mut response =
                        frame::build_response_header(kind, txn_id, unit, function);
                    response.push((words.len() * 2) as u8);
                    response.extend_from_slice(&data_utils::registers_to_bytes(&words));
                    frame::finish_adu(kind, &mut response);
                    response
                }
                Err(_) => {
                    warn!(
                        "illegal data address {:#06X}+{quantity} in read registers",
                        address
                    );
                    exception(ModbusException::IllegalDataAddress)
                }
            }
        }

        0x05 => {
            let address = word_at(offset + 1);
            let value = word_at(offset + 3);
            if bank.read_coils(address, 1).is_err() {
                warn!("illegal data address {address:#06X} in write single coil");
                exception(ModbusException::IllegalDataAddress)
            } else if value != 0xFF00 && value != 0x0000 {
                warn!("illegal coil value {value:#06X} at address {address:#06X}");
                exception(ModbusException::IllegalDataValue)
            } else {
                // Checked one line above, the address is in range.
                let _ = bank.write_single_coil(address, value == 0xFF00);
                let mut response = query[..query_len].to_vec();
                frame::finish_adu(kind, &mut response);
                response
            }
        }

        0x06 => {
            let address = word_at(offset + 1);
            let value = word_at(offset + 3);
            match bank.write_single_register(address, value) {
                Ok(()) => {
                    let mut response = query[..query_len].to_vec();
                    frame::finish_adu(kind, &mut response);
                    response
                }
                Err(_) => {
                    warn!("illegal data address {address:#06X} in write single register");
                    exception(ModbusException::IllegalDataAddress)
                }
            }
        }

        0x0F => {
            let address = word_at(offset + 1);
            let quantity = word_at(offset + 3);
            let bits =
                data_utils::unpack_bits(&query[offset + 6..query_len], quantity as usize);
            match bank.write_multiple_coils(address, &bits) {
                Ok(()) => {
                    let mut response =
                        frame::build_response_header(kind, txn_id, unit, function);
                    response.extend_from_slice(&query[offset + 1..offset + 5]);
                    frame::finish_adu(kind, &mut response);
                    response
                }
                Err(_) => {
                    warn!(
                        "illegal data address {:#06X}+{quantity} in write multiple coils",
                        address
                    );
                    exception(ModbusException::IllegalDataAddress)
                }
            }
        }

        0x10 => {
            let address = word_at(offset + 1);
            let quantity = word_at(offset + 3);
            let payload = &query[offset + 6..query_len];
            let words: Vec<u16> = payload
                .chunks_exact(2)
                .take(quantity as usize)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            if words.len() != quantity as usize {
                warn!("short payload in write multiple registers");
                exception(ModbusException::IllegalDataValue)
            } else {
                match bank.write_multiple_registers(address, &words) {
                    Ok(()) => {
                        let mut response =
                            frame::build_response_header(kind, txn_id, unit, function);
                        response.extend_from_slice(&query[offset + 1..offset + 5]);
                        frame::finish_adu(kind, &mut response);
                        response
                    }
                    Err(_) => {
                        warn!(
                            "illegal data address {:#06X}+{quantity} in write multiple registers",
                            address
                        );
                        exception(ModbusException::IllegalDataAddress)
                    }
                }
            }
        }

        0x07 | 0x11 => {
            info!("function 0x{function:02X} not implemented, query ignored");
            return None;
        }

        _ => {
            warn!("unsupported function code 0x{function:02X}");
            exception(ModbusException::IllegalFunction)
        }
    };

    if unit == BROADCAST_ADDRESS {
        return None;
    }
    Some(response)
}

/// Modbus TCP server configuration.
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    pub bind_address: SocketAddr,
    pub unit_id: UnitId,
    pub request_timeout: Duration,
    pub register_bank: Option<Arc<ModbusRegisterBank>>,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:502".parse().unwrap(),
            unit_id: 1,
            request_timeout: Duration::from_secs(30),
            register_bank: None,
        }
    }
}

/// Modbus TCP server: one task per accepted connection, all sharing the
/// register bank.
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    register_bank: Arc<ModbusRegisterBank>,
    stats: Arc<Mutex<ServerStats>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
}

impl ModbusTcpServer {
    pub fn new(bind_address: &str) -> ModbusResult<Self> {
        let bind_address = bind_address
            .parse()
            .map_err(|e| ModbusError::configuration(format!("invalid bind address: {e}")))?;
        Self::with_config(ModbusTcpServerConfig {
            bind_address,
            ..Default::default()
        })
    }

    pub fn with_config(config: ModbusTcpServerConfig) -> ModbusResult<Self> {
        let register_bank = config
            .register_bank
            .clone()
            .unwrap_or_else(|| Arc::new(ModbusRegisterBank::new()));

        Ok(Self {
            config,
            register_bank,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
        })
    }

    /// The bound address, available after `start`. Useful when binding
    /// port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn handle_client(
        mut stream: TcpStream,
        register_bank: Arc<ModbusRegisterBank>,
        unit_id: UnitId,
        stats: Arc<Mutex<ServerStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        timeouts: ReceiveTimeouts,
    ) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        debug!("client connected: {peer}");

        {
            let mut stats = stats.lock().await;
            stats.connections_count += 1;
        }

        loop {
            let query = tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = receive::read_query(&mut stream, FrameKind::Tcp, &timeouts) => {
                    match result {
                        Ok(query) => query,
                        Err(ModbusError::ConnectionClosed) => break,
                        Err(ModbusError::Timeout { .. }) => {
                            debug!("client {peer} idle, closing");
                            break;
                        }
                        Err(e) => {
                            error!("bad query from {peer}: {e}");
                            let mut stats = stats.lock().await;
                            stats.failed_requests += 1;
                            break;
                        }
                    }
                }
            };

            {
                let mut stats = stats.lock().await;
                stats.total_requests += 1;
                stats.bytes_received += query.len() as u64;
            }

            if let Some(response) =
                process_query(FrameKind::Tcp, &query, unit_id, &register_bank)
            {
                if let Err(e) = stream.write_all(&response).await {
                    error!("failed to answer {peer}: {e}");
                    break;
                }
                let mut stats = stats.lock().await;
                stats.successful_requests += 1;
                stats.bytes_sent += response.len() as u64;
            }
        }

        debug!("client disconnected: {peer}");
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ModbusError::configuration("server is already running"));
        }

        let listener = TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| {
                ModbusError::io(format!("failed to bind {}: {e}", self.config.bind_address))
            })?;
        self.local_addr = listener.local_addr().ok();
        info!("Modbus TCP server listening on {:?}", self.local_addr);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.running.store(true, Ordering::SeqCst);

        let register_bank = self.register_bank.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let unit_id = self.config.unit_id;
        let timeouts = ReceiveTimeouts {
            frame_start: self.config.request_timeout,
            ..ReceiveTimeouts::default()
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!("accepted connection from {addr}");
                                let register_bank = register_bank.clone();
                                let stats = stats.clone();
                                let shutdown_rx = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    Self::handle_client(
                                        stream,
                                        register_bank,
                                        unit_id,
                                        stats,
                                        shutdown_rx,
                                        timeouts,
                                    )
                                    .await;
                                });
                            }
                            Err(e) => error!("accept failed: {e}"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Modbus TCP server shutting down");
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self
            .stats
            .try_lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.register_bank_stats = Some(self.register_bank.stats());
        stats
    }

    fn get_register_bank(&self) -> Arc<ModbusRegisterBank> {
        self.register_bank.clone()
    }
}

/// Modbus RTU server: answers queries on a serial line.
pub struct ModbusRtuServer {
    config: SerialConfig,
    unit_id: UnitId,
    register_bank: Arc<ModbusRegisterBank>,
    stats: Arc<Mutex<ServerStats>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
}

impl ModbusRtuServer {
    pub fn new(config: SerialConfig, unit_id: UnitId) -> Self {
        Self::with_register_bank(config, unit_id, Arc::new(ModbusRegisterBank::new()))
    }

    pub fn with_register_bank(
        config: SerialConfig,
        unit_id: UnitId,
        register_bank: Arc<ModbusRegisterBank>,
    ) -> Self {
        Self {
            config,
            unit_id,
            register_bank,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl ModbusServer for ModbusRtuServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ModbusError::configuration("server is already running"));
        }

        let baud = self.config.effective_baud();
        let mut serial = SerialStream::open(&self.config.to_builder())?;
        info!(
            "Modbus RTU server on {} at {baud} baud, unit {}",
            self.config.device, self.unit_id
        );

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.running.store(true, Ordering::SeqCst);

        let register_bank = self.register_bank.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let unit_id = self.unit_id;
        let timeouts = ReceiveTimeouts {
            frame_start: Duration::from_secs(1),
            inter_char: ReceiveTimeouts::default()
                .inter_char
                .max(Duration::from_micros(timing::frame_gap_us(baud) as u64)),
        };

        tokio::spawn(async move {
            loop {
                let query = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = receive::read_query(&mut serial, FrameKind::Rtu, &timeouts) => {
                        match result {
                            Ok(query) => query,
                            // A quiet line is the normal state for a slave.
                            Err(ModbusError::Timeout { .. }) => continue,
                            Err(ModbusError::CrcMismatch { .. }) => {
                                warn!("discarding query with bad CRC");
                                let mut stats = stats.lock().await;
                                stats.failed_requests += 1;
                                continue;
                            }
                            Err(ModbusError::InvalidData { .. }) => {
                                warn!("discarding malformed query");
                                let mut stats = stats.lock().await;
                                stats.failed_requests += 1;
                                continue;
                            }
                            Err(e) => {
                                error!("serial receive failed: {e}");
                                break;
                            }
                        }
                    }
                };

                {
                    let mut stats = stats.lock().await;
                    stats.total_requests += 1;
                    stats.bytes_received += query.len() as u64;
                }

                if let Some(response) =
                    process_query(FrameKind::Rtu, &query, unit_id, &register_bank)
                {
                    if let Err(e) = serial.write_all(&response).await {
                        error!("serial send failed: {e}");
                        break;
                    }
                    let mut stats = stats.lock().await;
                    stats.successful_requests += 1;
                    stats.bytes_sent += response.len() as u64;
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self
            .stats
            .try_lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.register_bank_stats = Some(self.register_bank.stats());
        stats
    }

    fn get_register_bank(&self) -> Arc<ModbusRegisterBank> {
        self.register_bank.clone()
    }
}
