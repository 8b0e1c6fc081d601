//! Client (master) operations.
//!
//! TCP and RTU share the application layer: build a request PDU, hand it
//! to the transport, cross-validate the reply against the request. The
//! generic client implements that once over [`ModbusTransport`]; the
//! concrete clients pair it with a transport and a session configuration
//! (unit id, debug flag, error policy).
//!
//! Every error coming back from the transport passes through the
//! error-treatment policy before it reaches the caller: frame-level
//! garbage flushes the link, transport failures reconnect it, timeouts
//! and peer exceptions are returned untouched.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ModbusError, ModbusResult};
use crate::logging::{CallbackLogger, FrameDirection};
use crate::protocol::{
    data_utils, DataType, ModbusFunction, ModbusRequest, ModbusResponse, RegisterValue, UnitId,
};
use crate::transport::{
    ModbusTransport, RtuTransport, SerialConfig, TcpTransport, TransportStats,
};

/// What the engine does to the transport after a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Flush the link after frame-level garbage; close and re-open it
    /// after a transport failure.
    #[default]
    FlushOrReconnect,
    /// Return errors untouched and leave recovery to the caller.
    Nop,
}

/// Client interface over any transport.
#[async_trait]
pub trait ModbusClient: Send + Sync {
    /// Read coils (function code 0x01).
    async fn read_01(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>>;

    /// Read discrete inputs (function code 0x02).
    async fn read_02(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>>;

    /// Read holding registers (function code 0x03).
    async fn read_03(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>>;

    /// Read input registers (function code 0x04).
    async fn read_04(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>>;

    /// Read exception status (function code 0x07).
    async fn read_07(&mut self) -> ModbusResult<u8>;

    /// Report server id (function code 0x11). Returns the raw reply body;
    /// its first byte is the byte count the server declared.
    async fn read_11(&mut self) -> ModbusResult<Vec<u8>>;

    /// Write a single coil (function code 0x05).
    async fn write_05(&mut self, address: u16, value: bool) -> ModbusResult<()>;

    /// Write a single register (function code 0x06).
    async fn write_06(&mut self, address: u16, value: u16) -> ModbusResult<()>;

    /// Write multiple coils (function code 0x0F). Returns the quantity
    /// the server confirmed.
    async fn write_0f(&mut self, address: u16, values: &[bool]) -> ModbusResult<u16>;

    /// Write multiple registers (function code 0x10). Returns the
    /// quantity the server confirmed.
    async fn write_10(&mut self, address: u16, values: &[u16]) -> ModbusResult<u16>;

    fn unit_id(&self) -> UnitId;
    fn set_unit(&mut self, unit_id: UnitId);
    fn set_debug(&mut self, debug: bool);
    fn set_error_policy(&mut self, policy: ErrorPolicy);

    fn is_connected(&self) -> bool;
    async fn open(&mut self) -> ModbusResult<()>;
    async fn close(&mut self) -> ModbusResult<()>;
    fn get_stats(&self) -> TransportStats;
}

/// Generic Modbus client over any transport.
pub struct GenericModbusClient<T: ModbusTransport> {
    transport: T,
    unit_id: UnitId,
    policy: ErrorPolicy,
    logger: CallbackLogger,
}

impl<T: ModbusTransport> GenericModbusClient<T> {
    pub fn new(transport: T, unit_id: UnitId) -> Self {
        Self {
            transport,
            unit_id,
            policy: ErrorPolicy::default(),
            logger: CallbackLogger::disabled(),
        }
    }

    pub fn with_logger(transport: T, unit_id: UnitId, logger: CallbackLogger) -> Self {
        Self {
            transport,
            unit_id,
            policy: ErrorPolicy::default(),
            logger,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Execute a raw request: validate bounds, run the exchange, apply
    /// the error policy to any failure.
    pub async fn execute_request(
        &mut self,
        request: ModbusRequest,
    ) -> ModbusResult<ModbusResponse> {
        request.validate()?;

        match self.transport.request(&request).await {
            Ok(response) => {
                self.logger
                    .log_frame(FrameDirection::Receive, &response.data);
                Ok(response)
            }
            Err(error) => Err(self.treat_error(error).await),
        }
    }

    /// Apply the error-treatment policy and hand the error back.
    async fn treat_error(&mut self, error: ModbusError) -> ModbusError {
        if self.policy == ErrorPolicy::Nop {
            self.logger.log_error_treatment(&error, "nop");
            return error;
        }

        match &error {
            ModbusError::InvalidData { .. }
            | ModbusError::CrcMismatch { .. }
            | ModbusError::InvalidExceptionCode { .. } => {
                self.logger.log_error_treatment(&error, "flush");
                if let Err(e) = self.transport.flush().await {
                    self.logger.log_error_treatment(&e, "flush failed");
                }
            }
            ModbusError::Io { .. } | ModbusError::ConnectionClosed => {
                self.logger.log_error_treatment(&error, "reconnect");
                let _ = self.transport.close().await;
                if let Err(e) = self.transport.open().await {
                    self.logger.log_error_treatment(&e, "reconnect failed");
                }
            }
            // Timeouts and exception responses have no transport-side
            // remedy; the caller decides whether to retry.
            _ => self.logger.log_error_treatment(&error, "none"),
        }

        error
    }

    fn check_echo(request: &ModbusRequest, response: &ModbusResponse) -> ModbusResult<()> {
        // Broadcast writes come back as an empty placeholder.
        if request.unit_id == crate::protocol::BROADCAST_ADDRESS {
            return Ok(());
        }

        let mut echo = Vec::with_capacity(2 + request.data.len());
        echo.extend_from_slice(&request.address.to_be_bytes());
        echo.extend_from_slice(&request.data);
        if response.data != echo {
            return Err(ModbusError::invalid_data(format!(
                "single-write echo mismatch: sent {:02X?}, got {:02X?}",
                echo, response.data
            )));
        }
        Ok(())
    }

    fn check_write_multiple(
        request: &ModbusRequest,
        response: &ModbusResponse,
    ) -> ModbusResult<u16> {
        if request.unit_id == crate::protocol::BROADCAST_ADDRESS {
            return Ok(request.quantity);
        }

        if response.data.len() < 4 {
            return Err(ModbusError::invalid_data("short write confirmation"));
        }
        let address = u16::from_be_bytes([response.data[0], response.data[1]]);
        let quantity = u16::from_be_bytes([response.data[2], response.data[3]]);
        if address != request.address || quantity != request.quantity {
            return Err(ModbusError::invalid_data(format!(
                "write confirmation mismatch: requested ({}, {}), confirmed ({address}, {quantity})",
                request.address, request.quantity
            )));
        }
        Ok(quantity)
    }

    /// Read registers with an explicit data-type tag. The reply's byte
    /// count must equal `quantity * bytes_per_value(data_type)`.
    pub async fn read_registers_as(
        &mut self,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
        data_type: DataType,
    ) -> ModbusResult<Vec<RegisterValue>> {
        if !matches!(
            function,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters
        ) {
            return Err(ModbusError::invalid_function(function.to_u8()));
        }

        let request =
            ModbusRequest::new_read_typed(self.unit_id, function, address, quantity, data_type);
        let response = self.execute_request(request).await?;

        let expected_bytes = quantity as usize * data_type.bytes_per_value();
        let byte_count = response.data.first().copied().unwrap_or(0) as usize;
        if byte_count != expected_bytes {
            let error = ModbusError::invalid_data(format!(
                "byte count {byte_count} does not match {quantity} values of {data_type:?}"
            ));
            return Err(self.treat_error(error).await);
        }

        match response.parse_values(data_type) {
            Ok(values) => Ok(values),
            Err(error) => Err(self.treat_error(error).await),
        }
    }

    async fn read_bits(
        &mut self,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        let request = ModbusRequest::new_read(self.unit_id, function, address, quantity);
        let response = self.execute_request(request).await?;

        let expected_bytes = (quantity as usize).div_ceil(8);
        let byte_count = response.data.first().copied().unwrap_or(0) as usize;
        if byte_count != expected_bytes {
            let error = ModbusError::invalid_data(format!(
                "byte count {byte_count} does not match {quantity} requested bits"
            ));
            return Err(self.treat_error(error).await);
        }

        match response.parse_bits(quantity as usize) {
            Ok(bits) => Ok(bits),
            Err(error) => Err(self.treat_error(error).await),
        }
    }
}

#[async_trait]
impl<T: ModbusTransport> ModbusClient for GenericModbusClient<T> {
    async fn read_01(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(ModbusFunction::ReadCoils, address, quantity)
            .await
    }

    async fn read_02(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(ModbusFunction::ReadDiscreteInputs, address, quantity)
            .await
    }

    async fn read_03(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let values = self
            .read_registers_as(
                ModbusFunction::ReadHoldingRegisters,
                address,
                quantity,
                DataType::UInt16,
            )
            .await?;
        Ok(values
            .into_iter()
            .map(|v| match v {
                RegisterValue::UInt16(word) => word,
                other => other.as_bits() as u16,
            })
            .collect())
    }

    async fn read_04(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let values = self
            .read_registers_as(
                ModbusFunction::ReadInputRegisters,
                address,
                quantity,
                DataType::UInt16,
            )
            .await?;
        Ok(values
            .into_iter()
            .map(|v| match v {
                RegisterValue::UInt16(word) => word,
                other => other.as_bits() as u16,
            })
            .collect())
    }

    async fn read_07(&mut self) -> ModbusResult<u8> {
        let request = ModbusRequest::new_bare(self.unit_id, ModbusFunction::ReadExceptionStatus);
        let response = self.execute_request(request).await?;
        response
            .data
            .first()
            .copied()
            .ok_or_else(|| ModbusError::invalid_data("empty exception status reply"))
    }

    async fn read_11(&mut self) -> ModbusResult<Vec<u8>> {
        let request = ModbusRequest::new_bare(self.unit_id, ModbusFunction::ReportServerId);
        let response = self.execute_request(request).await?;
        Ok(response.data)
    }

    async fn write_05(&mut self, address: u16, value: bool) -> ModbusResult<()> {
        let data = if value {
            vec![0xFF, 0x00]
        } else {
            vec![0x00, 0x00]
        };
        let request = ModbusRequest::new_write(
            self.unit_id,
            ModbusFunction::WriteSingleCoil,
            address,
            1,
            data,
        );
        let response = self.execute_request(request.clone()).await?;
        Self::check_echo(&request, &response)
    }

    async fn write_06(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        let request = ModbusRequest::new_write(
            self.unit_id,
            ModbusFunction::WriteSingleRegister,
            address,
            1,
            value.to_be_bytes().to_vec(),
        );
        let response = self.execute_request(request.clone()).await?;
        Self::check_echo(&request, &response)
    }

    async fn write_0f(&mut self, address: u16, values: &[bool]) -> ModbusResult<u16> {
        let request = ModbusRequest::new_write(
            self.unit_id,
            ModbusFunction::WriteMultipleCoils,
            address,
            values.len() as u16,
            data_utils::pack_bits(values),
        );
        let response = self.execute_request(request.clone()).await?;
        Self::check_write_multiple(&request, &response)
    }

    async fn write_10(&mut self, address: u16, values: &[u16]) -> ModbusResult<u16> {
        let request = ModbusRequest::new_write(
            self.unit_id,
            ModbusFunction::WriteMultipleRegisters,
            address,
            values.len() as u16,
            data_utils::registers_to_bytes(values),
        );
        let response = self.execute_request(request.clone()).await?;
        Self::check_write_multiple(&request, &response)
    }

    fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    fn set_unit(&mut self, unit_id: UnitId) {
        self.unit_id = unit_id;
    }

    fn set_debug(&mut self, debug: bool) {
        self.transport.set_debug(debug);
    }

    fn set_error_policy(&mut self, policy: ErrorPolicy) {
        self.policy = policy;
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn open(&mut self) -> ModbusResult<()> {
        self.transport.open().await
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.transport.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}

/// Modbus TCP client.
pub struct ModbusTcpClient {
    inner: GenericModbusClient<TcpTransport>,
}

impl ModbusTcpClient {
    /// Create an unopened client; call [`ModbusClient::open`] before use.
    pub fn new(address: SocketAddr, unit_id: UnitId, timeout: Duration) -> Self {
        Self {
            inner: GenericModbusClient::new(TcpTransport::new(address, timeout), unit_id),
        }
    }

    /// Create and connect in one step.
    pub async fn connect(
        address: SocketAddr,
        unit_id: UnitId,
        timeout: Duration,
    ) -> ModbusResult<Self> {
        let mut client = Self::new(address, unit_id, timeout);
        client.inner.open().await?;
        Ok(client)
    }

    /// Create and connect from a string address like `"10.0.0.5:502"`.
    pub async fn from_address(
        address: &str,
        unit_id: UnitId,
        timeout: Duration,
    ) -> ModbusResult<Self> {
        let address: SocketAddr = address
            .parse()
            .map_err(|e| ModbusError::configuration(format!("invalid address: {e}")))?;
        Self::connect(address, unit_id, timeout).await
    }

    pub fn set_logger(&mut self, logger: CallbackLogger) {
        self.inner.logger = logger;
    }

    pub fn server_address(&self) -> SocketAddr {
        self.inner.transport().address()
    }

    pub async fn execute_request(
        &mut self,
        request: ModbusRequest,
    ) -> ModbusResult<ModbusResponse> {
        self.inner.execute_request(request).await
    }

    /// Typed register read, see [`GenericModbusClient::read_registers_as`].
    pub async fn read_registers_as(
        &mut self,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
        data_type: DataType,
    ) -> ModbusResult<Vec<RegisterValue>> {
        self.inner
            .read_registers_as(function, address, quantity, data_type)
            .await
    }
}

/// Modbus RTU client.
pub struct ModbusRtuClient {
    inner: GenericModbusClient<RtuTransport>,
}

impl ModbusRtuClient {
    /// Create an unopened client; call [`ModbusClient::open`] before use.
    pub fn new(config: SerialConfig, unit_id: UnitId, timeout: Duration) -> Self {
        Self {
            inner: GenericModbusClient::new(RtuTransport::new(config, timeout), unit_id),
        }
    }

    /// Create and open the serial device in one step.
    pub async fn connect(
        config: SerialConfig,
        unit_id: UnitId,
        timeout: Duration,
    ) -> ModbusResult<Self> {
        let mut client = Self::new(config, unit_id, timeout);
        client.inner.open().await?;
        Ok(client)
    }

    pub fn set_logger(&mut self, logger: CallbackLogger) {
        self.inner.logger = logger;
    }

    pub fn config(&self) -> &SerialConfig {
        self.inner.transport().config()
    }

    pub async fn execute_request(
        &mut self,
        request: ModbusRequest,
    ) -> ModbusResult<ModbusResponse> {
        self.inner.execute_request(request).await
    }

    /// Typed register read, see [`GenericModbusClient::read_registers_as`].
    pub async fn read_registers_as(
        &mut self,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
        data_type: DataType,
    ) -> ModbusResult<Vec<RegisterValue>> {
        self.inner
            .read_registers_as(function, address, quantity, data_type)
            .await
    }
}

macro_rules! delegate_client {
    ($wrapper:ty) => {
        #[async_trait]
        impl ModbusClient for $wrapper {
            async fn read_01(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
                self.inner.read_01(address, quantity).await
            }

            async fn read_02(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
                self.inner.read_02(address, quantity).await
            }

            async fn read_03(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
                self.inner.read_03(address, quantity).await
            }

            async fn read_04(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
                self.inner.read_04(address, quantity).await
            }

            async fn read_07(&mut self) -> ModbusResult<u8> {
                self.inner.read_07().await
            }

            async fn read_11(&mut self) -> ModbusResult<Vec<u8>> {
                self.inner.read_11().await
            }

            async fn write_05(&mut self, address: u16, value: bool) -> ModbusResult<()> {
                self.inner.write_05(address, value).await
            }

            async fn write_06(&mut self, address: u16, value: u16) -> ModbusResult<()> {
                self.inner.write_06(address, value).await
            }

            async fn write_0f(&mut self, address: u16, values: &[bool]) -> ModbusResult<u16> {
                self.inner.write_0f(address, values).await
            }

            async fn write_10(&mut self, address: u16, values: &[u16]) -> ModbusResult<u16> {
                self.inner.write_10(address, values).await
            }

            fn unit_id(&self) -> UnitId {
                self.inner.unit_id()
            }

            fn set_unit(&mut self, unit_id: UnitId) {
                self.inner.set_unit(unit_id);
            }

            fn set_debug(&mut self, debug: bool) {
                self.inner.set_debug(debug);
            }

            fn set_error_policy(&mut self, policy: ErrorPolicy) {
                self.inner.set_error_policy(policy);
            }

            fn is_connected(&self) -> bool {
                self.inner.is_connected()
            }

            async fn open(&mut self) -> ModbusResult<()> {
                self.inner.open().await
            }

            async fn close(&mut self) -> ModbusResult<()> {
                self.inner.close().await
            }

            fn get_stats(&self) -> TransportStats {
                self.inner.get_stats()
            }
        }
    };
}

delegate_client!(ModbusTcpClient);
delegate_client!(ModbusRtuClient);
