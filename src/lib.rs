//! # Modbus Engine
//!
//! A Modbus application-protocol engine speaking both transports — serial
//! RTU framing and TCP MBAP framing — in both roles, client (master) and
//! server (slave).
//!
//! The heart of the crate is the shared PDU codec and the receive state
//! machine: the two transports differ only in header layout, length
//! determination, and integrity check, so the application layer is
//! written once and reused. A client composes a request, transmits it,
//! awaits the framed reply within bounded time, validates it against the
//! request, and exposes decoded values; a server parses incoming queries,
//! consults the register bank, and emits compliant responses or exception
//! frames.
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x07 | Read Exception Status | ✅ | — |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x11 | Report Server ID | ✅ | — |
//!
//! ## Client Example
//!
//! ```rust,no_run
//! use modbus_engine::{ModbusClient, ModbusTcpClient, ModbusResult};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut client = ModbusTcpClient::from_address(
//!         "127.0.0.1:502",
//!         1,
//!         Duration::from_secs(5),
//!     )
//!     .await?;
//!
//!     let registers = client.read_03(0, 10).await?;
//!     println!("holding registers: {registers:?}");
//!
//!     client.write_06(100, 0x1234).await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Server Example
//!
//! ```rust,no_run
//! use modbus_engine::{ModbusRegisterBank, ModbusServer, ModbusTcpServer, ModbusTcpServerConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bank = Arc::new(ModbusRegisterBank::with_sizes(1000, 1000, 1000, 1000));
//!     let config = ModbusTcpServerConfig {
//!         bind_address: "127.0.0.1:502".parse()?,
//!         unit_id: 1,
//!         request_timeout: Duration::from_secs(30),
//!         register_bank: Some(bank),
//!     };
//!
//!     let mut server = ModbusTcpServer::with_config(config)?;
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

pub mod crc;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod receive;
pub mod transport;
pub mod client;
pub mod server;
pub mod register_bank;
pub mod logging;
pub mod utils;

pub use client::{ErrorPolicy, GenericModbusClient, ModbusClient, ModbusRtuClient, ModbusTcpClient};
pub use error::{ModbusError, ModbusResult};
pub use frame::{ExpectedLength, FrameKind};
pub use logging::{CallbackLogger, LogCallback, LogLevel};
pub use protocol::{
    DataType, ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, RegisterValue,
    UnitId,
};
pub use receive::ReceiveTimeouts;
pub use register_bank::{ModbusRegisterBank, RegisterBankStats};
pub use server::{
    ModbusRtuServer, ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, ServerStats,
};
pub use transport::{
    ModbusTransport, RtuTransport, SerialConfig, SerialDataBits, SerialParity, SerialStopBits,
    TcpTransport, TransportStats,
};

/// Maximum number of coils in a single read/write request.
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers in a single read/write request.
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum Modbus TCP frame size (MBAP header + PDU).
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum Modbus RTU frame size.
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Default wait for the first byte of a reply, in milliseconds.
pub const TIME_OUT_BEGIN_OF_FRAME_MS: u64 = 500;

/// Default wait between bytes of one frame, in milliseconds.
pub const TIME_OUT_END_OF_FRAME_MS: u64 = 10;

/// Modbus TCP default port.
pub const DEFAULT_TCP_PORT: u16 = 502;
