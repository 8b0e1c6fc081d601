//! Integration tests: a real client against a real server over loopback
//! TCP, plus wire-level vectors for the RTU framing.

use std::sync::Arc;
use std::time::Duration;

use modbus_engine::{
    crc, DataType, ErrorPolicy, ModbusClient, ModbusError, ModbusRegisterBank, ModbusServer,
    ModbusTcpClient, ModbusTcpServer, ModbusTcpServerConfig,
};

async fn start_server(bank: Arc<ModbusRegisterBank>) -> (ModbusTcpServer, std::net::SocketAddr) {
    let config = ModbusTcpServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        unit_id: 1,
        request_timeout: Duration::from_secs(5),
        register_bank: Some(bank),
    };
    let mut server = ModbusTcpServer::with_config(config).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

async fn connect(addr: std::net::SocketAddr) -> ModbusTcpClient {
    ModbusTcpClient::connect(addr, 1, Duration::from_millis(500))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_register_write_read_roundtrip() {
    let bank = Arc::new(ModbusRegisterBank::with_sizes(100, 100, 100, 100));
    let (mut server, addr) = start_server(bank).await;
    let mut client = connect(addr).await;

    client.write_06(0, 0x1234).await.unwrap();
    assert_eq!(client.read_03(0, 1).await.unwrap(), vec![0x1234]);

    let written = client.write_10(10, &[0x000A, 0x0102, 0xFFFF]).await.unwrap();
    assert_eq!(written, 3);
    assert_eq!(
        client.read_03(10, 3).await.unwrap(),
        vec![0x000A, 0x0102, 0xFFFF]
    );

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_coil_write_read_roundtrip() {
    let bank = Arc::new(ModbusRegisterBank::with_sizes(100, 100, 100, 100));
    let (mut server, addr) = start_server(bank).await;
    let mut client = connect(addr).await;

    client.write_05(7, true).await.unwrap();
    assert_eq!(client.read_01(7, 1).await.unwrap(), vec![true]);

    let pattern = [
        true, false, true, true, false, false, true, true, true, false,
    ];
    let written = client.write_0f(0x13, &pattern).await.unwrap();
    assert_eq!(written, 10);
    assert_eq!(client.read_01(0x13, 10).await.unwrap(), pattern.to_vec());

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_discrete_inputs_and_input_registers() {
    let bank = Arc::new(ModbusRegisterBank::with_sizes(100, 100, 100, 100));
    let pattern = [true, false, true, true, false, false, true, false, true, true];
    for (i, &bit) in pattern.iter().enumerate() {
        bank.set_discrete_input(i as u16, bit).unwrap();
    }
    bank.set_input_register(5, 0xBEEF).unwrap();

    let (mut server, addr) = start_server(bank).await;
    let mut client = connect(addr).await;

    assert_eq!(client.read_02(0, 10).await.unwrap(), pattern.to_vec());
    assert_eq!(client.read_04(5, 1).await.unwrap(), vec![0xBEEF]);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_illegal_address_surfaces_as_exception() {
    let bank = Arc::new(ModbusRegisterBank::with_sizes(1, 1, 1, 1));
    let (mut server, addr) = start_server(bank).await;
    let mut client = connect(addr).await;

    let err = client.read_03(0xFF, 1).await.unwrap_err();
    assert!(matches!(
        err,
        ModbusError::Exception {
            function: 0x03,
            code: 0x02,
            ..
        }
    ));

    // The session survives the exception and keeps working.
    assert_eq!(client.read_03(0, 1).await.unwrap(), vec![0]);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unimplemented_function_times_out() {
    let bank = Arc::new(ModbusRegisterBank::with_sizes(8, 8, 8, 8));
    let (mut server, addr) = start_server(bank).await;
    let mut client = connect(addr).await;
    client.set_error_policy(ErrorPolicy::Nop);

    // The server stays silent on read-exception-status, so the client
    // runs into its reply timeout.
    let err = client.read_07().await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { .. }));

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_reads_are_idempotent() {
    let bank = Arc::new(ModbusRegisterBank::with_sizes(32, 32, 32, 32));
    bank.write_multiple_registers(0, &[7, 8, 9]).unwrap();
    let (mut server, addr) = start_server(bank).await;
    let mut client = connect(addr).await;

    let first = client.read_03(0, 3).await.unwrap();
    let second = client.read_03(0, 3).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, vec![7, 8, 9]);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_clients_share_one_bank() {
    let bank = Arc::new(ModbusRegisterBank::with_sizes(32, 32, 32, 32));
    let (mut server, addr) = start_server(bank).await;
    let mut writer = connect(addr).await;
    let mut reader = connect(addr).await;

    writer.write_06(3, 0xCAFE).await.unwrap();
    assert_eq!(reader.read_03(3, 1).await.unwrap(), vec![0xCAFE]);

    writer.close().await.unwrap();
    reader.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_typed_float_read() {
    use modbus_engine::protocol::data_utils;
    use modbus_engine::{ModbusFunction, RegisterValue};

    let bank = Arc::new(ModbusRegisterBank::with_sizes(16, 16, 16, 16));
    let words = data_utils::write_f32(123.45);
    bank.write_multiple_registers(0, &words).unwrap();

    let (mut server, addr) = start_server(bank).await;
    let mut client = connect(addr).await;

    // Two registers hold one float; request 2 words and decode them.
    let registers = client.read_03(0, 2).await.unwrap();
    assert_eq!(data_utils::read_f32(&registers).unwrap(), 123.45);

    // Or read one typed 32-bit value directly.
    let values = client
        .read_registers_as(ModbusFunction::ReadHoldingRegisters, 0, 1, DataType::UInt32)
        .await
        .unwrap();
    assert_eq!(values.len(), 1);
    assert!(matches!(values[0], RegisterValue::UInt32(_)));

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_many_requests_on_one_session() {
    // Transaction ids must keep correlating across a long run of
    // serialized requests on a single connection.
    let bank = Arc::new(ModbusRegisterBank::with_sizes(300, 1, 300, 1));
    let (mut server, addr) = start_server(bank).await;
    let mut client = connect(addr).await;

    for i in 0..200u16 {
        client.write_06(i % 300, i).await.unwrap();
        assert_eq!(client.read_03(i % 300, 1).await.unwrap(), vec![i]);
    }

    let stats = client.get_stats();
    assert_eq!(stats.requests_sent, 400);
    assert_eq!(stats.responses_received, 400);

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_lifecycle() {
    let bank = Arc::new(ModbusRegisterBank::with_sizes(8, 8, 8, 8));
    let (mut server, addr) = start_server(bank).await;
    assert!(server.is_running());

    let mut client = connect(addr).await;
    assert_eq!(client.read_03(0, 1).await.unwrap(), vec![0]);
    client.close().await.unwrap();

    let stats = server.get_stats();
    assert!(stats.connections_count >= 1);
    assert!(stats.total_requests >= 1);

    server.stop().await.unwrap();
    assert!(!server.is_running());
}

#[test]
fn test_rtu_frame_construction() {
    // Manual frame for read-holding-registers, slave 1, addr 0, qty 2.
    let mut frame = vec![0x01, 0x03];
    frame.extend_from_slice(&0x0000u16.to_be_bytes());
    frame.extend_from_slice(&0x0002u16.to_be_bytes());
    crc::append_crc(&mut frame);

    assert_eq!(frame, [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    assert!(crc::check_crc(&frame).is_ok());
}

#[test]
fn test_crc_known_vectors() {
    let cases = [
        (vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02], 0xC40Bu16),
        (vec![0x01, 0x04, 0x00, 0x00, 0x00, 0x01], 0x31CA),
        (vec![0x01, 0x06, 0x00, 0x01, 0x00, 0x03], 0x980B),
        (vec![0x01, 0x01, 0x00, 0x13, 0x00, 0x25], 0x0C14),
        (vec![0x02, 0x03, 0x00, 0x00, 0x00, 0x01], 0x8439),
    ];

    for (data, expected) in cases {
        assert_eq!(
            crc::crc16(&data),
            expected,
            "CRC mismatch for {data:02X?}"
        );
    }
}
