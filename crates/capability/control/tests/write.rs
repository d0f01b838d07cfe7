use devgw_control::{ControlError, DeviceWriter, WriteService};
use devgw_protocol::{MockTransport, Request};
use devgw_session::{Session, SessionConfig};
use devgw_telemetry::PluginMetrics;
use domain::{Address, CommandEntry, Direction, ItemValue, RegisterTable, WireType, WireValue};
use std::sync::Arc;

fn service(mock: &MockTransport) -> (WriteService, Arc<Session>, Arc<PluginMetrics>) {
    let session = Arc::new(Session::new(
        "device",
        Box::new(mock.clone()),
        SessionConfig::default(),
    ));
    let metrics = Arc::new(PluginMetrics::new());
    (
        WriteService::new(Arc::clone(&session), Arc::clone(&metrics)),
        session,
        metrics,
    )
}

fn mute_entry() -> CommandEntry {
    CommandEntry::new(
        "mute",
        Address::Register {
            table: RegisterTable::Holding,
            address: 0xA3,
            bit: Some(0),
            unit: None,
        },
        WireType::Bit,
    )
}

#[tokio::test]
async fn bit_write_reads_register_first() {
    let mock = MockTransport::new();
    mock.set_register(0xA3, 0b0000_1100);
    let (writer, _session, metrics) = service(&mock);

    let outcome = writer
        .write(&mute_entry(), &ItemValue::Bool(true))
        .await
        .expect("write");

    assert_eq!(outcome.wire, WireValue::Bit(true));
    assert_eq!(mock.register(0xA3), Some(0b0000_1101));
    let requests = mock.requests();
    assert_eq!(requests.len(), 2);
    assert!(matches!(requests[0], Request::ReadRegisters { address: 0xA3, count: 1, .. }));
    assert!(matches!(requests[1], Request::WriteRegisters { address: 0xA3, .. }));
    assert_eq!(metrics.snapshot().device_writes, 1);
}

#[tokio::test]
async fn failed_read_aborts_bit_write() {
    let mock = MockTransport::new();
    mock.push_result(Err(devgw_protocol::TransportError::Timeout(
        "no answer".to_string(),
    )));
    let (writer, _session, metrics) = service(&mock);

    let err = writer
        .write(&mute_entry(), &ItemValue::Bool(true))
        .await
        .expect_err("read failed");

    assert!(matches!(err, ControlError::ReadBeforeWrite(_)));
    assert_eq!(mock.requests().len(), 1);
    assert_eq!(mock.register(0xA3), None);
    assert_eq!(metrics.snapshot().device_write_failures, 1);
}

#[tokio::test]
async fn out_of_range_value_never_reaches_device() {
    let mock = MockTransport::new();
    let (writer, _session, metrics) = service(&mock);
    let volume = CommandEntry::new(
        "volume",
        Address::Token {
            read: None,
            write: Some("MV{value}".to_string()),
            prefix: Some("MV".to_string()),
        },
        WireType::Word,
    )
    .with_direction(Direction::Write)
    .with_range(0.0, 50.0);

    let err = writer
        .write(&volume, &ItemValue::Int(75))
        .await
        .expect_err("range");

    assert!(matches!(err, ControlError::Validation(_)));
    assert!(err.is_rejected());
    assert!(mock.requests().is_empty());
    assert_eq!(mock.open_attempts(), 0);
    assert_eq!(metrics.snapshot().validation_rejected, 1);
    assert_eq!(metrics.snapshot().device_write_failures, 0);
}

#[tokio::test]
async fn read_only_entry_is_refused() {
    let mock = MockTransport::new();
    let (writer, _session, _metrics) = service(&mock);
    let entry = CommandEntry::new(
        "temperature",
        Address::Register {
            table: RegisterTable::Input,
            address: 0x32,
            bit: None,
            unit: None,
        },
        WireType::SignedWord,
    )
    .with_direction(Direction::Read);

    let err = writer
        .write(&entry, &ItemValue::Int(1))
        .await
        .expect_err("read-only");
    assert!(matches!(err, ControlError::ReadOnly(_)));
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn suspended_session_reports_suspended() {
    let mock = MockTransport::new();
    let (writer, session, _metrics) = service(&mock);
    session.suspend().await;

    let err = writer
        .write(&mute_entry(), &ItemValue::Bool(false))
        .await
        .expect_err("suspended");
    assert!(err.is_suspended());
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn token_write_fills_template() {
    let mock = MockTransport::new();
    let (writer, _session, _metrics) = service(&mock);
    let volume = CommandEntry::new(
        "volume",
        Address::Token {
            read: Some("MV?".to_string()),
            write: Some("MV{value}".to_string()),
            prefix: Some("MV".to_string()),
        },
        WireType::Word,
    )
    .with_range(0.0, 50.0);

    writer
        .write(&volume, &ItemValue::Int(28))
        .await
        .expect("write");

    assert_eq!(
        mock.requests(),
        vec![Request::Command {
            text: "MV28".to_string()
        }]
    );
}
