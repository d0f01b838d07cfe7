use async_trait::async_trait;
use devgw_control::{ControlError, DeviceWriter, WriteOutcome};
use devgw_pipeline::{Dispatcher, DispatcherConfig, EmitOutcome, PipelineError};
use devgw_session::SessionError;
use devgw_storage::{Binding, BindingRegistry, InMemoryItemStore};
use devgw_telemetry::PluginMetrics;
use domain::{
    Address, ChangeSource, CommandEntry, Direction, ItemValue, RegisterTable, WireType, WireValue,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CountingWriter {
    writes: Mutex<Vec<(String, ItemValue)>>,
}

#[async_trait]
impl DeviceWriter for CountingWriter {
    async fn write(
        &self,
        entry: &CommandEntry,
        value: &ItemValue,
    ) -> Result<WriteOutcome, ControlError> {
        self.writes
            .lock()
            .expect("lock")
            .push((entry.name.clone(), value.clone()));
        Ok(WriteOutcome {
            wire: WireValue::Bytes(value.to_string().into_bytes()),
            request: "counted".to_string(),
            latency_ms: 0,
        })
    }
}

struct FailingWriter;

#[async_trait]
impl DeviceWriter for FailingWriter {
    async fn write(
        &self,
        _entry: &CommandEntry,
        _value: &ItemValue,
    ) -> Result<WriteOutcome, ControlError> {
        Err(ControlError::Session(SessionError::Backoff(
            std::time::Duration::from_secs(10),
        )))
    }
}

fn temperature() -> Arc<CommandEntry> {
    Arc::new(
        CommandEntry::new(
            "outside_temp",
            Address::Register {
                table: RegisterTable::Input,
                address: 0x32,
                bit: None,
                unit: None,
            },
            WireType::SignedWord,
        )
        .with_direction(Direction::Read),
    )
}

fn volume() -> Arc<CommandEntry> {
    Arc::new(
        CommandEntry::new(
            "volume",
            Address::Token {
                read: Some("MV?".to_string()),
                write: Some("MV{value}".to_string()),
                prefix: Some("MV".to_string()),
            },
            WireType::Word,
        )
        .with_range(0.0, 50.0),
    )
}

struct Fixture {
    dispatcher: Dispatcher,
    registry: Arc<BindingRegistry>,
    store: Arc<InMemoryItemStore>,
    metrics: Arc<PluginMetrics>,
}

fn fixture(writer: Arc<dyn DeviceWriter>) -> Fixture {
    let registry = Arc::new(BindingRegistry::new());
    let store = Arc::new(InMemoryItemStore::new());
    let metrics = Arc::new(PluginMetrics::new());
    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            short_name: "avr".to_string(),
            change_ring_capacity: 3,
        },
        Arc::clone(&registry),
        store.clone(),
        writer,
        Arc::clone(&metrics),
    );
    Fixture {
        dispatcher,
        registry,
        store,
        metrics,
    }
}

#[tokio::test]
async fn same_wire_value_is_written_once() {
    let f = fixture(Arc::new(CountingWriter::default()));
    f.registry
        .register(Binding::new("/weather/outside", temperature()))
        .expect("bind");
    let wire = WireValue::Bytes(vec![0xff, 0x9c]);

    let first = f
        .dispatcher
        .apply(&temperature(), &wire, ItemValue::Float(-10.0), ChangeSource::Poll)
        .await;
    let second = f
        .dispatcher
        .apply(&temperature(), &wire, ItemValue::Float(-10.0), ChangeSource::Poll)
        .await;

    assert_eq!(first.written, 1);
    assert_eq!(second.written, 0);
    assert_eq!(second.suppressed, 1);
    let writes = f.store.writes_to("/weather/outside");
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].caller, "avr");
    assert_eq!(f.registry.last_wire("/weather/outside"), Some(wire));
    assert_eq!(f.metrics.snapshot().writes_suppressed, 1);
}

#[tokio::test]
async fn broadcast_entry_updates_every_item() {
    let f = fixture(Arc::new(CountingWriter::default()));
    f.registry
        .register(Binding::new("/zone1/volume", volume()))
        .expect("zone1");
    f.registry
        .register(Binding::new("/zone2/volume", volume()))
        .expect("zone2");

    let report = f
        .dispatcher
        .apply(
            &volume(),
            &WireValue::Json(serde_json::json!(28)),
            ItemValue::Int(28),
            ChangeSource::Push,
        )
        .await;

    assert_eq!(report.written, 2);
    assert_eq!(f.store.value("/zone1/volume"), Some(ItemValue::Int(28)));
    assert_eq!(f.store.value("/zone2/volume"), Some(ItemValue::Int(28)));
}

#[tokio::test]
async fn invalid_sentinel_becomes_zero_only_where_opted_in() {
    let f = fixture(Arc::new(CountingWriter::default()));
    let mut entry = CommandEntry::new(
        "flow_temp",
        Address::Register {
            table: RegisterTable::Input,
            address: 0x40,
            bit: None,
            unit: None,
        },
        WireType::Word,
    );
    entry.invalid_sentinel = Some(32767);
    let entry = Arc::new(entry);
    f.registry
        .register(Binding::new("/raw", Arc::clone(&entry)))
        .expect("raw");
    f.registry
        .register(Binding::new("/clean", Arc::clone(&entry)).with_invalid_zero(true))
        .expect("clean");

    f.dispatcher
        .apply(
            &entry,
            &WireValue::Bytes(vec![0x7f, 0xff]),
            ItemValue::Int(32767),
            ChangeSource::Poll,
        )
        .await;

    assert_eq!(f.store.value("/raw"), Some(ItemValue::Int(32767)));
    assert_eq!(f.store.value("/clean"), Some(ItemValue::Int(0)));
}

#[tokio::test]
async fn own_caller_tag_short_circuits() {
    let writer = Arc::new(CountingWriter::default());
    let f = fixture(writer.clone());
    f.registry
        .register(Binding::new("/zone1/volume", volume()))
        .expect("bind");

    let outcome = f
        .dispatcher
        .emit("/zone1/volume", ItemValue::Int(28), "avr")
        .await
        .expect("emit");

    assert_eq!(outcome, EmitOutcome::FeedbackIgnored);
    assert!(writer.writes.lock().expect("lock").is_empty());
    assert_eq!(f.metrics.snapshot().feedback_ignored, 1);
}

#[tokio::test]
async fn host_write_reaches_device_and_records_wire() {
    let writer = Arc::new(CountingWriter::default());
    let f = fixture(writer.clone());
    f.registry
        .register(Binding::new("/zone1/volume", volume()))
        .expect("bind");

    let outcome = f
        .dispatcher
        .emit("/zone1/volume", ItemValue::Int(30), "visu")
        .await
        .expect("emit");

    assert_eq!(outcome, EmitOutcome::Written(WireValue::Bytes(b"30".to_vec())));
    assert_eq!(
        writer.writes.lock().expect("lock").as_slice(),
        &[("volume".to_string(), ItemValue::Int(30))]
    );
    assert_eq!(
        f.registry.last_wire("/zone1/volume"),
        Some(WireValue::Bytes(b"30".to_vec()))
    );
}

#[tokio::test]
async fn read_only_and_unbound_items_are_not_written() {
    let writer = Arc::new(CountingWriter::default());
    let f = fixture(writer.clone());
    f.registry
        .register(Binding::new("/weather/outside", temperature()))
        .expect("bind");

    let read_only = f
        .dispatcher
        .emit("/weather/outside", ItemValue::Float(3.0), "visu")
        .await
        .expect("emit");
    let unbound = f
        .dispatcher
        .emit("/elsewhere", ItemValue::Float(3.0), "visu")
        .await
        .expect("emit");

    assert_eq!(read_only, EmitOutcome::ReadOnly);
    assert_eq!(unbound, EmitOutcome::Unbound);
    assert!(writer.writes.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn failed_device_write_keeps_last_wire() {
    let f = fixture(Arc::new(FailingWriter));
    f.registry
        .register(Binding::new("/zone1/volume", volume()))
        .expect("bind");
    f.registry.record_wire(
        "/zone1/volume",
        WireValue::Bytes(b"20".to_vec()),
        ItemValue::Int(20),
        1,
    );

    let err = f
        .dispatcher
        .emit("/zone1/volume", ItemValue::Int(25), "visu")
        .await
        .expect_err("device down");

    assert!(matches!(err, PipelineError::Control(_)));
    assert_eq!(
        f.registry.last_wire("/zone1/volume"),
        Some(WireValue::Bytes(b"20".to_vec()))
    );
}

#[tokio::test]
async fn change_ring_is_bounded() {
    let f = fixture(Arc::new(CountingWriter::default()));
    for index in 0..5 {
        f.dispatcher
            .write_item("/net/udp", ItemValue::Int(index), ChangeSource::Push)
            .await
            .expect("write");
    }

    let changes = f.dispatcher.recent_changes();
    assert_eq!(changes.len(), 3);
    assert_eq!(changes[0].new_value, ItemValue::Int(2));
    assert_eq!(changes[0].old_value, Some(ItemValue::Int(1)));
    assert_eq!(changes[2].new_value, ItemValue::Int(4));
}
