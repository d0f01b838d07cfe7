use devgw_codec::CommandTable;
use devgw_config::MapParameters;
use devgw_ingest::ListenerKind;
use devgw_plugin::{ControlKind, HostContext, ParseOutcome, Plugin, RecordingScheduler};
use devgw_protocol::{MockTransport, Request};
use devgw_storage::InMemoryItemStore;
use domain::{
    Address, ChangeSource, CommandEntry, ConnectionState, Direction, ItemDescriptor, ItemType,
    ItemValue, RegisterTable, Scale, WireType,
};
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    plugin: Plugin,
    mock: MockTransport,
    store: Arc<InMemoryItemStore>,
    scheduler: Arc<RecordingScheduler>,
}

fn params() -> MapParameters {
    MapParameters::new()
        .with("short_name", "avr")
        .with("transport", "modbus_tcp")
        .with("host", "192.0.2.10")
        .with("reconnect_step_secs", "0")
        .with("lock_timeout_ms", "500")
}

fn register(name: &str, address: u16, wire_type: WireType) -> CommandEntry {
    CommandEntry::new(
        name,
        Address::Register {
            table: RegisterTable::Holding,
            address,
            bit: None,
            unit: None,
        },
        wire_type,
    )
}

fn outside_temp() -> CommandEntry {
    register("outside_temp", 0x32, WireType::SignedWord)
        .with_direction(Direction::Read)
        .with_scale(Scale::new(1.0, 1))
}

fn volume() -> CommandEntry {
    register("volume", 0x40, WireType::Word)
        .with_direction(Direction::Write)
        .with_range(0.0, 50.0)
}

fn mute() -> CommandEntry {
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

fn main_volume() -> CommandEntry {
    CommandEntry::new(
        "main_volume",
        Address::Json {
            pointer: "/main/volume".to_string(),
            push_pointer: None,
            read: None,
            write: None,
        },
        WireType::Byte,
    )
    .with_direction(Direction::Read)
}

fn rig_with(params: MapParameters, entries: Vec<CommandEntry>) -> Rig {
    let mock = MockTransport::new();
    let store = Arc::new(InMemoryItemStore::new());
    let scheduler = Arc::new(RecordingScheduler::new());
    let table = CommandTable::from_entries(entries).expect("table");
    let plugin = Plugin::init_with_transport(
        &params,
        Some(table),
        HostContext {
            store: store.clone(),
            scheduler: scheduler.clone(),
        },
        Box::new(mock.clone()),
    );
    Rig {
        plugin,
        mock,
        store,
        scheduler,
    }
}

fn bind(rig: &Rig, path: &str, command: &str) {
    let item = ItemDescriptor::new(path, ItemType::Any).with_attr("avr_command", command);
    let outcome = rig.plugin.parse_item(&item).expect("parse");
    assert!(outcome.wants_updates());
}

#[tokio::test]
async fn polled_register_is_scaled_into_item() {
    let rig = rig_with(params(), vec![outside_temp()]);
    bind(&rig, "/weather/outside", "outside_temp");
    rig.mock.set_register(0x32, 0xFF9C);

    rig.plugin.run().await;
    assert_eq!(rig.scheduler.names(), vec!["avr_poll".to_string()]);
    assert_eq!(rig.scheduler.cycle("avr_poll"), Some(Duration::from_secs(30)));
    assert!(rig.scheduler.fire("avr_poll").await);

    assert_eq!(rig.store.value("/weather/outside"), Some(ItemValue::Float(-10.0)));
    let writes = rig.store.writes_to("/weather/outside");
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].caller, "avr");
    assert_eq!(writes[0].source, ChangeSource::Poll);

    rig.plugin.stop().await;
    assert!(rig.scheduler.names().is_empty());
}

#[tokio::test]
async fn out_of_range_write_never_reaches_device() {
    let rig = rig_with(params(), vec![volume()]);
    bind(&rig, "/avr/volume", "volume");
    rig.plugin.run().await;
    // 只写条目不参与轮询
    assert!(rig.scheduler.names().is_empty());

    rig.plugin
        .update_item("/avr/volume", ItemValue::Int(75), "ui")
        .await;

    assert!(rig.mock.requests().is_empty());
    assert_eq!(rig.plugin.metrics().expect("metrics").validation_rejected, 1);

    rig.plugin
        .update_item("/avr/volume", ItemValue::Int(30), "ui")
        .await;
    assert_eq!(rig.mock.register(0x40), Some(30));
    rig.plugin.stop().await;
}

#[tokio::test]
async fn udp_push_updates_item_and_own_writes_are_ignored() {
    let rig = rig_with(
        params()
            .with("udp_listen", "127.0.0.1:0")
            .with("allow_list", "127.0.0.1"),
        vec![main_volume()],
    );
    bind(&rig, "/avr/main/volume", "main_volume");
    let mut changes = rig.store.subscribe();

    rig.plugin.run().await;
    let addr = rig
        .plugin
        .listener_addr(ListenerKind::Udp)
        .expect("udp listener bound");

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    socket
        .send_to(br#"{"main":{"volume":28}}"#, addr)
        .await
        .expect("send");

    let write = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .expect("push delivered")
        .expect("change");
    assert_eq!(write.path, "/avr/main/volume");
    assert_eq!(write.value, ItemValue::Int(28));
    assert_eq!(write.caller, "avr");
    assert_eq!(write.source, ChangeSource::Push);

    // 宿主把插件自己的写入回调回来
    rig.plugin
        .update_item("/avr/main/volume", ItemValue::Int(28), "avr")
        .await;
    let metrics = rig.plugin.metrics().expect("metrics");
    assert_eq!(metrics.feedback_ignored, 1);
    assert_eq!(metrics.push_events, 1);
    assert!(rig.mock.requests().is_empty());

    rig.plugin.stop().await;
    assert!(rig.plugin.listeners().is_empty());
}

#[tokio::test]
async fn failed_connect_recovers_on_later_tick() {
    let rig = rig_with(params(), vec![outside_temp()]);
    bind(&rig, "/weather/outside", "outside_temp");
    rig.mock.set_fail_open(true);

    rig.plugin.run().await;
    assert_eq!(rig.mock.open_attempts(), 1);
    rig.scheduler.fire("avr_poll").await;
    assert!(rig.store.writes().is_empty());
    let session = rig.plugin.snapshot().session.expect("session");
    assert_eq!(session.state, ConnectionState::Disconnected);
    assert!(session.last_error.is_some());

    rig.mock.set_fail_open(false);
    rig.mock.set_register(0x32, 0x0010);
    rig.scheduler.fire("avr_poll").await;

    assert_eq!(rig.store.value("/weather/outside"), Some(ItemValue::Float(1.6)));
    let session = rig.plugin.snapshot().session.expect("session");
    assert_eq!(session.state, ConnectionState::Connected);
    rig.plugin.stop().await;
}

#[tokio::test]
async fn pause_control_suspends_and_resumes_device_access() {
    let rig = rig_with(params(), vec![volume()]);
    bind(&rig, "/avr/volume", "volume");
    let control = ItemDescriptor::new("/avr/pause", ItemType::Bool).with_attr("avr_control", "pause");
    assert_eq!(
        rig.plugin.parse_item(&control).expect("control"),
        ParseOutcome::Control(ControlKind::Pause)
    );
    rig.plugin.run().await;

    rig.plugin
        .update_item("/avr/pause", ItemValue::Bool(true), "ui")
        .await;
    let snapshot = rig.plugin.snapshot();
    assert!(snapshot.paused);
    assert_eq!(
        snapshot.session.expect("session").state,
        ConnectionState::Suspended
    );

    rig.plugin
        .update_item("/avr/volume", ItemValue::Int(20), "ui")
        .await;
    assert!(rig.mock.requests().is_empty());

    rig.plugin
        .update_item("/avr/pause", ItemValue::Bool(false), "ui")
        .await;
    assert!(!rig.plugin.snapshot().paused);
    rig.plugin
        .update_item("/avr/volume", ItemValue::Int(20), "ui")
        .await;
    assert_eq!(rig.mock.register(0x40), Some(20));
    rig.plugin.stop().await;
}

#[tokio::test]
async fn update_now_control_polls_and_resets() {
    let rig = rig_with(params(), vec![outside_temp()]);
    bind(&rig, "/weather/outside", "outside_temp");
    let control =
        ItemDescriptor::new("/avr/refresh", ItemType::Bool).with_attr("avr_control", "update_now");
    rig.plugin.parse_item(&control).expect("control");
    rig.mock.set_register(0x32, 0x00C8);
    rig.plugin.run().await;

    rig.plugin
        .update_item("/avr/refresh", ItemValue::Bool(true), "ui")
        .await;

    assert_eq!(rig.store.value("/weather/outside"), Some(ItemValue::Float(20.0)));
    assert_eq!(rig.store.value("/avr/refresh"), Some(ItemValue::Bool(false)));
    rig.plugin.stop().await;
}

#[tokio::test]
async fn bit_write_preserves_other_bits() {
    let rig = rig_with(params(), vec![mute()]);
    bind(&rig, "/avr/mute", "mute");
    rig.mock.set_register(0xA3, 0b0000_1100);

    rig.plugin
        .update_item("/avr/mute", ItemValue::Bool(true), "ui")
        .await;

    assert_eq!(rig.mock.register(0xA3), Some(0b0000_1101));
    let requests = rig.mock.requests();
    assert!(matches!(requests[0], Request::ReadRegisters { address: 0xA3, .. }));
    assert!(matches!(requests[1], Request::WriteRegisters { address: 0xA3, .. }));
}

#[tokio::test]
async fn missing_table_leaves_plugin_incomplete() {
    let store = Arc::new(InMemoryItemStore::new());
    let scheduler = Arc::new(RecordingScheduler::new());
    let plugin = Plugin::init(
        &params(),
        None,
        HostContext {
            store: store.clone(),
            scheduler: scheduler.clone(),
        },
    );

    assert!(!plugin.init_complete());
    assert!(plugin.init_error().expect("error").contains("command_table"));
    let item = ItemDescriptor::new("/avr/x", ItemType::Any).with_attr("avr_command", "x");
    assert!(plugin.parse_item(&item).is_err());

    plugin.run().await;
    assert!(!plugin.is_running());
    assert!(scheduler.names().is_empty());
    assert!(!plugin.snapshot().init_complete);
}

#[tokio::test]
async fn unrelated_items_are_ignored_and_stop_before_run_is_noop() {
    let rig = rig_with(params(), vec![volume()]);
    let item = ItemDescriptor::new("/other/item", ItemType::Any).with_attr("knx_command", "volume");

    let outcome = rig.plugin.parse_item(&item).expect("parse");
    assert_eq!(outcome, ParseOutcome::Ignored);
    assert!(!outcome.wants_updates());

    rig.plugin.stop().await;
    assert_eq!(rig.mock.close_count(), 0);
    assert!(!rig.plugin.is_running());
}

#[tokio::test]
async fn persisted_values_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache_dir = dir.path().to_string_lossy().to_string();
    let mut entry = outside_temp();
    entry.persist = true;

    let first = rig_with(params().with("cache_dir", cache_dir.as_str()), vec![entry.clone()]);
    bind(&first, "/weather/outside", "outside_temp");
    first.mock.set_register(0x32, 0xFF9C);
    first.plugin.run().await;
    first.scheduler.fire("avr_poll").await;
    first.plugin.stop().await;

    let second = rig_with(params().with("cache_dir", cache_dir.as_str()), vec![entry]);
    bind(&second, "/weather/outside", "outside_temp");
    second.mock.set_fail_open(true);
    second.plugin.run().await;

    assert_eq!(second.store.value("/weather/outside"), Some(ItemValue::Float(-10.0)));
    let writes = second.store.writes_to("/weather/outside");
    assert_eq!(writes[0].source, ChangeSource::Restore);
    second.plugin.stop().await;
}
