use devgw_control::WriteService;
use devgw_pipeline::{Dispatcher, DispatcherConfig};
use devgw_poller::{Poller, plan_blocks};
use devgw_protocol::{MockTransport, Reply};
use devgw_session::{Session, SessionConfig};
use devgw_storage::{Binding, BindingRegistry, InMemoryItemStore};
use devgw_telemetry::PluginMetrics;
use domain::{
    Address, BoolPair, CommandEntry, ConnectionState, Direction, ItemValue, RegisterTable, Scale,
    WireType,
};
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    mock: MockTransport,
    poller: Arc<Poller>,
    session: Arc<Session>,
    store: Arc<InMemoryItemStore>,
    metrics: Arc<PluginMetrics>,
}

fn rig(bindings: Vec<(&str, Arc<CommandEntry>)>) -> Rig {
    let mock = MockTransport::new();
    let session = Arc::new(Session::new(
        "modbus",
        Box::new(mock.clone()),
        SessionConfig {
            lock_timeout: Duration::from_millis(500),
            reconnect_step: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(200),
        },
    ));
    let metrics = Arc::new(PluginMetrics::new());
    let registry = Arc::new(BindingRegistry::new());
    for (path, entry) in &bindings {
        registry
            .register(Binding::new(*path, Arc::clone(entry)))
            .expect("bind");
    }
    let store = Arc::new(InMemoryItemStore::new());
    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig::new("modbus"),
        Arc::clone(&registry),
        store.clone(),
        Arc::new(WriteService::new(Arc::clone(&session), Arc::clone(&metrics))),
        Arc::clone(&metrics),
    ));
    let blocks = plan_blocks(registry.bound_entries(), Duration::from_secs(30));
    let poller = Arc::new(Poller::new(
        Arc::clone(&session),
        dispatcher,
        Arc::clone(&metrics),
        blocks,
    ));
    Rig {
        mock,
        poller,
        session,
        store,
        metrics,
    }
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

fn outside_temp() -> Arc<CommandEntry> {
    Arc::new(
        register("outside_temp", 0x32, WireType::SignedWord)
            .with_direction(Direction::Read)
            .with_scale(Scale::new(1.0, 1)),
    )
}

#[tokio::test]
async fn signed_register_is_scaled_into_item() {
    let rig = rig(vec![("/weather/outside", outside_temp())]);
    rig.mock.set_register(0x32, 0xFF9C);

    let report = rig.poller.tick().await;

    assert_eq!(report.blocks_read, 1);
    assert_eq!(report.items_written, 1);
    assert_eq!(rig.store.value("/weather/outside"), Some(ItemValue::Float(-10.0)));
    let writes = rig.store.writes_to("/weather/outside");
    assert_eq!(writes[0].caller, "modbus");
}

#[tokio::test]
async fn unchanged_register_is_not_rewritten() {
    let rig = rig(vec![("/weather/outside", outside_temp())]);
    rig.mock.set_register(0x32, 0x0064);

    rig.poller.tick().await;
    let second = rig.poller.tick().await;

    assert_eq!(second.items_written, 0);
    assert_eq!(rig.store.writes_to("/weather/outside").len(), 1);
}

#[tokio::test]
async fn disconnected_tick_makes_one_attempt_and_no_writes() {
    let rig = rig(vec![("/weather/outside", outside_temp())]);
    rig.mock.set_fail_open(true);

    let report = rig.poller.tick().await;

    assert!(report.skipped);
    assert_eq!(rig.mock.open_attempts(), 1);
    assert!(rig.store.writes().is_empty());
    assert_eq!(rig.session.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(70)).await;
    rig.mock.set_fail_open(false);
    rig.mock.set_register(0x32, 0x0010);
    let report = rig.poller.tick().await;
    assert!(!report.skipped);
    assert_eq!(report.items_written, 1);
    assert_eq!(rig.mock.open_attempts(), 2);
}

#[tokio::test]
async fn short_block_reply_skips_remaining_entries() {
    let flow = Arc::new(register("flow", 0x10, WireType::Word).with_block("status"));
    let power = Arc::new(register("power", 0x11, WireType::Word).with_block("status"));
    let rig = rig(vec![("/flow", flow), ("/power", power)]);
    rig.mock.set_register(0x10, 7);
    rig.mock.set_register(0x11, 9);
    rig.mock.set_reply_limit(Some(1));

    let report = rig.poller.tick().await;

    assert_eq!(report.blocks_read, 1);
    assert_eq!(rig.store.value("/flow"), Some(ItemValue::Int(7)));
    assert_eq!(rig.store.value("/power"), None);
}

#[tokio::test]
async fn undecodable_value_is_logged_and_skipped() {
    let mut state = CommandEntry::new(
        "power_state",
        Address::Token {
            read: Some("PW?".to_string()),
            write: None,
            prefix: Some("PW".to_string()),
        },
        WireType::BoolPair,
    );
    state.bool_pair = Some(BoolPair {
        off: "STANDBY".to_string(),
        on: "ON".to_string(),
    });
    let rig = rig(vec![("/avr/power", Arc::new(state))]);
    rig.mock.respond("PW?", Reply::Frame(b"PWBROKEN\r".to_vec()));

    let report = rig.poller.tick().await;

    assert_eq!(report.blocks_read, 1);
    assert_eq!(report.values_decoded, 0);
    assert!(rig.store.writes().is_empty());
    assert_eq!(rig.metrics.snapshot().decode_failures, 1);
}

#[tokio::test]
async fn overlapping_tick_is_dropped() {
    let rig = rig(vec![("/weather/outside", outside_temp())]);
    rig.mock.set_delay(Duration::from_millis(150));

    let first = {
        let poller = Arc::clone(&rig.poller);
        tokio::spawn(async move { poller.tick().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = rig.poller.tick().await;

    assert!(second.dropped);
    let first = first.await.expect("join");
    assert!(!first.dropped);
    assert_eq!(rig.metrics.snapshot().poll_ticks_dropped, 1);
    assert_eq!(rig.mock.requests().len(), 1);
}

#[tokio::test]
async fn suspended_session_skips_tick() {
    let rig = rig(vec![("/weather/outside", outside_temp())]);
    rig.session.suspend().await;

    let report = rig.poller.tick().await;

    assert!(report.skipped);
    assert_eq!(rig.mock.open_attempts(), 0);
}
