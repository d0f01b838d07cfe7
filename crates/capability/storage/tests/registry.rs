use devgw_storage::{Binding, BindingRegistry, StorageError};
use domain::{Address, CommandEntry, Direction, ItemValue, RegisterTable, WireType, WireValue};
use std::sync::Arc;

fn register_entry(name: &str, address: u16) -> Arc<CommandEntry> {
    Arc::new(CommandEntry::new(
        name,
        Address::Register {
            table: RegisterTable::Holding,
            address,
            bit: None,
            unit: None,
        },
        WireType::Word,
    ))
}

#[test]
fn entry_broadcasts_to_many_items() {
    let registry = BindingRegistry::new();
    let volume = register_entry("volume", 0x10);

    assert!(registry
        .register(Binding::new("/audio/zone1/volume", Arc::clone(&volume)))
        .expect("first"));
    assert!(registry
        .register(Binding::new("/audio/all/volume", Arc::clone(&volume)))
        .expect("second"));

    assert_eq!(
        registry.items_for_entry("volume"),
        vec!["/audio/zone1/volume".to_string(), "/audio/all/volume".to_string()]
    );
    assert_eq!(registry.bound_entries().len(), 1);
    assert_eq!(registry.len(), 2);
}

#[test]
fn duplicate_pair_is_idempotent_and_second_entry_conflicts() {
    let registry = BindingRegistry::new();
    let volume = register_entry("volume", 0x10);
    let mute = register_entry("mute", 0xA3);

    registry
        .register(Binding::new("/audio/volume", Arc::clone(&volume)))
        .expect("register");
    let again = registry
        .register(Binding::new("/audio/volume", Arc::clone(&volume)))
        .expect("same pair");
    assert!(!again);

    let err = registry
        .register(Binding::new("/audio/volume", mute))
        .expect_err("conflict");
    assert!(matches!(err, StorageError::Conflict { .. }));
    assert_eq!(registry.len(), 1);
}

#[test]
fn record_wire_updates_only_target_binding() {
    let registry = BindingRegistry::new();
    let temp = register_entry("temperature", 0x32);
    registry
        .register(Binding::new("/a", Arc::clone(&temp)).with_direction(Direction::Read))
        .expect("a");
    registry
        .register(Binding::new("/b", Arc::clone(&temp)))
        .expect("b");

    registry.record_wire(
        "/a",
        WireValue::Bytes(vec![0xff, 0x9c]),
        ItemValue::Float(-10.0),
        1_000,
    );

    assert_eq!(registry.last_wire("/a"), Some(WireValue::Bytes(vec![0xff, 0x9c])));
    assert_eq!(registry.last_wire("/b"), None);
    let snapshot = registry.snapshot();
    assert_eq!(snapshot[0].item_path, "/a");
    assert_eq!(snapshot[0].direction, Direction::Read);
    assert_eq!(snapshot[0].last_update_ms, Some(1_000));
}

#[test]
fn persisted_values_take_latest_binding() {
    let registry = BindingRegistry::new();
    let mut entry = CommandEntry::new(
        "comfort_temp",
        Address::Register {
            table: RegisterTable::Holding,
            address: 0x40,
            bit: None,
            unit: None,
        },
        WireType::Word,
    );
    entry.persist = true;
    let entry = Arc::new(entry);
    registry.register(Binding::new("/x", Arc::clone(&entry))).expect("x");
    registry.register(Binding::new("/y", Arc::clone(&entry))).expect("y");
    registry
        .register(Binding::new("/volatile", register_entry("volume", 1)))
        .expect("volatile");

    registry.record_value("/x", ItemValue::Float(21.0), 10);
    registry.record_value("/y", ItemValue::Float(22.5), 20);
    registry.record_value("/volatile", ItemValue::Int(3), 30);

    let values = registry.persisted_values();
    assert_eq!(values.len(), 1);
    assert_eq!(values.get("comfort_temp"), Some(&ItemValue::Float(22.5)));
}
