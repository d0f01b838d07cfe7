use devgw_storage::{InMemoryItemStore, ItemStore, StorageError};
use domain::{ChangeSource, ItemDescriptor, ItemType, ItemValue};

#[tokio::test]
async fn write_records_caller_and_notifies() {
    let store = InMemoryItemStore::with_items(&[ItemDescriptor::new(
        "/weather/outside",
        ItemType::Num,
    )]);
    let mut changes = store.subscribe();

    store
        .write_item(
            "/weather/outside",
            ItemValue::Float(-10.0),
            "modbus",
            ChangeSource::Poll,
        )
        .await
        .expect("write");

    let record = store
        .read_item("/weather/outside")
        .await
        .expect("query")
        .expect("item");
    assert_eq!(record.value, Some(ItemValue::Float(-10.0)));
    assert_eq!(record.last_caller.as_deref(), Some("modbus"));
    assert!(record.last_change_ms.is_some());

    let change = changes.recv().await.expect("change");
    assert_eq!(change.caller, "modbus");
    assert_eq!(change.source, ChangeSource::Poll);
}

#[tokio::test]
async fn same_value_updates_without_change() {
    let store = InMemoryItemStore::new();
    store
        .write_item("/hvac/mode", ItemValue::from("heat"), "host", ChangeSource::HostWrite)
        .await
        .expect("first");
    let first = store.read_item("/hvac/mode").await.expect("query").expect("item");

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store
        .write_item("/hvac/mode", ItemValue::from("heat"), "host", ChangeSource::HostWrite)
        .await
        .expect("second");
    let second = store.read_item("/hvac/mode").await.expect("query").expect("item");

    assert_eq!(first.last_change_ms, second.last_change_ms);
    assert!(second.last_update_ms >= first.last_update_ms);
    assert_eq!(store.writes_to("/hvac/mode").len(), 2);
}

#[tokio::test]
async fn rejects_blank_path() {
    let store = InMemoryItemStore::new();
    let err = store
        .write_item(" ", ItemValue::Bool(true), "host", ChangeSource::HostWrite)
        .await
        .expect_err("invalid");
    assert!(matches!(err, StorageError::InvalidPath(_)));
    assert!(store.writes().is_empty());
}
