//! 插件快照 → Web DTO

use api_contract::{BindingDto, ChangeDto, PluginSnapshotDto, SessionDto};
use devgw_plugin::PluginSnapshot;
use serde_json::Value;

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

pub fn snapshot_to_dto(snapshot: &PluginSnapshot) -> PluginSnapshotDto {
    let session = match &snapshot.session {
        Some(session) => SessionDto {
            transport: session.transport.clone(),
            state: session.state.to_string(),
            last_error: session.last_error.clone(),
            connected_since_ms: session.connected_since_ms,
            reconnect_failures: session.reconnect_failures,
        },
        None => SessionDto {
            transport: String::new(),
            state: "disconnected".to_string(),
            last_error: snapshot.init_error.clone(),
            connected_since_ms: None,
            reconnect_failures: 0,
        },
    };
    PluginSnapshotDto {
        short_name: snapshot.short_name.clone(),
        instance_id: snapshot
            .instance_id
            .clone()
            .unwrap_or_else(|| snapshot.short_name.clone()),
        init_complete: snapshot.init_complete,
        paused: snapshot.paused,
        session,
        bindings: snapshot
            .bindings
            .iter()
            .map(|binding| BindingDto {
                item_path: binding.item_path.clone(),
                command: binding.entry.clone(),
                address: binding.address.clone(),
                direction: binding.direction.as_str().to_string(),
                last_wire: binding.last_wire.as_ref().map(ToString::to_string),
                last_value: binding.last_value.as_ref().map(to_value),
                last_update_ms: binding.last_update_ms,
            })
            .collect(),
        recent_changes: snapshot
            .recent_changes
            .iter()
            .map(|change| ChangeDto {
                ts_ms: change.ts_ms,
                item_path: change.item_path.clone(),
                source: change.source.as_str().to_string(),
                old_value: change.old_value.as_ref().map(to_value),
                new_value: to_value(&change.new_value),
            })
            .collect(),
        metrics: to_value(&snapshot.metrics),
    }
}
