use devgw_telemetry::{PluginMetrics, new_request_ids};

#[test]
fn request_ids_non_empty() {
    let ids = new_request_ids();
    assert!(!ids.request_id.is_empty());
    assert!(!ids.trace_id.is_empty());
    assert_ne!(ids.request_id, ids.trace_id);
}

#[test]
fn plugin_metrics_are_per_instance() {
    let avr = PluginMetrics::new();
    let meter = PluginMetrics::new();

    avr.record_poll_tick();
    avr.record_value_applied();
    avr.record_device_write(12);
    avr.record_device_write(8);

    let snapshot = avr.snapshot();
    assert_eq!(snapshot.poll_ticks, 1);
    assert_eq!(snapshot.values_applied, 1);
    assert_eq!(snapshot.device_writes, 2);
    assert_eq!(snapshot.device_write_latency_ms_total, 20);
    assert_eq!(meter.snapshot(), Default::default());
}
