//! 追踪初始化、请求 ID 与插件级计数器。

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 请求级追踪标识。
#[derive(Debug, Clone)]
pub struct RequestIds {
    pub request_id: String,
    pub trace_id: String,
}

/// 计数器快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub poll_ticks: u64,
    pub poll_ticks_dropped: u64,
    pub blocks_read: u64,
    pub block_failures: u64,
    pub values_applied: u64,
    pub writes_suppressed: u64,
    pub decode_failures: u64,
    pub push_events: u64,
    pub push_rejected: u64,
    pub feedback_ignored: u64,
    pub validation_rejected: u64,
    pub device_writes: u64,
    pub device_write_failures: u64,
    pub device_write_latency_ms_total: u64,
}

/// 单个插件实例的计数器；实例之间不共享。
#[derive(Debug, Default)]
pub struct PluginMetrics {
    poll_ticks: AtomicU64,
    poll_ticks_dropped: AtomicU64,
    blocks_read: AtomicU64,
    block_failures: AtomicU64,
    values_applied: AtomicU64,
    writes_suppressed: AtomicU64,
    decode_failures: AtomicU64,
    push_events: AtomicU64,
    push_rejected: AtomicU64,
    feedback_ignored: AtomicU64,
    validation_rejected: AtomicU64,
    device_writes: AtomicU64,
    device_write_failures: AtomicU64,
    device_write_latency_ms_total: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PluginMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            poll_ticks: self.poll_ticks.load(Ordering::Relaxed),
            poll_ticks_dropped: self.poll_ticks_dropped.load(Ordering::Relaxed),
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            block_failures: self.block_failures.load(Ordering::Relaxed),
            values_applied: self.values_applied.load(Ordering::Relaxed),
            writes_suppressed: self.writes_suppressed.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            push_events: self.push_events.load(Ordering::Relaxed),
            push_rejected: self.push_rejected.load(Ordering::Relaxed),
            feedback_ignored: self.feedback_ignored.load(Ordering::Relaxed),
            validation_rejected: self.validation_rejected.load(Ordering::Relaxed),
            device_writes: self.device_writes.load(Ordering::Relaxed),
            device_write_failures: self.device_write_failures.load(Ordering::Relaxed),
            device_write_latency_ms_total: self
                .device_write_latency_ms_total
                .load(Ordering::Relaxed),
        }
    }

    /// 记录轮询周期执行次数。
    pub fn record_poll_tick(&self) {
        bump(&self.poll_ticks);
    }

    /// 记录因上一周期未结束而丢弃的轮询。
    pub fn record_poll_tick_dropped(&self) {
        bump(&self.poll_ticks_dropped);
    }

    pub fn record_block_read(&self) {
        bump(&self.blocks_read);
    }

    pub fn record_block_failure(&self) {
        bump(&self.block_failures);
    }

    /// 记录写入 item 的次数。
    pub fn record_value_applied(&self) {
        bump(&self.values_applied);
    }

    /// 记录因值未变化而跳过的写入。
    pub fn record_write_suppressed(&self) {
        bump(&self.writes_suppressed);
    }

    pub fn record_decode_failure(&self) {
        bump(&self.decode_failures);
    }

    pub fn record_push_event(&self) {
        bump(&self.push_events);
    }

    /// 记录被 allow-list 拒绝或无法解析的推送。
    pub fn record_push_rejected(&self) {
        bump(&self.push_rejected);
    }

    pub fn record_feedback_ignored(&self) {
        bump(&self.feedback_ignored);
    }

    pub fn record_validation_rejected(&self) {
        bump(&self.validation_rejected);
    }

    /// 记录设备写入成功及耗时（毫秒）。
    pub fn record_device_write(&self, latency_ms: u64) {
        bump(&self.device_writes);
        self.device_write_latency_ms_total
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_device_write_failure(&self) {
        bump(&self.device_write_failures);
    }
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的 request_id 与 trace_id。
pub fn new_request_ids() -> RequestIds {
    RequestIds {
        request_id: uuid::Uuid::new_v4().to_string(),
        trace_id: uuid::Uuid::new_v4().to_string(),
    }
}
