//! Dispatcher：item 写入与设备写入的唯一出入口。
//!
//! - apply：设备 → item，按绑定做变化抑制，带插件短名作为调用方标签
//! - emit：item → 设备，先做防回环判断，再交给写入链路
//! - 最近的变更记录保存在有界环形缓冲中，仅供快照使用

use devgw_codec::{is_invalid_sentinel, observed, zero_value};
use devgw_control::{ControlError, DeviceWriter};
use devgw_storage::{BindingRegistry, ItemStore, StorageError};
use devgw_telemetry::PluginMetrics;
use domain::{ChangeSource, CommandEntry, ItemValue, WireValue};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Dispatcher 错误。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("item store error: {0}")]
    Store(#[from] StorageError),
}

/// Dispatcher 参数。
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// 插件短名，同时作为调用方标签。
    pub short_name: String,
    pub change_ring_capacity: usize,
}

impl DispatcherConfig {
    pub fn new(short_name: impl Into<String>) -> Self {
        Self {
            short_name: short_name.into(),
            change_ring_capacity: 200,
        }
    }

    fn sanitized(mut self) -> Self {
        if self.change_ring_capacity == 0 {
            self.change_ring_capacity = 1;
        }
        self
    }
}

/// 变更记录。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub ts_ms: i64,
    pub item_path: String,
    pub source: ChangeSource,
    pub old_value: Option<ItemValue>,
    pub new_value: ItemValue,
}

/// 一次 apply 的结果统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub written: usize,
    pub suppressed: usize,
    pub failed: usize,
}

/// emit 的处理结果。
#[derive(Debug, Clone, PartialEq)]
pub enum EmitOutcome {
    /// 设备已接受；值为绑定上记录的线上值。
    Written(WireValue),
    /// 调用方是本插件自己。
    FeedbackIgnored,
    Unbound,
    ReadOnly,
}

struct ChangeRing {
    records: VecDeque<ChangeRecord>,
    capacity: usize,
}

impl ChangeRing {
    fn push(&mut self, record: ChangeRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }
}

/// Dispatcher
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: Arc<BindingRegistry>,
    store: Arc<dyn ItemStore>,
    writer: Arc<dyn DeviceWriter>,
    metrics: Arc<PluginMetrics>,
    changes: Mutex<ChangeRing>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<BindingRegistry>,
        store: Arc<dyn ItemStore>,
        writer: Arc<dyn DeviceWriter>,
        metrics: Arc<PluginMetrics>,
    ) -> Self {
        let config = config.sanitized();
        let changes = Mutex::new(ChangeRing {
            records: VecDeque::with_capacity(config.change_ring_capacity),
            capacity: config.change_ring_capacity,
        });
        Self {
            config,
            registry,
            store,
            writer,
            metrics,
            changes,
        }
    }

    pub fn caller_tag(&self) -> &str {
        &self.config.short_name
    }

    pub fn registry(&self) -> &Arc<BindingRegistry> {
        &self.registry
    }

    fn remember(&self, record: ChangeRecord) {
        self.changes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
    }

    /// 最近的变更（旧 → 新）
    pub fn recent_changes(&self) -> Vec<ChangeRecord> {
        self.changes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .records
            .iter()
            .cloned()
            .collect()
    }

    /// 设备 → item：把已解码的值写入绑定到该条目的全部 item。
    ///
    /// 线上值与绑定上次观测一致时跳过（首次观测总是写入）；
    /// item 写入失败时线上值不更新，下一次观测会重试。
    pub async fn apply(
        &self,
        entry: &CommandEntry,
        wire: &WireValue,
        value: ItemValue,
        source: ChangeSource,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        let seen = observed(entry, wire);
        let sentinel = is_invalid_sentinel(entry, wire);
        for binding in self.registry.bindings_for_entry(&entry.name) {
            if !binding.direction.can_read() {
                continue;
            }
            if binding.last_wire.as_ref() == Some(&seen) {
                report.suppressed += 1;
                self.metrics.record_write_suppressed();
                debug!(
                    target: "devgw.pipeline",
                    item = %binding.item_path,
                    entry = %entry.name,
                    "item_write_suppressed"
                );
                continue;
            }
            let value = if binding.invalid_zero && sentinel {
                zero_value(entry)
            } else {
                value.clone()
            };
            if let Err(err) = self
                .store
                .write_item(
                    &binding.item_path,
                    value.clone(),
                    &self.config.short_name,
                    source,
                )
                .await
            {
                report.failed += 1;
                warn!(
                    target: "devgw.pipeline",
                    item = %binding.item_path,
                    entry = %entry.name,
                    error = %err,
                    "item_write_failed"
                );
                continue;
            }
            let now = domain::now_epoch_ms();
            self.registry
                .record_wire(&binding.item_path, seen.clone(), value.clone(), now);
            self.metrics.record_value_applied();
            debug!(
                target: "devgw.pipeline",
                item = %binding.item_path,
                entry = %entry.name,
                value = %value,
                source = %source,
                "item_value_applied"
            );
            self.remember(ChangeRecord {
                ts_ms: now,
                item_path: binding.item_path,
                source,
                old_value: binding.last_value,
                new_value: value,
            });
            report.written += 1;
        }
        report
    }

    /// 从状态缓存恢复条目值；不记录线上值。
    pub async fn restore(&self, entry: &CommandEntry, value: ItemValue) -> ApplyReport {
        let mut report = ApplyReport::default();
        for binding in self.registry.bindings_for_entry(&entry.name) {
            match self
                .write_item(&binding.item_path, value.clone(), ChangeSource::Restore)
                .await
            {
                Ok(()) => {
                    self.registry.record_value(
                        &binding.item_path,
                        value.clone(),
                        domain::now_epoch_ms(),
                    );
                    report.written += 1;
                }
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// 写入非条目绑定的 item（原始监听 item、控制 item 复位）。
    pub async fn write_item(
        &self,
        item_path: &str,
        value: ItemValue,
        source: ChangeSource,
    ) -> Result<(), PipelineError> {
        let previous = self
            .store
            .read_item(item_path)
            .await
            .ok()
            .flatten()
            .and_then(|record| record.value);
        if let Err(err) = self
            .store
            .write_item(item_path, value.clone(), &self.config.short_name, source)
            .await
        {
            warn!(
                target: "devgw.pipeline",
                item = %item_path,
                error = %err,
                "item_write_failed"
            );
            return Err(err.into());
        }
        self.metrics.record_value_applied();
        self.remember(ChangeRecord {
            ts_ms: domain::now_epoch_ms(),
            item_path: item_path.to_string(),
            source,
            old_value: previous,
            new_value: value,
        });
        Ok(())
    }

    /// 调用方标签是否为本插件（防回环）。
    pub fn is_own_write(&self, caller: &str) -> bool {
        caller == self.config.short_name
    }

    /// item → 设备。
    ///
    /// 写入失败时绑定上的线上值保持不变，由下一次轮询对齐。
    pub async fn emit(
        &self,
        item_path: &str,
        value: ItemValue,
        caller: &str,
    ) -> Result<EmitOutcome, PipelineError> {
        if self.is_own_write(caller) {
            self.metrics.record_feedback_ignored();
            debug!(
                target: "devgw.pipeline",
                item = %item_path,
                caller = %caller,
                "feedback_ignored"
            );
            return Ok(EmitOutcome::FeedbackIgnored);
        }
        let Some(binding) = self.registry.get(item_path) else {
            return Ok(EmitOutcome::Unbound);
        };
        if !binding.direction.can_write() {
            warn!(
                target: "devgw.pipeline",
                item = %item_path,
                entry = %binding.entry.name,
                direction = binding.direction.as_str(),
                "item_write_read_only"
            );
            return Ok(EmitOutcome::ReadOnly);
        }
        let outcome = self.writer.write(&binding.entry, &value).await?;
        let now = domain::now_epoch_ms();
        self.registry
            .record_wire(item_path, outcome.wire.clone(), value.clone(), now);
        info!(
            target: "devgw.pipeline",
            item = %item_path,
            entry = %binding.entry.name,
            caller = %caller,
            value = %value,
            "item_change_emitted"
        );
        self.remember(ChangeRecord {
            ts_ms: now,
            item_path: item_path.to_string(),
            source: ChangeSource::HostWrite,
            old_value: binding.last_value,
            new_value: value,
        });
        Ok(EmitOutcome::Written(outcome.wire))
    }
}
