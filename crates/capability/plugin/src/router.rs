//! 推送路由：把监听收到的事件交给 Dispatcher。
//!
//! - MQTT：按状态 topic 匹配条目
//! - UDP / TCP / HTTP：负载是 JSON 文档时按 JSON 位置匹配，否则逐行按前缀匹配
//! - 原始监听 item：接收每条被接受消息的负载文本

use async_trait::async_trait;
use devgw_codec::{DecodeOutcome, decode, hex_dump};
use devgw_ingest::{
    AllowList, IngestError, ListenerKind, PayloadFormat, PushEvent, PushHandler, WarnThrottle,
};
use devgw_pipeline::Dispatcher;
use devgw_protocol::plan;
use devgw_storage::BindingRegistry;
use devgw_telemetry::PluginMetrics;
use domain::{ChangeSource, CommandEntry, ItemValue, WireValue};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// 绑定在某个监听上的原始 item。
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub path: String,
    pub allow: AllowList,
}

/// 单个监听的路由计划。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListenerPlan {
    /// 是否按命令表条目解析（插件级 `udp_listen` 与 MQTT 订阅）
    pub structured: bool,
    pub raw_items: Vec<RawItem>,
}

impl ListenerPlan {
    /// 监听级 allow-list：所有使用者的并集。
    pub fn listener_allow(&self, plugin_allow: &AllowList) -> AllowList {
        let mut allow: Option<AllowList> = self.structured.then(|| plugin_allow.clone());
        for item in &self.raw_items {
            allow = Some(match allow {
                Some(current) => current.union(&item.allow),
                None => item.allow.clone(),
            });
        }
        allow.unwrap_or_default()
    }
}

/// 推送事件路由器；每个监听一个实例。
pub struct PushRouter {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<BindingRegistry>,
    metrics: Arc<PluginMetrics>,
    plan: ListenerPlan,
    plugin_allow: AllowList,
    /// MQTT topic 前缀，匹配状态 topic 前剥离
    topic_prefix: Option<String>,
    throttle: WarnThrottle,
}

fn admitted(throttle: &WarnThrottle, allow: &AllowList, remote: Option<IpAddr>, listener: &str) -> bool {
    match remote {
        Some(ip) => throttle.admit(allow, ip, listener),
        None => allow.is_open(),
    }
}

impl PushRouter {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<PluginMetrics>,
        plan: ListenerPlan,
        plugin_allow: AllowList,
    ) -> Self {
        let registry = Arc::clone(dispatcher.registry());
        Self {
            dispatcher,
            registry,
            metrics,
            plan,
            plugin_allow,
            topic_prefix: None,
            throttle: WarnThrottle::default(),
        }
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.topic_prefix = (!prefix.trim_matches('/').is_empty()).then_some(prefix);
        self
    }

    fn relative_topic<'a>(&self, topic: &'a str) -> &'a str {
        let Some(prefix) = self.topic_prefix.as_deref() else {
            return topic;
        };
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        topic.strip_prefix(prefix.as_str()).unwrap_or(topic)
    }

    /// 解码并交给 Dispatcher；返回写入的 item 数。
    async fn apply(&self, entry: &CommandEntry, wire: WireValue) -> usize {
        match decode(entry, &wire) {
            DecodeOutcome::Decoded(value) => {
                self.dispatcher
                    .apply(entry, &wire, value, ChangeSource::Push)
                    .await
                    .written
            }
            DecodeOutcome::Skip(reason) => {
                debug!(target: "devgw.plugin", entry = %entry.name, reason = %reason, "push_value_skipped");
                0
            }
            DecodeOutcome::Fatal(reason) => {
                self.metrics.record_decode_failure();
                warn!(
                    target: "devgw.plugin",
                    entry = %entry.name,
                    reason = %reason,
                    payload = %hex_dump(&wire),
                    "push_decode_failed"
                );
                0
            }
        }
    }

    fn push_entries(&self) -> Vec<Arc<CommandEntry>> {
        self.registry
            .bound_entries()
            .into_iter()
            .filter(|entry| {
                self.registry
                    .bindings_for_entry(&entry.name)
                    .iter()
                    .any(|binding| binding.direction.can_read())
            })
            .collect()
    }

    async fn route_topic(&self, event: &PushEvent) -> usize {
        let Some(topic) = event.topic.as_deref() else {
            return 0;
        };
        let topic = self.relative_topic(topic);
        let mut written = 0;
        for entry in self.push_entries() {
            let Some(wire) = plan::extract_push_topic(&entry, topic, &event.payload) else {
                continue;
            };
            let wire = match event.format {
                PayloadFormat::Json => plan::parse_document(&event.payload)
                    .map(WireValue::Json)
                    .unwrap_or(wire),
                _ => wire,
            };
            written += self.apply(&entry, wire).await;
        }
        written
    }

    async fn route_document(&self, event: &PushEvent) -> usize {
        let entries = self.push_entries();
        let mut written = 0;
        if let Ok(document) = plan::parse_document(&event.payload) {
            for entry in &entries {
                if let Some(wire) = plan::extract_push_json(entry, &document) {
                    written += self.apply(entry, wire).await;
                }
            }
            return written;
        }
        let text = event.text();
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            for entry in &entries {
                if let Some(wire) = plan::extract_push_line(entry, line) {
                    written += self.apply(entry, wire).await;
                }
            }
        }
        written
    }

    async fn route_raw(&self, event: &PushEvent) -> usize {
        let mut written = 0;
        let text = event.text();
        for item in &self.plan.raw_items {
            if !admitted(&self.throttle, &item.allow, event.remote, &event.listener) {
                continue;
            }
            match self
                .dispatcher
                .write_item(&item.path, ItemValue::Text(text.clone()), ChangeSource::Push)
                .await
            {
                Ok(()) => written += 1,
                Err(err) => {
                    warn!(target: "devgw.plugin", item = %item.path, error = %err, "raw_item_write_failed");
                }
            }
        }
        written
    }
}

#[async_trait]
impl PushHandler for PushRouter {
    async fn handle(&self, event: PushEvent) -> Result<(), IngestError> {
        self.metrics.record_push_event();
        let mut written = 0;
        if self.plan.structured {
            if event.kind == ListenerKind::Mqtt {
                written += self.route_topic(&event).await;
            } else if admitted(&self.throttle, &self.plugin_allow, event.remote, &event.listener) {
                written += self.route_document(&event).await;
            } else {
                self.metrics.record_push_rejected();
            }
        }
        written += self.route_raw(&event).await;
        debug!(
            target: "devgw.plugin",
            listener = %event.listener,
            bytes = event.payload.len(),
            written,
            "push_event_routed"
        );
        Ok(())
    }
}
