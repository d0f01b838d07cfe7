//! 插件外壳：宿主插件契约的实现。
//!
//! 生命周期：`init` → `parse_item`（每个 item 一次）→ `run` → `update_item`* → `stop`。
//! 运行期错误只记录日志，不返回给宿主；`init` 失败时置 init-incomplete，`run` 拒绝执行。

use crate::error::PluginError;
use crate::parse::{AttributeKeys, ControlKind, ItemRole, parse_item_role};
use crate::router::{ListenerPlan, PushRouter, RawItem};
use crate::scheduler::{Job, Scheduler};
use devgw_codec::CommandTable;
use devgw_config::{ConfigError, ParameterSource, PluginConfig};
use devgw_control::WriteService;
use devgw_ingest::{
    AllowList, HttpListenSource, IngestError, ListenerKind, ListenerSupervisor, MqttSource,
    PayloadFormat, Source, TcpListenSource, TopicFilter, UdpSource,
};
use devgw_pipeline::{ChangeRecord, Dispatcher, DispatcherConfig, EmitOutcome};
use devgw_poller::{Poller, plan_blocks};
use devgw_protocol::{Framing, Transport, TransportSettings, build_transport};
use devgw_session::{Session, SessionConfig, SessionSnapshot};
use devgw_storage::{Binding, BindingRegistry, BindingSnapshot, ItemStore, StateCache};
use devgw_telemetry::{MetricsSnapshot, PluginMetrics};
use domain::{Address, ChangeSource, CommandEntry, ItemDescriptor, ItemValue, WireType};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// 宿主提供给插件的协作者。
#[derive(Clone)]
pub struct HostContext {
    pub store: Arc<dyn ItemStore>,
    pub scheduler: Arc<dyn Scheduler>,
}

/// parse_item 的结果。
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// item 不带本插件属性
    Ignored,
    Bound { entry: String },
    Listener { kind: ListenerKind, addr: SocketAddr },
    Control(ControlKind),
}

impl ParseOutcome {
    /// 宿主是否需要把该 item 的变化回调给插件。
    pub fn wants_updates(&self) -> bool {
        matches!(self, Self::Bound { .. } | Self::Control(_))
    }
}

/// Web 快照：插件当前状态的只读视图。
#[derive(Debug, Clone, Serialize)]
pub struct PluginSnapshot {
    pub short_name: String,
    pub instance_id: Option<String>,
    pub init_complete: bool,
    pub init_error: Option<String>,
    pub running: bool,
    pub paused: bool,
    pub session: Option<SessionSnapshot>,
    pub bindings: Vec<BindingSnapshot>,
    pub listeners: Vec<String>,
    pub recent_changes: Vec<ChangeRecord>,
    pub metrics: MetricsSnapshot,
}

type ListenerKey = (ListenerKind, SocketAddr);

/// init 成功后才存在的运行期状态。
struct Runtime {
    config: PluginConfig,
    keys: AttributeKeys,
    table: Arc<CommandTable>,
    plugin_allow: AllowList,
    session: Arc<Session>,
    registry: Arc<BindingRegistry>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<dyn Scheduler>,
    metrics: Arc<PluginMetrics>,
    cache: Option<StateCache>,
    controls: Mutex<BTreeMap<String, ControlKind>>,
    listeners: Mutex<BTreeMap<ListenerKey, ListenerPlan>>,
    poller: Mutex<Option<Arc<Poller>>>,
    supervisor: Mutex<Option<ListenerSupervisor>>,
    bound_listeners: Mutex<Vec<String>>,
    running: AtomicBool,
    paused: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
}

/// 插件外壳
pub struct Plugin {
    short_name: String,
    init_error: Option<String>,
    runtime: Option<Runtime>,
}

impl Plugin {
    /// 按参数构造；传输由配置决定，此时不打开。
    ///
    /// `table` 为空时从 `command_table` 参数指向的文件加载。
    pub fn init(
        params: &dyn ParameterSource,
        table: Option<CommandTable>,
        host: HostContext,
    ) -> Self {
        Self::init_inner(params, table, host, None)
    }

    /// 与 [`Plugin::init`] 相同，但使用调用方提供的传输（SDK 适配、测试）。
    pub fn init_with_transport(
        params: &dyn ParameterSource,
        table: Option<CommandTable>,
        host: HostContext,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self::init_inner(params, table, host, Some(transport))
    }

    fn init_inner(
        params: &dyn ParameterSource,
        table: Option<CommandTable>,
        host: HostContext,
        transport: Option<Box<dyn Transport>>,
    ) -> Self {
        let short_name = params
            .get("short_name")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "devgw".to_string());
        match Runtime::build(params, table, host, transport) {
            Ok(runtime) => {
                info!(
                    target: "devgw.plugin",
                    plugin = %short_name,
                    transport = runtime.config.transport_kind.as_str(),
                    entries = runtime.table.len(),
                    cycle_secs = runtime.config.cycle.as_secs(),
                    "plugin_initialized"
                );
                Self {
                    short_name,
                    init_error: None,
                    runtime: Some(runtime),
                }
            }
            Err(err) => {
                error!(target: "devgw.plugin", plugin = %short_name, error = %err, "plugin_init_incomplete");
                Self {
                    short_name,
                    init_error: Some(err.to_string()),
                    runtime: None,
                }
            }
        }
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// init 是否完成；为 false 时宿主不应调用 `run`。
    pub fn init_complete(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn init_error(&self) -> Option<&str> {
        self.init_error.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.runtime
            .as_ref()
            .is_some_and(|runtime| runtime.running.load(Ordering::Acquire))
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.runtime.as_ref().map(|runtime| &runtime.session)
    }

    pub fn registry(&self) -> Option<&Arc<BindingRegistry>> {
        self.runtime.as_ref().map(|runtime| &runtime.registry)
    }

    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.metrics.snapshot())
    }

    /// 已绑定的监听（`udp:127.0.0.1:41100` 形式），仅运行期间非空。
    pub fn listeners(&self) -> Vec<String> {
        match &self.runtime {
            Some(runtime) => runtime
                .bound_listeners
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
            None => Vec::new(),
        }
    }

    /// 指定类型的实际监听地址（端口 0 绑定后可取得真实端口）。
    pub fn listener_addr(&self, kind: ListenerKind) -> Option<SocketAddr> {
        let prefix = format!("{}:", kind.as_str());
        self.listeners()
            .iter()
            .filter_map(|label| label.strip_prefix(prefix.as_str()))
            .find_map(|addr| addr.parse().ok())
    }

    /// 解析 item；带本插件属性时登记绑定、监听或控制项。
    pub fn parse_item(&self, item: &ItemDescriptor) -> Result<ParseOutcome, PluginError> {
        let runtime = self.runtime.as_ref().ok_or_else(|| {
            PluginError::InitIncomplete(self.init_error.clone().unwrap_or_default())
        })?;
        let Some(role) = parse_item_role(item, &runtime.keys, &runtime.table)? else {
            return Ok(ParseOutcome::Ignored);
        };
        match role {
            ItemRole::Bound {
                entry,
                direction,
                invalid_zero,
            } => {
                let name = entry.name.clone();
                let binding = Binding::new(item.path.clone(), entry)
                    .with_direction(direction)
                    .with_invalid_zero(invalid_zero);
                if runtime.registry.register(binding)? {
                    info!(
                        target: "devgw.plugin",
                        item = %item.path,
                        entry = %name,
                        direction = direction.as_str(),
                        "item_bound"
                    );
                }
                Ok(ParseOutcome::Bound { entry: name })
            }
            ItemRole::Listener { kind, addr, allow } => {
                let allow = allow.unwrap_or_else(|| runtime.plugin_allow.clone());
                let mut listeners = runtime
                    .listeners
                    .lock()
                    .unwrap_or_else(|p| p.into_inner());
                let plan = listeners.entry((kind, addr)).or_default();
                if !plan.raw_items.iter().any(|raw| raw.path == item.path) {
                    plan.raw_items.push(RawItem {
                        path: item.path.clone(),
                        allow,
                    });
                }
                info!(target: "devgw.plugin", item = %item.path, listener = %kind, addr = %addr, "item_listener_bound");
                Ok(ParseOutcome::Listener { kind, addr })
            }
            ItemRole::Control(kind) => {
                runtime
                    .controls
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(item.path.clone(), kind);
                info!(target: "devgw.plugin", item = %item.path, control = kind.as_str(), "item_control_bound");
                Ok(ParseOutcome::Control(kind))
            }
        }
    }

    /// 启动：恢复持久化值、打开会话、启动监听、注册轮询。重复调用无副作用。
    pub async fn run(&self) {
        let Some(runtime) = &self.runtime else {
            error!(
                target: "devgw.plugin",
                plugin = %self.short_name,
                error = self.init_error.as_deref().unwrap_or_default(),
                "plugin_run_refused"
            );
            return;
        };
        runtime.run().await;
    }

    /// 停止：取消轮询、停止监听、关闭会话、写出持久化值。未运行时不做任何事。
    pub async fn stop(&self) {
        if let Some(runtime) = &self.runtime {
            runtime.stop().await;
        }
    }

    /// item 变化回调（宿主 → 设备）。
    pub async fn update_item(&self, item_path: &str, value: ItemValue, caller: &str) {
        let Some(runtime) = &self.runtime else {
            debug!(target: "devgw.plugin", item = %item_path, "update_before_init");
            return;
        };
        runtime.update_item(item_path, value, caller).await;
    }

    pub fn snapshot(&self) -> PluginSnapshot {
        let Some(runtime) = &self.runtime else {
            return PluginSnapshot {
                short_name: self.short_name.clone(),
                instance_id: None,
                init_complete: false,
                init_error: self.init_error.clone(),
                running: false,
                paused: false,
                session: None,
                bindings: Vec::new(),
                listeners: Vec::new(),
                recent_changes: Vec::new(),
                metrics: MetricsSnapshot::default(),
            };
        };
        PluginSnapshot {
            short_name: self.short_name.clone(),
            instance_id: Some(runtime.config.instance_id.clone()),
            init_complete: true,
            init_error: None,
            running: runtime.running.load(Ordering::Acquire),
            paused: runtime.paused.load(Ordering::Acquire),
            session: Some(runtime.session.snapshot()),
            bindings: runtime.registry.snapshot(),
            listeners: self.listeners(),
            recent_changes: runtime.dispatcher.recent_changes(),
            metrics: runtime.metrics.snapshot(),
        }
    }
}

/// TCP 监听沿用设备的分帧；设备不是流式协议时按 CRLF 分行。
fn listen_framing(settings: &TransportSettings) -> Framing {
    match settings {
        TransportSettings::Tcp { framing, .. } | TransportSettings::Serial { framing, .. }
            if *framing != Framing::Idle =>
        {
            framing.clone()
        }
        _ => Framing::crlf(),
    }
}

fn topic_format(entry: &CommandEntry) -> PayloadFormat {
    match entry.wire_type {
        WireType::Blob => PayloadFormat::Binary,
        WireType::String | WireType::Enum | WireType::BoolPair => PayloadFormat::Text,
        _ => PayloadFormat::Json,
    }
}

impl Runtime {
    fn build(
        params: &dyn ParameterSource,
        table: Option<CommandTable>,
        host: HostContext,
        transport: Option<Box<dyn Transport>>,
    ) -> Result<Self, PluginError> {
        let config = PluginConfig::from_params(params)?;
        let table = match (table, config.command_table.as_ref()) {
            (Some(table), _) => table,
            (None, Some(path)) => CommandTable::load(path)?,
            (None, None) => return Err(ConfigError::Missing("command_table".to_string()).into()),
        };
        let plugin_allow = AllowList::parse(&config.allow_list)
            .map_err(|bad| ConfigError::Invalid("allow_list".to_string(), bad))?;
        let transport = match transport {
            Some(transport) => transport,
            None => build_transport(config.transport.clone(), config.timeouts),
        };
        let session = Arc::new(Session::new(
            config.short_name.clone(),
            transport,
            SessionConfig {
                lock_timeout: config.lock_timeout,
                reconnect_step: config.reconnect_step,
                reconnect_max: config.reconnect_max,
            },
        ));
        let metrics = Arc::new(PluginMetrics::new());
        let registry = Arc::new(BindingRegistry::new());
        let writer = Arc::new(WriteService::new(Arc::clone(&session), Arc::clone(&metrics)));
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig {
                short_name: config.short_name.clone(),
                change_ring_capacity: config.change_ring_capacity,
            },
            Arc::clone(&registry),
            host.store,
            writer,
            Arc::clone(&metrics),
        ));
        let cache = config
            .cache_dir
            .as_ref()
            .map(|dir| StateCache::new(dir, &config.short_name));

        let mut listeners = BTreeMap::new();
        if let Some(addr) = config.udp_listen {
            listeners.insert(
                (ListenerKind::Udp, addr),
                ListenerPlan {
                    structured: true,
                    raw_items: Vec::new(),
                },
            );
        }

        Ok(Self {
            keys: AttributeKeys::new(&config.attr_prefix),
            table: Arc::new(table),
            plugin_allow,
            session,
            registry,
            dispatcher,
            scheduler: host.scheduler,
            metrics,
            cache,
            controls: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(listeners),
            poller: Mutex::new(None),
            supervisor: Mutex::new(None),
            bound_listeners: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            config,
        })
    }

    fn poll_job_name(&self) -> String {
        format!("{}_poll", self.config.short_name)
    }

    fn current_poller(&self) -> Option<Arc<Poller>> {
        self.poller
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// 至少有一个可读绑定的条目。
    fn readable_entries(&self) -> Vec<Arc<CommandEntry>> {
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

    async fn run(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.running.load(Ordering::Acquire) {
            debug!(target: "devgw.plugin", plugin = %self.config.short_name, "plugin_already_running");
            return;
        }
        self.session.rearm();
        self.restore_persisted().await;

        if !self.paused.load(Ordering::Acquire) {
            if let Err(err) = self.session.ensure_open().await {
                warn!(
                    target: "devgw.plugin",
                    plugin = %self.config.short_name,
                    error = %err,
                    "session_open_deferred"
                );
            }
        }

        let blocks = plan_blocks(self.readable_entries(), self.config.cycle);
        let poller = Arc::new(Poller::new(
            Arc::clone(&self.session),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.metrics),
            blocks,
        ));
        let block_count = poller.blocks().len();
        if block_count > 0 {
            let job_poller = Arc::clone(&poller);
            let job: Job = Arc::new(move || {
                let poller = Arc::clone(&job_poller);
                async move {
                    poller.tick().await;
                }
                .boxed()
            });
            self.scheduler
                .add(&self.poll_job_name(), self.config.cycle, job);
        }
        *self.poller.lock().unwrap_or_else(|p| p.into_inner()) = Some(poller);

        let listeners = self.start_listeners().await;
        self.running.store(true, Ordering::Release);
        info!(
            target: "devgw.plugin",
            plugin = %self.config.short_name,
            bindings = self.registry.len(),
            blocks = block_count,
            listeners,
            "plugin_started"
        );
    }

    async fn restore_persisted(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let values = match cache.load(&self.config.instance_id) {
            Ok(values) => values,
            Err(err) => {
                warn!(target: "devgw.plugin", path = %cache.path().display(), error = %err, "state_cache_load_failed");
                return;
            }
        };
        for (name, value) in values {
            let Some(entry) = self.table.get(&name).filter(|entry| entry.persist) else {
                debug!(target: "devgw.plugin", entry = %name, "state_cache_entry_ignored");
                continue;
            };
            let report = self.dispatcher.restore(entry, value).await;
            debug!(target: "devgw.plugin", entry = %name, written = report.written, "state_restored");
        }
    }

    fn persist(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let values = self.registry.persisted_values();
        if values.is_empty() {
            return;
        }
        if let Err(err) = cache.save(&self.config.instance_id, &values) {
            warn!(target: "devgw.plugin", path = %cache.path().display(), error = %err, "state_cache_save_failed");
        }
    }

    async fn bind_source(
        &self,
        kind: ListenerKind,
        addr: SocketAddr,
        allow: AllowList,
    ) -> Result<(Arc<dyn Source>, SocketAddr), IngestError> {
        match kind {
            ListenerKind::Udp => {
                let source = UdpSource::bind(addr, allow).await?;
                let local = source.local_addr();
                let source: Arc<dyn Source> = Arc::new(source);
                Ok((source, local))
            }
            ListenerKind::Tcp => {
                let source =
                    TcpListenSource::bind(addr, listen_framing(&self.config.transport), allow).await?;
                let local = source.local_addr();
                let source: Arc<dyn Source> = Arc::new(source);
                Ok((source, local))
            }
            ListenerKind::Http => {
                let source = HttpListenSource::bind(addr, allow).await?;
                let local = source.local_addr();
                let source: Arc<dyn Source> = Arc::new(source);
                Ok((source, local))
            }
            ListenerKind::Mqtt => Err(IngestError::Bind(
                "mqtt subscriptions are not bound to an address".to_string(),
            )),
        }
    }

    /// 启动全部监听；绑定失败只记录日志。返回启动的监听数。
    async fn start_listeners(&self) -> usize {
        let plans: Vec<(ListenerKey, ListenerPlan)> = self
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(key, plan)| (*key, plan.clone()))
            .collect();
        let supervisor = ListenerSupervisor::new();
        let mut labels = Vec::new();

        for ((kind, addr), plan) in plans {
            let allow = plan.listener_allow(&self.plugin_allow);
            let router = PushRouter::new(
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.metrics),
                plan,
                self.plugin_allow.clone(),
            );
            match self.bind_source(kind, addr, allow).await {
                Ok((source, local)) => {
                    labels.push(format!("{}:{}", kind, local));
                    supervisor.spawn(source, Arc::new(router));
                }
                Err(err) => {
                    warn!(target: "devgw.plugin", listener = %kind, addr = %addr, error = %err, "listener_bind_failed");
                }
            }
        }

        if let Some(settings) = &self.config.mqtt {
            let filters: Vec<TopicFilter> = self
                .readable_entries()
                .iter()
                .filter_map(|entry| match &entry.address {
                    Address::Topic { state, .. } => {
                        Some(TopicFilter::new(settings.topic(state), topic_format(entry)))
                    }
                    _ => None,
                })
                .collect();
            if !filters.is_empty() {
                let label = format!("mqtt:{}:{}", settings.host, settings.port);
                let router = PushRouter::new(
                    Arc::clone(&self.dispatcher),
                    Arc::clone(&self.metrics),
                    ListenerPlan {
                        structured: true,
                        raw_items: Vec::new(),
                    },
                    AllowList::any(),
                )
                .with_topic_prefix(settings.topic_prefix.clone());
                supervisor.spawn(
                    Arc::new(MqttSource::new(settings.clone(), filters)),
                    Arc::new(router),
                );
                labels.push(label);
            }
        }

        let started = labels.len();
        *self
            .bound_listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = labels;
        *self.supervisor.lock().unwrap_or_else(|p| p.into_inner()) = Some(supervisor);
        started
    }

    async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.scheduler.remove(&self.poll_job_name());
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }
        self.session.shutdown().await;
        self.persist();
        self.bound_listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        *self.poller.lock().unwrap_or_else(|p| p.into_inner()) = None;
        info!(target: "devgw.plugin", plugin = %self.config.short_name, "plugin_stopped");
    }

    async fn update_item(&self, item_path: &str, value: ItemValue, caller: &str) {
        if self.dispatcher.is_own_write(caller) {
            self.metrics.record_feedback_ignored();
            debug!(target: "devgw.plugin", item = %item_path, caller = %caller, "feedback_ignored");
            return;
        }
        let control = self
            .controls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(item_path)
            .copied();
        if let Some(kind) = control {
            self.handle_control(item_path, kind, &value).await;
            return;
        }
        match self.dispatcher.emit(item_path, value, caller).await {
            Ok(EmitOutcome::Written(wire)) => {
                debug!(target: "devgw.plugin", item = %item_path, wire = %wire, "item_change_written");
            }
            Ok(EmitOutcome::Unbound) => {
                debug!(target: "devgw.plugin", item = %item_path, "item_change_unbound");
            }
            Ok(EmitOutcome::ReadOnly | EmitOutcome::FeedbackIgnored) => {}
            Err(err) => {
                debug!(target: "devgw.plugin", item = %item_path, error = %err, "item_change_not_applied");
            }
        }
    }

    async fn handle_control(&self, item_path: &str, kind: ControlKind, value: &ItemValue) {
        let Some(on) = value.as_bool() else {
            warn!(target: "devgw.plugin", item = %item_path, value = %value, control = kind.as_str(), "control_value_invalid");
            return;
        };
        match kind {
            ControlKind::Pause => {
                if on && !self.paused.swap(true, Ordering::AcqRel) {
                    self.session.suspend().await;
                    info!(target: "devgw.plugin", plugin = %self.config.short_name, "plugin_paused");
                } else if !on && self.paused.swap(false, Ordering::AcqRel) {
                    self.session.resume().await;
                    info!(target: "devgw.plugin", plugin = %self.config.short_name, "plugin_resumed");
                }
            }
            ControlKind::UpdateNow => {
                if !on {
                    return;
                }
                match self.current_poller() {
                    Some(poller) => {
                        let report = poller.tick().await;
                        info!(
                            target: "devgw.plugin",
                            plugin = %self.config.short_name,
                            blocks_read = report.blocks_read,
                            items_written = report.items_written,
                            "update_now_completed"
                        );
                    }
                    None => {
                        debug!(target: "devgw.plugin", item = %item_path, "update_now_before_run");
                    }
                }
                if let Err(err) = self
                    .dispatcher
                    .write_item(item_path, ItemValue::Bool(false), ChangeSource::Poll)
                    .await
                {
                    warn!(target: "devgw.plugin", item = %item_path, error = %err, "control_reset_failed");
                }
            }
        }
    }
}
