//! # 插件外壳
//!
//! 把设备网关各能力组装为宿主可加载的插件实例：
//!
//! ```text
//! 宿主 ──init/parse_item/run/stop──► Plugin
//!                                     ├─ Session ◄── Poller（调度器周期触发）
//!                                     ├─ Dispatcher ──► ItemStore（宿主）
//!                                     ├─ ListenerSupervisor ──► PushRouter ──► Dispatcher
//!                                     └─ StateCache（停止时写出，启动时恢复）
//! 宿主 ──update_item──► Dispatcher::emit ──► WriteService ──► Session
//! ```
//!
//! item 通过 `<attr_prefix>_*` 属性声明角色：绑定命令、原始监听或控制项。

mod error;
mod parse;
mod router;
mod scheduler;
mod shell;

pub use error::PluginError;
pub use parse::{AttributeKeys, ControlKind, ItemRole, parse_item_role};
pub use router::{ListenerPlan, PushRouter, RawItem};
pub use scheduler::{Job, RecordingScheduler, Scheduler, TokioScheduler};
pub use shell::{HostContext, ParseOutcome, Plugin, PluginSnapshot};
