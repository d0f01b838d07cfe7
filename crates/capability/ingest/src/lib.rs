//! 推送监听（PushListener）。
//!
//! 设备主动上报的事件由各 [`Source`] 接收，统一为 [`PushEvent`] 交给插件的
//! [`PushHandler`]。单个事件解析失败只记录日志，监听继续运行。
//!
//! - `udp`：绑定本地端口，按来源 IP allow-list 过滤
//! - `tcp`：监听端口，按行 / 长度前缀分帧
//! - `http`：axum 接收 POST / PUT 推送
//! - `mqtt`：按声明顺序匹配 topic 过滤器，重连后重新订阅
//! - `supervisor`：运行各监听，异常退出后重启，停止时统一取消

pub mod acl;
pub mod event;
pub mod http;
pub mod mqtt;
pub mod supervisor;
pub mod tcp;
pub mod udp;

pub use acl::{ACL_WARN_WINDOW, AllowList, WarnThrottle};
pub use event::{IngestError, ListenerKind, PayloadFormat, PushEvent, PushHandler, Source};
pub use http::HttpListenSource;
pub use mqtt::{MqttSource, TopicFilter, topic_matches};
pub use supervisor::ListenerSupervisor;
pub use tcp::TcpListenSource;
pub use udp::UdpSource;
