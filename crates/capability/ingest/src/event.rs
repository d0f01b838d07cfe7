//! 推送事件与监听抽象

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 采集错误。
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("bind error: {0}")]
    Bind(String),
    #[error("source error: {0}")]
    Source(String),
    #[error("handler error: {0}")]
    Handler(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// 监听类型，对应 item 上的 `udp_listen` / `tcp_listen` / `http_listen`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerKind {
    Udp,
    Tcp,
    Http,
    Mqtt,
}

impl ListenerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 负载类型；MQTT 由首个匹配的过滤器决定，其它监听为 Auto。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    #[default]
    Auto,
    Json,
    Text,
    Binary,
}

impl PayloadFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "json" => Some(Self::Json),
            "text" | "str" | "string" => Some(Self::Text),
            "binary" | "bytes" | "raw" => Some(Self::Binary),
            _ => None,
        }
    }
}

/// 一次推送。
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub kind: ListenerKind,
    /// 监听标识，如 `udp:0.0.0.0:41100`。
    pub listener: String,
    pub remote: Option<IpAddr>,
    /// MQTT topic 或 HTTP 路径。
    pub topic: Option<String>,
    pub format: PayloadFormat,
    pub payload: Vec<u8>,
    pub received_at_ms: i64,
}

impl PushEvent {
    pub fn new(kind: ListenerKind, listener: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind,
            listener: listener.into(),
            remote: None,
            topic: None,
            format: PayloadFormat::Auto,
            payload,
            received_at_ms: domain::now_epoch_ms(),
        }
    }

    pub fn with_remote(mut self, remote: IpAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }

    /// UTF-8 宽松解码后的负载文本。
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// 推送处理器。
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn handle(&self, event: PushEvent) -> Result<(), IngestError>;
}

/// 推送监听抽象；`cancel` 触发后尽快返回。
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> String;

    async fn run(
        &self,
        handler: Arc<dyn PushHandler>,
        cancel: CancellationToken,
    ) -> Result<(), IngestError>;
}
