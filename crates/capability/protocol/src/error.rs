//! 传输错误类型定义

/// 传输层错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// 连接错误（拒绝、不可达、探测失败）
    #[error("connect error: {0}")]
    Connect(String),

    /// IO 错误（含 HTTP 5xx）
    #[error("io error: {0}")]
    Io(String),

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// 分帧错误
    #[error("framing error: {0}")]
    Framing(String),

    /// 帧完整但语义无效（Modbus 异常码、HTTP 4xx、非法 JSON）
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 回复短于请求的块长度
    #[error("short reply: expected {expected}, got {actual}")]
    ShortReply { expected: usize, actual: usize },

    /// 配置解析错误
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// 该传输不支持此请求
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// 传输未打开
    #[error("transport not open")]
    NotOpen,
}

impl TransportError {
    /// 是否为链路级故障：会话应转入 disconnected。
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Io(_) | Self::Timeout(_) | Self::Framing(_) | Self::NotOpen
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            std::io::ErrorKind::ConnectionRefused => Self::Connect(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}
