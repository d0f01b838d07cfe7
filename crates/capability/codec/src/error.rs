//! 编解码错误类型定义

/// 编解码错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// 值无法用该条目的线上类型表示
    #[error("type error: {0}")]
    Type(String),

    /// 超出可设置范围
    #[error("range error: {value} outside [{min}, {max}]")]
    Range { value: f64, min: f64, max: f64 },

    /// 枚举映射中不存在的语义值
    #[error("unknown enum value: {0}")]
    UnknownEnum(String),

    /// bit 写入需要先读取当前字节
    #[error("bit write requires the current wire value")]
    MissingCurrent,

    /// 线上数据长度或格式不符
    #[error("malformed wire value: {0}")]
    Malformed(String),
}

/// 命令表加载错误
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("table parse error: {0}")]
    Parse(String),

    #[error("duplicate entry: {0}")]
    Duplicate(String),

    #[error("invalid entry {name}: {reason}")]
    Invalid { name: String, reason: String },
}
