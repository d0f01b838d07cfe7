//! 存储层错误类型
//!
//! - item 写入 / 读取失败
//! - 绑定冲突
//! - 状态缓存文件读写与解析错误

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid item path: {0:?}")]
    InvalidPath(String),
    #[error("item not found: {0}")]
    NotFound(String),
    #[error("binding conflict: {item} already bound to {existing}")]
    Conflict { item: String, existing: String },
    #[error("lock failed")]
    Lock,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state cache error: {0}")]
    Serde(#[from] serde_json::Error),
}
