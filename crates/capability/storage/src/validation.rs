//! 验证辅助函数
//!
//! - ensure_item_path：item 路径非空、无首尾空白
//! - ensure_instance_id：状态缓存的实例键非空

use crate::error::StorageError;

/// 验证 item 路径
pub fn ensure_item_path(path: &str) -> Result<(), StorageError> {
    if path.is_empty() || path.trim() != path {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// 验证实例 ID
pub fn ensure_instance_id(instance_id: &str) -> Result<(), StorageError> {
    if instance_id.trim().is_empty() {
        return Err(StorageError::InvalidPath(instance_id.to_string()));
    }
    Ok(())
}
