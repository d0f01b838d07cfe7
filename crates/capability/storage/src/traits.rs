//! 存储接口 Trait 定义
//!
//! ItemStore 是宿主 item 树对插件暴露的最小契约：按不透明路径读写，
//! 每次写入都带调用方标签。

use crate::error::StorageError;
use crate::models::ItemRecord;
use async_trait::async_trait;
use domain::{ChangeSource, ItemValue};

/// 宿主 item 存储接口
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// 写入 item；`caller` 为写入方标签，宿主据此通知其它插件。
    async fn write_item(
        &self,
        path: &str,
        value: ItemValue,
        caller: &str,
        source: ChangeSource,
    ) -> Result<(), StorageError>;

    /// 读取 item 当前记录
    async fn read_item(&self, path: &str) -> Result<Option<ItemRecord>, StorageError>;
}
