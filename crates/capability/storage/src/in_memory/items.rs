//! item 树内存实现
//!
//! 用于参考宿主与测试：记录全部写入，并通过 broadcast 通知变更。

use crate::error::StorageError;
use crate::models::{ItemRecord, ItemWrite};
use crate::traits::ItemStore;
use crate::validation::ensure_item_path;
use domain::{ChangeSource, ItemDescriptor, ItemValue};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// item 树内存存储
pub struct InMemoryItemStore {
    items: RwLock<HashMap<String, ItemRecord>>,
    journal: RwLock<Vec<ItemWrite>>,
    changes: broadcast::Sender<ItemWrite>,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            items: RwLock::new(HashMap::new()),
            journal: RwLock::new(Vec::new()),
            changes,
        }
    }

    /// 按描述预先声明 item（宿主启动时的 item 树）
    pub fn with_items(descriptors: &[ItemDescriptor]) -> Self {
        let store = Self::new();
        for descriptor in descriptors {
            store.declare(descriptor);
        }
        store
    }

    pub fn declare(&self, descriptor: &ItemDescriptor) {
        let mut items = self.items.write().unwrap_or_else(|p| p.into_inner());
        items
            .entry(descriptor.path.clone())
            .or_insert_with(|| ItemRecord::new(descriptor.path.clone(), descriptor.item_type));
    }

    /// 订阅写入通知
    pub fn subscribe(&self) -> broadcast::Receiver<ItemWrite> {
        self.changes.subscribe()
    }

    /// 当前值
    pub fn value(&self, path: &str) -> Option<ItemValue> {
        let items = self.items.read().unwrap_or_else(|p| p.into_inner());
        items.get(path).and_then(|record| record.value.clone())
    }

    /// 全部写入记录（按时间顺序）
    pub fn writes(&self) -> Vec<ItemWrite> {
        self.journal
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// 指定 item 的写入记录
    pub fn writes_to(&self, path: &str) -> Vec<ItemWrite> {
        self.writes()
            .into_iter()
            .filter(|write| write.path == path)
            .collect()
    }

    /// 所有 item 路径（排序）
    pub fn paths(&self) -> Vec<String> {
        let items = self.items.read().unwrap_or_else(|p| p.into_inner());
        let mut paths: Vec<String> = items.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl Default for InMemoryItemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ItemStore for InMemoryItemStore {
    async fn write_item(
        &self,
        path: &str,
        value: ItemValue,
        caller: &str,
        source: ChangeSource,
    ) -> Result<(), StorageError> {
        ensure_item_path(path)?;
        let now = domain::now_epoch_ms();
        {
            let mut items = self.items.write().map_err(|_| StorageError::Lock)?;
            let record = items
                .entry(path.to_string())
                .or_insert_with(|| ItemRecord::new(path, domain::ItemType::Any));
            if record.value.as_ref() != Some(&value) {
                record.last_change_ms = Some(now);
            }
            record.value = Some(value.clone());
            record.last_caller = Some(caller.to_string());
            record.last_update_ms = Some(now);
        }
        let write = ItemWrite {
            path: path.to_string(),
            value,
            caller: caller.to_string(),
            source,
            ts_ms: now,
        };
        self.journal
            .write()
            .map_err(|_| StorageError::Lock)?
            .push(write.clone());
        // 无订阅者时发送失败，忽略
        let _ = self.changes.send(write);
        Ok(())
    }

    async fn read_item(&self, path: &str) -> Result<Option<ItemRecord>, StorageError> {
        let items = self.items.read().map_err(|_| StorageError::Lock)?;
        Ok(items.get(path).cloned())
    }
}
