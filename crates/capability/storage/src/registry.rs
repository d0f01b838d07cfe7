//! 绑定注册表
//!
//! parse_item 阶段一次性建立：item 路径 → 命令表条目。运行期只做直接查找，
//! 并维护每个绑定最近一次观测到的线上值。
//!
//! 约束：
//! - 每个 (item, 条目) 至多一个绑定
//! - 一个 item 只绑定一个条目；一个条目可以广播到多个 item

use crate::error::StorageError;
use crate::models::BindingSnapshot;
use crate::validation::ensure_item_path;
use domain::{CommandEntry, Direction, ItemValue, WireValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// item 与命令表条目的绑定
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub item_path: String,
    pub entry: Arc<CommandEntry>,
    /// 条目方向与 item 方向覆盖的交集。
    pub direction: Direction,
    /// 线上值等于条目的无效哨兵时写入 0。
    pub invalid_zero: bool,
    pub last_wire: Option<WireValue>,
    pub last_value: Option<ItemValue>,
    pub last_update_ms: Option<i64>,
}

impl Binding {
    pub fn new(item_path: impl Into<String>, entry: Arc<CommandEntry>) -> Self {
        let direction = entry.direction;
        Self {
            item_path: item_path.into(),
            entry,
            direction,
            invalid_zero: false,
            last_wire: None,
            last_value: None,
            last_update_ms: None,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_invalid_zero(mut self, invalid_zero: bool) -> Self {
        self.invalid_zero = invalid_zero;
        self
    }

    pub fn snapshot(&self) -> BindingSnapshot {
        BindingSnapshot {
            item_path: self.item_path.clone(),
            entry: self.entry.name.clone(),
            address: self.entry.address.describe(),
            direction: self.direction,
            invalid_zero: self.invalid_zero,
            last_wire: self.last_wire.clone(),
            last_value: self.last_value.clone(),
            last_update_ms: self.last_update_ms,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    by_item: HashMap<String, Binding>,
    /// 条目名 → item 路径（按注册顺序）。
    by_entry: HashMap<String, Vec<String>>,
}

/// 绑定注册表
#[derive(Debug, Default)]
pub struct BindingRegistry {
    inner: RwLock<Inner>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// 注册绑定；同一 (item, 条目) 重复注册返回 `Ok(false)`。
    pub fn register(&self, binding: Binding) -> Result<bool, StorageError> {
        ensure_item_path(&binding.item_path)?;
        let mut inner = self.write();
        if let Some(existing) = inner.by_item.get(&binding.item_path) {
            if existing.entry.name == binding.entry.name {
                return Ok(false);
            }
            return Err(StorageError::Conflict {
                item: binding.item_path.clone(),
                existing: existing.entry.name.clone(),
            });
        }
        inner
            .by_entry
            .entry(binding.entry.name.clone())
            .or_default()
            .push(binding.item_path.clone());
        inner.by_item.insert(binding.item_path.clone(), binding);
        Ok(true)
    }

    pub fn get(&self, item_path: &str) -> Option<Binding> {
        self.read().by_item.get(item_path).cloned()
    }

    pub fn contains(&self, item_path: &str) -> bool {
        self.read().by_item.contains_key(item_path)
    }

    /// 绑定到某条目的全部 item
    pub fn bindings_for_entry(&self, entry: &str) -> Vec<Binding> {
        let inner = self.read();
        inner
            .by_entry
            .get(entry)
            .into_iter()
            .flatten()
            .filter_map(|path| inner.by_item.get(path).cloned())
            .collect()
    }

    pub fn items_for_entry(&self, entry: &str) -> Vec<String> {
        self.read().by_entry.get(entry).cloned().unwrap_or_default()
    }

    /// 已绑定的条目（去重，按名称排序）
    pub fn bound_entries(&self) -> Vec<Arc<CommandEntry>> {
        let inner = self.read();
        let mut entries: BTreeMap<&str, Arc<CommandEntry>> = BTreeMap::new();
        for binding in inner.by_item.values() {
            entries
                .entry(binding.entry.name.as_str())
                .or_insert_with(|| Arc::clone(&binding.entry));
        }
        entries.into_values().collect()
    }

    pub fn last_wire(&self, item_path: &str) -> Option<WireValue> {
        self.read()
            .by_item
            .get(item_path)
            .and_then(|binding| binding.last_wire.clone())
    }

    /// 记录一次成功的解码或设备写入
    pub fn record_wire(&self, item_path: &str, wire: WireValue, value: ItemValue, ts_ms: i64) {
        let mut inner = self.write();
        if let Some(binding) = inner.by_item.get_mut(item_path) {
            binding.last_wire = Some(wire);
            binding.last_value = Some(value);
            binding.last_update_ms = Some(ts_ms);
        }
    }

    /// 记录写入 item 的值，不触碰线上值（状态恢复）
    pub fn record_value(&self, item_path: &str, value: ItemValue, ts_ms: i64) {
        let mut inner = self.write();
        if let Some(binding) = inner.by_item.get_mut(item_path) {
            binding.last_value = Some(value);
            binding.last_update_ms = Some(ts_ms);
        }
    }

    /// 需要持久化的条目值：条目名 → 最近值（多 item 时取最近更新者）
    pub fn persisted_values(&self) -> BTreeMap<String, ItemValue> {
        let inner = self.read();
        let mut latest: BTreeMap<String, (i64, ItemValue)> = BTreeMap::new();
        for binding in inner.by_item.values() {
            if !binding.entry.persist {
                continue;
            }
            let Some(value) = &binding.last_value else {
                continue;
            };
            let ts = binding.last_update_ms.unwrap_or(0);
            match latest.get(&binding.entry.name) {
                Some((seen, _)) if *seen >= ts => {}
                _ => {
                    latest.insert(binding.entry.name.clone(), (ts, value.clone()));
                }
            }
        }
        latest
            .into_iter()
            .map(|(name, (_, value))| (name, value))
            .collect()
    }

    /// 全部绑定快照（按路径排序）
    pub fn snapshot(&self) -> Vec<BindingSnapshot> {
        let inner = self.read();
        let mut bindings: Vec<BindingSnapshot> =
            inner.by_item.values().map(Binding::snapshot).collect();
        bindings.sort_by(|a, b| a.item_path.cmp(&b.item_path));
        bindings
    }

    pub fn len(&self) -> usize {
        self.read().by_item.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
