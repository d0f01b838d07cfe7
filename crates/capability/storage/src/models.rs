//! 存储数据模型
//!
//! - ItemRecord：宿主 item 的当前值与时间戳
//! - ItemWrite：一次 item 写入（带调用方标签）
//! - BindingSnapshot：绑定的只读视图

use domain::{ChangeSource, Direction, ItemType, ItemValue, WireValue};
use serde::Serialize;

/// 宿主 item 记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemRecord {
    pub path: String,
    pub item_type: ItemType,
    pub value: Option<ItemValue>,
    /// 最近一次写入的调用方标签。
    pub last_caller: Option<String>,
    pub last_update_ms: Option<i64>,
    /// 值真正变化的时间。
    pub last_change_ms: Option<i64>,
}

impl ItemRecord {
    pub fn new(path: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            path: path.into(),
            item_type,
            value: None,
            last_caller: None,
            last_update_ms: None,
            last_change_ms: None,
        }
    }
}

/// 一次 item 写入
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemWrite {
    pub path: String,
    pub value: ItemValue,
    pub caller: String,
    pub source: ChangeSource,
    pub ts_ms: i64,
}

/// 绑定快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingSnapshot {
    pub item_path: String,
    pub entry: String,
    pub address: String,
    pub direction: Direction,
    pub invalid_zero: bool,
    pub last_wire: Option<WireValue>,
    pub last_value: Option<ItemValue>,
    pub last_update_ms: Option<i64>,
}
