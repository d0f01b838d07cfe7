use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 宿主 item 的声明类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Bool,
    Num,
    Str,
    Bytes,
    #[default]
    Any,
}

/// 宿主在 parse_item 时交给插件的 item 描述。
///
/// `path` 是宿主拥有的不透明标识；插件不解释其层级。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub path: String,
    #[serde(default, rename = "type")]
    pub item_type: ItemType,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ItemDescriptor {
    pub fn new(path: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            path: path.into(),
            item_type,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// 变更来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Poll,
    Push,
    HostWrite,
    /// 启动时从状态缓存恢复。
    Restore,
}

impl ChangeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Push => "push",
            Self::HostWrite => "host-write",
            Self::Restore => "restore",
        }
    }
}

impl fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Suspended,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Suspended => "suspended",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
