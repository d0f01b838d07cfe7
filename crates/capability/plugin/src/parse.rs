//! item 属性解析
//!
//! 插件识别的属性均以 `<attr_prefix>_` 开头：
//!
//! | 属性 | 含义 |
//! |------|------|
//! | `command` | 绑定的命令表条目名 |
//! | `direction` | `read` / `write` / `read-write`，与条目方向取交集 |
//! | `invalid_zero` | 线上值为无效哨兵时写入 0 |
//! | `udp_listen` / `tcp_listen` / `http_listen` | 原始监听，`<ip>:<port>` 或端口 |
//! | `allow_list` | 该 item 的来源 allow-list，覆盖插件级设置 |
//! | `control` | `pause` 或 `update_now` |

use crate::error::PluginError;
use devgw_codec::CommandTable;
use devgw_config::parse_listen;
use devgw_ingest::{AllowList, ListenerKind};
use domain::{CommandEntry, Direction, ItemDescriptor};
use std::net::SocketAddr;
use std::sync::Arc;

/// 插件控制 item 的种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// 置 true 暂停会话，置 false 恢复
    Pause,
    /// 置 true 立即轮询一次，随后由插件复位为 false
    UpdateNow,
}

impl ControlKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pause" => Some(Self::Pause),
            "update_now" | "update" | "refresh" => Some(Self::UpdateNow),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::UpdateNow => "update_now",
        }
    }
}

/// 插件识别的属性名。
#[derive(Debug, Clone)]
pub struct AttributeKeys {
    pub command: String,
    pub direction: String,
    pub invalid_zero: String,
    pub udp_listen: String,
    pub tcp_listen: String,
    pub http_listen: String,
    pub allow_list: String,
    pub control: String,
}

impl AttributeKeys {
    pub fn new(prefix: &str) -> Self {
        let key = |suffix: &str| format!("{}_{}", prefix, suffix);
        Self {
            command: key("command"),
            direction: key("direction"),
            invalid_zero: key("invalid_zero"),
            udp_listen: key("udp_listen"),
            tcp_listen: key("tcp_listen"),
            http_listen: key("http_listen"),
            allow_list: key("allow_list"),
            control: key("control"),
        }
    }

    fn listeners(&self) -> [(ListenerKind, &str); 3] {
        [
            (ListenerKind::Udp, self.udp_listen.as_str()),
            (ListenerKind::Tcp, self.tcp_listen.as_str()),
            (ListenerKind::Http, self.http_listen.as_str()),
        ]
    }
}

/// 一个 item 在插件中的角色。
#[derive(Debug, Clone, PartialEq)]
pub enum ItemRole {
    Bound {
        entry: Arc<CommandEntry>,
        direction: Direction,
        invalid_zero: bool,
    },
    Listener {
        kind: ListenerKind,
        addr: SocketAddr,
        /// None 表示沿用插件级 allow-list
        allow: Option<AllowList>,
    },
    Control(ControlKind),
}

fn parse_flag(item: &ItemDescriptor, key: &str) -> Result<bool, PluginError> {
    match item.attr(key).map(|value| value.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(value) => match value.as_str() {
            "" | "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(PluginError::item(
                &item.path,
                format!("{} must be a boolean, got {}", key, value),
            )),
        },
    }
}

/// 解析 item 的角色；不带插件属性时返回 `None`。
///
/// 一个 item 只能承担一种角色。
pub fn parse_item_role(
    item: &ItemDescriptor,
    keys: &AttributeKeys,
    table: &CommandTable,
) -> Result<Option<ItemRole>, PluginError> {
    let command = item.attr(&keys.command);
    let listener = keys
        .listeners()
        .into_iter()
        .find_map(|(kind, key)| item.attr(key).map(|value| (kind, key, value)));
    let control = item.attr(&keys.control);

    let roles = [command.is_some(), listener.is_some(), control.is_some()]
        .iter()
        .filter(|present| **present)
        .count();
    if roles > 1 {
        return Err(PluginError::item(
            &item.path,
            "command, listener and control attributes are mutually exclusive",
        ));
    }

    if let Some(name) = command {
        let name = name.trim();
        let entry = table
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::item(&item.path, format!("unknown command {}", name)))?;
        let direction = match item.attr(&keys.direction) {
            None => entry.direction,
            Some(raw) => {
                let requested = Direction::parse(raw).ok_or_else(|| {
                    PluginError::item(&item.path, format!("invalid direction {}", raw))
                })?;
                entry.direction.narrow(requested).ok_or_else(|| {
                    PluginError::item(
                        &item.path,
                        format!(
                            "direction {} not allowed by {} ({})",
                            requested.as_str(),
                            entry.name,
                            entry.direction.as_str()
                        ),
                    )
                })?
            }
        };
        let invalid_zero = parse_flag(item, &keys.invalid_zero)?;
        return Ok(Some(ItemRole::Bound {
            entry,
            direction,
            invalid_zero,
        }));
    }

    if let Some((kind, key, value)) = listener {
        let addr = parse_listen(key, value)
            .map_err(|err| PluginError::item(&item.path, err.to_string()))?;
        let allow = item
            .attr(&keys.allow_list)
            .map(AllowList::parse)
            .transpose()
            .map_err(|bad| PluginError::item(&item.path, format!("invalid allow-list entry {}", bad)))?;
        return Ok(Some(ItemRole::Listener { kind, addr, allow }));
    }

    if let Some(value) = control {
        let kind = ControlKind::parse(value)
            .ok_or_else(|| PluginError::item(&item.path, format!("unknown control {}", value)))?;
        return Ok(Some(ItemRole::Control(kind)));
    }

    Ok(None)
}
