//! 稳定的 DTO 与 API 响应契约。
//!
//! 快照接口只读：插件快照先转换为这里的结构，再由 Web 层序列化。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 标准 API 响应封装。
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

/// 失败响应的错误体。
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// 健康检查返回结构。
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDto {
    pub status: String,
    pub plugins: usize,
}

/// 设备会话状态。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDto {
    pub transport: String,
    pub state: String,
    pub last_error: Option<String>,
    pub connected_since_ms: Option<i64>,
    pub reconnect_failures: u32,
}

/// 单个 item 绑定的最近状态。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingDto {
    pub item_path: String,
    pub command: String,
    pub address: String,
    pub direction: String,
    pub last_wire: Option<String>,
    pub last_value: Option<Value>,
    pub last_update_ms: Option<i64>,
}

/// 最近一次 item 变化。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDto {
    pub ts_ms: i64,
    pub item_path: String,
    pub source: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
}

/// 单个插件实例的快照。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSnapshotDto {
    pub short_name: String,
    pub instance_id: String,
    pub init_complete: bool,
    pub paused: bool,
    pub session: SessionDto,
    pub bindings: Vec<BindingDto>,
    pub recent_changes: Vec<ChangeDto>,
    /// 计数器，键为计数器名
    pub metrics: Value,
}
