//! 插件外壳错误。

use devgw_codec::TableError;
use devgw_config::ConfigError;
use devgw_ingest::IngestError;
use devgw_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("command table error: {0}")]
    Table(#[from] TableError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("listener error: {0}")]
    Ingest(#[from] IngestError),
    #[error("init incomplete: {0}")]
    InitIncomplete(String),
    #[error("item {item}: {reason}")]
    Item { item: String, reason: String },
}

impl PluginError {
    pub(crate) fn item(item: &str, reason: impl Into<String>) -> Self {
        Self::Item {
            item: item.to_string(),
            reason: reason.into(),
        }
    }
}
