//! 持久化状态缓存
//!
//! `<cache_dir>/<short_name>.json`：UTF-8 JSON，顶层对象按实例 ID 分区，
//! 每个分区是 条目名 → 值。保存时只替换本实例分区，其它实例原样保留。

use crate::error::StorageError;
use crate::validation::ensure_instance_id;
use domain::ItemValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// 实例状态缓存文件
#[derive(Debug, Clone)]
pub struct StateCache {
    path: PathBuf,
}

impl StateCache {
    pub fn new(cache_dir: impl AsRef<Path>, short_name: &str) -> Self {
        Self {
            path: cache_dir.as_ref().join(format!("{}.json", short_name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<serde_json::Map<String, serde_json::Value>, StorageError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(serde_json::Map::new());
            }
            Err(err) => return Err(err.into()),
        };
        if raw.trim().is_empty() {
            return Ok(serde_json::Map::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    /// 读取实例分区；文件或分区不存在时返回空。
    pub fn load(&self, instance_id: &str) -> Result<BTreeMap<String, ItemValue>, StorageError> {
        ensure_instance_id(instance_id)?;
        let document = self.read_document()?;
        match document.get(instance_id) {
            Some(section) => Ok(serde_json::from_value(section.clone())?),
            None => Ok(BTreeMap::new()),
        }
    }

    /// 写入实例分区（临时文件 + rename）
    pub fn save(
        &self,
        instance_id: &str,
        values: &BTreeMap<String, ItemValue>,
    ) -> Result<(), StorageError> {
        ensure_instance_id(instance_id)?;
        let mut document = self.read_document()?;
        document.insert(instance_id.to_string(), serde_json::to_value(values)?);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&document)?)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!(
            target: "devgw.storage",
            path = %self.path.display(),
            instance = %instance_id,
            entries = values.len(),
            "state_cache_saved"
        );
        Ok(())
    }
}
