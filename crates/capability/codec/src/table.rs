use crate::error::TableError;
use domain::{Address, CommandEntry, WireType};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// 设备命令表：按名称索引的只读 CommandEntry 集合。
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    entries: Vec<Arc<CommandEntry>>,
    by_name: HashMap<String, usize>,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum TableDocument {
    List(Vec<CommandEntry>),
    Wrapped { entries: Vec<CommandEntry> },
}

impl CommandTable {
    /// 校验并构建命令表。
    pub fn from_entries(entries: Vec<CommandEntry>) -> Result<Self, TableError> {
        let mut table = Self::default();
        for entry in entries {
            validate_entry(&entry)?;
            if table.by_name.contains_key(&entry.name) {
                return Err(TableError::Duplicate(entry.name));
            }
            table.by_name.insert(entry.name.clone(), table.entries.len());
            table.entries.push(Arc::new(entry));
        }
        Ok(table)
    }

    /// 从 JSON 解析：顶层数组，或 `{"entries": [...]}`。
    pub fn from_json(raw: &str) -> Result<Self, TableError> {
        let document: TableDocument =
            serde_json::from_str(raw).map_err(|err| TableError::Parse(err.to_string()))?;
        let entries = match document {
            TableDocument::List(entries) => entries,
            TableDocument::Wrapped { entries } => entries,
        };
        Self::from_entries(entries)
    }

    pub fn load(path: &Path) -> Result<Self, TableError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CommandEntry>> {
        self.by_name.get(name).map(|index| &self.entries[*index])
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<CommandEntry>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn invalid(entry: &CommandEntry, reason: impl Into<String>) -> TableError {
    TableError::Invalid {
        name: entry.name.clone(),
        reason: reason.into(),
    }
}

fn validate_entry(entry: &CommandEntry) -> Result<(), TableError> {
    if entry.name.trim().is_empty() {
        return Err(invalid(entry, "empty name"));
    }
    if let Some(scale) = entry.scale {
        if scale.factor == 0.0 || !scale.factor.is_finite() {
            return Err(invalid(entry, "scale factor must be finite and non-zero"));
        }
    }
    if let Some(range) = entry.settable_range {
        if range.min > range.max {
            return Err(invalid(entry, "settable_range min > max"));
        }
    }
    match entry.wire_type {
        WireType::Enum if entry.enum_map.as_ref().is_none_or(|map| map.is_empty()) => {
            return Err(invalid(entry, "enum entry without enum_map"));
        }
        WireType::BoolPair if entry.bool_pair.is_none() => {
            return Err(invalid(entry, "bool_pair entry without bool_pair tokens"));
        }
        _ => {}
    }
    if let Address::Register { table, bit, .. } = &entry.address {
        if table.is_bit_table() && entry.wire_type != WireType::Bit {
            return Err(invalid(entry, "coil/discrete tables carry bit entries only"));
        }
        if let Some(bit) = bit {
            if entry.wire_type != WireType::Bit {
                return Err(invalid(entry, "bit index on a non-bit entry"));
            }
            if u16::from(*bit) >= entry.register_count() * 16 {
                return Err(invalid(entry, format!("bit index {} out of register", bit)));
            }
        }
        if entry.direction.can_write() && !table.is_writable() {
            return Err(invalid(entry, "input/discrete tables are read-only"));
        }
    }
    Ok(())
}
