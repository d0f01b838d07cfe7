//! item 树文件加载。
//!
//! 文件为 JSON：item 描述数组，或 `{ "items": [...] }`。

use domain::ItemDescriptor;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("item file error: {0}")]
    Items(String),
    #[error("plugin init incomplete: {0}")]
    InitIncomplete(String),
}

pub fn parse_items(raw: &str) -> Result<Vec<ItemDescriptor>, HostError> {
    let document: Value =
        serde_json::from_str(raw).map_err(|err| HostError::Items(err.to_string()))?;
    let list = match document {
        Value::Object(mut object) => object
            .remove("items")
            .ok_or_else(|| HostError::Items("missing items array".to_string()))?,
        other => other,
    };
    let items: Vec<ItemDescriptor> =
        serde_json::from_value(list).map_err(|err| HostError::Items(err.to_string()))?;
    if let Some(item) = items.iter().find(|item| item.path.trim().is_empty()) {
        return Err(HostError::Items(format!("empty item path ({:?})", item.attributes)));
    }
    Ok(items)
}

pub fn load_items(path: &Path) -> Result<Vec<ItemDescriptor>, HostError> {
    let raw = std::fs::read_to_string(path)?;
    parse_items(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::ItemType;

    #[test]
    fn accepts_plain_and_wrapped_lists() {
        let plain = r#"[{"path": "/avr/volume", "type": "num", "attributes": {"avr_command": "volume"}}]"#;
        let wrapped = r#"{"items": [{"path": "/avr/power"}]}"#;

        let items = parse_items(plain).expect("plain");
        assert_eq!(items[0].item_type, ItemType::Num);
        assert_eq!(items[0].attr("avr_command"), Some("volume"));

        let items = parse_items(wrapped).expect("wrapped");
        assert_eq!(items[0].path, "/avr/power");
        assert_eq!(items[0].item_type, ItemType::Any);
    }

    #[test]
    fn rejects_empty_path() {
        assert!(matches!(
            parse_items(r#"[{"path": " "}]"#),
            Err(HostError::Items(_))
        ));
    }
}
