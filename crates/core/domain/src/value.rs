use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// 宿主 item 的语义值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ItemValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
        }
    }

    /// 数值视图；文本按十进制解析。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Text(value) => value.trim().parse::<f64>().ok(),
            Self::Bytes(_) => None,
        }
    }

    /// 布尔视图；接受 0/1 与常见开关文本。
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Int(value) => Some(*value != 0),
            Self::Float(value) => Some(*value != 0.0),
            Self::Text(value) => match value.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "1" | "yes" => Some(true),
                "false" | "off" | "0" | "no" => Some(false),
                _ => None,
            },
            Self::Bytes(_) => None,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(value) => Self::Bool(*value),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(value) => Self::Int(value),
                None => Self::Float(number.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(value) => Self::Text(value.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(value) => serde_json::Value::Bool(*value),
            Self::Int(value) => serde_json::Value::from(*value),
            Self::Float(value) => serde_json::Value::from(*value),
            Self::Text(value) => serde_json::Value::String(value.clone()),
            Self::Bytes(value) => serde_json::Value::from(value.clone()),
        }
    }
}

impl fmt::Display for ItemValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{}", value),
            Self::Int(value) => write!(f, "{}", value),
            Self::Float(value) => write!(f, "{}", value),
            Self::Text(value) => f.write_str(value),
            Self::Bytes(value) => {
                for byte in value {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl From<bool> for ItemValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ItemValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ItemValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ItemValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// 设备线上值：寄存器/报文字节、单 bit 或 JSON 片段。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WireValue {
    Bytes(Vec<u8>),
    Bit(bool),
    Json(serde_json::Value),
}

impl WireValue {
    /// 字节视图（用于十六进制转储）。
    pub fn as_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Self::Bytes(bytes) => Cow::Borrowed(bytes.as_slice()),
            Self::Bit(bit) => Cow::Owned(vec![u8::from(*bit)]),
            Self::Json(value) => Cow::Owned(value.to_string().into_bytes()),
        }
    }

    /// 文本视图：字节按 UTF-8 宽松解码，JSON 字符串去引号。
    pub fn as_text(&self) -> String {
        match self {
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::Bit(bit) => (if *bit { "1" } else { "0" }).to_string(),
            Self::Json(serde_json::Value::String(value)) => value.clone(),
            Self::Json(value) => value.to_string(),
        }
    }
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => {
                f.write_str("0x")?;
                for byte in bytes {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Self::Bit(bit) => write!(f, "{}", u8::from(*bit)),
            Self::Json(value) => write!(f, "{}", value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_value_untagged_json() {
        let parsed: ItemValue = serde_json::from_str("28").expect("int");
        assert_eq!(parsed, ItemValue::Int(28));
        let parsed: ItemValue = serde_json::from_str("21.5").expect("float");
        assert_eq!(parsed, ItemValue::Float(21.5));
        let parsed: ItemValue = serde_json::from_str("\"heat\"").expect("text");
        assert_eq!(parsed, ItemValue::Text("heat".to_string()));
    }

    #[test]
    fn bool_view_accepts_switch_words() {
        assert_eq!(ItemValue::from("on").as_bool(), Some(true));
        assert_eq!(ItemValue::Int(0).as_bool(), Some(false));
        assert_eq!(ItemValue::from("maybe").as_bool(), None);
    }

    #[test]
    fn wire_value_displays_hex() {
        assert_eq!(WireValue::Bytes(vec![0xff, 0x9c]).to_string(), "0xff9c");
        assert_eq!(WireValue::Bit(true).to_string(), "1");
    }
}
