//! 线上值与语义值之间的纯函数转换，不做任何 I/O。

use crate::error::CodecError;
use domain::{Address, CommandEntry, Endian, ItemValue, RegisterTable, WireType, WireValue};

/// 解码结果：成功、可跳过（无值）、不可恢复。
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Decoded(ItemValue),
    Skip(String),
    Fatal(String),
}

impl DecodeOutcome {
    pub fn value(self) -> Option<ItemValue> {
        match self {
            Self::Decoded(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Raw {
    Int(i64),
    Float(f64),
}

impl Raw {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }
}

/// 按条目解码线上值。
pub fn decode(entry: &CommandEntry, wire: &WireValue) -> DecodeOutcome {
    match try_decode(entry, wire) {
        Ok(Some(value)) => DecodeOutcome::Decoded(value),
        Ok(None) => DecodeOutcome::Skip(format!("{} has no value", entry.name)),
        Err(err) => DecodeOutcome::Fatal(err.to_string()),
    }
}

/// 解码；`Ok(None)` 表示线上没有值（JSON null、空回复）。
pub fn try_decode(entry: &CommandEntry, wire: &WireValue) -> Result<Option<ItemValue>, CodecError> {
    if is_empty_wire(wire) {
        return Ok(None);
    }
    let value = match entry.wire_type {
        WireType::Bit => ItemValue::Bool(decode_bit(entry, wire)?),
        WireType::Enum => {
            let key = wire_key(entry, wire)?;
            match entry.enum_map.as_ref().and_then(|map| map.get(&key)) {
                Some(semantic) => ItemValue::Text(semantic.clone()),
                None => ItemValue::Text(key),
            }
        }
        WireType::BoolPair => {
            let key = wire_key(entry, wire)?;
            let pair = entry
                .bool_pair
                .as_ref()
                .ok_or_else(|| CodecError::Type("bool_pair tokens missing".to_string()))?;
            if key == pair.on {
                ItemValue::Bool(true)
            } else if key == pair.off {
                ItemValue::Bool(false)
            } else {
                return Err(CodecError::Type(format!(
                    "{:?} matches neither {:?} nor {:?}",
                    key, pair.off, pair.on
                )));
            }
        }
        WireType::String => ItemValue::Text(decode_string(entry, wire)?),
        WireType::Blob => match wire {
            WireValue::Bytes(bytes) => ItemValue::Bytes(bytes.clone()),
            WireValue::Bit(bit) => ItemValue::Bytes(vec![u8::from(*bit)]),
            WireValue::Json(value) => ItemValue::Text(value.to_string()),
        },
        _ => {
            let raw = raw_number(entry, wire)?;
            scaled(entry, raw)
        }
    };
    Ok(Some(value))
}

/// 编码语义值；bit 条目带位索引时必须提供 `current`（读改写）。
pub fn encode(
    entry: &CommandEntry,
    value: &ItemValue,
    current: Option<&WireValue>,
) -> Result<WireValue, CodecError> {
    match entry.wire_type {
        WireType::Bit => encode_bit(entry, value, current),
        WireType::Enum => {
            let semantic = value.to_string();
            let key = entry
                .enum_map
                .as_ref()
                .and_then(|map| {
                    map.iter()
                        .find(|(_, mapped)| **mapped == semantic)
                        .map(|(key, _)| key.clone())
                })
                .ok_or(CodecError::UnknownEnum(semantic))?;
            emit_key(entry, &key)
        }
        WireType::BoolPair => {
            let on = value
                .as_bool()
                .ok_or_else(|| type_error(entry, value))?;
            let pair = entry
                .bool_pair
                .as_ref()
                .ok_or_else(|| CodecError::Type("bool_pair tokens missing".to_string()))?;
            let token = if on { &pair.on } else { &pair.off };
            emit_key(entry, token)
        }
        WireType::String => encode_string(entry, value),
        WireType::Blob => match value {
            ItemValue::Bytes(bytes) => Ok(WireValue::Bytes(bytes.clone())),
            ItemValue::Text(text) => Ok(WireValue::Bytes(text.clone().into_bytes())),
            other => Err(type_error(entry, other)),
        },
        _ => encode_number(entry, value),
    }
}

/// 写入前校验：类型与可设置范围。
pub fn validate(entry: &CommandEntry, value: &ItemValue) -> Result<(), CodecError> {
    match entry.wire_type {
        WireType::Bit | WireType::BoolPair => value
            .as_bool()
            .map(|_| ())
            .ok_or_else(|| type_error(entry, value)),
        WireType::Enum => {
            let semantic = value.to_string();
            let known = entry
                .enum_map
                .as_ref()
                .is_some_and(|map| map.values().any(|mapped| *mapped == semantic));
            if known {
                Ok(())
            } else {
                Err(CodecError::UnknownEnum(semantic))
            }
        }
        WireType::String => match value {
            ItemValue::Bytes(_) => Err(type_error(entry, value)),
            _ => Ok(()),
        },
        WireType::Blob => match value {
            ItemValue::Bytes(_) | ItemValue::Text(_) => Ok(()),
            _ => Err(type_error(entry, value)),
        },
        _ => {
            let number = value.as_f64().ok_or_else(|| type_error(entry, value))?;
            if number.is_nan() {
                return Err(CodecError::Type(format!("{}: NaN", entry.name)));
            }
            if let Some(range) = entry.settable_range {
                if !range.contains(number) {
                    return Err(CodecError::Range {
                        value: number,
                        min: range.min,
                        max: range.max,
                    });
                }
            }
            Ok(())
        }
    }
}

/// 绑定上记录的线上值：bit 条目只保留该位。
pub fn observed(entry: &CommandEntry, wire: &WireValue) -> WireValue {
    if entry.wire_type == WireType::Bit {
        if let Ok(bit) = decode_bit(entry, wire) {
            return WireValue::Bit(bit);
        }
    }
    wire.clone()
}

/// 线上值是否等于条目声明的无效哨兵值（缩放前比较）。
pub fn is_invalid_sentinel(entry: &CommandEntry, wire: &WireValue) -> bool {
    let Some(sentinel) = entry.invalid_sentinel else {
        return false;
    };
    if !entry.wire_type.is_numeric() {
        return false;
    }
    match raw_number(entry, wire) {
        Ok(Raw::Int(raw)) => raw == sentinel,
        Ok(Raw::Float(raw)) => raw == sentinel as f64,
        Err(_) => false,
    }
}

/// 与哨兵替换配合使用的零值。
pub fn zero_value(entry: &CommandEntry) -> ItemValue {
    match entry.scale {
        Some(scale) if !scale.is_identity() => ItemValue::Float(0.0),
        _ if matches!(entry.wire_type, WireType::Float | WireType::Double) => ItemValue::Float(0.0),
        _ => ItemValue::Int(0),
    }
}

/// 日志用十六进制转储。
pub fn hex_dump(wire: &WireValue) -> String {
    hex::encode(wire.as_bytes())
}

fn is_empty_wire(wire: &WireValue) -> bool {
    match wire {
        WireValue::Bytes(bytes) => bytes.is_empty(),
        WireValue::Json(value) => value.is_null(),
        WireValue::Bit(_) => false,
    }
}

fn type_error(entry: &CommandEntry, value: &ItemValue) -> CodecError {
    CodecError::Type(format!(
        "{} ({:?}) cannot take {} value {}",
        entry.name,
        entry.wire_type,
        value.type_name(),
        value
    ))
}

/// 按寄存器字序/字节序整理为大端顺序；对合法输入是对合映射，编码复用。
fn reorder(bytes: &[u8], byte_order: Endian, word_order: Endian) -> Vec<u8> {
    let mut words: Vec<[u8; 2]> = bytes
        .chunks(2)
        .map(|chunk| match chunk {
            [hi, lo] => [*hi, *lo],
            [lo] => [0, *lo],
            _ => [0, 0],
        })
        .collect();
    if word_order == Endian::Little {
        words.reverse();
    }
    words
        .into_iter()
        .flat_map(|[hi, lo]| match byte_order {
            Endian::Big => [hi, lo],
            Endian::Little => [lo, hi],
        })
        .collect()
}

fn byte_width(wire_type: WireType) -> usize {
    match wire_type {
        WireType::Byte => 1,
        WireType::Dword | WireType::SignedDword | WireType::Float => 4,
        WireType::Double => 8,
        _ => 2,
    }
}

/// 按 f32 的最短十进制表示转 f64，不带出二进制尾数（21.3 而非 21.299999237060547）。
fn widen_f32(value: f32) -> f64 {
    value
        .to_string()
        .parse::<f64>()
        .unwrap_or_else(|_| f64::from(value))
}

fn register_raw(entry: &CommandEntry, bytes: &[u8]) -> Result<Raw, CodecError> {
    let width = byte_width(entry.wire_type);
    if bytes.len() < width {
        return Err(CodecError::Malformed(format!(
            "{} needs {} bytes, got {}",
            entry.name,
            width,
            bytes.len()
        )));
    }
    if entry.wire_type == WireType::Byte {
        let byte = bytes[bytes.len() - 1];
        let value = if entry.is_signed() && byte > 127 {
            i64::from(byte) - 256
        } else {
            i64::from(byte)
        };
        return Ok(Raw::Int(value));
    }
    let ordered = reorder(&bytes[..width], entry.byte_order, entry.word_order);
    let raw = match entry.wire_type {
        WireType::Word | WireType::SignedWord => {
            let value = u16::from_be_bytes([ordered[0], ordered[1]]);
            if entry.is_signed() && value > 32767 {
                Raw::Int(i64::from(value) - 65536)
            } else {
                Raw::Int(i64::from(value))
            }
        }
        WireType::Dword | WireType::SignedDword => {
            let value = u32::from_be_bytes([ordered[0], ordered[1], ordered[2], ordered[3]]);
            if entry.is_signed() {
                Raw::Int(i64::from(value as i32))
            } else {
                Raw::Int(i64::from(value))
            }
        }
        WireType::Float => Raw::Float(widen_f32(f32::from_be_bytes([
            ordered[0], ordered[1], ordered[2], ordered[3],
        ]))),
        WireType::Double => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&ordered[..8]);
            Raw::Float(f64::from_be_bytes(buf))
        }
        other => {
            return Err(CodecError::Type(format!("{:?} is not numeric", other)));
        }
    };
    Ok(raw)
}

fn parse_number(text: &str) -> Result<Raw, CodecError> {
    let text = text.trim();
    if let Ok(value) = text.parse::<i64>() {
        return Ok(Raw::Int(value));
    }
    text.parse::<f64>()
        .map(Raw::Float)
        .map_err(|_| CodecError::Malformed(format!("{:?} is not a number", text)))
}

fn raw_number(entry: &CommandEntry, wire: &WireValue) -> Result<Raw, CodecError> {
    match wire {
        WireValue::Bytes(bytes) if entry.address.is_register() => register_raw(entry, bytes),
        WireValue::Bytes(bytes) => {
            let text = std::str::from_utf8(bytes)
                .map_err(|err| CodecError::Malformed(err.to_string()))?;
            parse_number(text)
        }
        WireValue::Bit(bit) => Ok(Raw::Int(i64::from(*bit))),
        WireValue::Json(serde_json::Value::Number(number)) => match number.as_i64() {
            Some(value) => Ok(Raw::Int(value)),
            None => number
                .as_f64()
                .map(Raw::Float)
                .ok_or_else(|| CodecError::Malformed(number.to_string())),
        },
        WireValue::Json(serde_json::Value::String(text)) => parse_number(text),
        WireValue::Json(serde_json::Value::Bool(value)) => Ok(Raw::Int(i64::from(*value))),
        WireValue::Json(other) => Err(CodecError::Malformed(format!(
            "{} is not a number",
            other
        ))),
    }
}

fn round_noise(value: f64) -> f64 {
    if value.abs() >= 1e9 {
        return value;
    }
    (value * 1e9).round() / 1e9
}

fn scaled(entry: &CommandEntry, raw: Raw) -> ItemValue {
    match entry.scale {
        Some(scale) if !scale.is_identity() => ItemValue::Float(round_noise(scale.apply(raw.as_f64()))),
        _ => match (entry.wire_type, raw) {
            (WireType::Float | WireType::Double, raw) => ItemValue::Float(raw.as_f64()),
            (_, Raw::Int(value)) => ItemValue::Int(value),
            (_, Raw::Float(value)) => ItemValue::Float(value),
        },
    }
}

fn unsigned_be(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .take(8)
        .rev()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

fn decode_bit(entry: &CommandEntry, wire: &WireValue) -> Result<bool, CodecError> {
    match wire {
        WireValue::Bit(bit) => Ok(*bit),
        WireValue::Bytes(bytes) if entry.address.is_register() => {
            let word = unsigned_be(bytes);
            match entry.bit_index() {
                Some(index) if u32::from(index) < 64 => Ok((word >> index) & 1 == 1),
                Some(index) => Err(CodecError::Malformed(format!("bit index {}", index))),
                None => Ok(word != 0),
            }
        }
        other => ItemValue::Text(other.as_text())
            .as_bool()
            .ok_or_else(|| CodecError::Type(format!("{} is not a bit", other))),
    }
}

fn encode_bit(
    entry: &CommandEntry,
    value: &ItemValue,
    current: Option<&WireValue>,
) -> Result<WireValue, CodecError> {
    let on = value.as_bool().ok_or_else(|| type_error(entry, value))?;
    match &entry.address {
        Address::Register { table, bit, .. } => {
            if let Some(index) = bit {
                let Some(WireValue::Bytes(current)) = current else {
                    return Err(CodecError::MissingCurrent);
                };
                if current.is_empty() || usize::from(*index) >= current.len() * 8 {
                    return Err(CodecError::Malformed(format!(
                        "bit {} outside {} byte(s)",
                        index,
                        current.len()
                    )));
                }
                let mut bytes = current.clone();
                let position = bytes.len() - 1 - usize::from(*index) / 8;
                let mask = 1u8 << (index % 8);
                if on {
                    bytes[position] |= mask;
                } else {
                    bytes[position] &= !mask;
                }
                Ok(WireValue::Bytes(bytes))
            } else if *table == RegisterTable::Coil {
                Ok(WireValue::Bit(on))
            } else {
                Ok(WireValue::Bytes(vec![0, u8::from(on)]))
            }
        }
        Address::Json { .. } => Ok(WireValue::Json(serde_json::Value::Bool(on))),
        _ => Ok(WireValue::Bytes(if on { b"1".to_vec() } else { b"0".to_vec() })),
    }
}

/// 枚举键 / 开关令牌的文本视图；寄存器按无符号整数输出。
fn wire_key(entry: &CommandEntry, wire: &WireValue) -> Result<String, CodecError> {
    match wire {
        WireValue::Bytes(bytes) if entry.address.is_register() => {
            if bytes.is_empty() {
                return Err(CodecError::Malformed("empty register".to_string()));
            }
            let ordered = reorder(bytes, entry.byte_order, entry.word_order);
            Ok(unsigned_be(&ordered).to_string())
        }
        WireValue::Bytes(bytes) => std::str::from_utf8(bytes)
            .map(|text| text.trim().to_string())
            .map_err(|err| CodecError::Malformed(err.to_string())),
        other => Ok(other.as_text().trim().to_string()),
    }
}

fn emit_key(entry: &CommandEntry, key: &str) -> Result<WireValue, CodecError> {
    match &entry.address {
        Address::Register { .. } => {
            let value = key
                .trim()
                .parse::<u16>()
                .map_err(|_| CodecError::Type(format!("{:?} is not a register value", key)))?;
            Ok(WireValue::Bytes(reorder(
                &value.to_be_bytes(),
                entry.byte_order,
                entry.word_order,
            )))
        }
        Address::Json { .. } => Ok(WireValue::Json(match key.parse::<i64>() {
            Ok(number) => serde_json::Value::from(number),
            Err(_) => serde_json::Value::String(key.to_string()),
        })),
        _ => Ok(WireValue::Bytes(key.as_bytes().to_vec())),
    }
}

fn decode_string(entry: &CommandEntry, wire: &WireValue) -> Result<String, CodecError> {
    match wire {
        WireValue::Bytes(bytes) => {
            let text = if entry.address.is_register() {
                String::from_utf8_lossy(bytes).into_owned()
            } else {
                String::from_utf8(bytes.clone())
                    .map_err(|err| CodecError::Type(err.to_string()))?
            };
            Ok(text
                .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string())
        }
        other => Ok(other.as_text().trim_end().to_string()),
    }
}

fn encode_string(entry: &CommandEntry, value: &ItemValue) -> Result<WireValue, CodecError> {
    if let ItemValue::Bytes(_) = value {
        return Err(type_error(entry, value));
    }
    let text = value.to_string();
    match &entry.address {
        Address::Register { .. } => {
            let capacity = usize::from(entry.register_count()) * 2;
            let mut bytes = text.into_bytes();
            if bytes.len() > capacity {
                return Err(CodecError::Type(format!(
                    "{} exceeds {} bytes",
                    entry.name, capacity
                )));
            }
            bytes.resize(capacity, 0);
            Ok(WireValue::Bytes(bytes))
        }
        Address::Json { .. } => Ok(WireValue::Json(serde_json::Value::String(text))),
        _ => Ok(WireValue::Bytes(text.into_bytes())),
    }
}

fn encode_number(entry: &CommandEntry, value: &ItemValue) -> Result<WireValue, CodecError> {
    let mut number = value.as_f64().ok_or_else(|| type_error(entry, value))?;
    if number.is_nan() {
        return Err(CodecError::Type(format!("{}: NaN", entry.name)));
    }
    if let Some(range) = entry.settable_range {
        number = range.clamp(number);
    }
    if let Some(scale) = entry.scale {
        number = scale.invert(number);
    }
    let integer = entry.wire_type.is_integer();
    if integer {
        number = number.round();
    }

    match &entry.address {
        Address::Register { .. } => {
            let bytes = match entry.wire_type {
                WireType::Byte => {
                    let raw = fit_integer(entry, number, -128.0, 255.0)? as i16;
                    (raw as u8 as u16).to_be_bytes().to_vec()
                }
                WireType::Word | WireType::SignedWord => {
                    let raw = fit_integer(entry, number, -32768.0, 65535.0)?;
                    (raw as i32 as u16).to_be_bytes().to_vec()
                }
                WireType::Dword | WireType::SignedDword => {
                    let raw = fit_integer(entry, number, -2147483648.0, 4294967295.0)?;
                    (raw as i64 as u32).to_be_bytes().to_vec()
                }
                WireType::Float => (number as f32).to_be_bytes().to_vec(),
                WireType::Double => number.to_be_bytes().to_vec(),
                other => {
                    return Err(CodecError::Type(format!("{:?} is not numeric", other)));
                }
            };
            Ok(WireValue::Bytes(reorder(
                &bytes,
                entry.byte_order,
                entry.word_order,
            )))
        }
        Address::Json { .. } => {
            if integer || (number.fract() == 0.0 && number.abs() < 9.0e15) {
                Ok(WireValue::Json(serde_json::Value::from(number as i64)))
            } else {
                Ok(WireValue::Json(serde_json::Value::from(number)))
            }
        }
        _ => {
            let text = if integer || (number.fract() == 0.0 && number.abs() < 9.0e15) {
                (number as i64).to_string()
            } else {
                number.to_string()
            };
            Ok(WireValue::Bytes(text.into_bytes()))
        }
    }
}

fn fit_integer(entry: &CommandEntry, number: f64, min: f64, max: f64) -> Result<f64, CodecError> {
    if number < min || number > max || !number.is_finite() {
        return Err(CodecError::Type(format!(
            "{} cannot represent {} as {:?}",
            entry.name, number, entry.wire_type
        )));
    }
    Ok(number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorder_is_an_involution() {
        let bytes = [0x01, 0x02, 0x03, 0x04];
        let once = reorder(&bytes, Endian::Little, Endian::Little);
        assert_eq!(once, vec![0x04, 0x03, 0x02, 0x01]);
        assert_eq!(reorder(&once, Endian::Little, Endian::Little), bytes.to_vec());
    }

    #[test]
    fn round_noise_drops_binary_tail() {
        assert_eq!(round_noise(0.1 + 0.2), 0.3);
    }

    #[test]
    fn unsigned_be_reads_trailing_bytes() {
        assert_eq!(unsigned_be(&[0x00, 0x0c]), 12);
    }
}
