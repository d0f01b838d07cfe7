//! 条目与请求 / 回复之间的映射
//!
//! 读：由条目地址生成请求，再从（可能是整块的）回复中切出本条目的线上值。
//! 写：把编码后的线上值包装成具体请求。

use crate::error::TransportError;
use crate::types::{bytes_to_words, words_to_bytes, Reply, Request};
use domain::{fill_template, Address, CommandEntry, RegisterTable, RequestTemplate, WireValue};

/// 模板转请求；行模板按查询处理（等待回复）。
pub fn template_request(template: &RequestTemplate, expect_prefix: Option<String>) -> Request {
    match template {
        RequestTemplate::Http { method, path, body } => Request::Http {
            method: *method,
            path: path.clone(),
            body: body.clone(),
        },
        RequestTemplate::Line { text } => Request::Query {
            text: text.clone(),
            expect_prefix,
        },
    }
}

/// 单条目的读取请求；不可主动读取时返回 None。
pub fn read_request(entry: &CommandEntry) -> Option<Request> {
    match &entry.address {
        Address::Register {
            table,
            address,
            unit,
            ..
        } => Some(Request::ReadRegisters {
            table: *table,
            unit: *unit,
            address: *address,
            count: if table.is_bit_table() {
                1
            } else {
                entry.register_count()
            },
        }),
        Address::Token { read, prefix, .. } => read.as_ref().map(|text| Request::Query {
            text: text.clone(),
            expect_prefix: prefix.clone(),
        }),
        Address::Json { read, .. } => read.as_ref().map(|template| template_request(template, None)),
        Address::Topic { .. } => None,
    }
}

/// 解析 JSON 回复文档。
pub fn parse_document(bytes: &[u8]) -> Result<serde_json::Value, TransportError> {
    serde_json::from_slice(bytes).map_err(|err| {
        TransportError::Protocol(format!(
            "invalid json reply ({}): {}",
            err,
            String::from_utf8_lossy(bytes)
        ))
    })
}

fn json_at(document: &serde_json::Value, pointer: &str) -> WireValue {
    WireValue::Json(
        document
            .pointer(pointer)
            .cloned()
            .unwrap_or(serde_json::Value::Null),
    )
}

/// 从回复中切出条目的线上值。
///
/// `origin` 为块读取的起始地址；非寄存器条目忽略。缺失的 JSON 位置返回 `Json(null)`，
/// 由 Codec 判定为跳过。
pub fn extract(entry: &CommandEntry, reply: &Reply, origin: u16) -> Result<WireValue, TransportError> {
    match (&entry.address, reply) {
        (Address::Register { address, .. }, Reply::Bits(bits)) => {
            let offset = usize::from(address.saturating_sub(origin));
            bits.get(offset)
                .map(|bit| WireValue::Bit(*bit))
                .ok_or(TransportError::ShortReply {
                    expected: offset + 1,
                    actual: bits.len(),
                })
        }
        (Address::Register { address, .. }, Reply::Registers(words)) => {
            let offset = usize::from(address.saturating_sub(origin));
            let end = offset + usize::from(entry.register_count());
            words
                .get(offset..end)
                .map(|slice| WireValue::Bytes(words_to_bytes(slice)))
                .ok_or(TransportError::ShortReply {
                    expected: end,
                    actual: words.len(),
                })
        }
        (Address::Token { prefix, .. }, Reply::Frame(bytes)) => {
            let text = String::from_utf8_lossy(bytes);
            let text = text.trim();
            let value = match prefix.as_deref() {
                Some(prefix) => text.strip_prefix(prefix).ok_or_else(|| {
                    TransportError::Protocol(format!("reply {:?} lacks prefix {:?}", text, prefix))
                })?,
                None => text,
            };
            Ok(WireValue::Bytes(value.trim().as_bytes().to_vec()))
        }
        (Address::Json { pointer, .. }, Reply::Frame(bytes)) => {
            Ok(json_at(&parse_document(bytes)?, pointer))
        }
        (address, reply) => Err(TransportError::Protocol(format!(
            "{} cannot be read from a {}-unit reply",
            address.describe(),
            reply.len()
        ))),
    }
}

/// 从推送的 JSON 文档中取条目的线上值；文档不含该位置时返回 None。
pub fn extract_push_json(entry: &CommandEntry, document: &serde_json::Value) -> Option<WireValue> {
    match &entry.address {
        Address::Json {
            pointer,
            push_pointer,
            ..
        } => document
            .pointer(push_pointer.as_deref().unwrap_or(pointer))
            .cloned()
            .map(WireValue::Json),
        _ => None,
    }
}

/// 从推送的文本行中取条目的线上值（按前缀匹配）。
pub fn extract_push_line(entry: &CommandEntry, line: &str) -> Option<WireValue> {
    match &entry.address {
        Address::Token {
            prefix: Some(prefix),
            ..
        } => line
            .trim()
            .strip_prefix(prefix.as_str())
            .map(|rest| WireValue::Bytes(rest.trim().as_bytes().to_vec())),
        _ => None,
    }
}

/// MQTT 状态 topic 的推送值。
pub fn extract_push_topic(entry: &CommandEntry, topic: &str, payload: &[u8]) -> Option<WireValue> {
    match &entry.address {
        Address::Topic { state, .. } if state.trim_matches('/') == topic.trim_matches('/') => {
            Some(WireValue::Bytes(payload.to_vec()))
        }
        _ => None,
    }
}

fn wire_bit(wire: &WireValue) -> bool {
    match wire {
        WireValue::Bit(bit) => *bit,
        WireValue::Json(value) => value.as_bool().unwrap_or_else(|| value.as_i64().unwrap_or(0) != 0),
        WireValue::Bytes(bytes) => bytes.iter().any(|byte| *byte != 0),
    }
}

fn unsupported(entry: &CommandEntry) -> TransportError {
    TransportError::Unsupported(format!(
        "{} ({}) has no write form",
        entry.name,
        entry.address.describe()
    ))
}

/// 把编码后的线上值包装成写请求。
pub fn write_request(entry: &CommandEntry, wire: &WireValue) -> Result<Request, TransportError> {
    match &entry.address {
        Address::Register {
            table,
            address,
            unit,
            ..
        } => match table {
            RegisterTable::Coil => Ok(Request::WriteCoil {
                unit: *unit,
                address: *address,
                value: wire_bit(wire),
            }),
            RegisterTable::Holding => {
                let bytes = match wire {
                    WireValue::Bytes(bytes) => bytes.clone(),
                    WireValue::Bit(bit) => vec![0, u8::from(*bit)],
                    WireValue::Json(_) => return Err(unsupported(entry)),
                };
                Ok(Request::WriteRegisters {
                    unit: *unit,
                    address: *address,
                    values: bytes_to_words(&bytes),
                })
            }
            RegisterTable::Input | RegisterTable::Discrete => Err(unsupported(entry)),
        },
        Address::Token { write, .. } => write
            .as_ref()
            .map(|template| Request::Command {
                text: fill_template(template, &wire.as_text()),
            })
            .ok_or_else(|| unsupported(entry)),
        Address::Json { write, .. } => {
            let template = write.as_ref().ok_or_else(|| unsupported(entry))?;
            Ok(match template.render(&wire.as_text()) {
                RequestTemplate::Http { method, path, body } => Request::Http { method, path, body },
                RequestTemplate::Line { text } => Request::Command { text },
            })
        }
        Address::Topic { command, .. } => command
            .as_ref()
            .map(|topic| Request::Publish {
                topic: topic.clone(),
                payload: wire.as_text().into_bytes(),
                retain: false,
            })
            .ok_or_else(|| unsupported(entry)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{HttpMethod, WireType};

    fn register(name: &str, address: u16, wire_type: WireType) -> CommandEntry {
        CommandEntry::new(
            name,
            Address::Register {
                table: RegisterTable::Holding,
                address,
                bit: None,
                unit: None,
            },
            wire_type,
        )
    }

    #[test]
    fn block_reply_is_sliced_by_offset() {
        let entry = register("power", 0x12, WireType::Dword);
        let reply = Reply::Registers(vec![0x0001, 0x0002, 0x0003, 0x0004]);
        let wire = extract(&entry, &reply, 0x10).expect("slice");
        assert_eq!(wire, WireValue::Bytes(vec![0x00, 0x03, 0x00, 0x04]));
    }

    #[test]
    fn short_block_reply_is_reported() {
        let entry = register("power", 0x12, WireType::Dword);
        let reply = Reply::Registers(vec![0x0001, 0x0002, 0x0003]);
        let err = extract(&entry, &reply, 0x10).expect_err("short");
        assert!(matches!(
            err,
            TransportError::ShortReply {
                expected: 4,
                actual: 3
            }
        ));
        assert!(!err.is_link_failure());
    }

    #[test]
    fn token_reply_strips_prefix() {
        let entry = CommandEntry::new(
            "volume",
            Address::Token {
                read: Some("MV?".to_string()),
                write: Some("MV{value}".to_string()),
                prefix: Some("MV".to_string()),
            },
            WireType::Word,
        );
        let wire = extract(&entry, &Reply::Frame(b"MV45\r".to_vec()), 0).expect("token");
        assert_eq!(wire, WireValue::Bytes(b"45".to_vec()));

        let request = write_request(&entry, &WireValue::Bytes(b"30".to_vec())).expect("write");
        assert_eq!(
            request,
            Request::Command {
                text: "MV30".to_string()
            }
        );
    }

    #[test]
    fn json_push_prefers_push_pointer() {
        let entry = CommandEntry::new(
            "volume",
            Address::Json {
                pointer: "/volume".to_string(),
                push_pointer: Some("/main/volume".to_string()),
                read: Some(RequestTemplate::Http {
                    method: HttpMethod::Get,
                    path: "/status".to_string(),
                    body: None,
                }),
                write: None,
            },
            WireType::Word,
        );
        let document = serde_json::json!({"main": {"volume": 28}});
        assert_eq!(
            extract_push_json(&entry, &document),
            Some(WireValue::Json(serde_json::json!(28)))
        );
        assert!(extract_push_json(&entry, &serde_json::json!({"volume": 3})).is_none());

        let polled = extract(&entry, &Reply::Frame(br#"{"volume":12}"#.to_vec()), 0).expect("poll");
        assert_eq!(polled, WireValue::Json(serde_json::json!(12)));
    }

    #[test]
    fn json_write_renders_template() {
        let entry = CommandEntry::new(
            "setpoint",
            Address::Json {
                pointer: "/setpoint".to_string(),
                push_pointer: None,
                read: None,
                write: Some(RequestTemplate::Http {
                    method: HttpMethod::Put,
                    path: "/api/setpoint".to_string(),
                    body: Some(r#"{"value":{value}}"#.to_string()),
                }),
            },
            WireType::Float,
        );
        let request = write_request(&entry, &WireValue::Json(serde_json::json!(21.5))).expect("write");
        assert_eq!(
            request,
            Request::Http {
                method: HttpMethod::Put,
                path: "/api/setpoint".to_string(),
                body: Some(r#"{"value":21.5}"#.to_string()),
            }
        );
    }

    #[test]
    fn input_registers_have_no_write_form() {
        let mut entry = register("temp", 1, WireType::Word);
        entry.address = Address::Register {
            table: RegisterTable::Input,
            address: 1,
            bit: None,
            unit: None,
        };
        assert!(matches!(
            write_request(&entry, &WireValue::Bytes(vec![0, 1])),
            Err(TransportError::Unsupported(_))
        ));
    }

    #[test]
    fn coil_reads_one_bit() {
        let mut entry = register("relay", 7, WireType::Bit);
        entry.address = Address::Register {
            table: RegisterTable::Coil,
            address: 7,
            bit: None,
            unit: Some(3),
        };
        assert_eq!(
            read_request(&entry),
            Some(Request::ReadRegisters {
                table: RegisterTable::Coil,
                unit: Some(3),
                address: 7,
                count: 1
            })
        );
        assert_eq!(
            write_request(&entry, &WireValue::Bit(true)).expect("coil"),
            Request::WriteCoil {
                unit: Some(3),
                address: 7,
                value: true
            }
        );
    }
}
