//! 流式传输的显式分帧
//!
//! 一次 recv 不等于一帧：TCP / 串口字节先进入缓冲区，再按设备声明的
//! 分帧方式切分。

use crate::error::TransportError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// 单帧上限（64 KiB）。
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// 分帧方式。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// 以分隔符结尾（CRLF、`\r`、`\n`）
    Line { delimiter: Vec<u8> },
    /// 大端长度前缀（2 或 4 字节）
    LengthPrefixed { width: u8 },
    /// 顶层平衡的 JSON 对象或数组
    Json,
    /// 以线路空闲结束（串口，由传输按字符间隔判定）
    Idle,
}

impl Framing {
    /// 解析参数：`line|length|length32|json|idle`，分隔符支持 `\r` `\n` `\t` 转义。
    pub fn parse(name: &str, delimiter: &str) -> Result<Self, TransportError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "line" => {
                let delimiter = unescape(delimiter);
                if delimiter.is_empty() {
                    return Err(TransportError::ConfigParse(
                        "line framing needs a delimiter".to_string(),
                    ));
                }
                Ok(Self::Line {
                    delimiter: delimiter.into_bytes(),
                })
            }
            "length" | "length16" | "length_prefixed" => Ok(Self::LengthPrefixed { width: 2 }),
            "length32" => Ok(Self::LengthPrefixed { width: 4 }),
            "json" => Ok(Self::Json),
            "idle" => Ok(Self::Idle),
            other => Err(TransportError::ConfigParse(format!(
                "unknown framing: {}",
                other
            ))),
        }
    }

    pub fn crlf() -> Self {
        Self::Line {
            delimiter: b"\r\n".to_vec(),
        }
    }
}

/// 还原参数中的转义序列。
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// tokio-util 编解码器。
#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: Framing,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trimmed(frame: BytesMut) -> BytesMut {
    let start = frame
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(frame.len());
    let end = frame
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(start, |index| index + 1);
    let mut frame = frame;
    frame.truncate(end);
    frame.advance(start);
    frame
}

/// 返回首个完整 JSON 值的 (起点, 终点)。
fn json_extent(buf: &[u8]) -> Option<(usize, usize)> {
    let start = buf.iter().position(|byte| *byte == b'{' || *byte == b'[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in buf[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some((start, start + offset + 1));
                }
            }
            _ => {}
        }
    }
    None
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, TransportError> {
        match &self.framing {
            Framing::Line { delimiter } => loop {
                let Some(position) = find(src, delimiter) else {
                    if src.len() > MAX_FRAME_LEN {
                        return Err(TransportError::Framing(format!(
                            "no delimiter within {} bytes",
                            MAX_FRAME_LEN
                        )));
                    }
                    return Ok(None);
                };
                let mut frame = src.split_to(position + delimiter.len());
                frame.truncate(position);
                let frame = trimmed(frame);
                if !frame.is_empty() {
                    return Ok(Some(frame));
                }
            },
            Framing::LengthPrefixed { width } => {
                let width = usize::from(*width);
                if src.len() < width {
                    return Ok(None);
                }
                let length = src[..width]
                    .iter()
                    .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte));
                if length > MAX_FRAME_LEN {
                    return Err(TransportError::Framing(format!(
                        "frame length {} exceeds {}",
                        length, MAX_FRAME_LEN
                    )));
                }
                if src.len() < width + length {
                    src.reserve(width + length - src.len());
                    return Ok(None);
                }
                src.advance(width);
                Ok(Some(src.split_to(length)))
            }
            Framing::Json => match json_extent(src) {
                Some((start, end)) => {
                    src.advance(start);
                    Ok(Some(src.split_to(end - start)))
                }
                None => {
                    if src.len() > MAX_FRAME_LEN {
                        return Err(TransportError::Framing(
                            "unterminated json document".to_string(),
                        ));
                    }
                    Ok(None)
                }
            },
            Framing::Idle => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, TransportError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = trimmed(src.split());
        Ok((!rest.is_empty()).then_some(rest))
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), TransportError> {
        match &self.framing {
            Framing::Line { delimiter } => {
                dst.reserve(item.len() + delimiter.len());
                let terminated = item.ends_with(delimiter);
                dst.put_slice(&item);
                if !terminated {
                    dst.put_slice(delimiter);
                }
            }
            Framing::LengthPrefixed { width } => {
                if item.len() > MAX_FRAME_LEN {
                    return Err(TransportError::Framing(format!(
                        "frame length {} exceeds {}",
                        item.len(),
                        MAX_FRAME_LEN
                    )));
                }
                if *width == 4 {
                    dst.put_u32(item.len() as u32);
                } else {
                    dst.put_u16(item.len() as u16);
                }
                dst.put_slice(&item);
            }
            Framing::Json | Framing::Idle => dst.put_slice(&item),
        }
        Ok(())
    }
}
