//! 请求 / 回复类型定义

use domain::{HttpMethod, RegisterTable};

/// 一次传输请求。
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// 批量读取寄存器（holding / input）或 bit（coil / discrete）
    ReadRegisters {
        table: RegisterTable,
        unit: Option<u8>,
        address: u16,
        count: u16,
    },
    WriteRegisters {
        unit: Option<u8>,
        address: u16,
        values: Vec<u16>,
    },
    WriteCoil {
        unit: Option<u8>,
        address: u16,
        value: bool,
    },
    /// 发送一行命令并等待回复帧；`expect_prefix` 用于跳过无关的主动上报
    Query {
        text: String,
        expect_prefix: Option<String>,
    },
    /// 只发送不等待回复
    Command { text: String },
    /// 原始帧请求（UDP / 串口），等待一帧回复
    Frame(Vec<u8>),
    Http {
        method: HttpMethod,
        path: String,
        body: Option<String>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
}

impl Request {
    /// 日志用的简短描述。
    pub fn describe(&self) -> String {
        match self {
            Self::ReadRegisters {
                table,
                address,
                count,
                ..
            } => format!("read {:?} {:#06x}+{}", table, address, count),
            Self::WriteRegisters { address, values, .. } => {
                format!("write {:#06x}+{}", address, values.len())
            }
            Self::WriteCoil { address, value, .. } => format!("coil {:#06x}={}", address, value),
            Self::Query { text, .. } => format!("query {:?}", text),
            Self::Command { text } => format!("command {:?}", text),
            Self::Frame(bytes) => format!("frame {} bytes", bytes.len()),
            Self::Http { method, path, .. } => format!("{} {}", method.as_str(), path),
            Self::Publish { topic, .. } => format!("publish {}", topic),
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Self::ReadRegisters { .. } | Self::Query { .. } | Self::Frame(_)
        ) && !matches!(
            self,
            Self::Http {
                method: HttpMethod::Get,
                ..
            }
        )
    }
}

/// 一次传输回复。
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Registers(Vec<u16>),
    Bits(Vec<bool>),
    Frame(Vec<u8>),
    Ack,
}

impl Reply {
    /// 回复携带的单元数（寄存器、bit 或字节）。
    pub fn len(&self) -> usize {
        match self {
            Self::Registers(words) => words.len(),
            Self::Bits(bits) => bits.len(),
            Self::Frame(bytes) => bytes.len(),
            Self::Ack => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 寄存器字转大端字节。
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_be_bytes()).collect()
}

/// 大端字节转寄存器字；奇数长度时高位补零。
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    if bytes.len() % 2 == 1 {
        let mut padded = Vec::with_capacity(bytes.len() + 1);
        padded.push(0);
        padded.extend_from_slice(bytes);
        return bytes_to_words(&padded);
    }
    bytes
        .chunks(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect()
}
