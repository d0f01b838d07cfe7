use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 读写方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[serde(alias = "r", alias = "read_only", alias = "read-only")]
    Read,
    #[serde(alias = "w", alias = "write_only", alias = "write-only")]
    Write,
    #[default]
    #[serde(alias = "rw", alias = "read-write")]
    ReadWrite,
}

impl Direction {
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    /// 与 item 上的方向覆盖取交集；无交集返回 None。
    pub fn narrow(self, requested: Direction) -> Option<Direction> {
        let read = self.can_read() && requested.can_read();
        let write = self.can_write() && requested.can_write();
        match (read, write) {
            (true, true) => Some(Self::ReadWrite),
            (true, false) => Some(Self::Read),
            (false, true) => Some(Self::Write),
            (false, false) => None,
        }
    }

    /// 解析 item 属性中的方向字符串。
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" | "r" | "read_only" | "read-only" => Some(Self::Read),
            "write" | "w" | "write_only" | "write-only" => Some(Self::Write),
            "read-write" | "read_write" | "rw" => Some(Self::ReadWrite),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read-write",
        }
    }
}

/// 线上编码类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireType {
    Bit,
    Byte,
    Word,
    #[serde(alias = "signed-word")]
    SignedWord,
    Dword,
    #[serde(alias = "signed-dword")]
    SignedDword,
    Float,
    Double,
    Enum,
    #[serde(alias = "bool-pair")]
    BoolPair,
    String,
    Blob,
}

impl WireType {
    /// 是否按整数解码（可带 scale）。
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Byte | Self::Word | Self::SignedWord | Self::Dword | Self::SignedDword
        )
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || matches!(self, Self::Float | Self::Double)
    }
}

/// Modbus 风格的寄存器表。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterTable {
    #[default]
    Holding,
    Input,
    Coil,
    #[serde(alias = "discrete_input")]
    Discrete,
}

impl RegisterTable {
    /// 单 bit 表（coil / discrete input）。
    pub fn is_bit_table(self) -> bool {
        matches!(self, Self::Coil | Self::Discrete)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::Holding | Self::Coil)
    }
}

/// 字节序 / 字序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// 文本 / JSON 设备的请求模板，`{value}` 在写入时替换为编码后的值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestTemplate {
    Http {
        #[serde(default)]
        method: HttpMethod,
        path: String,
        #[serde(default)]
        body: Option<String>,
    },
    Line {
        text: String,
    },
}

impl RequestTemplate {
    /// 用编码后的值渲染模板。
    pub fn render(&self, value: &str) -> RequestTemplate {
        match self {
            Self::Http { method, path, body } => Self::Http {
                method: *method,
                path: fill_template(path, value),
                body: body.as_ref().map(|body| fill_template(body, value)),
            },
            Self::Line { text } => Self::Line {
                text: fill_template(text, value),
            },
        }
    }

    /// 作为分组键：相同模板的 JSON 条目共享一次读取。
    pub fn key(&self) -> String {
        match self {
            Self::Http { method, path, body } => format!(
                "{} {} {}",
                method.as_str(),
                path,
                body.as_deref().unwrap_or("")
            ),
            Self::Line { text } => format!("line {}", text),
        }
    }
}

/// 替换模板中的 `{value}`。
pub fn fill_template(template: &str, value: &str) -> String {
    template.replace("{value}", value)
}

/// 协议地址。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Address {
    /// 寄存器地址（Modbus TCP/RTU）。
    Register {
        #[serde(default)]
        table: RegisterTable,
        address: u16,
        #[serde(default)]
        bit: Option<u8>,
        #[serde(default)]
        unit: Option<u8>,
    },
    /// 文本命令（行协议 / 串口）。
    ///
    /// 回复以 `prefix` 开头时剥离前缀，剩余部分为线上值。
    Token {
        #[serde(default)]
        read: Option<String>,
        #[serde(default)]
        write: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
    },
    /// JSON 文档中的位置（HTTP、JSON-RPC、UDP 推送）。
    Json {
        pointer: String,
        #[serde(default)]
        push_pointer: Option<String>,
        #[serde(default)]
        read: Option<RequestTemplate>,
        #[serde(default)]
        write: Option<RequestTemplate>,
    },
    /// MQTT 主题。
    Topic {
        state: String,
        #[serde(default)]
        command: Option<String>,
    },
}

impl Address {
    pub fn is_register(&self) -> bool {
        matches!(self, Self::Register { .. })
    }

    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json { .. })
    }

    /// 地址本身是否支持主动读取。
    pub fn is_readable(&self) -> bool {
        match self {
            Self::Register { .. } => true,
            Self::Token { read, .. } => read.is_some(),
            Self::Json { read, .. } => read.is_some(),
            Self::Topic { .. } => false,
        }
    }

    /// 日志用的简短描述。
    pub fn describe(&self) -> String {
        match self {
            Self::Register {
                table,
                address,
                bit,
                ..
            } => match bit {
                Some(bit) => format!("{:?}:{:#06x}.{}", table, address, bit),
                None => format!("{:?}:{:#06x}", table, address),
            },
            Self::Token { read, write, .. } => format!(
                "token:{}",
                read.as_deref().or(write.as_deref()).unwrap_or("")
            ),
            Self::Json { pointer, .. } => format!("json:{}", pointer),
            Self::Topic { state, .. } => format!("topic:{}", state),
        }
    }
}

/// 缩放：`语义值 = 线上值 × factor ÷ 10^shift`。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub shift: i32,
}

fn default_factor() -> f64 {
    1.0
}

impl Default for Scale {
    fn default() -> Self {
        Self {
            factor: 1.0,
            shift: 0,
        }
    }
}

impl Scale {
    pub fn new(factor: f64, shift: i32) -> Self {
        Self { factor, shift }
    }

    pub fn is_identity(&self) -> bool {
        self.factor == 1.0 && self.shift == 0
    }

    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.factor / 10f64.powi(self.shift)
    }

    pub fn invert(&self, value: f64) -> f64 {
        value * 10f64.powi(self.shift) / self.factor
    }
}

/// 可设置范围（闭区间）。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolPair {
    pub off: String,
    pub on: String,
}

/// 命令表条目：设备的一个可寻址属性及其编码规则。加载后不可变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub name: String,
    pub address: Address,
    #[serde(default)]
    pub direction: Direction,
    pub wire_type: WireType,
    #[serde(default)]
    pub scale: Option<Scale>,
    /// 线上值 → 语义字符串。
    #[serde(default)]
    pub enum_map: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub bool_pair: Option<BoolPair>,
    #[serde(default)]
    pub block_id: Option<String>,
    #[serde(default)]
    pub settable_range: Option<ValueRange>,
    #[serde(default)]
    pub invalid_sentinel: Option<i64>,
    #[serde(default)]
    pub byte_order: Endian,
    #[serde(default)]
    pub word_order: Endian,
    /// string / blob 的寄存器个数。
    #[serde(default)]
    pub length: Option<u16>,
    /// 停止时写入状态缓存，启动时恢复。
    #[serde(default)]
    pub persist: bool,
}

impl CommandEntry {
    /// 构造最小条目（其余字段取默认值）。
    pub fn new(name: impl Into<String>, address: Address, wire_type: WireType) -> Self {
        Self {
            name: name.into(),
            address,
            direction: Direction::ReadWrite,
            wire_type,
            scale: None,
            enum_map: None,
            bool_pair: None,
            block_id: None,
            settable_range: None,
            invalid_sentinel: None,
            byte_order: Endian::Big,
            word_order: Endian::Big,
            length: None,
            persist: false,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_scale(mut self, scale: Scale) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.settable_range = Some(ValueRange { min, max });
        self
    }

    pub fn with_block(mut self, block_id: impl Into<String>) -> Self {
        self.block_id = Some(block_id.into());
        self
    }

    /// 占用的寄存器个数。
    pub fn register_count(&self) -> u16 {
        match self.wire_type {
            WireType::Dword | WireType::SignedDword | WireType::Float => 2,
            WireType::Double => 4,
            WireType::String | WireType::Blob => self.length.unwrap_or(1).max(1),
            _ => 1,
        }
    }

    /// 是否参与周期轮询。
    pub fn is_polled(&self) -> bool {
        self.direction.can_read() && self.address.is_readable()
    }

    /// 有符号解码：显式有符号类型，或可设置范围下界为负。
    pub fn is_signed(&self) -> bool {
        match self.wire_type {
            WireType::SignedWord | WireType::SignedDword => true,
            WireType::Byte | WireType::Word | WireType::Dword => self.has_negative_bound(),
            _ => false,
        }
    }

    pub fn has_negative_bound(&self) -> bool {
        self.settable_range.is_some_and(|range| range.min < 0.0)
    }

    pub fn bit_index(&self) -> Option<u8> {
        match &self.address {
            Address::Register { bit, .. } => *bit,
            _ => None,
        }
    }
}
