//! 插件参数加载。
//!
//! 宿主通过 [`ParameterSource`] 提供参数；[`PluginConfig::from_params`] 按类型读取并
//! 补齐默认值，构造传输参数。

use devgw_auth::HttpAuth;
use devgw_protocol::{Framing, MqttSettings, SerialSettings, Timeouts, TransportSettings};
use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required parameter: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 宿主参数来源。
pub trait ParameterSource: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// 环境变量参数：`cycle_secs` 对应 `DEVGW_CYCLE_SECS`。
#[derive(Debug, Clone)]
pub struct EnvParameters {
    prefix: String,
}

impl EnvParameters {
    pub fn new() -> Self {
        Self::with_prefix("DEVGW_")
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// 先加载 `.env`（不存在时忽略），再读取环境变量。
    pub fn load() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(target: "devgw.config", path = %path.display(), "dotenv_loaded");
        }
        Self::new()
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.to_ascii_uppercase())
    }
}

impl Default for EnvParameters {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterSource for EnvParameters {
    fn get(&self, name: &str) -> Option<String> {
        env::var(self.key(name)).ok()
    }
}

/// 内存参数（宿主直接传入或测试）。
#[derive(Debug, Clone, Default)]
pub struct MapParameters {
    values: HashMap<String, String>,
}

impl MapParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_string(), value.into());
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for MapParameters {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }
}

impl ParameterSource for MapParameters {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// 传输类型参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    ModbusTcp,
    ModbusRtu,
    Tcp,
    Serial,
    Udp,
    Http,
    Mqtt,
}

impl TransportKind {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "modbus_tcp" | "modbus" => Ok(Self::ModbusTcp),
            "modbus_rtu" => Ok(Self::ModbusRtu),
            "tcp" => Ok(Self::Tcp),
            "serial" => Ok(Self::Serial),
            "udp" => Ok(Self::Udp),
            "http" | "https" => Ok(Self::Http),
            "mqtt" => Ok(Self::Mqtt),
            other => Err(ConfigError::Invalid("transport".to_string(), other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModbusTcp => "modbus_tcp",
            Self::ModbusRtu => "modbus_rtu",
            Self::Tcp => "tcp",
            Self::Serial => "serial",
            Self::Udp => "udp",
            Self::Http => "http",
            Self::Mqtt => "mqtt",
        }
    }
}

/// 单个插件实例的运行配置。
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub short_name: String,
    pub instance_id: String,
    /// item 属性名前缀，如 `avr_command`。
    pub attr_prefix: String,
    pub transport_kind: TransportKind,
    pub transport: TransportSettings,
    pub cycle: Duration,
    pub timeouts: Timeouts,
    pub lock_timeout: Duration,
    pub reconnect_step: Duration,
    pub reconnect_max: Duration,
    /// 插件级来源 allow-list（原样保留，空为不限制）。
    pub allow_list: String,
    pub udp_listen: Option<SocketAddr>,
    pub cache_dir: Option<PathBuf>,
    pub change_ring_capacity: usize,
    pub command_table: Option<PathBuf>,
    pub auto_select_first: bool,
    /// MQTT 传输时的 broker 参数（订阅同样使用）。
    pub mqtt: Option<MqttSettings>,
}

impl PluginConfig {
    pub fn from_params(params: &dyn ParameterSource) -> Result<Self, ConfigError> {
        Self::from_params_with_discovered(params, &[])
    }

    /// `discovered` 为宿主发现的设备地址，仅在未配置 `host` 时参与选择。
    pub fn from_params_with_discovered(
        params: &dyn ParameterSource,
        discovered: &[String],
    ) -> Result<Self, ConfigError> {
        let short_name = read_required(params, "short_name")?;
        let transport_kind = TransportKind::parse(&read_required(params, "transport")?)?;
        let instance_id = read_optional(params, "instance_id").unwrap_or_else(|| short_name.clone());
        let attr_prefix = read_optional(params, "attr_prefix").unwrap_or_else(|| short_name.clone());
        let auto_select_first = read_bool_with_default(params, "auto_select_first", false)?;

        let timeouts = Timeouts {
            connect: Duration::from_millis(read_with_default(params, "connect_timeout_ms", 5000u64)?),
            request: Duration::from_millis(read_with_default(params, "request_timeout_ms", 3000u64)?),
        };

        let mut mqtt = None;
        let transport = match transport_kind {
            TransportKind::ModbusTcp => TransportSettings::ModbusTcp {
                host: select_device(read_optional(params, "host"), discovered, auto_select_first)?,
                port: read_with_default(params, "port", 502u16)?,
                unit: read_with_default(params, "modbus_unit", 1u8)?,
            },
            TransportKind::ModbusRtu => TransportSettings::ModbusRtu {
                serial: read_serial(params)?,
                unit: read_with_default(params, "modbus_unit", 1u8)?,
            },
            TransportKind::Tcp => TransportSettings::Tcp {
                host: select_device(read_optional(params, "host"), discovered, auto_select_first)?,
                port: read_parsed_required(params, "port")?,
                framing: read_framing(params)?,
            },
            TransportKind::Serial => TransportSettings::Serial {
                serial: read_serial(params)?,
                framing: read_framing(params)?,
            },
            TransportKind::Udp => TransportSettings::Udp {
                host: select_device(read_optional(params, "host"), discovered, auto_select_first)?,
                port: read_parsed_required(params, "port")?,
            },
            TransportKind::Http => TransportSettings::Http {
                base_url: read_required(params, "base_url")?,
                auth: HttpAuth::from_parts(
                    &read_optional(params, "http_auth").unwrap_or_default(),
                    read_optional(params, "username"),
                    read_optional(params, "password"),
                    read_optional(params, "token"),
                    read_optional(params, "token_header"),
                )
                .map_err(|err| ConfigError::Invalid("http_auth".to_string(), err.to_string()))?,
                probe_path: read_optional(params, "probe_path"),
            },
            TransportKind::Mqtt => {
                let mut settings = MqttSettings::new(
                    read_required(params, "mqtt_host")?,
                    read_with_default(params, "mqtt_port", 1883u16)?,
                );
                settings.username = read_optional(params, "username");
                settings.password = read_optional(params, "password");
                settings.topic_prefix = read_optional(params, "mqtt_topic_prefix").unwrap_or_default();
                settings.qos = read_with_default(params, "mqtt_qos", 0u8)?;
                mqtt = Some(settings.clone());
                TransportSettings::Mqtt(settings)
            }
        };

        let udp_listen = read_optional(params, "udp_listen")
            .map(|value| parse_listen("udp_listen", &value))
            .transpose()?;

        Ok(Self {
            short_name,
            instance_id,
            attr_prefix,
            transport_kind,
            transport,
            cycle: Duration::from_secs(read_with_default(params, "cycle_secs", 30u64)?.max(1)),
            timeouts,
            lock_timeout: Duration::from_millis(read_with_default(params, "lock_timeout_ms", 2000u64)?),
            reconnect_step: Duration::from_secs(read_with_default(params, "reconnect_step_secs", 10u64)?),
            reconnect_max: Duration::from_secs(read_with_default(params, "reconnect_max_secs", 60u64)?),
            allow_list: read_optional(params, "allow_list").unwrap_or_default(),
            udp_listen,
            cache_dir: read_optional(params, "cache_dir").map(PathBuf::from),
            change_ring_capacity: read_with_default(params, "change_ring_capacity", 200usize)?,
            command_table: read_optional(params, "command_table").map(PathBuf::from),
            auto_select_first,
            mqtt,
        })
    }

    /// 属性名：`<attr_prefix>_<suffix>`。
    pub fn attr(&self, suffix: &str) -> String {
        format!("{}_{}", self.attr_prefix, suffix)
    }
}

/// 选择设备地址：显式配置优先；否则在允许时取第一个发现的设备。
pub fn select_device(
    configured: Option<String>,
    discovered: &[String],
    auto_select_first: bool,
) -> Result<String, ConfigError> {
    if let Some(host) = configured.filter(|host| !host.trim().is_empty()) {
        return Ok(host.trim().to_string());
    }
    if auto_select_first && let Some(first) = discovered.first() {
        debug!(target: "devgw.config", host = %first, candidates = discovered.len(), "device_auto_selected");
        return Ok(first.clone());
    }
    Err(ConfigError::Missing("host".to_string()))
}

/// 监听地址：`41100` 表示所有地址上的该端口，也接受 `ip:port`。
pub fn parse_listen(key: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.trim();
    if let Ok(port) = value.parse::<u16>() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    value
        .parse::<SocketAddr>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value.to_string()))
}

fn read_serial(params: &dyn ParameterSource) -> Result<SerialSettings, ConfigError> {
    let mut serial = SerialSettings::new(
        read_required(params, "serial_port")?,
        read_with_default(params, "serial_baud", 9600u32)?,
    );
    serial.idle = Duration::from_millis(read_with_default(params, "serial_idle_ms", 70u64)?);
    serial.turnaround_min =
        Duration::from_millis(read_with_default(params, "turnaround_min_ms", 0u64)?);
    serial.turnaround_max =
        Duration::from_millis(read_with_default(params, "turnaround_max_ms", 1500u64)?);
    if let Some(parity) = read_optional(params, "serial_parity") {
        serial.parity = parity
            .trim()
            .chars()
            .next()
            .filter(|c| matches!(c.to_ascii_uppercase(), 'N' | 'E' | 'O'))
            .ok_or_else(|| ConfigError::Invalid("serial_parity".to_string(), parity.clone()))?;
    }
    Ok(serial)
}

fn read_framing(params: &dyn ParameterSource) -> Result<Framing, ConfigError> {
    let name = read_optional(params, "framing").unwrap_or_else(|| "line".to_string());
    let delimiter = read_optional(params, "line_delimiter").unwrap_or_else(|| "\\r\\n".to_string());
    Framing::parse(&name, &delimiter)
        .map_err(|err| ConfigError::Invalid("framing".to_string(), err.to_string()))
}

fn read_required(params: &dyn ParameterSource, key: &str) -> Result<String, ConfigError> {
    read_optional(params, key).ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn read_parsed_required<T: FromStr>(
    params: &dyn ParameterSource,
    key: &str,
) -> Result<T, ConfigError> {
    let value = read_required(params, key)?;
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(params: &dyn ParameterSource, key: &str) -> Option<String> {
    match params.get(key) {
        Some(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn read_with_default<T: FromStr>(
    params: &dyn ParameterSource,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    let Some(value) = read_optional(params, key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_bool_with_default(
    params: &dyn ParameterSource,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(value) = read_optional(params, key) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid(key.to_string(), value)),
    }
}
