//! Transport 抽象与构造

use crate::error::TransportError;
use crate::framing::Framing;
use crate::http::HttpTransport;
use crate::modbus::{ModbusLink, ModbusTransport};
use crate::mqtt::{MqttSettings, MqttTransport};
use crate::serial::{SerialSettings, SerialTransport};
use crate::tcp::TcpTransport;
use crate::types::{Reply, Request};
use crate::udp::UdpTransport;
use async_trait::async_trait;
use devgw_auth::HttpAuth;
use std::time::Duration;

/// 单一协议族的设备连接。
///
/// 同一时刻只允许一个请求在途，由持有它的 Session 串行化。
#[async_trait]
pub trait Transport: Send {
    /// 协议名（日志用）
    fn kind(&self) -> &'static str;

    /// 打开连接；已打开时直接返回。
    async fn open(&mut self) -> Result<(), TransportError>;

    /// 关闭连接；幂等，永不失败。
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// 请求 / 回复。
    async fn request(&mut self, request: Request) -> Result<Reply, TransportError>;

    /// 帧流：发送一帧。
    async fn send(&mut self, _payload: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(format!("{} send", self.kind())))
    }

    /// 帧流：在期限内接收一帧。
    async fn receive(&mut self, _deadline: Duration) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported(format!("{} receive", self.kind())))
    }
}

/// 连接与单次请求超时。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(5000),
            request: Duration::from_millis(3000),
        }
    }
}

/// 传输构造参数。
#[derive(Debug, Clone)]
pub enum TransportSettings {
    ModbusTcp {
        host: String,
        port: u16,
        unit: u8,
    },
    ModbusRtu {
        serial: SerialSettings,
        unit: u8,
    },
    Tcp {
        host: String,
        port: u16,
        framing: Framing,
    },
    Serial {
        serial: SerialSettings,
        framing: Framing,
    },
    Udp {
        host: String,
        port: u16,
    },
    Http {
        base_url: String,
        auth: HttpAuth,
        probe_path: Option<String>,
    },
    Mqtt(MqttSettings),
}

/// 按参数构造具体传输；不打开连接。
pub fn build_transport(settings: TransportSettings, timeouts: Timeouts) -> Box<dyn Transport> {
    match settings {
        TransportSettings::ModbusTcp { host, port, unit } => Box::new(ModbusTransport::new(
            ModbusLink::Tcp { host, port },
            unit,
            timeouts,
        )),
        TransportSettings::ModbusRtu { serial, unit } => Box::new(ModbusTransport::new(
            ModbusLink::Rtu(serial),
            unit,
            timeouts,
        )),
        TransportSettings::Tcp {
            host,
            port,
            framing,
        } => Box::new(TcpTransport::new(host, port, framing, timeouts)),
        TransportSettings::Serial { serial, framing } => {
            Box::new(SerialTransport::new(serial, framing, timeouts))
        }
        TransportSettings::Udp { host, port } => Box::new(UdpTransport::new(host, port, timeouts)),
        TransportSettings::Http {
            base_url,
            auth,
            probe_path,
        } => Box::new(HttpTransport::new(base_url, auth, probe_path, timeouts)),
        TransportSettings::Mqtt(settings) => Box::new(MqttTransport::new(settings, timeouts)),
    }
}
