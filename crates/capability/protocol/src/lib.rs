//! # 传输能力模块
//!
//! 每个协议族一个 [`Transport`] 实现，由 Session 独占并串行化访问：
//! - **Modbus TCP / RTU**：寄存器块读写（tokio-modbus）
//! - **TCP**：行 / 长度前缀 / JSON 分帧的文本协议与 JSON-RPC
//! - **串口**：计量表与暖通控制器，发送前等待线路静默
//! - **UDP**：请求 / 回复数据报
//! - **HTTP(S)**：JSON 接口，支持 Basic / Bearer / Token Header / Digest
//! - **MQTT**：命令发布（订阅在采集侧）
//!
//! ## 架构设计
//!
//! ```text
//! CommandEntry ──plan::read_request──► Request ──Transport::request──► Reply
//!                                                                     │
//! WireValue ◄──────────────plan::extract──────────────────────────────┘
//!
//! WireValue ──plan::write_request──► Request ──Transport::request──► Ack
//! ```
//!
//! ## 分帧
//!
//! 流式传输从不假设一次读取等于一帧；字节先进入缓冲区，由 [`FrameCodec`]
//! 按设备声明的分帧切分（`line` / `length` / `length32` / `json` / `idle`）。

mod error;
mod framing;
mod http;
mod mock;
mod modbus;
mod mqtt;
pub mod plan;
mod serial;
mod tcp;
mod transport;
mod types;
mod udp;

pub use error::TransportError;
pub use framing::{FrameCodec, Framing, MAX_FRAME_LEN, unescape};
pub use http::HttpTransport;
pub use mock::MockTransport;
pub use modbus::{ModbusLink, ModbusTransport};
pub use mqtt::{MqttSettings, MqttTransport, qos_from_u8};
pub use serial::{SILENCE_WINDOW, SerialSettings, SerialTransport};
pub use tcp::TcpTransport;
pub use transport::{Timeouts, Transport, TransportSettings, build_transport};
pub use types::*;
pub use udp::UdpTransport;
