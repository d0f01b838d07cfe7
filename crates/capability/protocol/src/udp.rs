//! UDP 数据报传输
//!
//! 一个数据报即一帧。

use crate::error::TransportError;
use crate::transport::{Timeouts, Transport};
use crate::types::{Reply, Request};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// 单个数据报的接收缓冲。
const DATAGRAM_LEN: usize = 64 * 1024;

/// UDP 传输
pub struct UdpTransport {
    host: String,
    port: u16,
    timeouts: Timeouts,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn new(host: String, port: u16, timeouts: Timeouts) -> Self {
        Self {
            host,
            port,
            timeouts,
            socket: None,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 丢弃迟到的旧回复。
    fn drain_pending(&self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let mut buf = [0u8; 2048];
        while let Ok(n) = socket.try_recv(&mut buf) {
            debug!(target: "devgw.protocol", bytes = n, "stale_datagram_dropped");
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> &'static str {
        "udp"
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let addr = self.addr();
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        tokio::time::timeout(self.timeouts.connect, socket.connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("resolve {}", addr)))?
            .map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?;
        info!(target: "devgw.protocol", addr = %addr, "udp_connected");
        self.socket = Some(socket);
        Ok(())
    }

    async fn close(&mut self) {
        if self.socket.take().is_some() {
            info!(target: "devgw.protocol", addr = %self.addr(), "udp_closed");
        }
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    async fn request(&mut self, request: Request) -> Result<Reply, TransportError> {
        match request {
            Request::Frame(bytes) => {
                self.drain_pending();
                self.send(&bytes).await?;
                Ok(Reply::Frame(self.receive(self.timeouts.request).await?))
            }
            Request::Query { text, .. } => {
                self.drain_pending();
                self.send(text.as_bytes()).await?;
                Ok(Reply::Frame(self.receive(self.timeouts.request).await?))
            }
            Request::Command { text } => {
                self.send(text.as_bytes()).await?;
                Ok(Reply::Ack)
            }
            other => Err(TransportError::Unsupported(format!(
                "udp cannot {}",
                other.describe()
            ))),
        }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        socket.send(payload).await?;
        Ok(())
    }

    async fn receive(&mut self, deadline: Duration) -> Result<Vec<u8>, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        let mut buf = vec![0u8; DATAGRAM_LEN];
        let n = tokio::time::timeout(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout("udp receive".to_string()))??;
        buf.truncate(n);
        Ok(buf)
    }
}
