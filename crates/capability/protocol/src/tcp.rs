//! TCP 行协议 / JSON-RPC 客户端
//!
//! 主动连接设备，按显式分帧收发。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let mut transport = TcpTransport::new("192.168.1.20".into(), 23, Framing::crlf(), Timeouts::default());
//! transport.open().await?;
//! let reply = transport
//!     .request(Request::Query { text: "MV?".into(), expect_prefix: Some("MV".into()) })
//!     .await?;
//! ```

use crate::error::TransportError;
use crate::framing::{FrameCodec, Framing};
use crate::transport::{Timeouts, Transport};
use crate::types::{Reply, Request};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info};

/// TCP 流传输
pub struct TcpTransport {
    host: String,
    port: u16,
    framing: Framing,
    timeouts: Timeouts,
    framed: Option<Framed<TcpStream, FrameCodec>>,
}

impl TcpTransport {
    pub fn new(host: String, port: u16, framing: Framing, timeouts: Timeouts) -> Self {
        Self {
            host,
            port,
            framing,
            timeouts,
            framed: None,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 丢弃缓冲区里已到达但无人认领的帧（设备主动上报、上一次命令的回显）。
    async fn drain_pending(&mut self) {
        let Some(framed) = self.framed.as_mut() else {
            return;
        };
        while let Ok(Some(Ok(frame))) = tokio::time::timeout(Duration::ZERO, framed.next()).await {
            debug!(
                target: "devgw.protocol",
                frame = %String::from_utf8_lossy(&frame),
                "stale_frame_dropped"
            );
        }
    }

    /// 在期限内读取首个满足前缀的帧。
    async fn read_matching(&mut self, expect_prefix: Option<&str>) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + self.timeouts.request;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(format!(
                    "no reply matching {:?}",
                    expect_prefix.unwrap_or("")
                )));
            }
            let frame = self.receive(remaining).await?;
            match expect_prefix {
                Some(prefix) if !frame.starts_with(prefix.as_bytes()) => {
                    debug!(
                        target: "devgw.protocol",
                        frame = %String::from_utf8_lossy(&frame),
                        expect_prefix = %prefix,
                        "unrelated_frame_skipped"
                    );
                }
                _ => return Ok(frame),
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        if self.framed.is_some() {
            return Ok(());
        }
        let addr = self.addr();
        let stream = tokio::time::timeout(self.timeouts.connect, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect {}", addr)))?
            .map_err(|err| TransportError::Connect(format!("{}: {}", addr, err)))?;
        let _ = stream.set_nodelay(true);
        info!(target: "devgw.protocol", addr = %addr, "tcp_connected");
        self.framed = Some(Framed::new(stream, FrameCodec::new(self.framing.clone())));
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            let _ = framed.get_mut().shutdown().await;
            info!(target: "devgw.protocol", addr = %self.addr(), "tcp_closed");
        }
    }

    fn is_open(&self) -> bool {
        self.framed.is_some()
    }

    async fn request(&mut self, request: Request) -> Result<Reply, TransportError> {
        match request {
            Request::Query {
                text,
                expect_prefix,
            } => {
                self.drain_pending().await;
                self.send(text.as_bytes()).await?;
                let frame = self.read_matching(expect_prefix.as_deref()).await?;
                Ok(Reply::Frame(frame))
            }
            Request::Frame(bytes) => {
                self.drain_pending().await;
                self.send(&bytes).await?;
                let frame = self.read_matching(None).await?;
                Ok(Reply::Frame(frame))
            }
            Request::Command { text } => {
                self.send(text.as_bytes()).await?;
                Ok(Reply::Ack)
            }
            other => Err(TransportError::Unsupported(format!(
                "tcp cannot {}",
                other.describe()
            ))),
        }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let timeout = self.timeouts.request;
        let framed = self.framed.as_mut().ok_or(TransportError::NotOpen)?;
        tokio::time::timeout(timeout, framed.send(payload.to_vec()))
            .await
            .map_err(|_| TransportError::Timeout("tcp send".to_string()))?
    }

    async fn receive(&mut self, deadline: Duration) -> Result<Vec<u8>, TransportError> {
        let framed = self.framed.as_mut().ok_or(TransportError::NotOpen)?;
        let next = tokio::time::timeout(deadline, framed.next()).await;
        match next {
            Err(_) => Err(TransportError::Timeout("tcp receive".to_string())),
            Ok(None) => {
                self.framed = None;
                Err(TransportError::Io("connection closed by peer".to_string()))
            }
            Ok(Some(Err(err))) => Err(err),
            Ok(Some(Ok(frame))) => Ok(frame.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn query_skips_unrelated_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line == "MV?" {
                    writer.write_all(b"PWON\r\nMV45\r\n").await.expect("write");
                }
            }
        });

        let mut transport =
            TcpTransport::new("127.0.0.1".to_string(), port, Framing::crlf(), Timeouts::default());
        transport.open().await.expect("open");
        let reply = transport
            .request(Request::Query {
                text: "MV?".to_string(),
                expect_prefix: Some("MV".to_string()),
            })
            .await
            .expect("reply");

        assert_eq!(reply, Reply::Frame(b"MV45".to_vec()));
        transport.close().await;
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn connect_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let mut transport =
            TcpTransport::new("127.0.0.1".to_string(), port, Framing::crlf(), Timeouts::default());
        let err = transport.open().await.expect_err("refused");

        assert!(err.is_link_failure());
        assert!(!transport.is_open());
    }
}
