//! 串口传输（计量表、暖通控制器）
//!
//! 发送前先确认线路静默（一个字符间隔内无数据，整体不超过 3 秒），
//! 并保证距离上次收发至少间隔 `turnaround_min`。

use crate::error::TransportError;
use crate::framing::{FrameCodec, Framing};
use crate::transport::{Timeouts, Transport};
use crate::types::{Reply, Request};
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info};

/// 等待线路静默的总窗口。
pub const SILENCE_WINDOW: Duration = Duration::from_secs(3);

/// 串口参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud: u32,
    pub data_bits: u8,
    /// `N` / `E` / `O`
    pub parity: char,
    pub stop_bits: u8,
    /// 字符间隔：超过即认为一帧结束 / 线路静默
    pub idle: Duration,
    pub turnaround_min: Duration,
    /// 设备开始回复的最长等待；为零时使用请求超时
    pub turnaround_max: Duration,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            data_bits: 8,
            parity: 'N',
            stop_bits: 1,
            idle: Duration::from_millis(70),
            turnaround_min: Duration::ZERO,
            turnaround_max: Duration::from_millis(1500),
        }
    }

    /// 打开串口。
    pub fn open(&self) -> Result<SerialStream, TransportError> {
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let parity = match self.parity.to_ascii_uppercase() {
            'E' => Parity::Even,
            'O' => Parity::Odd,
            _ => Parity::None,
        };
        let stop_bits = if self.stop_bits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        };
        tokio_serial::new(&self.port, self.baud)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(|err| TransportError::Connect(format!("{}: {}", self.port, err)))
    }
}

/// 串口传输
pub struct SerialTransport {
    settings: SerialSettings,
    codec: FrameCodec,
    timeouts: Timeouts,
    stream: Option<SerialStream>,
    buffer: BytesMut,
    last_activity: Option<Instant>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings, framing: Framing, timeouts: Timeouts) -> Self {
        Self {
            settings,
            codec: FrameCodec::new(framing),
            timeouts,
            stream: None,
            buffer: BytesMut::new(),
            last_activity: None,
        }
    }

    fn reply_deadline(&self) -> Duration {
        if self.settings.turnaround_max.is_zero() {
            self.timeouts.request
        } else {
            self.settings.turnaround_max.min(self.timeouts.request)
        }
    }

    /// 读空线路：直到一个字符间隔内没有新字节。
    async fn wait_for_silence(&mut self) -> Result<(), TransportError> {
        let idle = self.settings.idle;
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let started = Instant::now();
        let mut chunk = [0u8; 256];
        let mut discarded = 0usize;
        loop {
            if started.elapsed() > SILENCE_WINDOW {
                return Err(TransportError::Framing(format!(
                    "line not silent within {:?}",
                    SILENCE_WINDOW
                )));
            }
            match tokio::time::timeout(idle, stream.read(&mut chunk)).await {
                Err(_) => break,
                Ok(Ok(0)) => return Err(TransportError::Io("serial port closed".to_string())),
                Ok(Ok(n)) => discarded += n,
                Ok(Err(err)) => return Err(err.into()),
            }
        }
        if discarded > 0 {
            debug!(target: "devgw.protocol", port = %self.settings.port, discarded, "serial_line_drained");
        }
        self.buffer.clear();
        Ok(())
    }

    async fn honour_turnaround(&self) {
        if let Some(last) = self.last_activity {
            let elapsed = last.elapsed();
            if elapsed < self.settings.turnaround_min {
                tokio::time::sleep(self.settings.turnaround_min - elapsed).await;
            }
        }
    }

    async fn transmit(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.wait_for_silence().await?;
        self.honour_turnaround().await;
        let mut encoded = BytesMut::new();
        self.codec.encode(payload.to_vec(), &mut encoded)?;
        let timeout = self.timeouts.request;
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        tokio::time::timeout(timeout, async {
            stream.write_all(&encoded).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| TransportError::Timeout("serial write".to_string()))??;
        self.last_activity = Some(Instant::now());
        Ok(())
    }

    /// 读取到空闲为止的一帧。
    async fn read_idle_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let first_deadline = self.reply_deadline();
        let idle = self.settings.idle;
        let total = self.timeouts.request;
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let mut chunk = [0u8; 256];
        let n = tokio::time::timeout(first_deadline, stream.read(&mut chunk))
            .await
            .map_err(|_| TransportError::Timeout("no reply on serial line".to_string()))??;
        if n == 0 {
            return Err(TransportError::Io("serial port closed".to_string()));
        }
        let mut frame = chunk[..n].to_vec();
        let started = Instant::now();
        while started.elapsed() < total {
            match tokio::time::timeout(idle, stream.read(&mut chunk)).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(n)) => frame.extend_from_slice(&chunk[..n]),
                Ok(Err(err)) => return Err(err.into()),
            }
        }
        self.last_activity = Some(Instant::now());
        Ok(frame)
    }

    /// 按分帧器读取一帧。
    async fn read_framed(&mut self) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + self.timeouts.request;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                self.last_activity = Some(Instant::now());
                return Ok(frame.to_vec());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout("serial frame incomplete".to_string()));
            }
            let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
            let n = tokio::time::timeout(remaining, stream.read(&mut chunk))
                .await
                .map_err(|_| TransportError::Timeout("serial frame incomplete".to_string()))??;
            if n == 0 {
                return Err(TransportError::Io("serial port closed".to_string()));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        if *self.codec.framing() == Framing::Idle {
            self.read_idle_frame().await
        } else {
            self.read_framed().await
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> &'static str {
        "serial"
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = self.settings.open()?;
        info!(
            target: "devgw.protocol",
            port = %self.settings.port,
            baud = self.settings.baud,
            "serial_opened"
        );
        self.stream = Some(stream);
        self.buffer.clear();
        Ok(())
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            info!(target: "devgw.protocol", port = %self.settings.port, "serial_closed");
        }
        self.buffer.clear();
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn request(&mut self, request: Request) -> Result<Reply, TransportError> {
        match request {
            Request::Query { text, .. } => {
                self.transmit(text.as_bytes()).await?;
                Ok(Reply::Frame(self.read_frame().await?))
            }
            Request::Frame(bytes) => {
                self.transmit(&bytes).await?;
                Ok(Reply::Frame(self.read_frame().await?))
            }
            Request::Command { text } => {
                self.transmit(text.as_bytes()).await?;
                Ok(Reply::Ack)
            }
            other => Err(TransportError::Unsupported(format!(
                "serial cannot {}",
                other.describe()
            ))),
        }
    }

    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.transmit(payload).await
    }

    async fn receive(&mut self, deadline: Duration) -> Result<Vec<u8>, TransportError> {
        tokio::time::timeout(deadline, self.read_frame())
            .await
            .map_err(|_| TransportError::Timeout("serial receive".to_string()))?
    }
}
