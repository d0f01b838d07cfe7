//! 写入链路：item 值 → 校验 → （bit 条目）读改写 → 编码 → 下发。
//!
//! 设备不在线时写入不排队，直接返回错误。

use async_trait::async_trait;
use devgw_codec::{CodecError, encode, observed, validate};
use devgw_protocol::{TransportError, plan};
use devgw_session::{Session, SessionError};
use devgw_telemetry::PluginMetrics;
use domain::{Address, CommandEntry, ItemValue, WireType, WireValue};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// 一次成功写入。
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// 绑定上应记录的线上值（bit 条目只保留该位）。
    pub wire: WireValue,
    pub request: String,
    pub latency_ms: u64,
}

/// 写入链路错误。
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{0} is read-only")]
    ReadOnly(String),
    #[error("validation error: {0}")]
    Validation(CodecError),
    #[error("encode error: {0}")]
    Encode(CodecError),
    #[error("read-before-write failed: {0}")]
    ReadBeforeWrite(SessionError),
    #[error("request error: {0}")]
    Request(TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ControlError {
    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            Self::Session(SessionError::Suspended) | Self::ReadBeforeWrite(SessionError::Suspended)
        )
    }

    /// 设备侧未被触碰（校验 / 方向 / 编码阶段失败）。
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::ReadOnly(_) | Self::Validation(_) | Self::Encode(_))
    }
}

/// 设备写入抽象。
#[async_trait]
pub trait DeviceWriter: Send + Sync {
    async fn write(
        &self,
        entry: &CommandEntry,
        value: &ItemValue,
    ) -> Result<WriteOutcome, ControlError>;
}

/// 基于 Session 的写入实现。
#[derive(Clone)]
pub struct WriteService {
    session: Arc<Session>,
    metrics: Arc<PluginMetrics>,
}

/// 带位索引的寄存器 bit 需要先读出所在寄存器。
fn needs_current(entry: &CommandEntry) -> bool {
    entry.wire_type == WireType::Bit
        && matches!(entry.address, Address::Register { bit: Some(_), .. })
}

fn register_origin(entry: &CommandEntry) -> u16 {
    match entry.address {
        Address::Register { address, .. } => address,
        _ => 0,
    }
}

impl WriteService {
    pub fn new(session: Arc<Session>, metrics: Arc<PluginMetrics>) -> Self {
        Self { session, metrics }
    }

    /// 读取 bit 所在寄存器的当前值。
    async fn read_current(&self, entry: &CommandEntry) -> Result<WireValue, ControlError> {
        let request = plan::read_request(entry).ok_or_else(|| {
            ControlError::Request(TransportError::Unsupported(format!(
                "{} cannot be read back",
                entry.name
            )))
        })?;
        let reply = self
            .session
            .call(request)
            .await
            .map_err(ControlError::ReadBeforeWrite)?;
        plan::extract(entry, &reply, register_origin(entry))
            .map_err(|err| ControlError::ReadBeforeWrite(SessionError::Transport(err)))
    }

    async fn write_inner(
        &self,
        entry: &CommandEntry,
        value: &ItemValue,
    ) -> Result<WriteOutcome, ControlError> {
        if !entry.direction.can_write() {
            return Err(ControlError::ReadOnly(entry.name.clone()));
        }
        if let Err(err) = validate(entry, value) {
            self.metrics.record_validation_rejected();
            return Err(ControlError::Validation(err));
        }
        let current = if needs_current(entry) {
            let current = self.read_current(entry).await?;
            debug!(
                target: "devgw.control",
                entry = %entry.name,
                current = %current,
                "read_before_write"
            );
            Some(current)
        } else {
            None
        };
        let wire = encode(entry, value, current.as_ref()).map_err(ControlError::Encode)?;
        let request = plan::write_request(entry, &wire).map_err(ControlError::Request)?;
        let description = request.describe();
        let started_at = Instant::now();
        self.session.call(request).await?;
        Ok(WriteOutcome {
            wire: observed(entry, &wire),
            request: description,
            latency_ms: started_at.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl DeviceWriter for WriteService {
    async fn write(
        &self,
        entry: &CommandEntry,
        value: &ItemValue,
    ) -> Result<WriteOutcome, ControlError> {
        match self.write_inner(entry, value).await {
            Ok(outcome) => {
                self.metrics.record_device_write(outcome.latency_ms);
                info!(
                    target: "devgw.control",
                    entry = %entry.name,
                    value = %value,
                    wire = %outcome.wire,
                    request = %outcome.request,
                    latency_ms = outcome.latency_ms,
                    "device_write_succeeded"
                );
                Ok(outcome)
            }
            Err(err) => {
                if !err.is_rejected() {
                    self.metrics.record_device_write_failure();
                }
                if err.is_suspended() {
                    info!(
                        target: "devgw.control",
                        entry = %entry.name,
                        session = %self.session.name(),
                        "device_write_suspended"
                    );
                } else {
                    warn!(
                        target: "devgw.control",
                        entry = %entry.name,
                        value = %value,
                        error = %err,
                        "device_write_failed"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::RegisterTable;

    #[test]
    fn only_indexed_register_bits_read_first() {
        let indexed = CommandEntry::new(
            "mute",
            Address::Register {
                table: RegisterTable::Holding,
                address: 0xA3,
                bit: Some(0),
                unit: None,
            },
            WireType::Bit,
        );
        let coil = CommandEntry::new(
            "relay",
            Address::Register {
                table: RegisterTable::Coil,
                address: 4,
                bit: None,
                unit: None,
            },
            WireType::Bit,
        );
        assert!(needs_current(&indexed));
        assert!(!needs_current(&coil));
    }
}
