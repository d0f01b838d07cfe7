//! 脚本化的内存传输（用于接线与测试）
//!
//! 克隆共享同一份设备状态：把一个克隆交给 Session，另一个留在测试里
//! 调整行为并检查收到的请求。

use crate::error::TransportError;
use crate::transport::Transport;
use crate::types::{Reply, Request};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    open_attempts: usize,
    close_count: usize,
    fail_open: bool,
    fail_requests: bool,
    delay: Duration,
    reply_limit: Option<usize>,
    registers: BTreeMap<u16, u16>,
    coils: BTreeMap<u16, bool>,
    responses: HashMap<String, Reply>,
    queued: VecDeque<Result<Reply, TransportError>>,
    requests: Vec<Request>,
    in_flight: usize,
    max_in_flight: usize,
}

/// 内存设备
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// 固定回复的匹配键：HTTP 按路径，文本按命令行。
fn response_key(request: &Request) -> Option<&str> {
    match request {
        Request::Http { path, .. } => Some(path.as_str()),
        Request::Query { text, .. } | Request::Command { text } => Some(text.as_str()),
        Request::Publish { topic, .. } => Some(topic.as_str()),
        _ => None,
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state().registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.state().registers.get(&address).copied()
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.state().coils.insert(address, value);
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.state().coils.get(&address).copied()
    }

    /// 对匹配的请求始终返回 `reply`。
    pub fn respond(&self, key: impl Into<String>, reply: Reply) {
        self.state().responses.insert(key.into(), reply);
    }

    /// 排队一次性结果，先于默认行为使用。
    pub fn push_result(&self, result: Result<Reply, TransportError>) {
        self.state().queued.push_back(result);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    /// 模拟链路中断：请求返回 IO 错误。
    pub fn set_fail_requests(&self, fail: bool) {
        self.state().fail_requests = fail;
    }

    /// 每个请求的处理耗时。
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    /// 截断寄存器 / bit 回复，模拟短回复。
    pub fn set_reply_limit(&self, limit: Option<usize>) {
        self.state().reply_limit = limit;
    }

    pub fn open_attempts(&self) -> usize {
        self.state().open_attempts
    }

    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state().requests.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn link_open(&self) -> bool {
        self.state().open
    }

    fn serve(&self, request: &Request) -> Result<Reply, TransportError> {
        let mut state = self.state();
        if let Some(result) = state.queued.pop_front() {
            return result;
        }
        if let Some(reply) = response_key(request).and_then(|key| state.responses.get(key)) {
            return Ok(reply.clone());
        }
        let limit = state.reply_limit;
        match request {
            Request::ReadRegisters {
                table,
                address,
                count,
                ..
            } => {
                let mut len = usize::from(*count);
                if let Some(limit) = limit {
                    len = len.min(limit);
                }
                let addresses = (0..len).map(|offset| address.wrapping_add(offset as u16));
                if table.is_bit_table() {
                    Ok(Reply::Bits(
                        addresses
                            .map(|address| state.coils.get(&address).copied().unwrap_or(false))
                            .collect(),
                    ))
                } else {
                    Ok(Reply::Registers(
                        addresses
                            .map(|address| state.registers.get(&address).copied().unwrap_or(0))
                            .collect(),
                    ))
                }
            }
            Request::WriteRegisters {
                address, values, ..
            } => {
                for (offset, value) in values.iter().enumerate() {
                    state
                        .registers
                        .insert(address.wrapping_add(offset as u16), *value);
                }
                Ok(Reply::Ack)
            }
            Request::WriteCoil { address, value, .. } => {
                state.coils.insert(*address, *value);
                Ok(Reply::Ack)
            }
            Request::Command { .. } | Request::Publish { .. } => Ok(Reply::Ack),
            Request::Http { method, .. } if *method != domain::HttpMethod::Get => Ok(Reply::Ack),
            other => Err(TransportError::Timeout(format!(
                "mock has no reply for {}",
                other.describe()
            ))),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.open {
            return Ok(());
        }
        state.open_attempts += 1;
        if state.fail_open {
            return Err(TransportError::Connect("mock device unreachable".to_string()));
        }
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state();
        if state.open {
            state.open = false;
            state.close_count += 1;
        }
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    async fn request(&mut self, request: Request) -> Result<Reply, TransportError> {
        let delay = {
            let mut state = self.state();
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            state.requests.push(request.clone());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = {
            let fail = self.state().fail_requests;
            if fail {
                Err(TransportError::Io("mock link down".to_string()))
            } else {
                self.serve(&request)
            }
        };
        self.state().in_flight -= 1;
        result
    }
}
