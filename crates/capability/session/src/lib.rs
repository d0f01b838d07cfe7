//! 设备会话：独占一个 Transport，串行化所有请求。
//!
//! - 串行化锁带获取期限（默认 2 秒），超时返回 `Busy`。
//! - 链路级错误关闭传输并转入 `disconnected`；下一次轮询触发 `ensure_open`。
//! - 连续失败（打开失败或打开后首个请求链路失败）按线性退避（`step × 次数`，上限 `max`）。
//! - `shutdown` 取消在途请求后关闭传输，保证停止在有限时间内返回。

use devgw_protocol::{Reply, Request, Transport, TransportError};
use domain::{ConnectionState, now_epoch_ms};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 会话错误。
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("session suspended")]
    Suspended,
    #[error("session shut down")]
    Shutdown,
    #[error("session busy: lock not acquired within {0:?}")]
    Busy(Duration),
    #[error("reconnect back-off: next attempt in {0:?}")]
    Backoff(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// 是否意味着设备当前不可达。
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Backoff(_) => true,
            Self::Transport(err) => err.is_link_failure(),
            _ => false,
        }
    }
}

/// 会话参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub lock_timeout: Duration,
    pub reconnect_step: Duration,
    pub reconnect_max: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            reconnect_step: Duration::from_secs(10),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    /// 第 `failures` 次连续失败后的等待时间。
    pub fn backoff(&self, failures: u32) -> Duration {
        self.reconnect_step
            .saturating_mul(failures.max(1))
            .min(self.reconnect_max)
    }
}

/// Web 快照用的会话状态。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub transport: String,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub connected_since_ms: Option<i64>,
    pub reconnect_failures: u32,
}

struct Link {
    transport: Box<dyn Transport>,
    failures: u32,
    next_attempt: Option<Instant>,
    /// 自上次连通以来是否已按 warn 记录过错误
    failure_logged: bool,
}

#[derive(Debug, Default)]
struct Status {
    state: ConnectionState,
    suspended: bool,
    shut_down: bool,
    last_error: Option<String>,
    connected_since_ms: Option<i64>,
    failures: u32,
}

/// 设备会话
pub struct Session {
    name: String,
    kind: &'static str,
    config: SessionConfig,
    link: tokio::sync::Mutex<Link>,
    status: Mutex<Status>,
    cancel: Mutex<CancellationToken>,
    open_attempts: AtomicUsize,
}

impl Session {
    /// 创建会话；不打开传输。
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            name: name.into(),
            kind: transport.kind(),
            config,
            link: tokio::sync::Mutex::new(Link {
                transport,
                failures: 0,
                next_attempt: None,
                failure_logged: false,
            }),
            status: Mutex::new(Status::default()),
            cancel: Mutex::new(CancellationToken::new()),
            open_attempts: AtomicUsize::new(0),
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_suspended(&self) -> bool {
        self.status().suspended
    }

    pub fn last_error(&self) -> Option<String> {
        self.status().last_error.clone()
    }

    /// 实际调用 `Transport::open` 的次数。
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status();
        SessionSnapshot {
            transport: self.kind.to_string(),
            state: status.state,
            last_error: status.last_error.clone(),
            connected_since_ms: status.connected_since_ms,
            reconnect_failures: status.failures,
        }
    }

    fn gate(&self) -> Result<(), SessionError> {
        let status = self.status();
        if status.shut_down {
            return Err(SessionError::Shutdown);
        }
        if status.suspended {
            return Err(SessionError::Suspended);
        }
        Ok(())
    }

    async fn lock_link(&self) -> Result<tokio::sync::MutexGuard<'_, Link>, SessionError> {
        tokio::time::timeout(self.config.lock_timeout, self.link.lock())
            .await
            .map_err(|_| SessionError::Busy(self.config.lock_timeout))
    }

    /// 传输未打开时尝试打开一次（受退避约束），返回当前状态。
    pub async fn ensure_open(&self) -> Result<ConnectionState, SessionError> {
        self.gate()?;
        let mut link = self.lock_link().await?;
        self.ensure_open_locked(&mut link).await
    }

    async fn ensure_open_locked(&self, link: &mut Link) -> Result<ConnectionState, SessionError> {
        self.gate()?;
        if link.transport.is_open() {
            self.status().state = ConnectionState::Connected;
            return Ok(ConnectionState::Connected);
        }
        if let Some(next) = link.next_attempt {
            let now = Instant::now();
            if now < next {
                let remaining = next - now;
                debug!(
                    target: "devgw.session",
                    session = %self.name,
                    remaining_ms = remaining.as_millis() as u64,
                    "reconnect_deferred"
                );
                return Err(SessionError::Backoff(remaining));
            }
        }

        self.status().state = ConnectionState::Connecting;
        self.open_attempts.fetch_add(1, Ordering::Relaxed);
        let token = self.token();
        let result = tokio::select! {
            _ = token.cancelled() => Err(SessionError::Shutdown),
            result = link.transport.open() => result.map_err(SessionError::from),
        };

        match result {
            Ok(()) => {
                link.next_attempt = None;
                {
                    let mut status = self.status();
                    status.state = ConnectionState::Connected;
                    status.connected_since_ms = Some(now_epoch_ms());
                    status.last_error = None;
                }
                // 失败计数要等第一个请求得到设备应答才清零
                if link.failures == 0 && !link.failure_logged {
                    info!(target: "devgw.session", session = %self.name, transport = self.kind, "session_connected");
                } else {
                    debug!(
                        target: "devgw.session",
                        session = %self.name,
                        transport = self.kind,
                        failures = link.failures,
                        "session_reopened"
                    );
                }
                Ok(ConnectionState::Connected)
            }
            Err(SessionError::Shutdown) => {
                link.transport.close().await;
                Err(SessionError::Shutdown)
            }
            Err(err) => {
                self.arm_backoff(link);
                {
                    let mut status = self.status();
                    status.state = ConnectionState::Disconnected;
                    status.last_error = Some(err.to_string());
                }
                self.log_failure(link, "session_open_failed", &err);
                Err(err)
            }
        }
    }

    /// 设备有应答：清零失败计数，必要时记录恢复。
    fn confirm_link(&self, link: &mut Link) {
        if link.failures == 0 && !link.failure_logged {
            return;
        }
        link.failures = 0;
        link.failure_logged = false;
        self.status().failures = 0;
        info!(target: "devgw.session", session = %self.name, transport = self.kind, "session_reconnected");
    }

    /// 记一次失败尝试并排定下一次打开时间。
    fn arm_backoff(&self, link: &mut Link) {
        link.failures = link.failures.saturating_add(1);
        link.next_attempt = Some(Instant::now() + self.config.backoff(link.failures));
        self.status().failures = link.failures;
    }

    fn log_failure(&self, link: &mut Link, event: &'static str, err: &SessionError) {
        if link.failure_logged {
            info!(
                target: "devgw.session",
                session = %self.name,
                transport = self.kind,
                failures = link.failures,
                error = %err,
                "{}",
                event
            );
        } else {
            link.failure_logged = true;
            warn!(
                target: "devgw.session",
                session = %self.name,
                transport = self.kind,
                failures = link.failures,
                error = %err,
                "{}",
                event
            );
        }
    }

    /// 串行化的请求：加锁、确保已打开、发送。
    ///
    /// 链路级错误会关闭传输并转入 `disconnected`，错误原样返回。
    pub async fn call(&self, request: Request) -> Result<Reply, SessionError> {
        self.gate()?;
        let mut link = self.lock_link().await?;
        self.ensure_open_locked(&mut link).await?;

        let token = self.token();
        let description = request.describe();
        let result = tokio::select! {
            _ = token.cancelled() => Err(SessionError::Shutdown),
            result = link.transport.request(request) => result.map_err(SessionError::from),
        };

        match &result {
            Ok(_) => {
                self.confirm_link(&mut link);
                debug!(target: "devgw.session", session = %self.name, request = %description, "session_call_ok");
            }
            Err(SessionError::Shutdown) => {
                link.transport.close().await;
            }
            Err(SessionError::Transport(err)) if err.is_link_failure() => {
                link.transport.close().await;
                // 部分传输的 open 不接触设备，链路失败同样计入退避
                self.arm_backoff(&mut link);
                {
                    let mut status = self.status();
                    if !status.suspended {
                        status.state = ConnectionState::Disconnected;
                    }
                    status.last_error = Some(err.to_string());
                }
                let err = SessionError::Transport(err.clone());
                self.log_failure(&mut link, "session_link_lost", &err);
            }
            Err(err) => {
                self.confirm_link(&mut link);
                self.status().last_error = Some(err.to_string());
                debug!(
                    target: "devgw.session",
                    session = %self.name,
                    request = %description,
                    error = %err,
                    "session_call_rejected"
                );
            }
        }
        result
    }

    /// 暂停：此后 `call` 直接返回 `Suspended`，传输被释放。
    pub async fn suspend(&self) {
        {
            let mut status = self.status();
            if status.suspended {
                return;
            }
            status.suspended = true;
            status.state = ConnectionState::Suspended;
        }
        info!(target: "devgw.session", session = %self.name, "session_suspended");
        match self.lock_link().await {
            Ok(mut link) => link.transport.close().await,
            Err(err) => {
                warn!(target: "devgw.session", session = %self.name, error = %err, "session_suspend_close_skipped");
            }
        }
    }

    /// 恢复：清除退避，下一次轮询立即重连。
    pub async fn resume(&self) {
        {
            let mut status = self.status();
            if !status.suspended || status.shut_down {
                return;
            }
            status.suspended = false;
            status.state = ConnectionState::Disconnected;
        }
        if let Ok(mut link) = self.lock_link().await {
            link.failures = 0;
            link.next_attempt = None;
        }
        info!(target: "devgw.session", session = %self.name, "session_resumed");
    }

    /// 关闭：取消在途请求、关闭传输、转入 `suspended`。可重复调用。
    pub async fn shutdown(&self) {
        {
            let mut status = self.status();
            status.shut_down = true;
            status.state = ConnectionState::Suspended;
        }
        self.token().cancel();
        match self.lock_link().await {
            Ok(mut link) => {
                let was_open = link.transport.is_open();
                link.transport.close().await;
                if was_open {
                    info!(target: "devgw.session", session = %self.name, transport = self.kind, "session_closed");
                }
            }
            Err(err) => {
                warn!(target: "devgw.session", session = %self.name, error = %err, "session_close_skipped");
            }
        }
    }

    /// `shutdown` 之后重新允许打开（插件再次 run）。
    pub fn rearm(&self) {
        *self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = CancellationToken::new();
        let mut status = self.status();
        if status.shut_down {
            status.shut_down = false;
            status.state = if status.suspended {
                ConnectionState::Suspended
            } else {
                ConnectionState::Disconnected
            };
        }
    }
}
