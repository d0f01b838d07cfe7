//! UDP 推送监听
//!
//! 绑定指定本地端口；来自 allow-list 之外的数据报静默丢弃（节流告警）。
//! 套接字出错时按原地址重新绑定。

use crate::acl::{AllowList, WarnThrottle};
use crate::event::{IngestError, ListenerKind, PushEvent, PushHandler, Source};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 65_535;
const REBIND_DELAY: Duration = Duration::from_secs(1);

/// UDP 推送监听
pub struct UdpSource {
    local: SocketAddr,
    socket: Mutex<Option<UdpSocket>>,
    allow: AllowList,
    throttle: WarnThrottle,
}

impl UdpSource {
    /// 立即绑定，便于调用方取得实际端口（端口 0 时）。
    pub async fn bind(addr: SocketAddr, allow: AllowList) -> Result<Self, IngestError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|err| IngestError::Bind(format!("udp {}: {}", addr, err)))?;
        let local = socket
            .local_addr()
            .map_err(|err| IngestError::Bind(err.to_string()))?;
        info!(target: "devgw.ingest", listener = %local, "udp_listener_bound");
        Ok(Self {
            local,
            socket: Mutex::new(Some(socket)),
            allow,
            throttle: WarnThrottle::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn label(&self) -> String {
        format!("udp:{}", self.local)
    }
}

#[async_trait]
impl Source for UdpSource {
    fn name(&self) -> String {
        self.label()
    }

    async fn run(
        &self,
        handler: Arc<dyn PushHandler>,
        cancel: CancellationToken,
    ) -> Result<(), IngestError> {
        let label = self.label();
        let mut slot = self.socket.lock().await;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if slot.is_none() {
                let rebound = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    result = UdpSocket::bind(self.local) => result,
                };
                match rebound {
                    Ok(socket) => {
                        info!(target: "devgw.ingest", listener = %label, "udp_listener_rebound");
                        *slot = Some(socket);
                    }
                    Err(err) => {
                        warn!(target: "devgw.ingest", listener = %label, error = %err, "udp_rebind_failed");
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(REBIND_DELAY) => continue,
                        }
                    }
                }
            }
            let Some(socket) = slot.as_ref() else {
                continue;
            };
            let received = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = socket.recv_from(&mut buf) => result,
            };
            let (len, peer) = match received {
                Ok(received) => received,
                Err(err) => {
                    warn!(target: "devgw.ingest", listener = %label, error = %err, "udp_receive_failed");
                    *slot = None;
                    continue;
                }
            };
            if !self.throttle.admit(&self.allow, peer.ip(), &label) {
                continue;
            }
            debug!(
                target: "devgw.ingest",
                listener = %label,
                source = %peer,
                bytes = len,
                "udp_datagram_received"
            );
            let event = PushEvent::new(ListenerKind::Udp, label.clone(), buf[..len].to_vec())
                .with_remote(peer.ip());
            if let Err(err) = handler.handle(event).await {
                warn!(target: "devgw.ingest", listener = %label, error = %err, "push_event_failed");
            }
        }
    }
}
