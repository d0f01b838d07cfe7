//! TCP 推送监听
//!
//! 每个连接一个任务，按配置的分帧切出消息；连接来源先过 allow-list。

use crate::acl::{AllowList, WarnThrottle};
use crate::event::{IngestError, ListenerKind, PushEvent, PushHandler, Source};
use async_trait::async_trait;
use devgw_protocol::{FrameCodec, Framing};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// TCP 推送监听
pub struct TcpListenSource {
    local: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    framing: Framing,
    allow: AllowList,
    throttle: Arc<WarnThrottle>,
}

impl TcpListenSource {
    pub async fn bind(
        addr: SocketAddr,
        framing: Framing,
        allow: AllowList,
    ) -> Result<Self, IngestError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| IngestError::Bind(format!("tcp {}: {}", addr, err)))?;
        let local = listener
            .local_addr()
            .map_err(|err| IngestError::Bind(err.to_string()))?;
        info!(target: "devgw.ingest", listener = %local, "tcp_listener_bound");
        Ok(Self {
            local,
            listener: Mutex::new(Some(listener)),
            framing,
            allow,
            throttle: Arc::new(WarnThrottle::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn label(&self) -> String {
        format!("tcp:{}", self.local)
    }
}

async fn read_connection(
    stream: TcpStream,
    peer: SocketAddr,
    label: String,
    framing: Framing,
    handler: Arc<dyn PushHandler>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, FrameCodec::new(framing));
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                let event = PushEvent::new(ListenerKind::Tcp, label.clone(), frame.to_vec())
                    .with_remote(peer.ip());
                if let Err(err) = handler.handle(event).await {
                    warn!(target: "devgw.ingest", listener = %label, error = %err, "push_event_failed");
                }
            }
            Some(Err(err)) => {
                warn!(target: "devgw.ingest", listener = %label, source = %peer, error = %err, "tcp_connection_error");
                return;
            }
            None => {
                debug!(target: "devgw.ingest", listener = %label, source = %peer, "tcp_connection_closed");
                return;
            }
        }
    }
}

#[async_trait]
impl Source for TcpListenSource {
    fn name(&self) -> String {
        self.label()
    }

    async fn run(
        &self,
        handler: Arc<dyn PushHandler>,
        cancel: CancellationToken,
    ) -> Result<(), IngestError> {
        let label = self.label();
        let mut slot = self.listener.lock().await;
        let listener = match slot.take() {
            Some(listener) => listener,
            None => TcpListener::bind(self.local)
                .await
                .map_err(|err| IngestError::Bind(format!("tcp {}: {}", self.local, err)))?,
        };
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    return Err(IngestError::Source(format!("{} accept: {}", label, err)));
                }
            };
            if !self.throttle.admit(&self.allow, peer.ip(), &label) {
                continue;
            }
            debug!(target: "devgw.ingest", listener = %label, source = %peer, "tcp_connection_accepted");
            tokio::spawn(read_connection(
                stream,
                peer,
                label.clone(),
                self.framing.clone(),
                Arc::clone(&handler),
                cancel.child_token(),
            ));
        }
    }
}
