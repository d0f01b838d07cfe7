//! HTTP 推送监听
//!
//! 接收任意路径的 POST / PUT；路径作为事件 topic。

use crate::acl::{AllowList, WarnThrottle};
use crate::event::{IngestError, ListenerKind, PushEvent, PushHandler, Source};
use async_trait::async_trait;
use bytes::Bytes;
use axum::Router;
use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, Uri};
use axum::routing::any;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// HTTP 推送监听
pub struct HttpListenSource {
    local: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    allow: AllowList,
    throttle: Arc<WarnThrottle>,
}

#[derive(Clone)]
struct PushState {
    label: String,
    allow: AllowList,
    throttle: Arc<WarnThrottle>,
    handler: Arc<dyn PushHandler>,
}

impl HttpListenSource {
    pub async fn bind(addr: SocketAddr, allow: AllowList) -> Result<Self, IngestError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| IngestError::Bind(format!("http {}: {}", addr, err)))?;
        let local = listener
            .local_addr()
            .map_err(|err| IngestError::Bind(err.to_string()))?;
        info!(target: "devgw.ingest", listener = %local, "http_listener_bound");
        Ok(Self {
            local,
            listener: Mutex::new(Some(listener)),
            allow,
            throttle: Arc::new(WarnThrottle::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn label(&self) -> String {
        format!("http:{}", self.local)
    }
}

async fn receive_push(
    State(state): State<PushState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: axum::http::Method,
    uri: Uri,
    body: Bytes,
) -> StatusCode {
    if method != axum::http::Method::POST && method != axum::http::Method::PUT {
        return StatusCode::METHOD_NOT_ALLOWED;
    }
    if !state.throttle.admit(&state.allow, peer.ip(), &state.label) {
        return StatusCode::FORBIDDEN;
    }
    let event = PushEvent::new(ListenerKind::Http, state.label.clone(), body.to_vec())
        .with_remote(peer.ip())
        .with_topic(uri.path());
    match state.handler.handle(event).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => {
            warn!(target: "devgw.ingest", listener = %state.label, error = %err, "push_event_failed");
            StatusCode::UNPROCESSABLE_ENTITY
        }
    }
}

#[async_trait]
impl Source for HttpListenSource {
    fn name(&self) -> String {
        self.label()
    }

    async fn run(
        &self,
        handler: Arc<dyn PushHandler>,
        cancel: CancellationToken,
    ) -> Result<(), IngestError> {
        let listener = match self.listener.lock().await.take() {
            Some(listener) => listener,
            None => TcpListener::bind(self.local)
                .await
                .map_err(|err| IngestError::Bind(format!("http {}: {}", self.local, err)))?,
        };
        let state = PushState {
            label: self.label(),
            allow: self.allow.clone(),
            throttle: Arc::clone(&self.throttle),
            handler,
        };
        let app = Router::new()
            .route("/", any(receive_push))
            .route("/*path", any(receive_push))
            .with_state(state);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| IngestError::Source(err.to_string()))
    }
}
