//! 参考宿主：内存 item 树 + 调度器 + 只读快照接口。
//!
//! 启动参数来自 `DEVGW_*` 环境变量（支持 .env）：插件参数见 `devgw-config`，
//! 宿主另读 `items_file`（item 树 JSON）与 `http_addr`（快照接口地址）。

mod items;
mod snapshot;

use api_contract::{ApiResponse, HealthDto};
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use devgw_config::{EnvParameters, ParameterSource};
use devgw_plugin::{HostContext, Plugin, TokioScheduler};
use devgw_storage::InMemoryItemStore;
use devgw_telemetry::{init_tracing, new_request_ids};
use items::{HostError, load_items};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, info, warn};

#[derive(Clone)]
struct AppState {
    plugin: Arc<Plugin>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let params = EnvParameters::load();
    init_tracing();

    let descriptors = match params.get("items_file") {
        Some(path) => load_items(&PathBuf::from(path))?,
        None => Vec::new(),
    };
    let http_addr = params
        .get("http_addr")
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());

    let store = Arc::new(InMemoryItemStore::with_items(&descriptors));
    let scheduler = Arc::new(TokioScheduler::new());
    let plugin = Arc::new(Plugin::init(
        &params,
        None,
        HostContext {
            store: store.clone(),
            scheduler: scheduler.clone(),
        },
    ));
    if !plugin.init_complete() {
        return Err(Box::new(HostError::InitIncomplete(format!(
            "{}: {}",
            plugin.short_name(),
            plugin.init_error().unwrap_or_default()
        ))) as Box<dyn std::error::Error>);
    }

    let mut watched = BTreeSet::new();
    for item in &descriptors {
        match plugin.parse_item(item) {
            Ok(outcome) if outcome.wants_updates() => {
                watched.insert(item.path.clone());
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target: "devgw.host", item = %item.path, error = %err, "item_parse_failed");
            }
        }
    }
    info!(
        target: "devgw.host",
        items = descriptors.len(),
        watched = watched.len(),
        "item_tree_loaded"
    );

    // 先订阅再启动，避免错过恢复值之后的宿主写入
    let changes = store.subscribe();
    plugin.run().await;
    let forwarder = tokio::spawn(forward_changes(Arc::clone(&plugin), changes, watched));

    let app = router(AppState {
        plugin: Arc::clone(&plugin),
    });
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!(target: "devgw.host", addr = %http_addr, "snapshot_api_listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    plugin.stop().await;
    forwarder.abort();
    info!(target: "devgw.host", "host_stopped");
    Ok(())
}

/// 把 item 树的写入回调给插件；插件自己的写入由插件按调用方标签忽略。
async fn forward_changes(
    plugin: Arc<Plugin>,
    mut changes: tokio::sync::broadcast::Receiver<devgw_storage::ItemWrite>,
    watched: BTreeSet<String>,
) {
    loop {
        match changes.recv().await {
            Ok(write) => {
                if watched.contains(&write.path) {
                    plugin
                        .update_item(&write.path, write.value, &write.caller)
                        .await;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: "devgw.host", skipped, "item_changes_lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/snapshot", get(get_snapshot))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_context))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.plugin.init_complete() { "ok" } else { "degraded" };
    Json(ApiResponse::success(HealthDto {
        status: status.to_string(),
        plugins: 1,
    }))
}

async fn get_snapshot(State(state): State<AppState>) -> Response {
    let snapshot = snapshot::snapshot_to_dto(&state.plugin.snapshot());
    (StatusCode::OK, Json(ApiResponse::success(snapshot))).into_response()
}

async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let ids = new_request_ids();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(ids.clone());

    let span = tracing::info_span!(
        "request",
        request_id = %ids.request_id,
        trace_id = %ids.trace_id,
        method = %method,
        path = %path
    );

    let mut response = next.run(req).instrument(span).await;
    response.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&ids.request_id).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response.headers_mut().insert(
        "x-trace-id",
        HeaderValue::from_str(&ids.trace_id).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response
}
