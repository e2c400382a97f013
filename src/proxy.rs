//! The HTTP face of devloop: a reverse proxy to the backend while it is
//! up, the waiting page while it is not, and the control endpoints the
//! browser integration uses (`/__health`, `/__build-status`, `/__reload`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::handler::Handler;
use axum::http::{header, StatusCode, Uri};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{Config, DEFAULT_RULE_NAME};
use crate::monitor::{BackendStatus, LivenessMonitor};
use crate::reload::ReloadBus;
use crate::tracker::{CURRENT_BUILD_ID_FILE, LAST_SUCCESS_BUILD_ID_FILE};

static WAITING_PAGE: &str = include_str!("assets/waiting.html");

type ProxyClient = hyper_util::client::legacy::Client<
    hyper_util::client::legacy::connect::HttpConnector,
    Body,
>;

#[derive(Clone)]
struct AppState {
    monitor: Arc<LivenessMonitor>,
    bus: ReloadBus,
    backend_port: u16,
    status_dir: PathBuf,
    client: ProxyClient,
}

/// Binds the proxy listener. Loopback only; a bind failure is fatal.
pub async fn bind(proxy_port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind(("127.0.0.1", proxy_port))
        .await
        .with_context(|| format!("failed to bind proxy port {proxy_port}"))?;
    let addr = listener.local_addr().context("failed to read local addr")?;
    info!(target: "proxy", "started proxy server on http://{addr}");
    Ok(listener)
}

pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(config: &Config, monitor: Arc<LivenessMonitor>, bus: ReloadBus) -> Router {
    let mut connector = hyper_util::client::legacy::connect::HttpConnector::new();
    connector.set_nodelay(true);

    let client =
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build(connector);

    let state = AppState {
        monitor,
        bus,
        backend_port: config.backend_port,
        status_dir: config.build_status_dir.clone(),
        client,
    };

    Router::new()
        .route("/__health", get(handle_health))
        .route("/__build-status", get(handle_build_status))
        .route("/__reload", get(handle_reload))
        .fallback_service(handle_proxy.with_state(state.clone()))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Everything that is not a control endpoint: forward to the backend when
/// it is up, serve the waiting page when it is not.
async fn handle_proxy(State(state): State<AppState>, mut req: Request) -> Response {
    if state.monitor.status() != BackendStatus::Up {
        return waiting_page();
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("", |pq| pq.as_str());
    let uri_string = format!("http://127.0.0.1:{}{path_and_query}", state.backend_port);
    let uri: Uri = match uri_string.parse() {
        Ok(uri) => uri,
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "invalid upstream URI").into_response();
        }
    };
    *req.uri_mut() = uri;

    match state.client.request(req).await {
        Ok(res) => res.into_response(),
        Err(e) => {
            error!(target: "proxy", "upstream error: {e}");
            (
                StatusCode::BAD_GATEWAY,
                format!("Backend temporarily unavailable: {e}"),
            )
                .into_response()
        }
    }
}

fn waiting_page() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        WAITING_PAGE,
    )
        .into_response()
}

async fn handle_health(State(state): State<AppState>) -> Response {
    match state.monitor.status() {
        BackendStatus::Up => (StatusCode::OK, "OK").into_response(),
        BackendStatus::Down => {
            (StatusCode::SERVICE_UNAVAILABLE, "Backend Down").into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct BuildStatusResponse {
    current_build: Option<BuildInfo>,
}

#[derive(Debug, Serialize)]
struct BuildInfo {
    build_id: String,
    rule_name: String,
    status: String,
    timestamp: i64,
}

async fn handle_build_status(State(state): State<AppState>) -> Response {
    let current_build = scan_status_dir(&state.status_dir).await;
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        axum::Json(BuildStatusResponse { current_build }),
    )
        .into_response()
}

/// Picks the newest `<ts>-<build_id>-<status>` marker in the audit
/// directory, skipping the two pointer files. Marker filenames do not
/// carry the rule name, so the reported `rule_name` is the default rule's.
async fn scan_status_dir(dir: &Path) -> Option<BuildInfo> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut newest: Option<BuildInfo> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(CURRENT_BUILD_ID_FILE)
            || name.starts_with(LAST_SUCCESS_BUILD_ID_FILE)
        {
            continue;
        }

        let mut parts = name.splitn(3, '-');
        let (Some(ts), Some(build_id), Some(status)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(timestamp) = ts.parse::<i64>() else { continue };

        if newest.as_ref().map_or(true, |b| timestamp > b.timestamp) {
            newest = Some(BuildInfo {
                build_id: build_id.to_string(),
                rule_name: DEFAULT_RULE_NAME.to_string(),
                status: status.to_string(),
                timestamp,
            });
        }
    }
    newest
}

/// Server-Sent Events stream of reload signals. The subscriber registers
/// with the reload bus for the lifetime of the connection; disconnecting
/// drops it, which unregisters it.
async fn handle_reload(State(state): State<AppState>) -> Response {
    let mut subscriber = state.bus.subscribe();
    let stream = async_stream::stream! {
        while let Some(()) = subscriber.recv().await {
            yield Ok::<SseEvent, std::convert::Infallible>(SseEvent::default().data("reload"));
        }
    };

    let sse = Sse::new(stream).keep_alive(KeepAlive::default());
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        sse,
    )
        .into_response()
}
