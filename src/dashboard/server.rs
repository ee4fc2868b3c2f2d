use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use rust_embed::Embed;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sysinfo::System;
use tokio::sync::Notify;
use tower_http::services::ServeDir;

use crate::storage::{DetectionStore, StoreError};

use super::cache::DetectionCache;
use super::monitor::Monitor;
use super::DashboardConfig;

#[derive(Embed)]
#[folder = "src/assets/"]
struct Assets;

const PROXY_READ_TIMEOUT: Duration = Duration::from_secs(300);
const PROXY_CHUNK_SIZE: usize = 64 * 1024;
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);
const RESTART_TIMEOUT: Duration = Duration::from_secs(10);
const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct DashState {
    pub config: Arc<DashboardConfig>,
    pub cache: DetectionCache,
    pub monitor: Arc<Monitor>,
    /// Short-request client for stats, snapshots and control calls.
    pub client: reqwest::Client,
    /// Long-lived client for MJPEG proxying.
    pub stream_client: reqwest::Client,
    pub started: Instant,
    pub system: Arc<Mutex<System>>,
}

pub async fn start_dashboard(
    config: Arc<DashboardConfig>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) -> Result<(), std::io::Error> {
    let client = reqwest::Client::new();
    let stream_client = reqwest::Client::builder()
        .read_timeout(PROXY_READ_TIMEOUT)
        .build()
        .expect("reqwest client");

    let camera_names: Vec<String> = config.cameras.iter().map(|c| c.name.clone()).collect();
    let cache = DetectionCache::new(config.output_root.clone(), camera_names);
    let cache_watcher = cache.spawn_watcher(Arc::clone(&shutdown_flag));

    let monitor = Monitor::new(Arc::clone(&config), client.clone());
    let monitor_task = monitor.spawn(Arc::clone(&shutdown_flag));

    let state = DashState {
        config: Arc::clone(&config),
        cache,
        monitor,
        client,
        stream_client,
        started: Instant::now(),
        system: Arc::new(Mutex::new(System::new())),
    };

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/detections", get(detections_handler))
        .route("/detections_mtime", get(detections_mtime_handler))
        .route("/detection_label", post(detection_label_handler))
        .route("/detection/{camera}/{ts}", delete(delete_detection_handler))
        .route(
            "/bulk_delete_non_meteor/{camera}",
            post(bulk_delete_handler),
        )
        .route("/camera_stats/{i}", get(camera_stats_handler))
        .route("/camera_stream/{i}", get(camera_stream_handler))
        .route("/camera_snapshot/{i}", get(camera_snapshot_handler))
        .route("/camera_restart/{i}", post(camera_restart_handler))
        .route("/camera_settings/apply_all", post(apply_all_handler))
        .route("/dashboard_stats", get(dashboard_stats_handler))
        .nest_service("/files", ServeDir::new(config.output_root.clone()))
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("dashboard on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await;

    cache_watcher.abort();
    monitor_task.abort();
    result
}

async fn index_handler() -> impl IntoResponse {
    match Assets::get("dashboard.html") {
        Some(content) => Html(content.data.to_vec()).into_response(),
        None => (StatusCode::NOT_FOUND, "dashboard.html not found").into_response(),
    }
}

async fn detections_handler(State(state): State<DashState>) -> Response {
    let items = state.cache.items();
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(items.as_ref().clone()),
    )
        .into_response()
}

async fn detections_mtime_handler(State(state): State<DashState>) -> Response {
    Json(serde_json::json!({"mtime": state.cache.mtime()})).into_response()
}

#[derive(Deserialize)]
struct LabelRequest {
    camera: String,
    timestamp: String,
    label: String,
}

async fn detection_label_handler(
    State(state): State<DashState>,
    Json(request): Json<LabelRequest>,
) -> Response {
    if !state
        .config
        .cameras
        .iter()
        .any(|c| c.name == request.camera)
    {
        return (StatusCode::NOT_FOUND, "unknown camera").into_response();
    }

    let dir = state.config.output_root.join(&request.camera);
    let result = tokio::task::spawn_blocking(move || {
        DetectionStore::open(dir)?.set_label(&request.timestamp, &request.label)
    })
    .await;

    match result {
        Ok(Ok(())) => {
            state.cache.refresh();
            Json(serde_json::json!({"success": true})).into_response()
        }
        Ok(Err(StoreError::UnknownLabel(label))) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"success": false, "error": format!("unknown label '{label}'")})),
        )
            .into_response(),
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"success": false, "error": e.to_string()})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"success": false, "error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn delete_detection_handler(
    State(state): State<DashState>,
    Path((camera, ts)): Path<(String, String)>,
) -> Response {
    if !state.config.cameras.iter().any(|c| c.name == camera) {
        return (StatusCode::NOT_FOUND, "unknown camera").into_response();
    }

    let dir = state.config.output_root.join(&camera);
    let result =
        tokio::task::spawn_blocking(move || DetectionStore::open(dir)?.delete_event(&ts)).await;

    match result {
        Ok(Ok(removed)) => {
            state.cache.refresh();
            let files: Vec<String> = removed
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            Json(serde_json::json!({"success": true, "deleted_files": files})).into_response()
        }
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"success": false, "error": e.to_string()})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"success": false, "error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn bulk_delete_handler(
    State(state): State<DashState>,
    Path(camera): Path<String>,
) -> Response {
    if !state.config.cameras.iter().any(|c| c.name == camera) {
        return (StatusCode::NOT_FOUND, "unknown camera").into_response();
    }

    let dir = state.config.output_root.join(&camera);
    let result =
        tokio::task::spawn_blocking(move || DetectionStore::open(dir)?.delete_by_label("non-meteor"))
            .await;

    match result {
        Ok(Ok((count, files))) => {
            state.cache.refresh();
            let files: Vec<String> = files.iter().map(|p| p.display().to_string()).collect();
            tracing::info!(camera = %camera, deleted = count, "bulk delete of non-meteor events");
            Json(serde_json::json!({
                "success": true,
                "deleted_count": count,
                "files": files,
            }))
            .into_response()
        }
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"success": false, "error": e.to_string()})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"success": false, "error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn camera_stats_handler(State(state): State<DashState>, Path(i): Path<usize>) -> Response {
    match state.monitor.snapshot(i) {
        Some(snapshot) => (
            [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
            Json(snapshot),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "camera not found").into_response(),
    }
}

/// Proxy the camera's MJPEG stream. Client disconnects simply drop the
/// stream; upstream hiccups end the response without tearing anything
/// else down.
async fn camera_stream_handler(State(state): State<DashState>, Path(i): Path<usize>) -> Response {
    let endpoint = match state.config.cameras.get(i) {
        Some(e) => e,
        None => return (StatusCode::NOT_FOUND, "camera not found").into_response(),
    };

    let url = format!("{}/stream", endpoint.url);
    match state.stream_client.get(&url).send().await {
        Ok(upstream) if upstream.status().is_success() => {
            let content_type = upstream
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("multipart/x-mixed-replace; boundary=frame")
                .to_string();
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(rechunk(upstream.bytes_stream())))
                .expect("valid response")
        }
        Ok(upstream) => (
            StatusCode::BAD_GATEWAY,
            format!("camera answered {}", upstream.status()),
        )
            .into_response(),
        Err(e) => {
            tracing::debug!(camera = %endpoint.name, error = %e, "stream proxy failed");
            (StatusCode::BAD_GATEWAY, "camera unreachable").into_response()
        }
    }
}

/// Re-chunk a proxied body into fixed 64 KiB pieces regardless of how the
/// upstream connection happened to frame its reads; whatever is left when
/// the upstream ends is flushed as a final short chunk.
fn rechunk<S, E>(upstream: S) -> impl futures::Stream<Item = Result<Bytes, E>>
where
    S: futures::Stream<Item = Result<Bytes, E>>,
{
    async_stream::stream! {
        futures::pin_mut!(upstream);
        let mut buf = BytesMut::with_capacity(PROXY_CHUNK_SIZE * 2);
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    buf.extend_from_slice(&bytes);
                    while buf.len() >= PROXY_CHUNK_SIZE {
                        yield Ok(buf.split_to(PROXY_CHUNK_SIZE).freeze());
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        if !buf.is_empty() {
            let len = buf.len();
            yield Ok(buf.split_to(len).freeze());
        }
    }
}

async fn camera_snapshot_handler(
    State(state): State<DashState>,
    Path(i): Path<usize>,
) -> Response {
    let endpoint = match state.config.cameras.get(i) {
        Some(e) => e,
        None => return (StatusCode::NOT_FOUND, "camera not found").into_response(),
    };

    let url = format!("{}/snapshot", endpoint.url);
    match state
        .client
        .get(&url)
        .timeout(SNAPSHOT_TIMEOUT)
        .send()
        .await
    {
        Ok(upstream) if upstream.status().is_success() => match upstream.bytes().await {
            Ok(bytes) => {
                ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response()
            }
            Err(_) => (StatusCode::BAD_GATEWAY, "snapshot read failed").into_response(),
        },
        _ => (StatusCode::BAD_GATEWAY, "camera unreachable").into_response(),
    }
}

async fn camera_restart_handler(
    State(state): State<DashState>,
    Path(i): Path<usize>,
) -> Response {
    let endpoint = match state.config.cameras.get(i) {
        Some(e) => e,
        None => return (StatusCode::NOT_FOUND, "camera not found").into_response(),
    };

    let url = format!("{}/restart", endpoint.url);
    match state
        .client
        .post(&url)
        .timeout(RESTART_TIMEOUT)
        .send()
        .await
    {
        Ok(upstream) => {
            let status = upstream.status();
            tracing::info!(camera = %endpoint.name, status = %status, "manual restart forwarded");
            StatusCode::from_u16(status.as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY)
                .into_response()
        }
        Err(e) => {
            tracing::error!(camera = %endpoint.name, error = %e, "restart forward failed");
            (StatusCode::BAD_GATEWAY, "camera unreachable").into_response()
        }
    }
}

#[derive(Serialize)]
struct ApplyAllResult {
    camera: String,
    status: Option<u16>,
    response: Option<Value>,
    error: Option<String>,
}

/// Fan the same partial settings object out to every camera and report
/// each outcome.
async fn apply_all_handler(
    State(state): State<DashState>,
    Json(updates): Json<serde_json::Map<String, Value>>,
) -> Response {
    let requests = state.config.cameras.iter().map(|endpoint| {
        let client = state.client.clone();
        let updates = updates.clone();
        let name = endpoint.name.clone();
        let url = format!("{}/apply_settings", endpoint.url);
        async move {
            match client
                .post(&url)
                .timeout(APPLY_TIMEOUT)
                .json(&updates)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.json::<Value>().await.ok();
                    ApplyAllResult {
                        camera: name,
                        status: Some(status),
                        response: body,
                        error: None,
                    }
                }
                Err(e) => ApplyAllResult {
                    camera: name,
                    status: None,
                    response: None,
                    error: Some(e.to_string()),
                },
            }
        }
    });

    let results = futures::future::join_all(requests).await;
    Json(results).into_response()
}

async fn dashboard_stats_handler(State(state): State<DashState>) -> Response {
    let cpu = {
        let mut system = state.system.lock().expect("sysinfo lock");
        system.refresh_cpu_usage();
        system.global_cpu_usage()
    };
    Json(serde_json::json!({
        "cpu_percent": cpu,
        "uptime_seconds": state.started.elapsed().as_secs_f64(),
        "camera_count": state.config.cameras.len(),
    }))
    .into_response()
}
