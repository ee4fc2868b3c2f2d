use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use rust_embed::Embed;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::camera::{CameraStats, PreviewCell};
use crate::config::{apply_partial, KeyError, SettingsStore};
use crate::detect::pipeline::{load_settings, store_settings, PipelineControl, SharedSettings};

#[derive(Embed)]
#[folder = "src/assets/"]
struct Assets;

const MASK_REGEN_TIMEOUT: Duration = Duration::from_secs(3);
const RESTART_GRACE: Duration = Duration::from_millis(300);

/// Set by `/restart` or a restart-requiring settings change; `main` waits
/// on the notify and exits with the restart code so the supervisor brings
/// the process back up.
pub struct RestartHandle {
    requested: AtomicBool,
    notify: Notify,
}

impl RestartHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Flag the restart and fire the notify after a short grace so the
    /// in-flight response gets flushed first.
    pub fn schedule(self: &Arc<Self>) {
        if self.requested.swap(true, Ordering::Relaxed) {
            return;
        }
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_GRACE).await;
            handle.notify.notify_waiters();
        });
    }
}

#[derive(Clone)]
pub struct AppState {
    pub camera_name: String,
    pub settings: SharedSettings,
    pub settings_store: Arc<SettingsStore>,
    pub stats: Arc<CameraStats>,
    pub preview: Arc<PreviewCell>,
    pub control: Arc<PipelineControl>,
    pub restart: Arc<RestartHandle>,
}

pub async fn start_server(
    state: AppState,
    port: u16,
    shutdown: Arc<Notify>,
) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/stream", get(stream_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/stats", get(stats_handler))
        .route("/apply_settings", post(apply_settings_handler))
        .route("/update_mask", post(update_mask_handler))
        .route("/restart", post(restart_handler))
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("camera HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
}

async fn index_handler() -> impl IntoResponse {
    match Assets::get("index.html") {
        Some(content) => Html(content.data.to_vec()).into_response(),
        None => (StatusCode::NOT_FOUND, "index.html not found").into_response(),
    }
}

/// MJPEG preview: one multipart part per published preview frame, at
/// roughly the stream rate, until the client hangs up.
async fn stream_handler(State(state): State<AppState>) -> Response {
    let mut rx = state.preview.subscribe();
    let stream = async_stream::stream! {
        loop {
            if rx.changed().await.is_err() {
                break;
            }
            let frame = rx.borrow_and_update().clone();
            if let Some(frame) = frame {
                let head = format!(
                    "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    frame.jpeg.len()
                );
                let mut buf = BytesMut::with_capacity(head.len() + frame.jpeg.len() + 2);
                buf.extend_from_slice(head.as_bytes());
                buf.extend_from_slice(&frame.jpeg);
                buf.extend_from_slice(b"\r\n");
                yield Ok::<Bytes, std::convert::Infallible>(buf.freeze());
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .expect("valid response")
}

#[derive(Deserialize)]
struct SnapshotQuery {
    #[serde(default)]
    download: u8,
}

async fn snapshot_handler(
    State(state): State<AppState>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    match state.preview.latest() {
        Some(frame) => {
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "image/jpeg");
            if query.download == 1 {
                builder = builder.header(
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}_snapshot.jpg\"", state.camera_name),
                );
            }
            builder
                .body(Body::from(frame.jpeg.clone()))
                .expect("valid response")
        }
        None => (StatusCode::SERVICE_UNAVAILABLE, "no frame yet").into_response(),
    }
}

#[derive(Serialize)]
struct StatsResponse {
    camera: String,
    detection_count: u64,
    elapsed_seconds: f64,
    runtime_fps: f64,
    stream_alive: bool,
    time_since_last_frame: Option<f64>,
    is_detecting: bool,
    frames_received: u64,
    frames_dropped: u64,
    malformed_frames: u64,
    reconnects: u64,
    restart_requested: bool,
    settings: BTreeMap<String, Value>,
}

async fn stats_handler(State(state): State<AppState>) -> Response {
    let settings = load_settings(&state.settings);
    let stats = &state.stats;
    let body = StatsResponse {
        camera: state.camera_name.clone(),
        detection_count: stats.detection_count.load(Ordering::Relaxed),
        elapsed_seconds: stats.elapsed_seconds(),
        runtime_fps: stats.runtime_fps(),
        stream_alive: stats.stream_alive(),
        time_since_last_frame: stats.time_since_last_frame(),
        is_detecting: stats.is_detecting.load(Ordering::Relaxed),
        frames_received: stats.frames_received.load(Ordering::Relaxed),
        frames_dropped: stats.frames_dropped.load(Ordering::Relaxed),
        malformed_frames: stats.malformed_frames.load(Ordering::Relaxed),
        reconnects: stats.reconnects.load(Ordering::Relaxed),
        restart_requested: state.restart.requested(),
        settings: settings.settings_map(),
    };
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(body),
    )
        .into_response()
}

#[derive(Serialize)]
struct ApplySettingsResponse {
    success: bool,
    applied: Vec<String>,
    errors: Vec<KeyError>,
    restart_required: bool,
    restart_requested: bool,
    restart_triggers: Vec<String>,
}

async fn apply_settings_handler(
    State(state): State<AppState>,
    Json(updates): Json<serde_json::Map<String, Value>>,
) -> Response {
    let current = load_settings(&state.settings);
    let mut next = (*current).clone();
    let outcome = apply_partial(&mut next, &updates);

    if !outcome.applied.is_empty() {
        // Persist before any restart so a crash-restart replays the
        // user's intent.
        if let Err(e) = state.settings_store.save(&next) {
            tracing::error!(error = %e, "failed to persist settings");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"success": false, "error": e.to_string()})),
            )
                .into_response();
        }
        store_settings(&state.settings, next);
        tracing::info!(applied = ?outcome.applied, "settings applied");
    }

    let restart_requested = outcome.restart_required;
    if restart_requested {
        tracing::info!(triggers = ?outcome.restart_triggers, "restart-requiring settings changed");
        state.restart.schedule();
    }

    let status = if outcome.applied.is_empty() && !outcome.errors.is_empty() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    let body = ApplySettingsResponse {
        success: outcome.errors.is_empty(),
        applied: outcome.applied,
        errors: outcome.errors,
        restart_required: outcome.restart_required,
        restart_requested,
        restart_triggers: outcome.restart_triggers,
    };
    (status, Json(body)).into_response()
}

async fn update_mask_handler(State(state): State<AppState>) -> Response {
    let before = state.control.mask_epoch.load(Ordering::Relaxed);
    state
        .control
        .mask_regen_requested
        .store(true, Ordering::Relaxed);

    // The detection loop regenerates on its next frame; wait for the
    // epoch to move.
    let deadline = tokio::time::Instant::now() + MASK_REGEN_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if state.control.mask_epoch.load(Ordering::Relaxed) != before {
            let settings = load_settings(&state.settings);
            return Json(serde_json::json!({
                "success": true,
                "mask_path": settings.persisted_mask_path().display().to_string(),
            }))
            .into_response();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({
            "success": false,
            "error": "no frame available to build a mask from",
        })),
    )
        .into_response()
}

async fn restart_handler(State(state): State<AppState>) -> Response {
    tracing::info!(camera = %state.camera_name, "restart requested over HTTP");
    state.restart.schedule();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"success": true, "restarting": true})),
    )
        .into_response()
}
