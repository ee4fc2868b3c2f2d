use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use meteord::api::{self, AppState, RestartHandle};
use meteord::camera::{CameraStats, PreviewCell, RtspSource, StreamReader};
use meteord::clip::{ClipWorker, ClipWorkerConfig};
use meteord::config::{CameraSettings, SettingsStore};
use meteord::detect::pipeline::{shared_settings, DetectionLoop, PipelineControl};
use meteord::detect::{FixedWindow, TwilightGate};
use meteord::storage::DetectionStore;

/// Exit codes: 0 graceful stop, 2 unrecoverable configuration, 3 restart
/// requested (the supervisor restarts on any non-zero).
const EXIT_CONFIG: i32 = 2;
const EXIT_RESTART: i32 = 3;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("meteord=debug".parse().expect("valid directive")),
        )
        .init();

    let mut settings = match CameraSettings::from_env() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Replay the last applied runtime settings over the env defaults.
    let settings_store = SettingsStore::new(settings.runtime_settings_path());
    settings_store.load_into(&mut settings);

    if let Err(e) = std::fs::create_dir_all(settings.camera_dir()) {
        tracing::error!(
            path = %settings.camera_dir().display(),
            error = %e,
            "cannot prepare output directory"
        );
        std::process::exit(EXIT_CONFIG);
    }
    if let Err(e) = settings_store.save(&settings) {
        tracing::error!(error = %e, "cannot persist runtime settings");
        std::process::exit(EXIT_CONFIG);
    }

    let gate = if settings.enable_time_window {
        match FixedWindow::parse(&settings.twilight_start, &settings.twilight_end) {
            Some(window) => {
                tracing::info!(
                    start = %settings.twilight_start,
                    end = %settings.twilight_end,
                    "detection gated to the night window"
                );
                TwilightGate::new(true, Some(Box::new(window)))
            }
            None => {
                tracing::error!("invalid TWILIGHT_START / TWILIGHT_END");
                std::process::exit(EXIT_CONFIG);
            }
        }
    } else {
        TwilightGate::disabled()
    };

    let store = match DetectionStore::open(settings.camera_dir()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "cannot open detection store");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let camera_name = settings.camera_name.clone();
    let web_port = settings.web_port;
    let clip_config = ClipWorkerConfig {
        camera_name: camera_name.clone(),
        extract_clips: settings.extract_clips,
        fb_normalize: settings.fb_normalize,
        fb_delete_mov: settings.fb_delete_mov,
    };
    let rtsp_url = settings.rtsp_url.clone();

    tracing::info!(
        camera = %camera_name,
        sensitivity = settings.sensitivity.as_str(),
        scale = settings.scale,
        buffer_secs = settings.buffer_seconds(),
        "starting meteor detection"
    );

    let shared = shared_settings(settings);
    let stats = CameraStats::new();
    let preview = Arc::new(PreviewCell::new());
    let control = PipelineControl::new();
    let restart = RestartHandle::new();
    let shutdown = Arc::new(AtomicBool::new(false));
    let server_shutdown = Arc::new(Notify::new());

    let reader = StreamReader::start(
        Box::new(RtspSource::new(rtsp_url)),
        camera_name.clone(),
        Arc::clone(&stats),
        Arc::clone(&shutdown),
    );

    let (clip_tx, clip_rx) = crossbeam_channel::unbounded();
    let clip_worker = ClipWorker::new(clip_rx, store, clip_config);
    let clip_handle = tokio::task::spawn_blocking(move || clip_worker.run());

    let detection = DetectionLoop::new(
        shared.clone(),
        reader,
        Arc::clone(&stats),
        Arc::clone(&preview),
        Arc::clone(&control),
        gate,
        clip_tx,
        Arc::clone(&shutdown),
    );
    let detection_handle = meteord::detect::spawn_detection_loop(detection);

    let app_state = AppState {
        camera_name: camera_name.clone(),
        settings: shared,
        settings_store: Arc::new(settings_store),
        stats: Arc::clone(&stats),
        preview,
        control,
        restart: Arc::clone(&restart),
    };
    let server_shutdown_clone = Arc::clone(&server_shutdown);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = api::start_server(app_state, web_port, server_shutdown_clone).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = restart.wait() => {
            tracing::info!("restart requested, shutting down");
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    server_shutdown.notify_waiters();

    // Detection drains and finalises tracks, then drops the clip sender;
    // the clip worker drains its queue and exits.
    let _ = detection_handle.await;
    let _ = clip_handle.await;
    // Long-lived stream connections get a bounded drain window.
    if tokio::time::timeout(std::time::Duration::from_secs(5), server_handle)
        .await
        .is_err()
    {
        tracing::warn!("HTTP connections did not drain in time");
    }

    tracing::info!(
        camera = %camera_name,
        detections = stats.detection_count.load(Ordering::Relaxed),
        frames = stats.frames_received.load(Ordering::Relaxed),
        "shutdown complete"
    );

    if restart.requested() {
        std::process::exit(EXIT_RESTART);
    }
}
