use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use meteord::dashboard::{start_dashboard, DashboardConfig};

const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("meteord=debug".parse().expect("valid directive")),
        )
        .init();

    let config = match DashboardConfig::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    tracing::info!(
        cameras = config.cameras.len(),
        monitor = config.monitor_enabled,
        "starting dashboard"
    );

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(Notify::new());

    let server_config = Arc::clone(&config);
    let server_flag = Arc::clone(&shutdown_flag);
    let server_shutdown = Arc::clone(&shutdown);
    let server = tokio::spawn(async move {
        if let Err(e) = start_dashboard(server_config, server_flag, server_shutdown).await {
            tracing::error!(error = %e, "dashboard server error");
        }
    });

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    shutdown_flag.store(true, Ordering::Relaxed);
    shutdown.notify_waiters();
    // Proxied streams run until the client hangs up; bound the drain.
    if tokio::time::timeout(std::time::Duration::from_secs(5), server)
        .await
        .is_err()
    {
        tracing::warn!("HTTP connections did not drain in time");
    }
    tracing::info!("shutdown complete");
}
