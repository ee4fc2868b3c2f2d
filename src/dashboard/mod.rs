pub mod cache;
pub mod monitor;
pub mod server;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::ConfigError;

pub use cache::DetectionCache;
pub use monitor::Monitor;
pub use server::start_dashboard;

#[derive(Debug, Clone)]
pub struct CameraEndpoint {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub port: u16,
    pub output_root: PathBuf,
    pub cameras: Vec<CameraEndpoint>,
    pub monitor_enabled: bool,
    pub monitor_interval: Duration,
    /// Seconds without a frame before a camera counts as stopped.
    pub monitor_timeout: f64,
    pub restart_delay: Duration,
    pub restart_cooldown: Duration,
    pub restart_max_count: u32,
}

impl DashboardConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cameras = Vec::new();
        for i in 1.. {
            let name = std::env::var(format!("CAMERA_{i}_NAME"));
            let url = std::env::var(format!("CAMERA_{i}_URL"));
            match (name, url) {
                (Ok(name), Ok(url)) if !name.is_empty() && !url.is_empty() => {
                    cameras.push(CameraEndpoint {
                        name,
                        url: url.trim_end_matches('/').to_string(),
                    });
                }
                _ => break,
            }
        }
        if cameras.is_empty() {
            return Err(ConfigError::MissingEnv("CAMERA_1_NAME / CAMERA_1_URL"));
        }

        Ok(Self {
            port: parse_env("DASH_PORT", 8081)?,
            output_root: PathBuf::from(
                std::env::var("OUTPUT_ROOT").unwrap_or_else(|_| "detections".to_string()),
            ),
            cameras,
            monitor_enabled: parse_env("CAMERA_MONITOR_ENABLED", true)?,
            monitor_interval: Duration::from_secs(parse_env("CAMERA_MONITOR_INTERVAL", 60u64)?),
            monitor_timeout: parse_env("CAMERA_MONITOR_TIMEOUT", 120.0)?,
            restart_delay: Duration::from_secs(parse_env("CAMERA_RESTART_DELAY", 5u64)?),
            restart_cooldown: Duration::from_secs(parse_env(
                "CAMERA_RESTART_COOLDOWN_SEC",
                300u64,
            )?),
            restart_max_count: parse_env("CAMERA_RESTART_MAX_COUNT", 10u32)?,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidEnv {
            key,
            value: v.clone(),
        }),
        Err(_) => Ok(default),
    }
}
