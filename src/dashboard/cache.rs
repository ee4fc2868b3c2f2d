use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::storage::{DetectionStore, PersistedDetection};

const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// One archive entry as served by `/detections`.
#[derive(Debug, Clone, Serialize)]
pub struct CachedDetection {
    pub camera: String,
    pub label: String,
    #[serde(flatten)]
    pub detection: PersistedDetection,
}

#[derive(Default)]
struct CacheInner {
    items: Arc<Vec<CachedDetection>>,
    mtime: u64,
}

/// In-memory view of every camera's detection archive, rebuilt only when
/// the files on disk actually change. `/detections` and
/// `/detections_mtime` read the cache, never the disk, so response cost
/// stays flat no matter how large the archive grows.
#[derive(Clone)]
pub struct DetectionCache {
    output_root: PathBuf,
    cameras: Arc<Vec<String>>,
    inner: Arc<RwLock<CacheInner>>,
}

impl DetectionCache {
    pub fn new(output_root: PathBuf, cameras: Vec<String>) -> Self {
        let cache = Self {
            output_root,
            cameras: Arc::new(cameras),
            inner: Arc::new(RwLock::new(CacheInner::default())),
        };
        cache.refresh();
        cache
    }

    pub fn items(&self) -> Arc<Vec<CachedDetection>> {
        Arc::clone(&self.inner.read().expect("cache lock").items)
    }

    pub fn mtime(&self) -> u64 {
        self.inner.read().expect("cache lock").mtime
    }

    /// Newest file mtime (millis since epoch) across every monitored
    /// detections and labels file.
    fn disk_mtime(&self) -> u64 {
        let mut newest = 0u64;
        for camera in self.cameras.iter() {
            let dir = self.output_root.join(camera);
            for name in ["detections.jsonl", "detection_labels.json"] {
                if let Ok(meta) = std::fs::metadata(dir.join(name)) {
                    if let Ok(modified) = meta.modified() {
                        let ms = modified
                            .duration_since(UNIX_EPOCH)
                            .unwrap_or(Duration::ZERO)
                            .as_millis() as u64;
                        newest = newest.max(ms);
                    }
                }
            }
        }
        newest
    }

    /// Rebuild when the disk has moved on since the last scan.
    pub fn refresh_if_changed(&self) {
        let disk = self.disk_mtime();
        let cached = self.mtime();
        if disk > cached {
            self.refresh();
        }
    }

    /// Unconditional rebuild, newest events first.
    pub fn refresh(&self) {
        let mut items = Vec::new();
        for camera in self.cameras.iter() {
            let store = match DetectionStore::open(self.output_root.join(camera)) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(camera = %camera, error = %e, "skipping unreadable archive");
                    continue;
                }
            };
            let labels = store.labels();
            for detection in store.read_all() {
                let label = labels
                    .get(&detection.timestamp)
                    .cloned()
                    .unwrap_or_default();
                items.push(CachedDetection {
                    camera: camera.clone(),
                    label,
                    detection,
                });
            }
        }
        // ISO timestamps sort lexicographically; newest first.
        items.sort_by(|a, b| b.detection.timestamp.cmp(&a.detection.timestamp));

        let disk = self.disk_mtime();
        let mut inner = self.inner.write().expect("cache lock");
        inner.items = Arc::new(items);
        // Monotonic even if files vanish between scans.
        inner.mtime = inner.mtime.max(disk);
    }

    /// Background watcher: polls file mtimes and rebuilds on change.
    pub fn spawn_watcher(&self, shutdown: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCH_INTERVAL);
            while !shutdown.load(Ordering::Relaxed) {
                interval.tick().await;
                let snapshot = cache.clone();
                // Disk scans stay off the async workers.
                let _ = tokio::task::spawn_blocking(move || snapshot.refresh_if_changed()).await;
            }
            tracing::debug!("detection cache watcher stopped");
        })
    }
}
