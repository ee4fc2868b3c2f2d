use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use opencv::core::Mat;
use tokio::sync::watch;

/// One decoded frame. `ts` is monotonic seconds since process start; the
/// wall time is captured at decode for event timestamps. The pixel data is
/// shared, never copied, once the frame is published.
#[derive(Clone)]
pub struct Frame {
    pub ts: f64,
    pub wall: DateTime<Utc>,
    pub img: Arc<Mat>,
}

impl Frame {
    pub fn new(ts: f64, wall: DateTime<Utc>, img: Mat) -> Self {
        Self {
            ts,
            wall,
            img: Arc::new(img),
        }
    }
}

/// Latest annotated preview frame, JPEG-encoded.
pub struct PreviewFrame {
    pub jpeg: Vec<u8>,
    pub seq: u64,
}

/// Single-slot, single-writer, many-reader cell holding the most recent
/// preview frame. Readers never block the writer; a slow reader simply
/// observes fewer frames.
pub struct PreviewCell {
    tx: watch::Sender<Option<Arc<PreviewFrame>>>,
    seq: AtomicU64,
}

impl PreviewCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, jpeg: Vec<u8>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.tx.send(Some(Arc::new(PreviewFrame { jpeg, seq })));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<PreviewFrame>>> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<PreviewFrame>> {
        self.tx.borrow().clone()
    }
}

impl Default for PreviewCell {
    fn default() -> Self {
        Self::new()
    }
}

const FPS_SCALE: u64 = 1000;

/// Process-wide per-camera counters. Single conceptual writer per field
/// (reader thread or detection thread); HTTP handlers only read.
pub struct CameraStats {
    started: Instant,
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub reconnects: AtomicU64,
    pub detection_count: AtomicU64,
    /// Milliseconds since `started`, 0 = no frame yet.
    last_frame_ms: AtomicU64,
    /// Derived from the source FPS at connect time, floor 2000 ms.
    alive_timeout_ms: AtomicU64,
    /// Measured processing rate, stored as fps * 1000.
    runtime_fps_milli: AtomicU64,
    pub is_detecting: AtomicBool,
}

impl CameraStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            detection_count: AtomicU64::new(0),
            last_frame_ms: AtomicU64::new(0),
            alive_timeout_ms: AtomicU64::new(2000),
            runtime_fps_milli: AtomicU64::new(0),
            is_detecting: AtomicBool::new(false),
        })
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn mark_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.last_frame_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_alive_timeout(&self, source_fps: f64) {
        // A stream is considered dead after missing ~20 frame periods,
        // never less than two seconds.
        let ms = if source_fps > 0.0 {
            ((20_000.0 / source_fps) as u64).max(2000)
        } else {
            2000
        };
        self.alive_timeout_ms.store(ms, Ordering::Relaxed);
    }

    pub fn time_since_last_frame(&self) -> Option<f64> {
        let ms = self.last_frame_ms.load(Ordering::Relaxed);
        if ms == 0 {
            return None;
        }
        let now = self.started.elapsed().as_millis() as u64;
        Some(now.saturating_sub(ms) as f64 / 1000.0)
    }

    pub fn stream_alive(&self) -> bool {
        match self.time_since_last_frame() {
            Some(age) => {
                age * 1000.0 <= self.alive_timeout_ms.load(Ordering::Relaxed) as f64
            }
            None => false,
        }
    }

    pub fn set_runtime_fps(&self, fps: f64) {
        self.runtime_fps_milli
            .store((fps * FPS_SCALE as f64) as u64, Ordering::Relaxed);
    }

    pub fn runtime_fps(&self) -> f64 {
        self.runtime_fps_milli.load(Ordering::Relaxed) as f64 / FPS_SCALE as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_cell_keeps_most_recent() {
        let cell = PreviewCell::new();
        assert!(cell.latest().is_none());
        cell.publish(vec![1]);
        cell.publish(vec![2, 2]);
        let latest = cell.latest().unwrap();
        assert_eq!(latest.jpeg, vec![2, 2]);
        assert_eq!(latest.seq, 2);
    }

    #[test]
    fn stream_alive_requires_a_frame() {
        let stats = CameraStats::new();
        assert!(!stats.stream_alive());
        stats.mark_frame();
        assert!(stats.stream_alive());
    }

    #[test]
    fn alive_timeout_has_two_second_floor() {
        let stats = CameraStats::new();
        stats.set_alive_timeout(100.0);
        assert_eq!(stats.alive_timeout_ms.load(Ordering::Relaxed), 2000);
        stats.set_alive_timeout(5.0);
        assert_eq!(stats.alive_timeout_ms.load(Ordering::Relaxed), 4000);
    }
}
