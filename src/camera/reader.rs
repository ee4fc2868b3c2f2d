use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};
use thiserror::Error;
use tokio::sync::watch;

use super::frame::{CameraStats, Frame};

const CHANNEL_CAPACITY: usize = 30;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 30;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("opencv error: {0}")]
    Cv(#[from] opencv::Error),
    #[error("failed to open stream")]
    OpenFailed,
    #[error("decode failure")]
    Decode,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub width: i32,
    pub height: i32,
    pub source_fps: f64,
}

/// Anything that can hand out frames: the RTSP capture in production,
/// file or synthetic sources in tests and offline tooling.
pub trait VideoSource: Send {
    fn open(&mut self) -> Result<StreamInfo, StreamError>;
    fn read(&mut self) -> Result<Mat, StreamError>;
    fn close(&mut self);
}

/// RTSP source over the ffmpeg-backed capture.
pub struct RtspSource {
    url: String,
    capture: Option<VideoCapture>,
}

impl RtspSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            capture: None,
        }
    }
}

impl VideoSource for RtspSource {
    fn open(&mut self) -> Result<StreamInfo, StreamError> {
        let capture = VideoCapture::from_file(&self.url, videoio::CAP_FFMPEG)?;
        if !capture.is_opened()? {
            return Err(StreamError::OpenFailed);
        }
        let info = StreamInfo {
            width: capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32,
            height: capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32,
            source_fps: capture.get(videoio::CAP_PROP_FPS)?,
        };
        self.capture = Some(capture);
        Ok(info)
    }

    fn read(&mut self) -> Result<Mat, StreamError> {
        let capture = self.capture.as_mut().ok_or(StreamError::OpenFailed)?;
        let mut frame = Mat::default();
        if !capture.read(&mut frame)? {
            return Err(StreamError::Decode);
        }
        Ok(frame)
    }

    fn close(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            let _ = capture.release();
        }
    }
}

/// Owns the reader thread. The thread is the only place the capture handle
/// is touched; decoded frames go out through a bounded channel where the
/// oldest frame is dropped on overflow.
pub struct StreamReader {
    rx: Receiver<Frame>,
    info_rx: watch::Receiver<Option<StreamInfo>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamReader {
    pub fn start(
        source: Box<dyn VideoSource>,
        camera_name: String,
        stats: Arc<CameraStats>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self::start_with_capacity(source, camera_name, stats, shutdown, CHANNEL_CAPACITY)
    }

    pub(crate) fn start_with_capacity(
        source: Box<dyn VideoSource>,
        camera_name: String,
        stats: Arc<CameraStats>,
        shutdown: Arc<AtomicBool>,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = bounded(capacity);
        let (info_tx, info_rx) = watch::channel(None);
        let drain = rx.clone();
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(format!("reader-{camera_name}"))
            .spawn(move || {
                run_reader(
                    source,
                    camera_name,
                    tx,
                    drain,
                    info_tx,
                    stats,
                    thread_shutdown,
                );
            })
            .expect("spawn reader thread");

        Self {
            rx,
            info_rx,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Next frame, or a timeout when the stream is quiet. A disconnected
    /// channel means the reader thread has exited.
    pub fn read(&self, timeout: Duration) -> Result<Frame, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn info(&self) -> Option<StreamInfo> {
        *self.info_rx.borrow()
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_reader(
    mut source: Box<dyn VideoSource>,
    camera_name: String,
    tx: Sender<Frame>,
    drain: Receiver<Frame>,
    info_tx: watch::Sender<Option<StreamInfo>>,
    stats: Arc<CameraStats>,
    shutdown: Arc<AtomicBool>,
) {
    let epoch = Instant::now();
    let mut connected_before = false;

    // Connecting -> Reading -> (failure) -> Connecting, until shutdown.
    while !shutdown.load(Ordering::Relaxed) {
        let info = match source.open() {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(camera = %camera_name, error = %e, "stream connect failed");
                sleep_interruptible(RECONNECT_DELAY, &shutdown);
                continue;
            }
        };

        tracing::info!(
            camera = %camera_name,
            width = info.width,
            height = info.height,
            fps = info.source_fps,
            "stream connected"
        );
        if connected_before {
            stats.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        connected_before = true;
        stats.set_alive_timeout(info.source_fps);
        let _ = info_tx.send(Some(info));

        let mut consecutive_failures = 0u32;
        while !shutdown.load(Ordering::Relaxed) {
            let img = match source.read() {
                Ok(img) => {
                    consecutive_failures = 0;
                    img
                }
                Err(_) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                        tracing::warn!(
                            camera = %camera_name,
                            failures = consecutive_failures,
                            "too many decode failures, reconnecting"
                        );
                        break;
                    }
                    continue;
                }
            };

            if img.empty() {
                stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            stats.mark_frame();
            let frame = Frame::new(epoch.elapsed().as_secs_f64(), chrono::Utc::now(), img);

            // Freshness beats completeness: shed the oldest queued frame
            // rather than stalling the decoder.
            if tx.is_full() && drain.try_recv().is_ok() {
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            if tx.try_send(frame).is_err() {
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        source.close();
        if !shutdown.load(Ordering::Relaxed) {
            tracing::info!(camera = %camera_name, "reconnecting in {}s", RECONNECT_DELAY.as_secs());
            sleep_interruptible(RECONNECT_DELAY, &shutdown);
        }
    }

    source.close();
    tracing::debug!(camera = %camera_name, "reader thread stopped");
}

fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total && !shutdown.load(Ordering::Relaxed) {
        thread::sleep(step);
        slept += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    /// Emits a fixed number of frames, then reports decode failures.
    struct SyntheticSource {
        frames_left: u32,
        opened: bool,
    }

    impl SyntheticSource {
        fn new(frames: u32) -> Self {
            Self {
                frames_left: frames,
                opened: false,
            }
        }
    }

    impl VideoSource for SyntheticSource {
        fn open(&mut self) -> Result<StreamInfo, StreamError> {
            self.opened = true;
            Ok(StreamInfo {
                width: 64,
                height: 48,
                source_fps: 25.0,
            })
        }

        fn read(&mut self) -> Result<Mat, StreamError> {
            if self.frames_left == 0 {
                // Let the reader spin on failures until it reconnects.
                std::thread::sleep(Duration::from_millis(5));
                return Err(StreamError::Decode);
            }
            self.frames_left -= 1;
            let mat =
                Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(10.0)).unwrap();
            Ok(mat)
        }

        fn close(&mut self) {}
    }

    #[test]
    fn delivers_frames_with_monotonic_timestamps() {
        let stats = CameraStats::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut reader = StreamReader::start(
            Box::new(SyntheticSource::new(5)),
            "test".into(),
            Arc::clone(&stats),
            Arc::clone(&shutdown),
        );

        let mut last_ts = -1.0;
        for _ in 0..5 {
            let frame = reader.read(Duration::from_secs(2)).expect("frame");
            assert!(frame.ts >= last_ts);
            last_ts = frame.ts;
        }
        assert!(stats.stream_alive());
        reader.stop();
    }

    #[test]
    fn overflow_drops_oldest_not_newest() {
        let stats = CameraStats::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut reader = StreamReader::start_with_capacity(
            Box::new(SyntheticSource::new(20)),
            "test".into(),
            Arc::clone(&stats),
            Arc::clone(&shutdown),
            4,
        );

        // Let the source outrun the (absent) consumer.
        std::thread::sleep(Duration::from_millis(300));
        assert!(stats.frames_dropped.load(Ordering::Relaxed) > 0);

        // Whatever is left must still be in order, ending at the newest.
        let mut frames = Vec::new();
        while let Ok(f) = reader.read(Duration::from_millis(50)) {
            frames.push(f.ts);
        }
        assert!(!frames.is_empty());
        assert!(frames.windows(2).all(|w| w[0] <= w[1]));
        reader.stop();
    }

    #[test]
    fn stop_joins_reader_thread() {
        let stats = CameraStats::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut reader = StreamReader::start(
            Box::new(SyntheticSource::new(1000)),
            "test".into(),
            stats,
            shutdown,
        );
        reader.stop();
        assert!(reader.handle.is_none());
    }
}
