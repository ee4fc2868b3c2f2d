use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use opencv::core::{Mat, Point, Scalar, Size, Vector};
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc};

use crate::buffer::RingBuffer;
use crate::camera::{CameraStats, PreviewCell, StreamReader};
use crate::clip::ClipJob;
use crate::config::CameraSettings;

use super::detector::Detector;
use super::mask::MaskEngine;
use super::tracker::{FinalizedTrack, Tracker};
use super::twilight::TwilightGate;

const READ_TIMEOUT: Duration = Duration::from_millis(500);
const FPS_WINDOW: Duration = Duration::from_secs(2);

/// Hot-swappable settings snapshot: writers replace the inner Arc, the
/// detection loop picks the new one up at the next frame boundary.
pub type SharedSettings = Arc<RwLock<Arc<CameraSettings>>>;

pub fn shared_settings(settings: CameraSettings) -> SharedSettings {
    Arc::new(RwLock::new(Arc::new(settings)))
}

pub fn load_settings(settings: &SharedSettings) -> Arc<CameraSettings> {
    settings.read().expect("settings lock").clone()
}

pub fn store_settings(settings: &SharedSettings, new: CameraSettings) {
    *settings.write().expect("settings lock") = Arc::new(new);
}

/// Control cells shared between the HTTP surface and the detection loop.
/// The loop owns the mask engine, so regeneration is requested here and
/// acknowledged through the epoch counter.
pub struct PipelineControl {
    pub mask_regen_requested: AtomicBool,
    pub mask_epoch: AtomicU64,
}

impl PipelineControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mask_regen_requested: AtomicBool::new(false),
            mask_epoch: AtomicU64::new(0),
        })
    }
}

/// The single owner of ring buffer, detector and tracker state. Consumes
/// frames from the reader channel, publishes annotated previews, and ships
/// accepted events to the clip worker.
pub struct DetectionLoop {
    settings: SharedSettings,
    reader: StreamReader,
    stats: Arc<CameraStats>,
    preview: Arc<PreviewCell>,
    control: Arc<PipelineControl>,
    gate: TwilightGate,
    clip_tx: Sender<ClipJob>,
    shutdown: Arc<AtomicBool>,
}

impl DetectionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: SharedSettings,
        reader: StreamReader,
        stats: Arc<CameraStats>,
        preview: Arc<PreviewCell>,
        control: Arc<PipelineControl>,
        gate: TwilightGate,
        clip_tx: Sender<ClipJob>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            reader,
            stats,
            preview,
            control,
            gate,
            clip_tx,
            shutdown,
        }
    }

    pub fn run(mut self) {
        let applied = load_settings(&self.settings);
        let camera = applied.camera_name.clone();
        tracing::info!(camera = %camera, "detection loop started");

        // Wait for the first frame to learn the stream geometry.
        let first = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                tracing::info!(camera = %camera, "shutdown before first frame");
                return;
            }
            match self.reader.read(READ_TIMEOUT) {
                Ok(frame) => break frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        };

        let full_size = Size::new(first.img.cols(), first.img.rows());
        let scale = applied.scale;
        let proc_size = Size::new(
            ((full_size.width as f64 * scale) as i32).max(1),
            ((full_size.height as f64 * scale) as i32).max(1),
        );

        let mut state = match LoopState::new(&applied, scale, full_size, proc_size) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(camera = %camera, error = %e, "failed to initialise detector");
                return;
            }
        };
        let mut applied = applied;
        let mut ring = RingBuffer::new(applied.buffer_seconds());
        let mut prev_gray: Option<Mat> = None;

        let mut fps_window_start = Instant::now();
        let mut fps_frames = 0u32;
        let mut last_stats_log = Instant::now();

        let mut pending = Some(first);
        while !self.shutdown.load(Ordering::Relaxed) {
            let frame = match pending.take() {
                Some(f) => f,
                None => match self.reader.read(READ_TIMEOUT) {
                    Ok(f) => f,
                    Err(RecvTimeoutError::Timeout) => {
                        self.stats.is_detecting.store(false, Ordering::Relaxed);
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };

            // Pick up hot settings at the frame boundary.
            let current = load_settings(&self.settings);
            if !Arc::ptr_eq(&current, &applied) {
                state.apply_settings(&applied, &current, scale);
                applied = current;
            }

            if let Err(e) = self.step(&applied, &mut state, &mut ring, &mut prev_gray, frame) {
                tracing::error!(camera = %camera, error = %e, "detection step failed");
            }

            fps_frames += 1;
            if fps_window_start.elapsed() >= FPS_WINDOW {
                let fps = fps_frames as f64 / fps_window_start.elapsed().as_secs_f64();
                self.stats.set_runtime_fps(fps);
                fps_window_start = Instant::now();
                fps_frames = 0;
            }

            if last_stats_log.elapsed() >= Duration::from_secs(30) {
                tracing::info!(
                    camera = %camera,
                    frames = ring.len(),
                    span_secs = format!("{:.1}", ring.span_seconds()),
                    fps = format!("{:.1}", self.stats.runtime_fps()),
                    "buffer stats"
                );
                last_stats_log = Instant::now();
            }
        }

        // Drain whatever the reader still has, with a short deadline, then
        // flush the tracker.
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            match self.reader.read(Duration::from_millis(50)) {
                Ok(frame) => {
                    let current = load_settings(&self.settings);
                    if let Err(e) =
                        self.step(&current, &mut state, &mut ring, &mut prev_gray, frame)
                    {
                        tracing::error!(camera = %camera, error = %e, "detection step failed");
                    }
                }
                Err(_) => break,
            }
        }
        let finalized = state.tracker.finalize_all();
        self.dispatch(&load_settings(&self.settings), &ring, finalized);

        tracing::info!(camera = %camera, "detection loop stopped");
    }

    fn step(
        &mut self,
        settings: &Arc<CameraSettings>,
        state: &mut LoopState,
        ring: &mut RingBuffer,
        prev_gray: &mut Option<Mat>,
        frame: crate::camera::Frame,
    ) -> opencv::Result<()> {
        let mut full_gray = Mat::default();
        imgproc::cvt_color_def(frame.img.as_ref(), &mut full_gray, imgproc::COLOR_BGR2GRAY)?;

        let gray = if state.scale < 1.0 {
            let mut scaled = Mat::default();
            imgproc::resize(
                &full_gray,
                &mut scaled,
                state.proc_size,
                0.0,
                0.0,
                imgproc::INTER_AREA,
            )?;
            scaled
        } else {
            full_gray.try_clone()?
        };

        if self.control.mask_regen_requested.swap(false, Ordering::Relaxed) {
            state.regenerate_mask(settings, &full_gray);
            self.control.mask_epoch.fetch_add(1, Ordering::Relaxed);
        }

        ring.add(frame.clone());

        let active = self.gate.is_active(frame.wall);
        self.stats
            .is_detecting
            .store(active && self.stats.stream_alive(), Ordering::Relaxed);

        if active {
            if let Some(prev) = prev_gray.as_ref() {
                let tracking_mode = state.tracker.has_open_tracks();
                let candidates =
                    state
                        .detector
                        .detect(&gray, prev, &state.masks, tracking_mode, frame.ts)?;
                let finalized = state.tracker.observe(frame.ts, &candidates, frame.wall);
                self.dispatch(settings, ring, finalized);
            }
        } else {
            // Outside the window: no new candidates, but tracks straddling
            // the window edge still close and finalise.
            let finalized = state.tracker.observe(frame.ts, &[], frame.wall);
            self.dispatch(settings, ring, finalized);
        }

        self.publish_preview(&frame, state)?;
        *prev_gray = Some(gray);
        Ok(())
    }

    fn dispatch(
        &self,
        settings: &Arc<CameraSettings>,
        ring: &RingBuffer,
        finalized: Vec<FinalizedTrack>,
    ) {
        for item in finalized {
            let event = match item {
                FinalizedTrack::Accepted(event) => event,
                FinalizedTrack::Rejected { .. } => continue,
            };
            self.stats.detection_count.fetch_add(1, Ordering::Relaxed);

            let frames = ring.range(
                event.start_ts - settings.clip_margin_before,
                event.end_ts + settings.clip_margin_after,
            );
            let nominal_fps = self
                .reader
                .info()
                .map(|i| i.source_fps)
                .unwrap_or(0.0);
            if self
                .clip_tx
                .send(ClipJob {
                    event,
                    frames,
                    nominal_fps,
                })
                .is_err()
            {
                tracing::error!("clip worker unavailable, event lost");
            }
        }
    }

    fn publish_preview(&self, frame: &crate::camera::Frame, state: &LoopState) -> opencv::Result<()> {
        let mut annotated = frame.img.try_clone()?;
        for track in state.tracker.open_tracks() {
            if track.points.len() >= 2 {
                let first = track.points.first().expect("non-empty");
                let last = track.points.last().expect("non-empty");
                imgproc::line(
                    &mut annotated,
                    Point::new(first.x as i32, first.y as i32),
                    Point::new(last.x as i32, last.y as i32),
                    Scalar::new(0.0, 255.0, 255.0, 0.0),
                    2,
                    imgproc::LINE_AA,
                    0,
                )?;
            }
            if let Some(last) = track.points.last() {
                imgproc::circle(
                    &mut annotated,
                    Point::new(last.x as i32, last.y as i32),
                    8,
                    Scalar::new(0.0, 165.0, 255.0, 0.0),
                    2,
                    imgproc::LINE_AA,
                    0,
                )?;
            }
        }

        let mut buf = Vector::<u8>::new();
        let params = Vector::<i32>::new();
        imgcodecs::imencode(".jpg", &annotated, &mut buf, &params)?;
        self.preview.publish(buf.to_vec());
        Ok(())
    }
}

/// Everything the loop owns exclusively.
struct LoopState {
    detector: Detector,
    tracker: Tracker,
    masks: MaskEngine,
    scale: f64,
    proc_size: Size,
}

impl LoopState {
    fn new(
        settings: &CameraSettings,
        scale: f64,
        full_size: Size,
        proc_size: Size,
    ) -> opencv::Result<Self> {
        let detector = Detector::new(settings.params.clone(), scale, full_size)?;
        let mut masks = MaskEngine::new(proc_size);
        let mut tracker = Tracker::new(settings.params.clone());
        Self::load_masks(&mut masks, settings);
        tracker.set_nuisance(masks.nuisance_map(scale));
        Ok(Self {
            detector,
            tracker,
            masks,
            scale,
            proc_size,
        })
    }

    fn load_masks(masks: &mut MaskEngine, settings: &CameraSettings) {
        // A camera-generated mask wins over a configured one.
        let persisted = settings.persisted_mask_path();
        let exclusion_path = if persisted.exists() {
            Some(persisted)
        } else {
            settings.mask_path.clone()
        };
        masks.clear_exclusion();
        if let Some(path) = exclusion_path {
            match masks.load_exclusion(&path, settings.mask_dilate) {
                Ok(true) => tracing::info!(path = %path.display(), "exclusion mask loaded"),
                Ok(false) => tracing::warn!(path = %path.display(), "exclusion mask unreadable"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "exclusion mask load failed"),
            }
        }
        masks.clear_nuisance();
        if let Some(path) = &settings.nuisance_mask_path {
            match masks.load_nuisance(path, settings.nuisance_mask_dilate) {
                Ok(true) => tracing::info!(path = %path.display(), "nuisance mask loaded"),
                Ok(false) => tracing::warn!(path = %path.display(), "nuisance mask unreadable"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "nuisance mask load failed"),
            }
        }
    }

    fn apply_settings(&mut self, old: &CameraSettings, new: &CameraSettings, scale: f64) {
        self.detector.set_params(new.params.clone());
        self.tracker.set_params(new.params.clone());

        let mask_config_changed = old.mask_path != new.mask_path
            || old.mask_dilate != new.mask_dilate
            || old.nuisance_mask_path != new.nuisance_mask_path
            || old.nuisance_mask_dilate != new.nuisance_mask_dilate;
        if mask_config_changed {
            Self::load_masks(&mut self.masks, new);
            self.tracker.set_nuisance(self.masks.nuisance_map(scale));
        }
        tracing::debug!("hot settings applied");
    }

    /// Build a fresh exclusion mask from the current frame, persist it, and
    /// swap it into the detector path.
    fn regenerate_mask(&mut self, settings: &CameraSettings, full_gray: &Mat) {
        let mask = match MaskEngine::generate_from_frame(full_gray, settings.mask_dilate) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, "mask generation failed");
                return;
            }
        };
        let path = settings.persisted_mask_path();
        if let Err(e) = MaskEngine::save_png(&path, &mask) {
            tracing::error!(path = %path.display(), error = %e, "mask persist failed");
        }
        match self.masks.load_exclusion(&path, settings.mask_dilate) {
            Ok(true) => {
                tracing::info!(path = %path.display(), "exclusion mask regenerated");
            }
            _ => {
                // Fall back to the in-memory mask, normalised by hand.
                tracing::warn!("persisted mask reload failed, using in-memory mask");
                self.masks.set_exclusion(mask);
            }
        }
    }
}

pub fn spawn_detection_loop(detection: DetectionLoop) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || detection.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{StreamError, StreamInfo, VideoSource};
    use crate::clip::{ClipWorker, ClipWorkerConfig};
    use crate::storage::DetectionStore;
    use opencv::core::CV_8UC3;
    use std::sync::atomic::AtomicBool;

    /// Dark frames, then a bright dot sweeping linearly, then dark again.
    /// Frames are paced in real time so reader timestamps spread out.
    struct StreakSource {
        frame_index: i32,
        total: i32,
        streak_start: i32,
        streak_len: i32,
        frame_delay: Duration,
    }

    impl StreakSource {
        fn new() -> Self {
            Self {
                frame_index: 0,
                total: 40,
                streak_start: 10,
                streak_len: 11,
                frame_delay: Duration::from_millis(30),
            }
        }

        fn streak_position(&self, i: i32) -> (i32, i32) {
            // 10 steps of (9, 4): (60,100) -> (150,140).
            (60 + 9 * i, 100 + 4 * i)
        }
    }

    impl VideoSource for StreakSource {
        fn open(&mut self) -> Result<StreamInfo, StreamError> {
            Ok(StreamInfo {
                width: 320,
                height: 240,
                source_fps: 30.0,
            })
        }

        fn read(&mut self) -> Result<Mat, StreamError> {
            std::thread::sleep(self.frame_delay);
            if self.frame_index >= self.total {
                std::thread::sleep(Duration::from_millis(20));
                return Err(StreamError::Decode);
            }
            let mut img =
                Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(0.0)).unwrap();
            let streak_i = self.frame_index - self.streak_start;
            if streak_i >= 0 && streak_i < self.streak_len {
                let (x, y) = self.streak_position(streak_i);
                imgproc::circle(
                    &mut img,
                    Point::new(x, y),
                    2,
                    Scalar::all(255.0),
                    -1,
                    imgproc::LINE_8,
                    0,
                )
                .unwrap();
            }
            self.frame_index += 1;
            Ok(img)
        }

        fn close(&mut self) {}
    }

    #[test]
    fn synthetic_streak_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = crate::config::test_settings();
        cfg.output_root = dir.path().to_path_buf();
        cfg.extract_clips = false;
        let camera_dir = cfg.camera_dir();

        let settings = shared_settings(cfg);
        let stats = CameraStats::new();
        let preview = Arc::new(PreviewCell::new());
        let control = PipelineControl::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader = crate::camera::StreamReader::start(
            Box::new(StreakSource::new()),
            "cam1".into(),
            Arc::clone(&stats),
            Arc::clone(&shutdown),
        );

        let (clip_tx, clip_rx) = crossbeam_channel::unbounded();
        let store = DetectionStore::open(&camera_dir).unwrap();
        let worker = ClipWorker::new(
            clip_rx,
            DetectionStore::open(&camera_dir).unwrap(),
            ClipWorkerConfig {
                camera_name: "cam1".into(),
                extract_clips: false,
                fb_normalize: false,
                fb_delete_mov: false,
            },
        );
        let worker_handle = std::thread::spawn(move || worker.run());

        let detection = DetectionLoop::new(
            settings,
            reader,
            Arc::clone(&stats),
            preview.clone(),
            control,
            TwilightGate::disabled(),
            clip_tx,
            Arc::clone(&shutdown),
        );
        let loop_handle = std::thread::spawn(move || detection.run());

        // 40 frames at ~30 ms each, plus slack.
        std::thread::sleep(Duration::from_millis(2200));
        shutdown.store(true, Ordering::Relaxed);
        loop_handle.join().unwrap();
        worker_handle.join().unwrap();

        let events = store.read_all();
        assert_eq!(events.len(), 1, "expected exactly one event");
        let e = &events[0];
        assert!((e.start_point[0] - 60).abs() <= 3, "start x {}", e.start_point[0]);
        assert!((e.start_point[1] - 100).abs() <= 3);
        assert!((e.end_point[0] - 150).abs() <= 3, "end x {}", e.end_point[0]);
        assert!((e.end_point[1] - 140).abs() <= 3);
        assert!(e.confidence > 0.0 && e.confidence <= 1.0);
        assert_eq!(stats.detection_count.load(Ordering::Relaxed), 1);

        // The preview cell saw annotated frames.
        assert!(preview.latest().is_some());
    }
}
