use std::path::{Path, PathBuf};
use std::process::Command;

use crossbeam_channel::Receiver;
use opencv::core::{Mat, Point, Scalar, Size};
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc, videoio};

use crate::camera::Frame;
use crate::detect::MeteorEvent;
use crate::storage::{DetectionStore, PersistedDetection};

/// Fourcc candidates, first writable one wins.
const FOURCC_CANDIDATES: &[(&str, [char; 4])] = &[
    ("avc1", ['a', 'v', 'c', '1']),
    ("mp4v", ['m', 'p', '4', 'v']),
    ("XVID", ['X', 'V', 'I', 'D']),
    ("MJPG", ['M', 'J', 'P', 'G']),
];

const MIN_FPS: f64 = 1.0;
const MAX_FPS: f64 = 120.0;

/// One accepted event together with its margin-padded frames, lifted out
/// of the ring buffer on the detection thread.
pub struct ClipJob {
    pub event: MeteorEvent,
    pub frames: Vec<Frame>,
    pub nominal_fps: f64,
}

#[derive(Clone)]
pub struct ClipWorkerConfig {
    pub camera_name: String,
    pub extract_clips: bool,
    pub fb_normalize: bool,
    pub fb_delete_mov: bool,
}

/// Drains clip jobs in FIFO order, so `detections.jsonl` stays ordered by
/// wall timestamp per camera no matter how long a clip takes.
pub struct ClipWorker {
    receiver: Receiver<ClipJob>,
    store: DetectionStore,
    config: ClipWorkerConfig,
}

impl ClipWorker {
    pub fn new(receiver: Receiver<ClipJob>, store: DetectionStore, config: ClipWorkerConfig) -> Self {
        Self {
            receiver,
            store,
            config,
        }
    }

    /// Blocking loop; exits when all senders are dropped, after draining
    /// every remaining job.
    pub fn run(self) {
        while let Ok(job) = self.receiver.recv() {
            self.process(job);
        }
        tracing::debug!(camera = %self.config.camera_name, "clip worker shutting down");
    }

    fn process(&self, job: ClipJob) {
        let detection = PersistedDetection::from_event(&job.event);
        let stem = match detection.file_stem() {
            Some(s) => s,
            None => {
                tracing::error!(timestamp = %detection.timestamp, "unrepresentable event timestamp");
                return;
            }
        };

        if job.frames.is_empty() {
            tracing::warn!(camera = %self.config.camera_name, "no frames available for event, recording without media");
        } else {
            if let Err(e) = self.write_composites(&job, &stem) {
                tracing::error!(camera = %self.config.camera_name, error = %e, "composite write failed");
            }
            if self.config.extract_clips {
                if let Err(e) = self.write_clip(&job, &stem) {
                    // The event is still recorded below; only the clip is
                    // missing.
                    tracing::error!(camera = %self.config.camera_name, error = %e, "clip write failed");
                }
            }
        }

        if let Err(e) = self.store.append(&detection) {
            tracing::error!(camera = %self.config.camera_name, error = %e, "failed to append detection");
        } else {
            tracing::info!(
                camera = %self.config.camera_name,
                timestamp = %detection.timestamp,
                confidence = format!("{:.2}", detection.confidence),
                "detection recorded"
            );
        }
    }

    fn write_composites(&self, job: &ClipJob, stem: &str) -> opencv::Result<()> {
        let composite = build_composite(&job.frames)?;
        let raw_path = self.store.dir().join(format!("{stem}_composite_original.jpg"));
        imgcodecs::imwrite_def(&raw_path.to_string_lossy(), &composite)?;

        let mut marked = composite.try_clone()?;
        let start = Point::new(job.event.start_point.0, job.event.start_point.1);
        let end = Point::new(job.event.end_point.0, job.event.end_point.1);
        imgproc::line(
            &mut marked,
            start,
            end,
            Scalar::new(0.0, 255.0, 255.0, 0.0),
            2,
            imgproc::LINE_AA,
            0,
        )?;
        imgproc::circle(
            &mut marked,
            start,
            6,
            Scalar::new(0.0, 255.0, 0.0, 0.0),
            2,
            imgproc::LINE_AA,
            0,
        )?;
        imgproc::circle(
            &mut marked,
            end,
            6,
            Scalar::new(0.0, 0.0, 255.0, 0.0),
            2,
            imgproc::LINE_AA,
            0,
        )?;
        let marked_path = self.store.dir().join(format!("{stem}_composite.jpg"));
        imgcodecs::imwrite_def(&marked_path.to_string_lossy(), &marked)?;
        Ok(())
    }

    fn write_clip(&self, job: &ClipJob, stem: &str) -> opencv::Result<()> {
        let first = &job.frames[0];
        let size = Size::new(first.img.cols(), first.img.rows());
        let fps = estimate_fps(&job.frames, job.nominal_fps);
        let mov_path = self.store.dir().join(format!("{stem}.mov"));

        let mut writer = match open_writer(&mov_path, fps, size) {
            Some(w) => w,
            None => {
                tracing::error!(
                    camera = %self.config.camera_name,
                    path = %mov_path.display(),
                    "no working codec, skipping clip"
                );
                return Ok(());
            }
        };

        for frame in &job.frames {
            writer.write(frame.img.as_ref())?;
        }
        writer.release()?;

        tracing::debug!(
            camera = %self.config.camera_name,
            path = %mov_path.display(),
            frames = job.frames.len(),
            fps = format!("{:.1}", fps),
            "clip written"
        );

        if self.config.fb_normalize {
            self.normalize_clip(&mov_path, stem);
        }
        Ok(())
    }

    /// Re-encode to H.264 baseline with faststart so browsers can play the
    /// clip directly.
    fn normalize_clip(&self, mov_path: &Path, stem: &str) {
        let mp4_path = self.store.dir().join(format!("{stem}.mp4"));
        let status = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-y",
                "-i",
            ])
            .arg(mov_path)
            .args([
                "-c:v",
                "libx264",
                "-profile:v",
                "baseline",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
            ])
            .arg(&mp4_path)
            .status();

        match status {
            Ok(status) if status.success() => {
                if self.config.fb_delete_mov {
                    if let Err(e) = std::fs::remove_file(mov_path) {
                        tracing::warn!(error = %e, "failed to delete source container");
                    }
                }
            }
            Ok(status) => {
                tracing::warn!(
                    camera = %self.config.camera_name,
                    code = ?status.code(),
                    "ffmpeg normalisation failed, keeping original container"
                );
            }
            Err(e) => {
                tracing::warn!(
                    camera = %self.config.camera_name,
                    error = %e,
                    "ffmpeg not available, keeping original container"
                );
            }
        }
    }
}

fn open_writer(path: &PathBuf, fps: f64, size: Size) -> Option<videoio::VideoWriter> {
    for (name, chars) in FOURCC_CANDIDATES {
        let fourcc =
            match videoio::VideoWriter::fourcc(chars[0], chars[1], chars[2], chars[3]) {
                Ok(f) => f,
                Err(_) => continue,
            };
        match videoio::VideoWriter::new(&path.to_string_lossy(), fourcc, fps, size, true) {
            Ok(writer) => match writer.is_opened() {
                Ok(true) => {
                    tracing::debug!(codec = name, "selected clip codec");
                    return Some(writer);
                }
                _ => continue,
            },
            Err(_) => continue,
        }
    }
    None
}

/// Pixel-wise maximum over all frames. Transient bright trajectories
/// survive; the static background stays at its brightest observed value.
pub(crate) fn build_composite(frames: &[Frame]) -> opencv::Result<Mat> {
    let mut iter = frames.iter();
    let first = iter
        .next()
        .ok_or_else(|| opencv::Error::new(opencv::core::StsError, "no frames".to_string()))?;
    let mut acc = first.img.try_clone()?;
    for frame in iter {
        let mut next = Mat::default();
        opencv::core::max(&acc, frame.img.as_ref(), &mut next)?;
        acc = next;
    }
    Ok(acc)
}

/// Cameras frequently lie about their FPS; derive it from the timestamps
/// actually observed and only fall back to the nominal rate when there are
/// too few samples.
pub(crate) fn estimate_fps(frames: &[Frame], nominal: f64) -> f64 {
    let mut deltas: Vec<f64> = frames
        .windows(2)
        .map(|w| w[1].ts - w[0].ts)
        .filter(|d| *d > 0.0)
        .collect();
    if deltas.len() < 2 {
        return fallback_fps(nominal);
    }
    deltas.sort_by(|a, b| a.total_cmp(b));
    let median = deltas[deltas.len() / 2];
    if median <= 0.0 {
        return fallback_fps(nominal);
    }
    (1.0 / median).clamp(MIN_FPS, MAX_FPS)
}

fn fallback_fps(nominal: f64) -> f64 {
    if nominal > 0.0 {
        nominal.clamp(MIN_FPS, MAX_FPS)
    } else {
        25.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use opencv::core::CV_8UC3;

    fn frame_at(ts: f64, bright_col: i32) -> Frame {
        let mut img =
            Mat::new_rows_cols_with_default(16, 16, CV_8UC3, Scalar::all(0.0)).unwrap();
        imgproc::rectangle(
            &mut img,
            opencv::core::Rect::new(bright_col, 4, 2, 2),
            Scalar::all(200.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        Frame::new(ts, Utc::now(), img)
    }

    #[test]
    fn composite_is_pixelwise_maximum() {
        let frames = vec![frame_at(0.0, 2), frame_at(0.1, 10)];
        let composite = build_composite(&frames).unwrap();
        // Both transient blobs survive in the composite.
        let a = composite.at_2d::<opencv::core::Vec3b>(5, 3).unwrap();
        let b = composite.at_2d::<opencv::core::Vec3b>(5, 11).unwrap();
        assert_eq!(a[0], 200);
        assert_eq!(b[0], 200);
    }

    #[test]
    fn fps_comes_from_observed_deltas() {
        let frames: Vec<Frame> = (0..10).map(|i| frame_at(i as f64 * 0.1, 2)).collect();
        let fps = estimate_fps(&frames, 30.0);
        assert!((fps - 10.0).abs() < 0.5);
    }

    #[test]
    fn fps_falls_back_to_nominal_with_few_samples() {
        let frames = vec![frame_at(0.0, 2), frame_at(0.1, 2)];
        assert_eq!(estimate_fps(&frames, 30.0), 30.0);
        assert_eq!(estimate_fps(&[], 0.0), 25.0);
    }

    #[test]
    fn fps_is_clamped() {
        let frames: Vec<Frame> = (0..10).map(|i| frame_at(i as f64 * 0.0001, 2)).collect();
        assert_eq!(estimate_fps(&frames, 30.0), MAX_FPS);
    }

    #[test]
    fn worker_records_event_without_clips() {
        use crate::detect::MeteorEvent;

        let dir = tempfile::tempdir().unwrap();
        let store = DetectionStore::open(dir.path().join("cam1")).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = ClipWorker::new(
            rx,
            DetectionStore::open(dir.path().join("cam1")).unwrap(),
            ClipWorkerConfig {
                camera_name: "cam1".into(),
                extract_clips: false,
                fb_normalize: false,
                fb_delete_mov: false,
            },
        );

        let event = MeteorEvent {
            wall_timestamp: Utc.with_ymd_and_hms(2026, 2, 2, 6, 55, 33).unwrap(),
            start_ts: 10.0,
            end_ts: 10.5,
            start_point: (2, 5),
            end_point: (12, 5),
            peak_brightness: 200.0,
            confidence: 0.8,
            length_px: 10.0,
            duration_s: 0.5,
        };
        tx.send(ClipJob {
            event,
            frames: (0..5).map(|i| frame_at(10.0 + i as f64 * 0.1, 2)).collect(),
            nominal_fps: 25.0,
        })
        .unwrap();
        drop(tx);
        worker.run();

        let recorded = store.read_all();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].start_point, [2, 5]);
        // Composites exist, no clip was requested.
        assert!(store
            .dir()
            .join("meteor_20260202_065533_composite.jpg")
            .exists());
        assert!(store
            .dir()
            .join("meteor_20260202_065533_composite_original.jpg")
            .exists());
        assert!(!store.dir().join("meteor_20260202_065533.mov").exists());
    }
}
