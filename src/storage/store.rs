use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detect::MeteorEvent;

pub const ALLOWED_LABELS: &[&str] = &["", "meteor", "non-meteor", "post_detected"];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const FILE_STEM_FORMAT: &str = "meteor_%Y%m%d_%H%M%S";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown label '{0}'")]
    UnknownLabel(String),
}

/// One event as it lives on disk, one JSON object per line of
/// `detections.jsonl`. Events are append-only; labels live in a separate
/// mutable file keyed by the timestamp string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDetection {
    pub timestamp: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub start_point: [i32; 2],
    pub end_point: [i32; 2],
    pub length_pixels: f64,
    pub peak_brightness: f64,
    pub confidence: f64,
}

impl PersistedDetection {
    pub fn from_event(event: &MeteorEvent) -> Self {
        Self {
            timestamp: event
                .wall_timestamp
                .naive_utc()
                .format(TIMESTAMP_FORMAT)
                .to_string(),
            start_time: event.start_ts,
            end_time: event.end_ts,
            duration: event.duration_s,
            start_point: [event.start_point.0, event.start_point.1],
            end_point: [event.end_point.0, event.end_point.1],
            length_pixels: event.length_px,
            peak_brightness: event.peak_brightness,
            confidence: event.confidence,
        }
    }

    /// `meteor_YYYYMMDD_HHMMSS`, the stem shared by the clip and both
    /// composites of this event.
    pub fn file_stem(&self) -> Option<String> {
        let parsed = NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT).ok()?;
        Some(parsed.format(FILE_STEM_FORMAT).to_string())
    }
}

pub fn file_stem_for_timestamp(timestamp: &str) -> Option<String> {
    let parsed = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
    Some(parsed.format(FILE_STEM_FORMAT).to_string())
}

/// Durable per-camera event archive: append-only JSONL plus a mutable
/// labels file. The camera service only appends; the dashboard reads,
/// labels and deletes.
pub struct DetectionStore {
    dir: PathBuf,
}

impl DetectionStore {
    pub fn open(camera_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = camera_dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn jsonl_path(&self) -> PathBuf {
        self.dir.join("detections.jsonl")
    }

    pub fn labels_path(&self) -> PathBuf {
        self.dir.join("detection_labels.json")
    }

    /// Append one event. A single write carries the whole line including
    /// the terminator, then flushes, so a tailing reader never sees a
    /// half-line.
    pub fn append(&self, detection: &PersistedDetection) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(detection)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.jsonl_path())?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// All events in file order. Malformed lines are logged and skipped so
    /// one bad line never hides the archive.
    pub fn read_all(&self) -> Vec<PersistedDetection> {
        let content = match std::fs::read_to_string(self.jsonl_path()) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(d) => out.push(d),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed detection line");
                }
            }
        }
        out
    }

    /// Labels keyed by timestamp string. Labels outside the closed set are
    /// treated as unclassified on read.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let content = match std::fs::read_to_string(self.labels_path()) {
            Ok(c) => c,
            Err(_) => return BTreeMap::new(),
        };
        let raw: BTreeMap<String, String> = match serde_json::from_str(&content) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed labels file");
                return BTreeMap::new();
            }
        };
        raw.into_iter()
            .map(|(k, v)| {
                if ALLOWED_LABELS.contains(&v.as_str()) {
                    (k, v)
                } else {
                    (k, String::new())
                }
            })
            .collect()
    }

    /// Upsert a label. Only the closed set is accepted on write.
    pub fn set_label(&self, timestamp: &str, label: &str) -> Result<(), StoreError> {
        if !ALLOWED_LABELS.contains(&label) {
            return Err(StoreError::UnknownLabel(label.to_string()));
        }
        let mut labels = self.labels();
        labels.insert(timestamp.to_string(), label.to_string());
        self.write_labels(&labels)
    }

    fn remove_label(&self, timestamp: &str) -> Result<(), StoreError> {
        let mut labels = self.labels();
        if labels.remove(timestamp).is_some() {
            self.write_labels(&labels)?;
        }
        Ok(())
    }

    fn write_labels(&self, labels: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let body = serde_json::to_string_pretty(labels)?;
        let tmp = self.labels_path().with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, self.labels_path())?;
        Ok(())
    }

    /// Candidate artifact paths for an event: clip containers and both
    /// composites. Only the ones that exist get deleted.
    pub fn artifact_paths(&self, timestamp: &str) -> Vec<PathBuf> {
        let stem = match file_stem_for_timestamp(timestamp) {
            Some(s) => s,
            None => return Vec::new(),
        };
        [
            format!("{stem}.mov"),
            format!("{stem}.mp4"),
            format!("{stem}_composite.jpg"),
            format!("{stem}_composite_original.jpg"),
        ]
        .into_iter()
        .map(|name| self.dir.join(name))
        .collect()
    }

    /// Delete one event: its JSONL line, its label, and every artifact
    /// file on disk. Returns the artifact files actually removed.
    pub fn delete_event(&self, timestamp: &str) -> Result<Vec<PathBuf>, StoreError> {
        let remaining: Vec<PersistedDetection> = self
            .read_all()
            .into_iter()
            .filter(|d| d.timestamp != timestamp)
            .collect();
        self.rewrite_jsonl(&remaining)?;
        self.remove_label(timestamp)?;

        let mut removed = Vec::new();
        for path in self.artifact_paths(timestamp) {
            if path.exists() {
                std::fs::remove_file(&path)?;
                removed.push(path);
            }
        }
        Ok(removed)
    }

    /// Delete every event carrying the given label. Returns the number of
    /// events removed and the artifact files deleted with them.
    pub fn delete_by_label(&self, label: &str) -> Result<(usize, Vec<PathBuf>), StoreError> {
        let labels = self.labels();
        let doomed: Vec<String> = self
            .read_all()
            .into_iter()
            .filter(|d| labels.get(&d.timestamp).map(String::as_str) == Some(label))
            .map(|d| d.timestamp)
            .collect();

        let mut files = Vec::new();
        for timestamp in &doomed {
            files.extend(self.delete_event(timestamp)?);
        }
        Ok((doomed.len(), files))
    }

    fn rewrite_jsonl(&self, detections: &[PersistedDetection]) -> Result<(), StoreError> {
        let mut body = String::new();
        for d in detections {
            body.push_str(&serde_json::to_string(d)?);
            body.push('\n');
        }
        let tmp = self.jsonl_path().with_extension("jsonl.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, self.jsonl_path())?;
        Ok(())
    }
}
