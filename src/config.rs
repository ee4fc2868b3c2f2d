use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to persist runtime settings: {0}")]
    Persist(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    Fireball,
}

impl Sensitivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
            Sensitivity::Fireball => "fireball",
        }
    }
}

impl FromStr for Sensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Sensitivity::Low),
            "medium" => Ok(Sensitivity::Medium),
            "high" => Ok(Sensitivity::High),
            "fireball" => Ok(Sensitivity::Fireball),
            other => Err(format!("unknown sensitivity '{other}'")),
        }
    }
}

/// Numeric envelope for the detector and tracker. Immutable within one
/// detection step; hot-swapped between steps via a settings snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    pub diff_threshold: f64,
    pub min_brightness: f64,
    pub min_brightness_tracking: f64,
    pub min_area: f64,
    pub max_area: f64,
    pub min_length: f64,
    pub max_length: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub min_speed: f64,
    pub min_linearity: f64,
    pub max_gap_time: f64,
    pub max_distance: f64,
    pub merge_max_gap_time: f64,
    pub merge_max_distance: f64,
    pub merge_max_speed_ratio: f64,
    pub min_track_points: usize,
    pub max_stationary_ratio: f64,
    pub small_area_threshold: f64,
    pub nuisance_overlap_threshold: f64,
    pub nuisance_path_overlap_threshold: f64,
    pub exclude_bottom_ratio: f64,
    pub exclude_edge_ratio: f64,
}

impl DetectionParams {
    pub fn preset(sensitivity: Sensitivity) -> Self {
        let mut p = Self {
            diff_threshold: 30.0,
            min_brightness: 200.0,
            min_brightness_tracking: 160.0,
            min_area: 5.0,
            max_area: 10_000.0,
            min_length: 20.0,
            max_length: 5_000.0,
            min_duration: 0.1,
            max_duration: 10.0,
            min_speed: 50.0,
            min_linearity: 0.7,
            max_gap_time: 2.0,
            max_distance: 80.0,
            merge_max_gap_time: 1.5,
            merge_max_distance: 80.0,
            merge_max_speed_ratio: 0.5,
            min_track_points: 4,
            max_stationary_ratio: 0.4,
            small_area_threshold: 25.0,
            nuisance_overlap_threshold: 0.60,
            nuisance_path_overlap_threshold: 0.70,
            exclude_bottom_ratio: 1.0 / 16.0,
            exclude_edge_ratio: 0.0,
        };
        match sensitivity {
            Sensitivity::Low => {
                p.diff_threshold = 40.0;
                p.min_brightness = 220.0;
            }
            Sensitivity::Medium => {}
            Sensitivity::High => {
                p.diff_threshold = 20.0;
                p.min_brightness = 180.0;
            }
            Sensitivity::Fireball => {
                p.diff_threshold = 15.0;
                p.min_brightness = 150.0;
                p.min_speed = 15.0;
                p.min_linearity = 0.5;
                p.max_duration = 20.0;
            }
        }
        p
    }
}

/// Full per-camera configuration. One immutable snapshot of this struct is
/// the unit of hot-swapping; restart-requiring fields only take effect on
/// the next process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    pub camera_name: String,
    pub rtsp_url: String,
    pub web_port: u16,
    pub output_root: PathBuf,
    pub sensitivity: Sensitivity,
    pub scale: f64,
    pub buffer: f64,
    pub extract_clips: bool,
    pub fb_normalize: bool,
    pub fb_delete_mov: bool,
    pub clip_margin_before: f64,
    pub clip_margin_after: f64,
    pub mask_path: Option<PathBuf>,
    pub mask_dilate: i32,
    pub nuisance_mask_path: Option<PathBuf>,
    pub nuisance_mask_dilate: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
    pub enable_time_window: bool,
    pub twilight_start: String,
    pub twilight_end: String,
    pub params: DetectionParams,
}

impl CameraSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let rtsp_url = env_required("RTSP_URL")?;
        let camera_name = env_required("CAMERA_NAME")?;
        let sensitivity: Sensitivity = env_parse("SENSITIVITY", Sensitivity::Medium)?;
        let mut params = DetectionParams::preset(sensitivity);

        let scale: f64 = env_parse("SCALE", 1.0)?;
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(ConfigError::InvalidEnv {
                key: "SCALE",
                value: scale.to_string(),
            });
        }

        if let Some(v) = env_opt::<f64>("EXCLUDE_BOTTOM")? {
            if !(0.0..1.0).contains(&v) {
                return Err(ConfigError::InvalidEnv {
                    key: "EXCLUDE_BOTTOM",
                    value: v.to_string(),
                });
            }
            params.exclude_bottom_ratio = v;
        }
        if let Some(v) = env_opt::<f64>("EXCLUDE_EDGE_RATIO")? {
            params.exclude_edge_ratio = v;
        }
        if let Some(v) = env_opt::<f64>("NUISANCE_OVERLAP")? {
            params.nuisance_overlap_threshold = v;
        }
        if let Some(v) = env_opt::<f64>("NUISANCE_PATH_OVERLAP")? {
            params.nuisance_path_overlap_threshold = v;
        }
        if let Some(v) = env_opt::<f64>("NUISANCE_SMALL_AREA")? {
            params.small_area_threshold = v;
        }

        Ok(Self {
            camera_name,
            rtsp_url,
            web_port: env_parse("WEB_PORT", 8080)?,
            output_root: PathBuf::from(
                std::env::var("OUTPUT_ROOT").unwrap_or_else(|_| "detections".to_string()),
            ),
            sensitivity,
            scale,
            buffer: env_parse("BUFFER", 10.0)?,
            extract_clips: env_parse("EXTRACT_CLIPS", true)?,
            fb_normalize: env_parse("FB_NORMALIZE", false)?,
            fb_delete_mov: env_parse("FB_DELETE_MOV", false)?,
            clip_margin_before: env_parse("CLIP_MARGIN_BEFORE", 0.5)?,
            clip_margin_after: env_parse("CLIP_MARGIN_AFTER", 0.5)?,
            mask_path: std::env::var("MASK_PATH").ok().map(PathBuf::from),
            mask_dilate: env_parse("MASK_DILATE", 0)?,
            nuisance_mask_path: std::env::var("NUISANCE_MASK_PATH").ok().map(PathBuf::from),
            nuisance_mask_dilate: env_parse("NUISANCE_MASK_DILATE", 0)?,
            latitude: env_parse("LATITUDE", 0.0)?,
            longitude: env_parse("LONGITUDE", 0.0)?,
            timezone: std::env::var("TIMEZONE").unwrap_or_else(|_| "UTC".to_string()),
            enable_time_window: env_parse("ENABLE_TIME_WINDOW", false)?,
            twilight_start: std::env::var("TWILIGHT_START").unwrap_or_else(|_| "18:00".to_string()),
            twilight_end: std::env::var("TWILIGHT_END").unwrap_or_else(|_| "06:00".to_string()),
            params,
        })
    }

    /// Effective ring-buffer span. The buffer must always be able to cover
    /// the longest acceptable track plus pre/post margins.
    pub fn buffer_seconds(&self) -> f64 {
        self.buffer.max(self.params.max_duration + 2.0)
    }

    pub fn camera_dir(&self) -> PathBuf {
        self.output_root.join(&self.camera_name)
    }

    pub fn mask_dir(&self) -> PathBuf {
        self.camera_dir().join("masks")
    }

    pub fn persisted_mask_path(&self) -> PathBuf {
        self.mask_dir()
            .join(format!("{}_mask.png", self.camera_name))
    }

    pub fn runtime_settings_path(&self) -> PathBuf {
        self.output_root
            .join("runtime_settings")
            .join(format!("{}.json", self.camera_name))
    }

    /// Flat view of every schema key, used for the `/stats` settings echo
    /// and for persistence.
    pub fn settings_map(&self) -> BTreeMap<String, Value> {
        let mut m = BTreeMap::new();
        let p = &self.params;
        m.insert("sensitivity".into(), Value::from(self.sensitivity.as_str()));
        m.insert("scale".into(), Value::from(self.scale));
        m.insert("buffer".into(), Value::from(self.buffer));
        m.insert("extract_clips".into(), Value::from(self.extract_clips));
        m.insert("fb_normalize".into(), Value::from(self.fb_normalize));
        m.insert("fb_delete_mov".into(), Value::from(self.fb_delete_mov));
        m.insert(
            "clip_margin_before".into(),
            Value::from(self.clip_margin_before),
        );
        m.insert(
            "clip_margin_after".into(),
            Value::from(self.clip_margin_after),
        );
        m.insert(
            "mask_path".into(),
            match &self.mask_path {
                Some(p) => Value::from(p.to_string_lossy().into_owned()),
                None => Value::Null,
            },
        );
        m.insert("mask_dilate".into(), Value::from(self.mask_dilate));
        m.insert(
            "nuisance_mask_path".into(),
            match &self.nuisance_mask_path {
                Some(p) => Value::from(p.to_string_lossy().into_owned()),
                None => Value::Null,
            },
        );
        m.insert(
            "nuisance_mask_dilate".into(),
            Value::from(self.nuisance_mask_dilate),
        );
        m.insert("diff_threshold".into(), Value::from(p.diff_threshold));
        m.insert("min_brightness".into(), Value::from(p.min_brightness));
        m.insert(
            "min_brightness_tracking".into(),
            Value::from(p.min_brightness_tracking),
        );
        m.insert("min_area".into(), Value::from(p.min_area));
        m.insert("max_area".into(), Value::from(p.max_area));
        m.insert("min_length".into(), Value::from(p.min_length));
        m.insert("max_length".into(), Value::from(p.max_length));
        m.insert("min_duration".into(), Value::from(p.min_duration));
        m.insert("max_duration".into(), Value::from(p.max_duration));
        m.insert("min_speed".into(), Value::from(p.min_speed));
        m.insert("min_linearity".into(), Value::from(p.min_linearity));
        m.insert("max_gap_time".into(), Value::from(p.max_gap_time));
        m.insert("max_distance".into(), Value::from(p.max_distance));
        m.insert(
            "merge_max_gap_time".into(),
            Value::from(p.merge_max_gap_time),
        );
        m.insert(
            "merge_max_distance".into(),
            Value::from(p.merge_max_distance),
        );
        m.insert(
            "merge_max_speed_ratio".into(),
            Value::from(p.merge_max_speed_ratio),
        );
        m.insert(
            "min_track_points".into(),
            Value::from(p.min_track_points as u64),
        );
        m.insert(
            "max_stationary_ratio".into(),
            Value::from(p.max_stationary_ratio),
        );
        m.insert(
            "small_area_threshold".into(),
            Value::from(p.small_area_threshold),
        );
        m.insert(
            "nuisance_overlap_threshold".into(),
            Value::from(p.nuisance_overlap_threshold),
        );
        m.insert(
            "nuisance_path_overlap_threshold".into(),
            Value::from(p.nuisance_path_overlap_threshold),
        );
        m.insert(
            "exclude_bottom_ratio".into(),
            Value::from(p.exclude_bottom_ratio),
        );
        m.insert(
            "exclude_edge_ratio".into(),
            Value::from(p.exclude_edge_ratio),
        );
        m
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Hot,
    Restart,
}

const RESTART_KEYS: &[&str] = &[
    "sensitivity",
    "scale",
    "buffer",
    "extract_clips",
    "fb_normalize",
    "fb_delete_mov",
];

const HOT_KEYS: &[&str] = &[
    "clip_margin_before",
    "clip_margin_after",
    "mask_path",
    "mask_dilate",
    "nuisance_mask_path",
    "nuisance_mask_dilate",
    "diff_threshold",
    "min_brightness",
    "min_brightness_tracking",
    "min_area",
    "max_area",
    "min_length",
    "max_length",
    "min_duration",
    "max_duration",
    "min_speed",
    "min_linearity",
    "max_gap_time",
    "max_distance",
    "merge_max_gap_time",
    "merge_max_distance",
    "merge_max_speed_ratio",
    "min_track_points",
    "max_stationary_ratio",
    "small_area_threshold",
    "nuisance_overlap_threshold",
    "nuisance_path_overlap_threshold",
    "exclude_bottom_ratio",
    "exclude_edge_ratio",
];

pub fn key_kind(key: &str) -> Option<KeyKind> {
    if RESTART_KEYS.contains(&key) {
        Some(KeyKind::Restart)
    } else if HOT_KEYS.contains(&key) {
        Some(KeyKind::Hot)
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyError {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ApplyOutcome {
    pub applied: Vec<String>,
    pub errors: Vec<KeyError>,
    pub restart_required: bool,
    pub restart_triggers: Vec<String>,
}

/// Apply a partial settings object against a copy of the current settings.
/// Valid keys apply even when other keys in the same request fail; a key
/// whose value is invalid is left untouched. Keys that did not change the
/// stored value are not reported as applied.
///
/// `sensitivity` goes first: changing the preset re-derives the whole
/// detector envelope, and explicit per-key values in the same request must
/// win over the preset.
pub fn apply_partial(
    settings: &mut CameraSettings,
    updates: &serde_json::Map<String, Value>,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();

    let first = updates
        .iter()
        .filter(|(k, _)| k.as_str() == "sensitivity");
    let rest = updates
        .iter()
        .filter(|(k, _)| k.as_str() != "sensitivity");
    for (key, value) in first.chain(rest) {
        match key_kind(key) {
            None => outcome.errors.push(KeyError {
                key: key.clone(),
                reason: "unknown setting".to_string(),
            }),
            Some(kind) => match apply_key(settings, key, value) {
                Ok(true) => {
                    outcome.applied.push(key.clone());
                    if kind == KeyKind::Restart {
                        outcome.restart_required = true;
                        outcome.restart_triggers.push(key.clone());
                    }
                }
                Ok(false) => {}
                Err(reason) => outcome.errors.push(KeyError {
                    key: key.clone(),
                    reason,
                }),
            },
        }
    }

    outcome
}

fn as_f64(value: &Value) -> Result<f64, String> {
    value
        .as_f64()
        .ok_or_else(|| format!("expected a number, got {value}"))
}

fn as_bool(value: &Value) -> Result<bool, String> {
    value
        .as_bool()
        .ok_or_else(|| format!("expected a boolean, got {value}"))
}

fn bounded(value: f64, min: f64, max: f64) -> Result<f64, String> {
    if value >= min && value <= max {
        Ok(value)
    } else {
        Err(format!("value {value} out of range [{min}, {max}]"))
    }
}

fn opt_path(value: &Value) -> Result<Option<PathBuf>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) if text.is_empty() => Ok(None),
        Value::String(text) => Ok(Some(PathBuf::from(text))),
        other => Err(format!("expected a path string, got {other}")),
    }
}

fn apply_key(s: &mut CameraSettings, key: &str, value: &Value) -> Result<bool, String> {
    macro_rules! set {
        ($field:expr, $new:expr) => {{
            let new = $new;
            if $field != new {
                $field = new;
                Ok(true)
            } else {
                Ok(false)
            }
        }};
    }

    match key {
        "sensitivity" => {
            let text = value.as_str().ok_or("expected a string")?;
            let sensitivity: Sensitivity = text.parse()?;
            if s.sensitivity != sensitivity {
                s.sensitivity = sensitivity;
                // The preset re-derives the detector envelope on restart.
                s.params = DetectionParams::preset(sensitivity);
                Ok(true)
            } else {
                Ok(false)
            }
        }
        "scale" => {
            let v = as_f64(value)?;
            if !(v > 0.0 && v <= 1.0) {
                return Err(format!("value {v} out of range (0, 1]"));
            }
            set!(s.scale, v)
        }
        "buffer" => set!(s.buffer, bounded(as_f64(value)?, 1.0, 600.0)?),
        "extract_clips" => set!(s.extract_clips, as_bool(value)?),
        "fb_normalize" => set!(s.fb_normalize, as_bool(value)?),
        "fb_delete_mov" => set!(s.fb_delete_mov, as_bool(value)?),
        "clip_margin_before" => set!(s.clip_margin_before, bounded(as_f64(value)?, 0.0, 30.0)?),
        "clip_margin_after" => set!(s.clip_margin_after, bounded(as_f64(value)?, 0.0, 30.0)?),
        "mask_path" => set!(s.mask_path, opt_path(value)?),
        "nuisance_mask_path" => set!(s.nuisance_mask_path, opt_path(value)?),
        "mask_dilate" => set!(s.mask_dilate, bounded(as_f64(value)?, 0.0, 100.0)? as i32),
        "nuisance_mask_dilate" => set!(
            s.nuisance_mask_dilate,
            bounded(as_f64(value)?, 0.0, 100.0)? as i32
        ),
        "diff_threshold" => set!(s.params.diff_threshold, bounded(as_f64(value)?, 1.0, 255.0)?),
        "min_brightness" => set!(s.params.min_brightness, bounded(as_f64(value)?, 0.0, 255.0)?),
        "min_brightness_tracking" => set!(
            s.params.min_brightness_tracking,
            bounded(as_f64(value)?, 0.0, 255.0)?
        ),
        "min_area" => set!(s.params.min_area, bounded(as_f64(value)?, 0.0, 1e6)?),
        "max_area" => set!(s.params.max_area, bounded(as_f64(value)?, 1.0, 1e7)?),
        "min_length" => set!(s.params.min_length, bounded(as_f64(value)?, 0.0, 1e5)?),
        "max_length" => set!(s.params.max_length, bounded(as_f64(value)?, 1.0, 1e6)?),
        "min_duration" => set!(s.params.min_duration, bounded(as_f64(value)?, 0.0, 3600.0)?),
        "max_duration" => set!(s.params.max_duration, bounded(as_f64(value)?, 0.01, 3600.0)?),
        "min_speed" => set!(s.params.min_speed, bounded(as_f64(value)?, 0.0, 1e6)?),
        "min_linearity" => set!(s.params.min_linearity, bounded(as_f64(value)?, 0.0, 1.0)?),
        "max_gap_time" => set!(s.params.max_gap_time, bounded(as_f64(value)?, 0.01, 60.0)?),
        "max_distance" => set!(s.params.max_distance, bounded(as_f64(value)?, 1.0, 1e5)?),
        "merge_max_gap_time" => set!(
            s.params.merge_max_gap_time,
            bounded(as_f64(value)?, 0.0, 60.0)?
        ),
        "merge_max_distance" => set!(
            s.params.merge_max_distance,
            bounded(as_f64(value)?, 0.0, 1e5)?
        ),
        "merge_max_speed_ratio" => set!(
            s.params.merge_max_speed_ratio,
            bounded(as_f64(value)?, 0.0, 1.0)?
        ),
        "min_track_points" => set!(
            s.params.min_track_points,
            bounded(as_f64(value)?, 2.0, 10_000.0)? as usize
        ),
        "max_stationary_ratio" => set!(
            s.params.max_stationary_ratio,
            bounded(as_f64(value)?, 0.0, 1.0)?
        ),
        "small_area_threshold" => set!(
            s.params.small_area_threshold,
            bounded(as_f64(value)?, 0.0, 1e6)?
        ),
        "nuisance_overlap_threshold" => set!(
            s.params.nuisance_overlap_threshold,
            bounded(as_f64(value)?, 0.0, 1.0)?
        ),
        "nuisance_path_overlap_threshold" => set!(
            s.params.nuisance_path_overlap_threshold,
            bounded(as_f64(value)?, 0.0, 1.0)?
        ),
        "exclude_bottom_ratio" => {
            let v = as_f64(value)?;
            if !(0.0..1.0).contains(&v) {
                return Err(format!("value {v} out of range [0, 1)"));
            }
            set!(s.params.exclude_bottom_ratio, v)
        }
        "exclude_edge_ratio" => set!(
            s.params.exclude_edge_ratio,
            bounded(as_f64(value)?, 0.0, 0.45)?
        ),
        _ => Err("unknown setting".to_string()),
    }
}

/// Durable per-camera settings. The file replays the user's last applied
/// configuration after a crash or self-restart.
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Overlay previously persisted settings onto env-derived defaults.
    /// Unknown or invalid persisted keys are logged and skipped.
    pub fn load_into(&self, settings: &mut CameraSettings) {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return,
        };
        let map: serde_json::Map<String, Value> = match serde_json::from_str(&content) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "ignoring malformed runtime settings file"
                );
                return;
            }
        };
        let outcome = apply_partial(settings, &map);
        for err in &outcome.errors {
            tracing::warn!(key = %err.key, reason = %err.reason, "skipped persisted setting");
        }
        if !outcome.applied.is_empty() {
            tracing::info!(
                path = %self.path.display(),
                applied = outcome.applied.len(),
                "restored runtime settings"
            );
        }
    }

    /// Write the full flat settings map, temp file + rename so a crash
    /// mid-write never leaves a truncated file.
    pub fn save(&self, settings: &CameraSettings) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::OutputDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let map = settings.settings_map();
        let body = serde_json::to_string_pretty(&map).map_err(std::io::Error::from)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn env_required(key: &'static str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingEnv(key)),
    }
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidEnv {
            key,
            value: v.clone(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_opt<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: v }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> CameraSettings {
    CameraSettings {
        camera_name: "cam1".into(),
        rtsp_url: "rtsp://example/stream".into(),
        web_port: 8080,
        output_root: PathBuf::from("detections"),
        sensitivity: Sensitivity::Medium,
        scale: 1.0,
        buffer: 10.0,
        extract_clips: true,
        fb_normalize: false,
        fb_delete_mov: false,
        clip_margin_before: 0.5,
        clip_margin_after: 0.5,
        mask_path: None,
        mask_dilate: 0,
        nuisance_mask_path: None,
        nuisance_mask_dilate: 0,
        latitude: 0.0,
        longitude: 0.0,
        timezone: "UTC".into(),
        enable_time_window: false,
        twilight_start: "18:00".into(),
        twilight_end: "06:00".into(),
        params: DetectionParams::preset(Sensitivity::Medium),
    }
}
