pub mod detector;
pub mod mask;
pub mod pipeline;
pub mod tracker;
pub mod twilight;

pub use detector::{Candidate, Detector};
pub use mask::{MaskEngine, NuisanceMap};
pub use pipeline::{spawn_detection_loop, DetectionLoop, SharedSettings};
pub use tracker::{FinalizedTrack, MeteorEvent, RejectReason, Track, Tracker};
pub use twilight::{FixedWindow, SunSchedule, TwilightGate};
