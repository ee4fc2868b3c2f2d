pub mod frame;
pub mod reader;

pub use frame::{CameraStats, Frame, PreviewCell, PreviewFrame};
pub use reader::{RtspSource, StreamError, StreamInfo, StreamReader, VideoSource};
