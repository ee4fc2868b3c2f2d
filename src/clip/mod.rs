mod writer;

pub use writer::{ClipJob, ClipWorker, ClipWorkerConfig};
