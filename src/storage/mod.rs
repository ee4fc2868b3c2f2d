mod store;

pub use store::{DetectionStore, PersistedDetection, StoreError, ALLOWED_LABELS};
