// Store module — per-account persistence

mod backend;

pub use backend::{FileStorage, MemoryStorage, StorageBackend};
