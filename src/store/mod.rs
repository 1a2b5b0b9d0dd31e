//! Persistence layer: the JSON-backed record of handled messages.

pub mod dedup;

pub use dedup::{DedupStore, FolderState};
