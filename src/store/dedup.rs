//! Durable dedup store: which UIDs, per folder, have already been handled.
//!
//! The file is a JSON object keyed by folder name:
//!
//! ```json
//! { "support": { "processed_uids": [41, 42] } }
//! ```
//!
//! Entries only grow. If the file is deleted, every message in every
//! monitored folder looks new on the next poll and gets replied to again;
//! the store is the only thing standing between the poller and old mail.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Handled UIDs for one folder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderState {
    /// Insertion-ordered, no duplicates.
    #[serde(default)]
    pub processed_uids: Vec<u32>,
    #[serde(skip)]
    index: HashSet<u32>,
}

impl FolderState {
    fn from_uids(uids: impl IntoIterator<Item = u32>) -> Self {
        let mut state = Self::default();
        for uid in uids {
            state.insert(uid);
        }
        state
    }

    fn insert(&mut self, uid: u32) -> bool {
        if self.index.insert(uid) {
            self.processed_uids.push(uid);
            true
        } else {
            false
        }
    }

    fn contains(&self, uid: u32) -> bool {
        self.index.contains(&uid)
    }
}

impl PartialEq for FolderState {
    fn eq(&self, other: &Self) -> bool {
        self.processed_uids == other.processed_uids
    }
}

impl Eq for FolderState {}

/// Per-folder handled-UID sets backed by a JSON file.
#[derive(Debug)]
pub struct DedupStore {
    path: PathBuf,
    folders: IndexMap<String, FolderState>,
}

impl DedupStore {
    /// Empty store that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>, folders: &[String]) -> Self {
        let mut store = Self {
            path: path.into(),
            folders: IndexMap::new(),
        };
        store.ensure_folders(folders);
        store
    }

    /// Load the store from `path`.
    ///
    /// A missing file is a fresh start. Every folder in `folders` that the
    /// file does not mention gets an empty entry; entries for folders that
    /// are no longer configured are kept as they are.
    pub fn load(path: impl Into<PathBuf>, folders: &[String]) -> Result<Self, StateError> {
        let path = path.into();

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No state file yet, starting empty");
                return Ok(Self::new(path, folders));
            }
            Err(source) => return Err(StateError::Read { path, source }),
        };

        let raw: IndexMap<String, FolderState> = match serde_json::from_str(&text) {
            Ok(raw) => raw,
            Err(source) => return Err(StateError::Corrupt { path, source }),
        };

        let mut store = Self {
            path,
            folders: raw
                .into_iter()
                .map(|(name, state)| (name, FolderState::from_uids(state.processed_uids)))
                .collect(),
        };
        store.ensure_folders(folders);
        Ok(store)
    }

    fn ensure_folders(&mut self, folders: &[String]) {
        for folder in folders {
            self.folders.entry(folder.clone()).or_default();
        }
    }

    /// Write the whole mapping to disk.
    ///
    /// The JSON goes to a temporary file in the same directory which is then
    /// renamed over the destination, so a crash mid-write leaves the previous
    /// file intact.
    pub fn save(&self) -> Result<(), StateError> {
        let write_err = |reason: String| StateError::Write {
            path: self.path.clone(),
            reason,
        };

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| write_err(e.to_string()))?;

        let json =
            serde_json::to_vec_pretty(&self.folders).map_err(|e| write_err(e.to_string()))?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(&dir).map_err(|e| write_err(e.to_string()))?;
        tmp.write_all(&json).map_err(|e| write_err(e.to_string()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| write_err(e.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|e| write_err(e.error.to_string()))?;

        tracing::debug!(path = %self.path.display(), "State saved");
        Ok(())
    }

    /// Record `uid` as handled in `folder`. Returns `false` if it already was.
    pub fn mark_handled(&mut self, folder: &str, uid: u32) -> bool {
        self.folders.entry(folder.to_string()).or_default().insert(uid)
    }

    /// Whether `uid` has been handled in `folder`.
    pub fn is_handled(&self, folder: &str, uid: u32) -> bool {
        self.folders.get(folder).is_some_and(|f| f.contains(uid))
    }

    /// Handled UIDs for `folder` in the order they were recorded.
    pub fn handled(&self, folder: &str) -> &[u32] {
        self.folders
            .get(folder)
            .map(|f| f.processed_uids.as_slice())
            .unwrap_or(&[])
    }

    /// Folder names known to the store.
    pub fn folders(&self) -> impl Iterator<Item = &str> {
        self.folders.keys().map(String::as_str)
    }

}
