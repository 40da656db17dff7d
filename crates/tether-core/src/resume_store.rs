//! Resume-id storage.
//!
//! [`MemoryResumeStore`] lives as long as the process. [`JsonFileResumeStore`]
//! keeps a JSON map on disk (default `.tether/sessions.json`) and writes
//! through on every update.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tether_proto::{ResumeStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    ids: Mutex<HashMap<String, String>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResumeStore for MemoryResumeStore {
    fn resume_id(&self, session_id: &str) -> Option<String> {
        lock(&self.ids).get(session_id).cloned()
    }

    fn set_resume_id(&self, session_id: &str, resume_id: &str) -> Result<(), StoreError> {
        lock(&self.ids).insert(session_id.to_string(), resume_id.to_string());
        Ok(())
    }
}

/// One stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeEntry {
    pub resume_id: String,
    /// RFC 3339 timestamp of the last update.
    pub updated_at: String,
}

pub struct JsonFileResumeStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, ResumeEntry>>,
}

impl JsonFileResumeStore {
    /// Opens the store at `path`.
    ///
    /// A missing or empty file is an empty store. Unparseable contents are an
    /// error rather than silently discarded history.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let entries = match std::fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), sessions = entries.len(), "Opened resume store");
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored entries, keyed by session id.
    pub fn entries(&self) -> BTreeMap<String, ResumeEntry> {
        lock(&self.entries).clone()
    }

    fn save(&self, entries: &BTreeMap<String, ResumeEntry>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, content + "\n")?;
        Ok(())
    }
}

impl ResumeStore for JsonFileResumeStore {
    fn resume_id(&self, session_id: &str) -> Option<String> {
        lock(&self.entries)
            .get(session_id)
            .map(|entry| entry.resume_id.clone())
    }

    fn set_resume_id(&self, session_id: &str, resume_id: &str) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        if entries
            .get(session_id)
            .is_some_and(|entry| entry.resume_id == resume_id)
        {
            return Ok(());
        }
        entries.insert(
            session_id.to_string(),
            ResumeEntry {
                resume_id: resume_id.to_string(),
                updated_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        self.save(&entries)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
