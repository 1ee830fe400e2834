//! Generation history, newest first, kept in client-local storage.
//!
//! The history is one JSON array stored under a single key of a
//! [`LocalStorage`]. It is never touched by the offline cache.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::RoninResult;
use crate::types::{HistoryItem, IMAGE_PROMPT_PREFIX};

/// A string key/value store persisted as one JSON file.
#[derive(Debug)]
pub struct LocalStorage {
    path: PathBuf,
    items: BTreeMap<String, String>,
}

impl LocalStorage {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> RoninResult<Self> {
        let path = path.into();
        let items = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, items })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_item(&self, key: &str) -> Option<&str> {
        self.items.get(key).map(String::as_str)
    }

    pub fn set_item(&mut self, key: &str, value: impl Into<String>) -> RoninResult<()> {
        self.items.insert(key.to_string(), value.into());
        self.flush()
    }

    pub fn remove_item(&mut self, key: &str) -> RoninResult<()> {
        if self.items.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> RoninResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string(&self.items)?)?;
        Ok(())
    }
}

/// History of generated visualizations.
#[derive(Debug)]
pub struct HistoryStore {
    storage: LocalStorage,
    key: String,
    items: Vec<HistoryItem>,
}

impl HistoryStore {
    /// Load the history kept under `key`.
    ///
    /// A stored value that does not parse is logged and treated as empty;
    /// it is overwritten by the next write.
    pub fn load(storage: LocalStorage, key: impl Into<String>) -> Self {
        let key = key.into();
        let items = match storage.get_item(&key) {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                log::error!("Failed to parse history under {}: {}", key, e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        log::debug!("Loaded {} history items", items.len());
        Self {
            storage,
            key,
            items,
        }
    }

    /// Items, newest first.
    pub fn items(&self) -> &[HistoryItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Record a successful generation at the front of the history.
    pub fn record(
        &mut self,
        prompt: &str,
        code: impl Into<String>,
        with_image: bool,
    ) -> RoninResult<&HistoryItem> {
        self.record_at(prompt, code, with_image, ronin_common::unix_millis())
    }

    fn record_at(
        &mut self,
        prompt: &str,
        code: impl Into<String>,
        with_image: bool,
        now: u64,
    ) -> RoninResult<&HistoryItem> {
        // Ids are timestamps; keep them unique within one millisecond.
        let timestamp = match self.items.first() {
            Some(newest) if newest.timestamp >= now => newest.timestamp + 1,
            _ => now,
        };
        let prompt = if with_image {
            format!("{}{}", IMAGE_PROMPT_PREFIX, prompt)
        } else {
            prompt.to_string()
        };

        self.items.insert(
            0,
            HistoryItem {
                id: timestamp.to_string(),
                prompt,
                code: code.into(),
                timestamp,
            },
        );
        self.persist()?;
        Ok(&self.items[0])
    }

    pub fn get(&self, id: &str) -> Option<&HistoryItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Remove every item.
    pub fn clear(&mut self) -> RoninResult<()> {
        self.items.clear();
        self.persist()?;
        log::info!("History cleared");
        Ok(())
    }

    fn persist(&mut self) -> RoninResult<()> {
        let raw = serde_json::to_string(&self.items)?;
        self.storage.set_item(&self.key, raw)
    }
}
