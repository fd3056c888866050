//! Config entries
//!
//! A config entry is one configured instance of an integration: its
//! connection data plus user-adjustable options. Entries are created from the
//! config file; integrations may migrate their options during setup.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),
}

/// A configured integration instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub domain: String,
    pub title: String,
    pub disabled: bool,
    pub data: Map<String, Value>,
    pub options: Map<String, Value>,
}

impl ConfigEntry {
    pub fn new(
        entry_id: impl Into<String>,
        domain: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: entry_id.into(),
            domain: domain.into(),
            title: title.into(),
            disabled: false,
            data: Map::new(),
            options: Map::new(),
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_options(mut self, options: Map<String, Value>) -> Self {
        self.options = options;
        self
    }

    /// Deserialize the entry data into an integration's typed config
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.data.clone()))
    }

    /// Deserialize the entry options into an integration's typed options
    pub fn parse_options<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.options.clone()))
    }
}

/// Called with the updated entry whenever its options change
pub type UpdateListener = Arc<dyn Fn(&ConfigEntry) + Send + Sync>;

/// Returned by [`ConfigEntries::add_update_listener`], used to remove it again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    entry_id: String,
    id: u64,
}

/// All config entries known to the engine
#[derive(Default)]
pub struct ConfigEntries {
    entries: RwLock<HashMap<String, ConfigEntry>>,
    listeners: Mutex<HashMap<String, Vec<(u64, UpdateListener)>>>,
    next_listener_id: AtomicU64,
}

impl ConfigEntries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: ConfigEntry) -> Result<(), ConfigEntriesError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&entry.entry_id) {
            return Err(ConfigEntriesError::AlreadyExists(entry.entry_id));
        }

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        entries.insert(entry.entry_id.clone(), entry);
        Ok(())
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(entry_id).cloned()
    }

    /// Entry ids in sorted order
    pub fn entry_ids(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Replace an entry's options
    ///
    /// Update listeners run only when the options actually changed. Returns
    /// whether they did.
    pub fn update_options(
        &self,
        entry_id: &str,
        options: Map<String, Value>,
    ) -> Result<bool, ConfigEntriesError> {
        let updated = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let entry = entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
            if entry.options == options {
                return Ok(false);
            }
            entry.options = options;
            entry.clone()
        };
        debug!("Updated options of config entry: {}", entry_id);

        // Listeners may call back into ConfigEntries, so no lock is held here
        let listeners: Vec<UpdateListener> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners
                .get(entry_id)
                .map(|l| l.iter().map(|(_, f)| f.clone()).collect())
                .unwrap_or_default()
        };
        for listener in listeners {
            listener(&updated);
        }

        Ok(true)
    }

    pub fn add_update_listener(&self, entry_id: &str, listener: UpdateListener) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners
            .entry(entry_id.to_string())
            .or_default()
            .push((id, listener));

        ListenerHandle {
            entry_id: entry_id.to_string(),
            id,
        }
    }

    /// Remove a listener; returns false if it was already removed
    pub fn remove_listener(&self, handle: &ListenerHandle) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = listeners.get_mut(&handle.entry_id) else {
            return false;
        };

        let before = list.len();
        list.retain(|(id, _)| *id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(&handle.entry_id);
        }
        removed
    }

    pub fn listener_count(&self, entry_id: &str) -> usize {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.get(entry_id).map_or(0, Vec::len)
    }
}
