use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::MutexGuard;

/// Per-entry runtime data of one integration, keyed by entry id
///
/// Created by the integration factory and handed to the integration, so
/// nothing reaches for shared global state. Clones refer to the same map.
pub struct EntryStore<T> {
    inner: Arc<Mutex<HashMap<String, T>>>,
}

impl<T> EntryStore<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, HashMap<String, T>> {
        self.inner.lock().await
    }

    pub async fn insert(&self, entry_id: impl Into<String>, value: T) -> Option<T> {
        self.inner.lock().await.insert(entry_id.into(), value)
    }

    pub async fn remove(&self, entry_id: &str) -> Option<T> {
        self.inner.lock().await.remove(entry_id)
    }

    pub async fn contains(&self, entry_id: &str) -> bool {
        self.inner.lock().await.contains_key(entry_id)
    }
}

impl<T> Clone for EntryStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for EntryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_entries() {
        let store: EntryStore<u32> = EntryStore::new();
        let other = store.clone();

        assert_eq!(store.insert("a", 1).await, None);
        assert!(other.contains("a").await);
        assert_eq!(other.insert("a", 2).await, Some(1));
        assert_eq!(store.remove("a").await, Some(2));
        assert!(!other.contains("a").await);
    }
}
