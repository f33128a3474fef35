use crate::{CacheError, DurableKeyValueStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const GALLERY_STATE_KEY: &str = "gallery_state";

/// Locally cached gallery: identity paths and their access URLs, kept as two
/// parallel sequences of equal length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryState {
    identity_paths: Vec<String>,
    access_urls: Vec<String>,
}

impl GalleryState {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        let (identity_paths, access_urls) = entries.into_iter().unzip();
        GalleryState {
            identity_paths,
            access_urls,
        }
    }

    /// `None` when the sequences differ in length.
    pub fn from_parallel(identity_paths: Vec<String>, access_urls: Vec<String>) -> Option<Self> {
        if identity_paths.len() != access_urls.len() {
            return None;
        }
        Some(GalleryState {
            identity_paths,
            access_urls,
        })
    }

    pub fn identity_paths(&self) -> &[String] {
        &self.identity_paths
    }

    pub fn access_urls(&self) -> &[String] {
        &self.access_urls
    }

    pub fn len(&self) -> usize {
        self.identity_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identity_paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.identity_paths
            .iter()
            .map(String::as_str)
            .zip(self.access_urls.iter().map(String::as_str))
    }

    pub fn access_url_for(&self, identity_path: &str) -> Option<&str> {
        self.iter()
            .find(|(path, _)| *path == identity_path)
            .map(|(_, url)| url)
    }
}

/// Durable copy of the gallery used for instant display at start-up.
///
/// Only the gallery reconciler writes through this type.
#[derive(Clone)]
pub struct GalleryStateStore {
    store: Arc<dyn DurableKeyValueStore>,
    key: String,
}

impl GalleryStateStore {
    pub fn new(store: Arc<dyn DurableKeyValueStore>) -> Self {
        Self::with_key(store, GALLERY_STATE_KEY)
    }

    pub fn with_key(store: Arc<dyn DurableKeyValueStore>, key: &str) -> Self {
        GalleryStateStore {
            store,
            key: key.to_string(),
        }
    }

    /// Read the cached state. Missing, unreadable or inconsistent data all
    /// yield an empty state.
    pub fn load(&self) -> GalleryState {
        let bytes = match self.store.read_blob(&self.key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return GalleryState::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read cached gallery state");
                return GalleryState::default();
            }
        };
        match serde_json::from_slice::<GalleryState>(&bytes) {
            Ok(state) if state.identity_paths.len() == state.access_urls.len() => state,
            Ok(state) => {
                tracing::warn!(
                    paths = state.identity_paths.len(),
                    urls = state.access_urls.len(),
                    "Cached gallery state has mismatched lengths, discarding"
                );
                GalleryState::default()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cached gallery state is corrupt, discarding");
                GalleryState::default()
            }
        }
    }

    /// Replace the cached state as a whole.
    pub fn save(&self, state: &GalleryState) -> Result<(), CacheError> {
        let bytes =
            serde_json::to_vec(state).map_err(|e| CacheError::SerializationError(e.to_string()))?;
        self.store.write_blob(&self.key, &bytes)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.store.delete_blob(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBlobStore;

    fn sample() -> GalleryState {
        GalleryState::new(vec![
            ("u/p2".into(), "https://s/p2?t=1".into()),
            ("u/p1".into(), "https://s/p1?t=1".into()),
        ])
    }

    #[test]
    fn test_load_absent_is_empty() {
        let store = GalleryStateStore::new(Arc::new(MemoryBlobStore::new()));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let store = GalleryStateStore::new(Arc::new(MemoryBlobStore::new()));
        store.save(&sample()).unwrap();
        let loaded = store.load();
        assert_eq!(loaded, sample());
        assert_eq!(loaded.access_url_for("u/p1"), Some("https://s/p1?t=1"));
    }

    #[test]
    fn test_corrupt_blob_is_empty() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.write_blob(GALLERY_STATE_KEY, b"\x00not json").unwrap();
        let store = GalleryStateStore::new(blobs);
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_mismatched_lengths_are_empty() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs
            .write_blob(
                GALLERY_STATE_KEY,
                br#"{"identity_paths":["a","b"],"access_urls":["x"]}"#,
            )
            .unwrap();
        let store = GalleryStateStore::new(blobs);
        assert!(store.load().is_empty());
        assert!(GalleryState::from_parallel(vec!["a".into()], vec![]).is_none());
    }

    #[test]
    fn test_save_replaces_not_merges() {
        let store = GalleryStateStore::new(Arc::new(MemoryBlobStore::new()));
        store.save(&sample()).unwrap();
        let smaller = GalleryState::new(vec![("u/p9".into(), "https://s/p9".into())]);
        store.save(&smaller).unwrap();
        assert_eq!(store.load(), smaller);
        store.clear().unwrap();
        assert!(store.load().is_empty());
    }
}
