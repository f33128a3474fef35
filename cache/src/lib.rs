//! Cache module for the photo journal client.
//!
//! Holds the process-wide in-memory [`ImageCache`], the durable blob storage
//! behind [`DurableKeyValueStore`] and the [`GalleryStateStore`] built on it.

mod blob_store;
mod gallery_state;
mod image_cache;

pub use blob_store::{DurableKeyValueStore, MemoryBlobStore, SqliteBlobStore};
pub use gallery_state::{GalleryState, GalleryStateStore, GALLERY_STATE_KEY};
pub use image_cache::{CacheLimits, CacheStats, ImageCache};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Database Error: {0}")]
    DatabaseError(String),
    #[error("Serialization Error: {0}")]
    SerializationError(String),
    #[error("Other Error: {0}")]
    Other(String),
}
