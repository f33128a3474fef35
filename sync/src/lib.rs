//! Synchronization module: keeps the local gallery in step with the backend,
//! tracks background transformations and warms the image cache.

mod image_loader;
mod jobs;
mod pipeline;
mod reconciler;

pub use image_loader::{ImageLoader, ImageLoaderError, DEFAULT_FETCH_TIMEOUT};
pub use jobs::{
    InFlightJobTracker, JobGuard, JobState, Notification, NotificationKind, TransformJob,
    CANCELLED_MESSAGE, ERROR_DISMISS_AFTER, SUCCESS_DISMISS_AFTER,
};
pub use pipeline::{PipelineError, TransformPipeline};
pub use reconciler::{GalleryImage, GalleryReconciler, RefreshOutcome, DEFAULT_SIGNED_URL_EXPIRY_SECS};

use api_client::ApiClientError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("Not signed in")]
    Unauthenticated,
    #[error("API Client Error: {0}")]
    ApiClientError(#[from] ApiClientError),
    #[error("Cache Error: {0}")]
    CacheError(String),
    #[error("Other Error: {0}")]
    Other(String),
}
