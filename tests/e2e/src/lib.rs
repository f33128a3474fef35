//! Fully wired client over in-memory backends, shared by the end-to-end tests.

use api_client::tables;
use cache::{GalleryStateStore, MemoryBlobStore};
use feed::FeedPaginator;
use mocks::{FakeDataStore, FakeImageSource, FakeObjectStore, FakeTransformApi, StaticAuth};
use serde_json::json;
use std::sync::Arc;
use sync::{GalleryReconciler, InFlightJobTracker, TransformPipeline};

pub const RESULT_URL: &str = "https://transform.test/results/out.png";

pub struct Client {
    pub data: Arc<FakeDataStore>,
    pub objects: Arc<FakeObjectStore>,
    pub transform: Arc<FakeTransformApi>,
    pub images: Arc<FakeImageSource>,
    pub auth: Arc<StaticAuth>,
    pub blobs: Arc<MemoryBlobStore>,
    pub tracker: InFlightJobTracker,
    pub reconciler: Arc<GalleryReconciler>,
    pub pipeline: Arc<TransformPipeline>,
    pub feed: FeedPaginator,
}

impl Client {
    pub fn signed_in(user_id: &str) -> Self {
        let data = Arc::new(FakeDataStore::new());
        let objects = Arc::new(FakeObjectStore::new());
        let transform = Arc::new(FakeTransformApi::succeeding(RESULT_URL));
        let images = Arc::new(FakeImageSource::new());
        images.insert(RESULT_URL, b"styled-png");
        let auth = Arc::new(StaticAuth::signed_in(user_id));
        let blobs = Arc::new(MemoryBlobStore::new());
        let tracker = InFlightJobTracker::new();
        let reconciler = Arc::new(GalleryReconciler::new(
            data.clone(),
            objects.clone(),
            auth.clone(),
            GalleryStateStore::new(blobs.clone()),
        ));
        let pipeline = Arc::new(TransformPipeline::new(
            transform.clone(),
            images.clone(),
            data.clone(),
            objects.clone(),
            auth.clone(),
            tracker.clone(),
            reconciler.clone(),
        ));
        let feed = FeedPaginator::new(data.clone(), auth.clone());
        Client {
            data,
            objects,
            transform,
            images,
            auth,
            blobs,
            tracker,
            reconciler,
            pipeline,
            feed,
        }
    }

    /// Add gallery rows for `user_id`, one per path, newest last.
    pub fn seed_gallery(&self, user_id: &str, paths: &[&str]) {
        let rows = paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                json!({
                    "user_id": user_id,
                    "storage_path": path,
                    "created_at": format!("2024-02-0{}T12:00:00Z", i + 1)
                })
            })
            .collect();
        self.data.seed(tables::GALLERY, rows);
    }
}
