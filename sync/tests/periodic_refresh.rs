use api_client::{tables, ApiClientError};
use cache::{GalleryStateStore, MemoryBlobStore};
use mocks::{FakeDataStore, FakeObjectStore, StaticAuth};
use serde_json::json;
use std::sync::Arc;
use sync::{GalleryReconciler, RefreshOutcome};
use tokio::sync::mpsc;
use tokio::time::Duration;

fn reconciler(data: Arc<FakeDataStore>) -> Arc<GalleryReconciler> {
    Arc::new(GalleryReconciler::new(
        data,
        Arc::new(FakeObjectStore::new()),
        Arc::new(StaticAuth::signed_in("u1")),
        GalleryStateStore::new(Arc::new(MemoryBlobStore::new())),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_periodic_refresh_reports_and_stops() {
    let data = Arc::new(FakeDataStore::new());
    data.seed(
        tables::GALLERY,
        vec![json!({ "user_id": "u1", "storage_path": "p1", "created_at": "2024-01-01T00:00:00Z" })],
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (handle, shutdown) = reconciler(data).start_periodic_refresh(Duration::from_secs(60), Some(tx));

    assert_eq!(rx.recv().await, Some(RefreshOutcome::Replaced { count: 1 }));
    assert_eq!(rx.recv().await, Some(RefreshOutcome::Unchanged));

    shutdown.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_refresh_backs_off_on_failure() {
    let data = Arc::new(FakeDataStore::new());
    data.fail("query", tables::GALLERY, ApiClientError::Timeout);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (handle, shutdown) =
        reconciler(data.clone()).start_periodic_refresh(Duration::from_secs(3600), Some(tx));

    for _ in 0..3 {
        assert!(matches!(rx.recv().await, Some(RefreshOutcome::Failed(_))));
    }
    // Failures are retried after 1s, 2s, then 4s rather than a full interval.
    let start = tokio::time::Instant::now();
    data.clear_failures();
    assert_eq!(rx.recv().await, Some(RefreshOutcome::Unchanged));
    assert!(start.elapsed() <= Duration::from_secs(4));

    drop(shutdown);
    handle.await.unwrap();
}
