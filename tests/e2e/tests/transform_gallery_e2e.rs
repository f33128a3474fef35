use api_client::{ApiClientError, StyleParameters, GALLERY_BUCKET};
use bytes::Bytes;
use cache::{DurableKeyValueStore, GalleryStateStore, GALLERY_STATE_KEY};
use e2e::Client;
use std::sync::Arc;
use sync::{NotificationKind, RefreshOutcome};
use tokio::time::{sleep, Duration};

#[tokio::test(start_paused = true)]
async fn test_transformed_photo_lands_at_top_of_gallery() {
    let client = Client::signed_in("u1");
    client.seed_gallery("u1", &["u1/old-1.png", "u1/old-2.png"]);
    assert_eq!(
        client.reconciler.refresh("u1").await,
        RefreshOutcome::Replaced { count: 2 }
    );
    let signed_before = client.objects.signed_url_count();
    client.transform.set_delay(Some(Duration::from_secs(5)));

    let job = {
        let pipeline = Arc::clone(&client.pipeline);
        pipeline.spawn(
            "job1".to_string(),
            Bytes::from_static(b"raw-photo"),
            StyleParameters::default(),
        )
    };

    sleep(Duration::from_secs(1)).await;
    let n = client.tracker.notification().unwrap();
    assert_eq!(n.kind, NotificationKind::Transforming);
    assert_eq!(n.message, "Transforming image…");

    let record = job.await.unwrap().unwrap();
    assert_eq!(record.identity_path, "u1/job1.png");
    assert!(client.objects.object(GALLERY_BUCKET, "u1/job1.png").is_some());

    let n = client.tracker.notification().unwrap();
    assert_eq!(n.kind, NotificationKind::Success);
    assert_eq!(n.related_job_id.as_deref(), Some("job1"));

    let gallery = client.reconciler.gallery();
    assert_eq!(
        gallery.identity_paths(),
        [
            "u1/job1.png".to_string(),
            "u1/old-2.png".to_string(),
            "u1/old-1.png".to_string()
        ]
    );
    assert_eq!(client.objects.signed_url_count(), signed_before + 3);
    let stored = GalleryStateStore::new(client.blobs.clone()).load();
    assert_eq!(stored, gallery);
    assert_eq!(stored.identity_paths()[0], "u1/job1.png");

    sleep(Duration::from_secs(3)).await;
    assert!(client.tracker.notification().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_two_jobs_share_one_notification() {
    let client = Client::signed_in("u1");
    client.transform.set_delay(Some(Duration::from_secs(5)));

    let first = Arc::clone(&client.pipeline).spawn(
        "a".to_string(),
        Bytes::from_static(b"1"),
        StyleParameters::default(),
    );
    sleep(Duration::from_secs(1)).await;
    let second = Arc::clone(&client.pipeline).spawn(
        "b".to_string(),
        Bytes::from_static(b"2"),
        StyleParameters::default(),
    );
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        client.tracker.notification().unwrap().message,
        "Transforming 2 images…"
    );

    first.await.unwrap().unwrap();
    assert_eq!(
        client.tracker.notification().unwrap().kind,
        NotificationKind::Success
    );
    assert_eq!(client.tracker.active_count(), 1);

    second.await.unwrap().unwrap();
    assert_eq!(client.reconciler.gallery().len(), 2);
    sleep(Duration::from_secs(3)).await;
    assert!(client.tracker.notification().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_transform_leaves_gallery_alone() {
    let client = Client::signed_in("u1");
    client.seed_gallery("u1", &["u1/old-1.png"]);
    client.reconciler.refresh("u1").await;
    let blob = client.blobs.read_blob(GALLERY_STATE_KEY).unwrap();
    client
        .transform
        .set_outcome(Err(ApiClientError::BackendError {
            status: 429,
            message: "rate limited".into(),
        }));

    let err = client
        .pipeline
        .process("job1", Bytes::from_static(b"raw"), &StyleParameters::default())
        .await;
    assert!(err.is_err());
    let n = client.tracker.notification().unwrap();
    assert_eq!(n.kind, NotificationKind::Error);
    assert!(n.message.contains("rate limited"));
    assert_eq!(client.blobs.read_blob(GALLERY_STATE_KEY).unwrap(), blob);

    sleep(Duration::from_millis(3500)).await;
    assert!(client.tracker.notification().is_some());
    sleep(Duration::from_millis(600)).await;
    assert!(client.tracker.notification().is_none());
}
