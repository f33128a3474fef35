use crate::SyncError;
use api_client::{
    decode_row, tables, GalleryRecord, Query, RemoteDataStore, RemoteObjectStore, GALLERY_BUCKET,
};
use auth::AuthContext;
use cache::{GalleryState, GalleryStateStore};
use futures::future::try_join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

pub const DEFAULT_SIGNED_URL_EXPIRY_SECS: u64 = 3600;

/// Longest wait between retries of a failing periodic refresh.
const MAX_BACKOFF_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryImage {
    pub identity_path: String,
    pub access_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Remote identity paths match the cached ones; nothing was signed.
    Unchanged,
    /// Local state was replaced with `count` freshly signed images.
    Replaced { count: usize },
    /// The refresh was abandoned and the previous state kept.
    Failed(String),
    /// No signed-in user.
    Unauthenticated,
}

/// Reconciles the locally cached gallery with the backend.
///
/// Change detection only looks at the ordered identity paths: access URLs are
/// re-signed to different strings on every request, so diffing them would
/// re-sign the whole gallery on every refresh.
pub struct GalleryReconciler {
    data: Arc<dyn RemoteDataStore>,
    objects: Arc<dyn RemoteObjectStore>,
    auth: Arc<dyn AuthContext>,
    state_store: GalleryStateStore,
    gallery_tx: watch::Sender<GalleryState>,
    // Set while the in-memory gallery is newer than the durable copy.
    persist_pending: AtomicBool,
    expiry_secs: u64,
}

impl GalleryReconciler {
    /// Loads the durable state immediately so the gallery can be shown before
    /// the first network round trip.
    pub fn new(
        data: Arc<dyn RemoteDataStore>,
        objects: Arc<dyn RemoteObjectStore>,
        auth: Arc<dyn AuthContext>,
        state_store: GalleryStateStore,
    ) -> Self {
        let initial = state_store.load();
        tracing::info!(cached = initial.len(), "Loaded cached gallery state");
        let (gallery_tx, _) = watch::channel(initial);
        GalleryReconciler {
            data,
            objects,
            auth,
            state_store,
            gallery_tx,
            persist_pending: AtomicBool::new(false),
            expiry_secs: DEFAULT_SIGNED_URL_EXPIRY_SECS,
        }
    }

    pub fn with_signed_url_expiry(mut self, secs: u64) -> Self {
        self.expiry_secs = secs;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<GalleryState> {
        self.gallery_tx.subscribe()
    }

    pub fn gallery(&self) -> GalleryState {
        self.gallery_tx.borrow().clone()
    }

    pub fn images(&self) -> Vec<GalleryImage> {
        self.gallery_tx
            .borrow()
            .iter()
            .map(|(path, url)| GalleryImage {
                identity_path: path.to_string(),
                access_url: url.to_string(),
            })
            .collect()
    }

    /// Refresh the gallery of the signed-in user.
    pub async fn refresh_current(&self) -> RefreshOutcome {
        match self.auth.current_user_id() {
            Some(user_id) => self.refresh(&user_id).await,
            None => {
                tracing::debug!("Skipping gallery refresh, not signed in");
                RefreshOutcome::Unauthenticated
            }
        }
    }

    /// Fetch the remote identity paths for `user_id` and, only if they differ
    /// from the cached ones, re-sign every image and replace local state.
    ///
    /// Failures are logged and leave the previous state untouched.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self)))]
    pub async fn refresh(&self, user_id: &str) -> RefreshOutcome {
        let start = Instant::now();
        let remote_paths = match self.fetch_identity_paths(user_id).await {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(error = %e, user_id, "Gallery refresh failed, keeping cached state");
                return RefreshOutcome::Failed(e.to_string());
            }
        };

        let unchanged = self.gallery_tx.borrow().identity_paths() == remote_paths.as_slice();
        if unchanged {
            tracing::debug!(count = remote_paths.len(), "Gallery unchanged");
            if self.persist_pending.load(Ordering::SeqCst) {
                let current = self.gallery_tx.borrow().clone();
                self.persist(&current);
            }
            return RefreshOutcome::Unchanged;
        }

        let urls = match self.sign_all(&remote_paths).await {
            Ok(urls) => urls,
            Err(e) => {
                tracing::warn!(error = %e, user_id, "Signing gallery URLs failed, keeping cached state");
                return RefreshOutcome::Failed(e.to_string());
            }
        };

        let count = remote_paths.len();
        let state = GalleryState::new(remote_paths.into_iter().zip(urls).collect());
        self.persist(&state);
        self.gallery_tx.send_replace(state);
        tracing::info!(
            "refresh_time_ms" = %start.elapsed().as_millis(),
            count,
            "Gallery replaced"
        );
        RefreshOutcome::Replaced { count }
    }

    /// Save `state`. A failed save is retried by the next unchanged refresh,
    /// since change detection alone would never rewrite it.
    fn persist(&self, state: &GalleryState) {
        match self.state_store.save(state) {
            Ok(()) => {
                if self.persist_pending.swap(false, Ordering::SeqCst) {
                    tracing::info!(count = state.len(), "Persisted gallery state after earlier failure");
                }
            }
            Err(e) => {
                self.persist_pending.store(true, Ordering::SeqCst);
                tracing::error!(error = %e, "Failed to persist gallery state, will retry");
            }
        }
    }

    async fn fetch_identity_paths(&self, user_id: &str) -> Result<Vec<String>, SyncError> {
        let query = Query::new().eq("user_id", user_id).order_desc("created_at");
        let rows = self.data.query(tables::GALLERY, &query).await?;
        let mut paths = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode_row::<GalleryRecord>(row) {
                Ok(record) => paths.push(record.identity_path),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed gallery record"),
            }
        }
        Ok(paths)
    }

    async fn sign_all(&self, paths: &[String]) -> Result<Vec<String>, SyncError> {
        let requests = paths
            .iter()
            .map(|path| self.objects.signed_url(GALLERY_BUCKET, path, self.expiry_secs));
        Ok(try_join_all(requests).await?)
    }

    /// Refresh every `interval` until the returned sender fires or is dropped.
    /// Failed refreshes are retried with exponential backoff.
    pub fn start_periodic_refresh(
        self: Arc<Self>,
        interval: Duration,
        outcomes: Option<mpsc::UnboundedSender<RefreshOutcome>>,
    ) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut backoff = 1u64;
            loop {
                let wait = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    outcome = self.refresh_current() => {
                        let wait = match &outcome {
                            RefreshOutcome::Failed(reason) => {
                                let wait = backoff.min(MAX_BACKOFF_SECS);
                                tracing::error!(reason = %reason, backoff = wait, "Periodic refresh failed");
                                backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                                Duration::from_secs(wait)
                            }
                            _ => {
                                backoff = 1;
                                interval
                            }
                        };
                        if let Some(tx) = &outcomes {
                            if tx.send(outcome).is_err() {
                                tracing::debug!("Refresh outcome receiver dropped");
                            }
                        }
                        wait
                    }
                };
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = sleep(wait) => {}
                }
            }
            tracing::info!("Periodic gallery refresh stopped");
        });
        (handle, shutdown_tx)
    }
}
