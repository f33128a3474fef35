use crate::config::AppConfig;
use api_client::{
    BackendClient, HttpImageSource, HttpTransformApi, ImageSource, RemoteDataStore,
    RemoteObjectStore,
};
use auth::{AuthError, Session, SessionAuth, SessionStore};
use cache::{CacheError, CacheLimits, GalleryStateStore, ImageCache, SqliteBlobStore};
use feed::FeedPaginator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use sync::{GalleryReconciler, ImageLoader, InFlightJobTracker, TransformPipeline};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Auth Error: {0}")]
    Auth(#[from] AuthError),
    #[error("Cache Error: {0}")]
    Cache(#[from] CacheError),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every long-lived component, built once and shared by reference.
pub struct AppContext {
    pub config: AppConfig,
    pub backend: BackendClient,
    pub auth: Arc<SessionAuth>,
    pub blobs: Arc<SqliteBlobStore>,
    pub reconciler: Arc<GalleryReconciler>,
    pub tracker: InFlightJobTracker,
    pub loader: ImageLoader,
    pub pipeline: Arc<TransformPipeline>,
    pub feed: FeedPaginator,
}

impl AppContext {
    pub fn build(config: AppConfig) -> Result<Self, AppError> {
        std::fs::create_dir_all(&config.cache_path)?;
        let backend = BackendClient::new(&config.backend_url, &config.backend_anon_key);
        let auth = Arc::new(SessionAuth::new(
            &config.backend_url,
            &config.backend_anon_key,
            SessionStore::from_env(),
        ));
        let blobs = Arc::new(SqliteBlobStore::new(&config.db_path())?);

        let data: Arc<dyn RemoteDataStore> = Arc::new(backend.clone());
        let objects: Arc<dyn RemoteObjectStore> = Arc::new(backend.clone());
        let reconciler = Arc::new(
            GalleryReconciler::new(
                Arc::clone(&data),
                Arc::clone(&objects),
                auth.clone(),
                GalleryStateStore::new(blobs.clone()),
            )
            .with_signed_url_expiry(config.signed_url_expiry_secs),
        );

        let timeout = Duration::from_secs(config.fetch_timeout_secs);
        let images: Arc<dyn ImageSource> = Arc::new(HttpImageSource::new(timeout));
        let cache = ImageCache::new(CacheLimits {
            max_entries: config.image_cache_entries,
            max_bytes: config.image_cache_bytes,
        });
        let loader = ImageLoader::new(Arc::clone(&images), cache).with_timeout(timeout);

        let tracker = InFlightJobTracker::new();
        let transform = Arc::new(HttpTransformApi::new(
            &config.transform_url,
            &config.backend_anon_key,
        ));
        let pipeline = Arc::new(
            TransformPipeline::new(
                transform,
                images,
                Arc::clone(&data),
                objects,
                auth.clone(),
                tracker.clone(),
                reconciler.clone(),
            )
            .with_image_loader(loader.clone()),
        );
        let feed = FeedPaginator::new(data, auth.clone());

        Ok(AppContext {
            config,
            backend,
            auth,
            blobs,
            reconciler,
            tracker,
            loader,
            pipeline,
            feed,
        })
    }

    /// Restore the stored session, refreshing it when it is about to expire,
    /// and authorize backend requests with it.
    pub async fn restore_session(&self) -> Result<Option<Session>, AuthError> {
        if self.auth.restore()?.is_none() {
            return Ok(None);
        }
        let session = self.auth.ensure_valid().await?;
        self.backend
            .set_access_token(Some(session.access_token.clone()));
        Ok(Some(session))
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let session = self.auth.sign_in_with_password(email, password).await?;
        self.backend
            .set_access_token(Some(session.access_token.clone()));
        Ok(session)
    }

    /// Refresh the session in the background and hand every refreshed access
    /// token to the backend client.
    pub fn start_token_refresh(
        &self,
        interval: Duration,
        error_tx: Option<mpsc::UnboundedSender<AuthError>>,
    ) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let backend = self.backend.clone();
        Arc::clone(&self.auth).start_token_refresh_task(
            interval,
            move |session: &Session| backend.set_access_token(Some(session.access_token.clone())),
            error_tx,
        )
    }

    pub fn sign_out(&self) -> Result<(), AuthError> {
        self.backend.set_access_token(None);
        self.auth.sign_out()
    }
}
