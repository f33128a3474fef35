//! Image loading on top of the shared in-memory [`ImageCache`].

use api_client::{ApiClientError, ImageSource};
use bytes::Bytes;
use cache::ImageCache;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_CONCURRENT: usize = 4;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ImageLoaderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("image not found")]
    NotFound,
    #[error("fetch timed out")]
    Timeout,
    #[error("fetch cancelled")]
    Cancelled,
}

impl From<ApiClientError> for ImageLoaderError {
    fn from(e: ApiClientError) -> Self {
        match e {
            ApiClientError::NotFound => ImageLoaderError::NotFound,
            ApiClientError::Timeout => ImageLoaderError::Timeout,
            other => ImageLoaderError::Network(other.to_string()),
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes, ImageLoaderError>>>;

struct InFlight {
    id: u64,
    abort: AbortHandle,
    fetch: SharedFetch,
}

type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

fn lock(map: &InFlightMap) -> MutexGuard<'_, HashMap<String, InFlight>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fetches remote images into an [`ImageCache`].
///
/// Concurrent loads of the same key share one fetch. Each fetch runs as its own
/// task, so it completes and fills the cache even if every caller waiting on it
/// goes away. Every fetch is bounded by a timeout, and invalidating a key
/// cancels its fetch so a stale payload never lands in the cache.
#[derive(Clone)]
pub struct ImageLoader {
    source: Arc<dyn ImageSource>,
    cache: ImageCache<Bytes>,
    inflight: InFlightMap,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
}

impl ImageLoader {
    pub fn new(source: Arc<dyn ImageSource>, cache: ImageCache<Bytes>) -> Self {
        Self {
            source,
            cache,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            timeout: DEFAULT_FETCH_TIMEOUT,
            semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, permits: usize) -> Self {
        self.semaphore = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    pub fn cache(&self) -> &ImageCache<Bytes> {
        &self.cache
    }

    /// Load an image keyed by its own URL.
    pub async fn load(&self, url: &str) -> Result<Bytes, ImageLoaderError> {
        self.load_keyed(url, url).await
    }

    /// Return the cached payload for `key` or fetch it from `url`.
    ///
    /// Signed URLs change on every refresh, so callers pass the stable identity
    /// path as `key` to keep hitting the cache.
    pub async fn load_keyed(&self, key: &str, url: &str) -> Result<Bytes, ImageLoaderError> {
        if let Some(bytes) = self.cache.get(key) {
            return Ok(bytes);
        }
        let fetch = {
            // Held across spawn and insert so the fetch task cannot finish
            // before its entry exists.
            let mut inflight = lock(&self.inflight);
            match inflight.get(key) {
                Some(existing) => existing.fetch.clone(),
                None => {
                    let entry = self.start_fetch(key, url);
                    let fetch = entry.fetch.clone();
                    inflight.insert(key.to_string(), entry);
                    fetch
                }
            }
        };
        fetch.await
    }

    fn start_fetch(&self, key: &str, url: &str) -> InFlight {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let source = Arc::clone(&self.source);
        let semaphore = Arc::clone(&self.semaphore);
        let timeout = self.timeout;
        let url_owned = url.to_string();
        let download = async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| ImageLoaderError::Cancelled)?;
            let start = Instant::now();
            let bytes = tokio::time::timeout(timeout, source.fetch(&url_owned))
                .await
                .map_err(|_| ImageLoaderError::Timeout)??;
            tracing::debug!("image_fetch_time_ms" = %start.elapsed().as_millis(), bytes = bytes.len(), "Fetched image");
            Ok::<_, ImageLoaderError>(bytes)
        };

        let inflight = Arc::clone(&self.inflight);
        let cache = self.cache.clone();
        let key_owned = key.to_string();
        let task = tokio::spawn(async move {
            let result = download.await;
            let mut map = lock(&inflight);
            let current = map.get(&key_owned).map(|e| e.id) == Some(id);
            if current {
                map.remove(&key_owned);
            }
            drop(map);
            match &result {
                Ok(bytes) if current => {
                    let evicted = cache.put(key_owned.clone(), bytes.clone(), bytes.len());
                    if !evicted.is_empty() {
                        tracing::debug!(count = evicted.len(), "Evicted images from cache");
                    }
                }
                Ok(_) => tracing::debug!(key = %key_owned, "Discarding superseded image fetch"),
                Err(e) => tracing::warn!(key = %key_owned, error = %e, "Image fetch failed"),
            }
            result
        });
        let abort = task.abort_handle();
        let fetch = async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(ImageLoaderError::Cancelled),
                Err(e) => Err(ImageLoaderError::Network(e.to_string())),
            }
        }
        .boxed()
        .shared();

        InFlight { id, abort, fetch }
    }

    /// Drop `key` from the cache and cancel any fetch in progress for it.
    pub fn invalidate(&self, key: &str) {
        self.cancel(key);
        self.cache.remove(key);
    }

    /// Cancel the in-flight fetch for `key`; waiters get `Cancelled`.
    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.inflight).remove(key) {
            Some(entry) => {
                entry.abort.abort();
                tracing::debug!(key, "Cancelled image fetch");
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inflight).len()
    }

    /// Cancel every fetch and empty the cache.
    pub fn clear(&self) {
        let drained: Vec<InFlight> = lock(&self.inflight).drain().map(|(_, v)| v).collect();
        for entry in drained {
            entry.abort.abort();
        }
        self.cache.clear();
    }

    /// Warm the cache for `(key, url)` pairs; failures are only logged.
    pub async fn preload(&self, items: &[(String, String)]) {
        let start = Instant::now();
        futures::stream::iter(items.iter())
            .for_each_concurrent(None, |(key, url)| async move {
                if let Err(e) = self.load_keyed(key, url).await {
                    tracing::error!("Failed to preload image {}: {}", key, e);
                }
            })
            .await;
        tracing::info!("preload_time_ms" = %start.elapsed().as_millis(), "count" = items.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_client::HttpImageSource;
    use cache::CacheLimits;
    use httpmock::prelude::*;
    use mocks::FakeImageSource;

    fn loader(source: Arc<FakeImageSource>) -> ImageLoader {
        ImageLoader::new(source, ImageCache::new(CacheLimits::default()))
    }

    #[tokio::test]
    async fn test_second_load_hits_cache() {
        let source = Arc::new(FakeImageSource::new());
        source.insert("http://img/a", b"aaaa");
        let loader = loader(source.clone());
        assert_eq!(loader.load("http://img/a").await.unwrap(), Bytes::from_static(b"aaaa"));
        assert_eq!(loader.load("http://img/a").await.unwrap(), Bytes::from_static(b"aaaa"));
        assert_eq!(source.fetches(), 1);
        assert_eq!(loader.cache().total_bytes(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_share_one_fetch() {
        let source = Arc::new(FakeImageSource::new());
        source.insert("http://img/a", b"a");
        source.set_delay(Some(Duration::from_millis(100)));
        let loader = loader(source.clone());
        let (a, b) = tokio::join!(loader.load("http://img/a"), loader.load("http://img/a"));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(source.fetches(), 1);
        assert_eq!(loader.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out() {
        let source = Arc::new(FakeImageSource::new());
        source.insert("http://img/slow", b"s");
        source.set_delay(Some(Duration::from_secs(60)));
        let loader = loader(source).with_timeout(Duration::from_secs(5));
        let err = loader.load("http://img/slow").await.unwrap_err();
        assert_eq!(err, ImageLoaderError::Timeout);
        assert!(loader.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_cancels_fetch() {
        let source = Arc::new(FakeImageSource::new());
        source.insert("http://img/a", b"a");
        source.set_delay(Some(Duration::from_secs(1)));
        let loader = loader(source);
        let pending = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load_keyed("u1/a.png", "http://img/a").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(loader.in_flight(), 1);
        loader.invalidate("u1/a.png");
        assert_eq!(pending.await.unwrap(), Err(ImageLoaderError::Cancelled));
        assert!(!loader.cache().contains("u1/a.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_completes_after_waiter_gives_up() {
        let source = Arc::new(FakeImageSource::new());
        source.insert("http://img/a", b"aaaa");
        source.set_delay(Some(Duration::from_secs(1)));
        let loader = loader(source.clone());

        let attempt = tokio::time::timeout(
            Duration::from_millis(100),
            loader.load_keyed("u1/a.png", "http://img/a"),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(loader.in_flight(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(loader.in_flight(), 0);
        assert!(loader.cache().contains("u1/a.png"));
        assert_eq!(
            loader.load_keyed("u1/a.png", "http://img/a").await.unwrap(),
            Bytes::from_static(b"aaaa")
        );
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_missing_image_is_not_cached() {
        let source = Arc::new(FakeImageSource::new());
        let loader = loader(source.clone());
        assert_eq!(
            loader.load("http://img/none").await.unwrap_err(),
            ImageLoaderError::NotFound
        );
        assert!(loader.cache().is_empty());
        let _ = loader.load("http://img/none").await;
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_preload_warms_cache() {
        let source = Arc::new(FakeImageSource::new());
        source.insert("http://img/a", b"a");
        source.insert("http://img/b", b"bb");
        let loader = loader(source);
        loader
            .preload(&[
                ("a".to_string(), "http://img/a".to_string()),
                ("b".to_string(), "http://img/b".to_string()),
                ("c".to_string(), "http://img/c".to_string()),
            ])
            .await;
        assert!(loader.cache().contains("a"));
        assert!(loader.cache().contains("b"));
        assert!(!loader.cache().contains("c"));
    }

    #[tokio::test]
    async fn test_load_over_http() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/photo.png");
            then.status(200).body("png-bytes");
        });
        let source = Arc::new(HttpImageSource::new(Duration::from_secs(5)));
        let loader = ImageLoader::new(source, ImageCache::new(CacheLimits::default()));
        let bytes = loader.load(&server.url("/photo.png")).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"png-bytes"));
        mock.assert();
    }
}
