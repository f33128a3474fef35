use crate::enrich::enrich_page;
use crate::{FeedError, FeedPost};
use api_client::{
    decode_row, encode_row, tables, ApiClientError, Filter, LikeRow, PostRow, Query,
    RemoteDataStore,
};
use auth::AuthContext;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;

pub const DEFAULT_PAGE_SIZE: usize = 20;

pub(crate) struct FeedState {
    pub(crate) posts: Vec<FeedPost>,
    pub(crate) next_offset: usize,
    pub(crate) has_more: bool,
    loading: bool,
    // Bumped by every first-page load so an older next-page result is dropped.
    generation: u64,
}

impl Default for FeedState {
    fn default() -> Self {
        FeedState {
            posts: Vec::new(),
            next_offset: 0,
            has_more: true,
            loading: false,
            generation: 0,
        }
    }
}

impl FeedState {
    pub(crate) fn post_mut(&mut self, post_id: &str) -> Option<&mut FeedPost> {
        self.posts.iter_mut().find(|p| p.post.id == post_id)
    }
}

/// Clears `loading` if a page load is dropped mid-fetch. A newer load owns
/// the flag once the generation moves on. A load that completes disarms the
/// guard while holding the state lock and clears the flag itself.
struct LoadingGuard<'a> {
    paginator: &'a FeedPaginator,
    generation: u64,
    armed: bool,
}

impl<'a> LoadingGuard<'a> {
    fn new(paginator: &'a FeedPaginator, generation: u64) -> Self {
        LoadingGuard {
            paginator,
            generation,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(generation = self.generation, "Page load dropped before finishing");
        let mut state = self.paginator.lock();
        if state.generation == self.generation {
            state.loading = false;
        }
    }
}

/// Offset-based loader for the public feed.
///
/// Pages are appended in fetch order and never re-sorted. At most one page load
/// runs at a time; extra `load_next_page` calls while one is in flight return
/// immediately.
pub struct FeedPaginator {
    pub(crate) data: Arc<dyn RemoteDataStore>,
    pub(crate) auth: Arc<dyn AuthContext>,
    state: Mutex<FeedState>,
    posts_tx: watch::Sender<Vec<FeedPost>>,
}

impl FeedPaginator {
    pub fn new(data: Arc<dyn RemoteDataStore>, auth: Arc<dyn AuthContext>) -> Self {
        let (posts_tx, _) = watch::channel(Vec::new());
        FeedPaginator {
            data,
            auth,
            state: Mutex::new(FeedState::default()),
            posts_tx,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn publish(&self, state: &FeedState) {
        self.posts_tx.send_replace(state.posts.clone());
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<FeedPost>> {
        self.posts_tx.subscribe()
    }

    pub fn posts(&self) -> Vec<FeedPost> {
        self.lock().posts.clone()
    }

    pub fn post(&self, post_id: &str) -> Option<FeedPost> {
        self.lock().posts.iter().find(|p| p.post.id == post_id).cloned()
    }

    pub fn has_more(&self) -> bool {
        self.lock().has_more
    }

    pub fn is_loading(&self) -> bool {
        self.lock().loading
    }

    /// Reset and load the first page, replacing every loaded post.
    /// Returns the number of posts now shown.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self)))]
    pub async fn load_first_page(&self, page_size: usize) -> Result<usize, FeedError> {
        check_page_size(page_size)?;
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.loading = true;
            state.generation
        };
        let guard = LoadingGuard::new(self, generation);

        let result = self.fetch_page(0, page_size).await;

        let mut state = self.lock();
        guard.disarm();
        if state.generation != generation {
            return Ok(0);
        }
        state.loading = false;
        let (fetched, page) = result?;
        state.posts.clear();
        append_unique(&mut state.posts, page);
        state.next_offset = fetched;
        state.has_more = fetched == page_size;
        self.publish(&state);
        Ok(state.posts.len())
    }

    /// Append the next page. A no-op returning `Ok(0)` while another load is in
    /// flight or once the feed is exhausted.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self)))]
    pub async fn load_next_page(&self, page_size: usize) -> Result<usize, FeedError> {
        check_page_size(page_size)?;
        let (generation, offset) = {
            let mut state = self.lock();
            if state.loading || !state.has_more {
                tracing::debug!(
                    loading = state.loading,
                    has_more = state.has_more,
                    "Skipping next page"
                );
                return Ok(0);
            }
            state.loading = true;
            (state.generation, state.next_offset)
        };
        let guard = LoadingGuard::new(self, generation);

        let result = self.fetch_page(offset, page_size).await;

        let mut state = self.lock();
        guard.disarm();
        if state.generation != generation {
            tracing::debug!("Discarding page fetched before a reset");
            return Ok(0);
        }
        state.loading = false;
        let (fetched, page) = result?;
        let appended = append_unique(&mut state.posts, page);
        state.next_offset += fetched;
        state.has_more = fetched == page_size;
        self.publish(&state);
        Ok(appended)
    }

    /// Fetch and enrich one page. Returns the raw row count alongside the
    /// posts, since rows that fail to decode still advance the offset.
    async fn fetch_page(
        &self,
        offset: usize,
        page_size: usize,
    ) -> Result<(usize, Vec<FeedPost>), FeedError> {
        let start = Instant::now();
        let query = Query::new()
            .order_desc("created_at")
            .range(offset, page_size);
        let rows = self.data.query(tables::POSTS, &query).await?;
        let fetched = rows.len();
        let posts: Vec<PostRow> = rows
            .iter()
            .filter_map(|row| match decode_row::<PostRow>(row) {
                Ok(post) => Some(post),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed post");
                    None
                }
            })
            .collect();
        let viewer = self.auth.current_user_id();
        let page = enrich_page(self.data.as_ref(), posts, viewer.as_deref()).await;
        tracing::info!(
            "page_time_ms" = %start.elapsed().as_millis(),
            offset,
            fetched,
            "Loaded feed page"
        );
        Ok((fetched, page))
    }

    /// Flip the like on a loaded post.
    ///
    /// The local post changes before the backend is called. If the backend
    /// call fails the change is rolled back and the error returned.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self)))]
    pub async fn toggle_like(&self, post_id: &str) -> Result<bool, FeedError> {
        let user_id = self
            .auth
            .require_user()
            .map_err(|_| FeedError::Unauthenticated)?;
        let liked = {
            let mut state = self.lock();
            let post = state
                .post_mut(post_id)
                .ok_or(FeedError::NotFoundOrForbidden)?;
            post.is_liked = !post.is_liked;
            post.like_count = if post.is_liked {
                post.like_count + 1
            } else {
                post.like_count.saturating_sub(1)
            };
            let liked = post.is_liked;
            self.publish(&state);
            liked
        };

        let result = if liked {
            let like = LikeRow {
                post_id: post_id.to_string(),
                user_id: user_id.clone(),
            };
            match encode_row(&like) {
                Ok(row) => self.data.insert(tables::LIKES, row).await.map(|_| ()),
                Err(e) => Err(e),
            }
        } else {
            let filters = [
                Filter::eq("post_id", post_id),
                Filter::eq("user_id", user_id.as_str()),
            ];
            self.data.delete(tables::LIKES, &filters).await
        };

        if let Err(e) = result {
            tracing::warn!(post_id, error = %e, "Like toggle failed, rolling back");
            self.rollback_like(post_id, liked);
            return Err(FeedError::Remote(e));
        }
        Ok(liked)
    }

    fn rollback_like(&self, post_id: &str, applied: bool) {
        let mut state = self.lock();
        if let Some(post) = state.post_mut(post_id) {
            // Only undo our own flip, not a later one.
            if post.is_liked == applied {
                post.is_liked = !applied;
                post.like_count = if applied {
                    post.like_count.saturating_sub(1)
                } else {
                    post.like_count + 1
                };
                self.publish(&state);
            }
        }
    }

    /// Recompute `is_liked` for every loaded post. Posts whose lookup fails
    /// keep their previous flag.
    pub async fn backfill_like_status(&self) {
        let ids: Vec<String> = self.lock().posts.iter().map(|p| p.post.id.clone()).collect();
        let viewer = match self.auth.current_user_id() {
            Some(user_id) => user_id,
            None => {
                let mut state = self.lock();
                state.posts.iter_mut().for_each(|p| p.is_liked = false);
                self.publish(&state);
                return;
            }
        };
        let lookups = ids.iter().map(|id| {
            let viewer = viewer.as_str();
            async move { (id, crate::enrich::liked_by(self.data.as_ref(), id, viewer).await) }
        });
        let results = futures::future::join_all(lookups).await;

        let mut state = self.lock();
        let mut failed = 0;
        for (id, result) in results {
            match result {
                Ok(liked) => {
                    if let Some(post) = state.post_mut(id) {
                        post.is_liked = liked;
                    }
                }
                Err(_) => failed += 1,
            }
        }
        if failed > 0 {
            tracing::warn!(failed, "Like status backfill incomplete");
        }
        self.publish(&state);
    }
}

fn check_page_size(page_size: usize) -> Result<(), FeedError> {
    if page_size == 0 {
        return Err(FeedError::InvalidInput("page size must be positive".into()));
    }
    Ok(())
}

/// Append posts whose id is not present yet; returns how many were added.
pub(crate) fn append_unique(posts: &mut Vec<FeedPost>, page: Vec<FeedPost>) -> usize {
    let mut seen: HashSet<String> = posts.iter().map(|p| p.post.id.clone()).collect();
    let before = posts.len();
    for post in page {
        if seen.insert(post.post.id.clone()) {
            posts.push(post);
        }
    }
    posts.len() - before
}

#[cfg(test)]
mod tests {
    use super::*;
    use mocks::{FakeDataStore, StaticAuth};
    use serde_json::json;

    fn seed_posts(data: &FakeDataStore, n: usize) {
        let rows = (0..n)
            .map(|i| {
                json!({
                    "id": format!("p{:03}", i),
                    "user_id": "u2",
                    "image_url": format!("https://img/{}.png", i),
                    "created_at": format!("2024-01-01T00:{:02}:{:02}Z", i / 60, i % 60)
                })
            })
            .collect();
        data.seed(tables::POSTS, rows);
    }

    fn paginator(data: Arc<FakeDataStore>) -> FeedPaginator {
        FeedPaginator::new(data, Arc::new(StaticAuth::signed_in("u1")))
    }

    #[tokio::test]
    async fn test_pages_are_newest_first() {
        let data = Arc::new(FakeDataStore::new());
        seed_posts(&data, 3);
        let feed = paginator(data);
        assert_eq!(feed.load_first_page(2).await.unwrap(), 2);
        assert_eq!(feed.load_next_page(2).await.unwrap(), 1);
        let ids: Vec<String> = feed.posts().iter().map(|p| p.id().to_string()).collect();
        assert_eq!(ids, ["p002", "p001", "p000"]);
        assert!(!feed.has_more());
        assert_eq!(feed.load_next_page(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_page_size_rejected() {
        let feed = paginator(Arc::new(FakeDataStore::new()));
        assert!(matches!(
            feed.load_first_page(0).await,
            Err(FeedError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_post_skipped_but_counted() {
        let data = Arc::new(FakeDataStore::new());
        seed_posts(&data, 1);
        data.seed(tables::POSTS, vec![json!({ "id": "bad", "created_at": "2023-01-01T00:00:00Z" })]);
        let feed = paginator(data);
        assert_eq!(feed.load_first_page(2).await.unwrap(), 1);
        assert!(feed.has_more());
        assert_eq!(feed.load_next_page(2).await.unwrap(), 0);
        assert!(!feed.has_more());
    }

    #[tokio::test]
    async fn test_like_toggle_is_optimistic_and_persisted() {
        let data = Arc::new(FakeDataStore::new());
        seed_posts(&data, 1);
        let feed = paginator(data.clone());
        feed.load_first_page(20).await.unwrap();

        assert!(feed.toggle_like("p000").await.unwrap());
        let post = feed.post("p000").unwrap();
        assert!(post.is_liked);
        assert_eq!(post.like_count, 1);
        assert_eq!(data.rows(tables::LIKES).len(), 1);

        assert!(!feed.toggle_like("p000").await.unwrap());
        assert_eq!(feed.post("p000").unwrap().like_count, 0);
        assert!(data.rows(tables::LIKES).is_empty());
    }

    #[tokio::test]
    async fn test_like_failure_rolls_back() {
        let data = Arc::new(FakeDataStore::new());
        seed_posts(&data, 1);
        let feed = paginator(data.clone());
        feed.load_first_page(20).await.unwrap();
        data.fail("insert", tables::LIKES, ApiClientError::Timeout);

        let err = feed.toggle_like("p000").await.unwrap_err();
        assert_eq!(err, FeedError::Remote(ApiClientError::Timeout));
        let post = feed.post("p000").unwrap();
        assert!(!post.is_liked);
        assert_eq!(post.like_count, 0);
    }

    #[tokio::test]
    async fn test_like_requires_sign_in() {
        let data = Arc::new(FakeDataStore::new());
        seed_posts(&data, 1);
        let auth = Arc::new(StaticAuth::signed_in("u1"));
        let feed = FeedPaginator::new(data, auth.clone());
        feed.load_first_page(20).await.unwrap();
        auth.set_user(None);
        assert_eq!(
            feed.toggle_like("p000").await.unwrap_err(),
            FeedError::Unauthenticated
        );
        assert!(!feed.post("p000").unwrap().is_liked);
    }

    #[tokio::test]
    async fn test_backfill_updates_like_flags() {
        let data = Arc::new(FakeDataStore::new());
        seed_posts(&data, 2);
        let auth = Arc::new(StaticAuth::anonymous());
        let feed = FeedPaginator::new(data.clone(), auth.clone());
        feed.load_first_page(20).await.unwrap();
        assert!(feed.posts().iter().all(|p| !p.is_liked));

        data.seed(tables::LIKES, vec![json!({ "post_id": "p001", "user_id": "u1" })]);
        auth.set_user(Some("u1"));
        feed.backfill_like_status().await;
        assert!(feed.post("p001").unwrap().is_liked);
        assert!(!feed.post("p000").unwrap().is_liked);

        data.fail("count", tables::LIKES, ApiClientError::Timeout);
        feed.backfill_like_status().await;
        assert!(feed.post("p001").unwrap().is_liked);
    }

    #[test]
    fn test_append_unique_drops_duplicates() {
        let row = |id: &str| {
            let v = json!({ "id": id, "user_id": "u", "image_url": "x", "created_at": "2024-01-01T00:00:00Z" });
            FeedPost::bare(decode_row(v.as_object().unwrap()).unwrap())
        };
        let mut posts = vec![row("a"), row("b")];
        assert_eq!(append_unique(&mut posts, vec![row("b"), row("c")]), 1);
        assert_eq!(posts.len(), 3);
    }
}
