use crate::enrich::{enrich_post, lookup_author, lookup_authors, lookup_profile};
use crate::paginator::FeedPaginator;
use crate::{Comment, FeedError, FeedPost, ProfileDetails};
use api_client::{
    decode_row, encode_row, tables, CommentRow, Filter, NewComment, NewPost, PostRow, Query,
};

impl FeedPaginator {
    fn require_user(&self) -> Result<String, FeedError> {
        self.auth
            .require_user()
            .map_err(|_| FeedError::Unauthenticated)
    }

    /// Comments on `post_id`, oldest first. Rows that fail to decode are
    /// skipped.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self)))]
    pub async fn load_comments(&self, post_id: &str) -> Result<Vec<Comment>, FeedError> {
        let query = Query::new().eq("post_id", post_id).order_asc("created_at");
        let rows = self.data.query(tables::COMMENTS, &query).await?;
        let decoded: Vec<CommentRow> = rows
            .iter()
            .filter_map(|row| match decode_row::<CommentRow>(row) {
                Ok(comment) => Some(comment),
                Err(e) => {
                    tracing::warn!(post_id, error = %e, "Skipping malformed comment");
                    None
                }
            })
            .collect();
        let authors =
            lookup_authors(self.data.as_ref(), decoded.iter().map(|c| c.user_id.as_str())).await;
        Ok(decoded
            .into_iter()
            .map(|row| {
                let author = authors.get(&row.user_id).cloned();
                comment_from_row(row, author)
            })
            .collect())
    }

    pub async fn add_comment(&self, post_id: &str, content: &str) -> Result<Comment, FeedError> {
        let user_id = self.require_user()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(FeedError::InvalidInput("comment is empty".into()));
        }
        let new = NewComment {
            post_id: post_id.to_string(),
            user_id: user_id.clone(),
            content: content.to_string(),
        };
        let inserted = self.data.insert(tables::COMMENTS, encode_row(&new)?).await?;
        let row: CommentRow = decode_row(&inserted)?;

        {
            let mut state = self.lock();
            if let Some(post) = state.post_mut(post_id) {
                post.comment_count += 1;
                self.publish(&state);
            }
        }
        let author = lookup_author(self.data.as_ref(), &user_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Author lookup failed for new comment");
                None
            });
        Ok(comment_from_row(row, author))
    }

    /// Publish a post and put it at the top of the loaded feed.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self)))]
    pub async fn create_post(
        &self,
        image_url: &str,
        caption: Option<&str>,
    ) -> Result<FeedPost, FeedError> {
        let user_id = self.require_user()?;
        if image_url.trim().is_empty() {
            return Err(FeedError::InvalidInput("image URL is empty".into()));
        }
        let new = NewPost {
            user_id: user_id.clone(),
            image_url: image_url.to_string(),
            caption: caption
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        };
        let inserted = self.data.insert(tables::POSTS, encode_row(&new)?).await?;
        let row: PostRow = decode_row(&inserted)?;
        let post = enrich_post(self.data.as_ref(), row, Some(&user_id)).await;

        let mut state = self.lock();
        if state.post_mut(post.id()).is_none() {
            state.posts.insert(0, post.clone());
            // Everything already loaded moved down by one remotely.
            state.next_offset += 1;
            self.publish(&state);
        }
        tracing::info!(post_id = %post.id(), "Post created");
        Ok(post)
    }

    /// Delete one of the signed-in user's posts together with its likes and
    /// comments.
    ///
    /// Ownership is checked before anything is deleted, and the post row goes
    /// first so a rejected delete never strips a post of its dependents.
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self)))]
    pub async fn delete_post(&self, post_id: &str) -> Result<(), FeedError> {
        let user_id = self.require_user()?;
        let owned = self
            .data
            .query(
                tables::POSTS,
                &Query::new()
                    .eq("id", post_id)
                    .eq("user_id", user_id.as_str())
                    .limit(1),
            )
            .await?;
        if owned.is_empty() {
            return Err(FeedError::NotFoundOrForbidden);
        }

        self.data
            .delete(
                tables::POSTS,
                &[Filter::eq("id", post_id), Filter::eq("user_id", user_id.as_str())],
            )
            .await?;
        for table in [tables::LIKES, tables::COMMENTS] {
            if let Err(e) = self.data.delete(table, &[Filter::eq("post_id", post_id)]).await {
                tracing::warn!(post_id, table, error = %e, "Failed to delete post dependents");
            }
        }

        let mut state = self.lock();
        let before = state.posts.len();
        state.posts.retain(|p| p.post.id != post_id);
        if state.posts.len() != before {
            state.next_offset = state.next_offset.saturating_sub(1);
            self.publish(&state);
        }
        tracing::info!(post_id, "Post deleted");
        Ok(())
    }

    pub async fn load_profile(&self, user_id: &str) -> Result<ProfileDetails, FeedError> {
        let profile = lookup_profile(self.data.as_ref(), user_id)
            .await?
            .ok_or(FeedError::NotFoundOrForbidden)?;
        let post_count = self
            .data
            .count(tables::POSTS, &[Filter::eq("user_id", user_id)])
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id, error = %e, "Post count failed");
                0
            });
        Ok(ProfileDetails {
            id: profile.id,
            username: profile.username,
            full_name: profile.full_name,
            avatar_url: profile.avatar_url,
            bio: profile.bio,
            post_count,
        })
    }
}

fn comment_from_row(row: CommentRow, author: Option<crate::AuthorProfile>) -> Comment {
    Comment {
        id: row.id,
        post_id: row.post_id,
        user_id: row.user_id,
        content: row.content,
        created_at: row.created_at,
        author,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_client::ApiClientError;
    use mocks::{FakeDataStore, StaticAuth};
    use serde_json::json;
    use std::sync::Arc;

    fn fixture(user: &str) -> (Arc<FakeDataStore>, FeedPaginator) {
        let data = Arc::new(FakeDataStore::new());
        data.seed(
            tables::PROFILES,
            vec![
                json!({ "id": "u1", "username": "ana", "bio": "hi" }),
                json!({ "id": "u2", "username": "bo" }),
            ],
        );
        data.seed(
            tables::POSTS,
            vec![
                json!({ "id": "p1", "user_id": "u1", "image_url": "https://img/1.png", "created_at": "2024-01-01T00:00:00Z" }),
                json!({ "id": "p2", "user_id": "u2", "image_url": "https://img/2.png", "created_at": "2024-01-02T00:00:00Z" }),
            ],
        );
        let feed = FeedPaginator::new(data.clone(), Arc::new(StaticAuth::signed_in(user)));
        (data, feed)
    }

    #[tokio::test]
    async fn test_comments_skip_bad_rows_and_carry_authors() {
        let (data, feed) = fixture("u1");
        data.seed(
            tables::COMMENTS,
            vec![
                json!({ "id": "c2", "post_id": "p1", "user_id": "u2", "content": "second", "created_at": "2024-01-03T00:00:00Z" }),
                json!({ "id": "c1", "post_id": "p1", "user_id": "u1", "content": "first", "created_at": "2024-01-02T00:00:00Z" }),
                json!({ "id": "c3", "post_id": "p1", "created_at": "2024-01-04T00:00:00Z" }),
            ],
        );
        let comments = feed.load_comments("p1").await.unwrap();
        let contents: Vec<&str> = comments.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);
        assert_eq!(comments[1].author.as_ref().unwrap().username, "bo");
    }

    #[tokio::test]
    async fn test_add_comment_updates_count() {
        let (data, feed) = fixture("u1");
        feed.load_first_page(20).await.unwrap();
        let comment = feed.add_comment("p2", "  nice  ").await.unwrap();
        assert_eq!(comment.content, "nice");
        assert_eq!(comment.author.unwrap().username, "ana");
        assert_eq!(feed.post("p2").unwrap().comment_count, 1);
        assert_eq!(data.rows(tables::COMMENTS).len(), 1);

        assert!(matches!(
            feed.add_comment("p2", "   ").await,
            Err(FeedError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_create_post_goes_on_top() {
        let (_data, feed) = fixture("u1");
        feed.load_first_page(20).await.unwrap();
        let post = feed
            .create_post("https://img/new.png", Some("  "))
            .await
            .unwrap();
        assert!(post.post.caption.is_none());
        assert_eq!(post.author.as_ref().unwrap().username, "ana");
        assert_eq!(feed.posts()[0].id(), post.id());
        assert_eq!(feed.posts().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_post_rejects_foreign_post() {
        let (data, feed) = fixture("u1");
        data.seed(tables::LIKES, vec![json!({ "post_id": "p2", "user_id": "u1" })]);
        assert_eq!(
            feed.delete_post("p2").await.unwrap_err(),
            FeedError::NotFoundOrForbidden
        );
        assert_eq!(data.rows(tables::POSTS).len(), 2);
        assert_eq!(data.rows(tables::LIKES).len(), 1);
        assert_eq!(data.call_count("delete", tables::LIKES), 0);
    }

    #[tokio::test]
    async fn test_delete_post_removes_dependents() {
        let (data, feed) = fixture("u1");
        data.seed(tables::LIKES, vec![json!({ "post_id": "p1", "user_id": "u2" })]);
        data.seed(
            tables::COMMENTS,
            vec![json!({ "id": "c1", "post_id": "p1", "user_id": "u2", "content": "x", "created_at": "2024-01-02T00:00:00Z" })],
        );
        feed.load_first_page(20).await.unwrap();
        feed.delete_post("p1").await.unwrap();
        assert_eq!(data.rows(tables::POSTS).len(), 1);
        assert!(data.rows(tables::LIKES).is_empty());
        assert!(data.rows(tables::COMMENTS).is_empty());
        assert!(feed.post("p1").is_none());
    }

    #[tokio::test]
    async fn test_failed_post_delete_leaves_dependents() {
        let (data, feed) = fixture("u1");
        data.seed(tables::LIKES, vec![json!({ "post_id": "p1", "user_id": "u2" })]);
        data.fail("delete", tables::POSTS, ApiClientError::Unauthorized);
        assert!(feed.delete_post("p1").await.is_err());
        assert_eq!(data.rows(tables::LIKES).len(), 1);
    }

    #[tokio::test]
    async fn test_load_profile() {
        let (_data, feed) = fixture("u1");
        let profile = feed.load_profile("u1").await.unwrap();
        assert_eq!(profile.username, "ana");
        assert_eq!(profile.bio.as_deref(), Some("hi"));
        assert_eq!(profile.post_count, 1);
        assert_eq!(
            feed.load_profile("ghost").await.unwrap_err(),
            FeedError::NotFoundOrForbidden
        );
    }

    #[tokio::test]
    async fn test_mutations_require_sign_in() {
        let data = Arc::new(FakeDataStore::new());
        let feed = FeedPaginator::new(data, Arc::new(StaticAuth::anonymous()));
        assert_eq!(
            feed.create_post("https://img/x.png", None).await.unwrap_err(),
            FeedError::Unauthenticated
        );
        assert_eq!(
            feed.add_comment("p1", "hi").await.unwrap_err(),
            FeedError::Unauthenticated
        );
        assert_eq!(
            feed.delete_post("p1").await.unwrap_err(),
            FeedError::Unauthenticated
        );
    }
}
