use crate::{AuthorProfile, FeedPost};
use api_client::{
    decode_row, tables, ApiClientError, Filter, PostRow, ProfileRow, Query, RemoteDataStore,
};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};

pub(crate) async fn lookup_profile(
    data: &dyn RemoteDataStore,
    user_id: &str,
) -> Result<Option<ProfileRow>, ApiClientError> {
    let rows = data
        .query(tables::PROFILES, &Query::new().eq("id", user_id).limit(1))
        .await?;
    rows.first().map(decode_row::<ProfileRow>).transpose()
}

pub(crate) async fn lookup_author(
    data: &dyn RemoteDataStore,
    user_id: &str,
) -> Result<Option<AuthorProfile>, ApiClientError> {
    Ok(lookup_profile(data, user_id).await?.map(AuthorProfile::from))
}

/// Authors for a set of user ids; ids that fail to resolve are left out.
pub(crate) async fn lookup_authors<'a>(
    data: &dyn RemoteDataStore,
    user_ids: impl IntoIterator<Item = &'a str>,
) -> HashMap<String, AuthorProfile> {
    let unique: HashSet<&str> = user_ids.into_iter().collect();
    let lookups = unique.into_iter().map(|id| async move {
        match lookup_author(data, id).await {
            Ok(author) => author.map(|a| (id.to_string(), a)),
            Err(e) => {
                tracing::warn!(user_id = id, error = %e, "Author lookup failed");
                None
            }
        }
    });
    join_all(lookups).await.into_iter().flatten().collect()
}

pub(crate) async fn liked_by(
    data: &dyn RemoteDataStore,
    post_id: &str,
    user_id: &str,
) -> Result<bool, ApiClientError> {
    let filters = [Filter::eq("post_id", post_id), Filter::eq("user_id", user_id)];
    Ok(data.count(tables::LIKES, &filters).await? > 0)
}

/// Attach author, counters and the viewer's like flag to one post. Each lookup
/// fails on its own; the post is always returned.
pub(crate) async fn enrich_post(
    data: &dyn RemoteDataStore,
    post: PostRow,
    viewer: Option<&str>,
) -> FeedPost {
    let post_filter = [Filter::eq("post_id", post.id.as_str())];
    let (author, likes, comments, liked) = tokio::join!(
        lookup_author(data, &post.user_id),
        data.count(tables::LIKES, &post_filter),
        data.count(tables::COMMENTS, &post_filter),
        async {
            match viewer {
                Some(user_id) => liked_by(data, &post.id, user_id).await,
                None => Ok(false),
            }
        },
    );

    let mut enriched = FeedPost::bare(post);
    match author {
        Ok(author) => enriched.author = author,
        Err(e) => tracing::warn!(post_id = %enriched.post.id, error = %e, "Author enrichment failed"),
    }
    match likes {
        Ok(n) => enriched.like_count = n,
        Err(e) => tracing::warn!(post_id = %enriched.post.id, error = %e, "Like count failed"),
    }
    match comments {
        Ok(n) => enriched.comment_count = n,
        Err(e) => tracing::warn!(post_id = %enriched.post.id, error = %e, "Comment count failed"),
    }
    match liked {
        Ok(liked) => enriched.is_liked = liked,
        Err(e) => tracing::warn!(post_id = %enriched.post.id, error = %e, "Like status failed"),
    }
    enriched
}

/// Enrich a page concurrently, keeping the fetch order.
pub(crate) async fn enrich_page(
    data: &dyn RemoteDataStore,
    posts: Vec<PostRow>,
    viewer: Option<&str>,
) -> Vec<FeedPost> {
    join_all(posts.into_iter().map(|post| enrich_post(data, post, viewer))).await
}
