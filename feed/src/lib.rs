//! Social feed: paginated posts enriched with author, like and comment data.

mod enrich;
mod paginator;
mod social;

pub use paginator::{FeedPaginator, DEFAULT_PAGE_SIZE};

use api_client::{ApiClientError, PostRow, ProfileRow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeedError {
    #[error("Not signed in")]
    Unauthenticated,
    #[error("Not found or not owned by the current user")]
    NotFoundOrForbidden,
    #[error("Backend Error: {0}")]
    Remote(#[from] ApiClientError),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// The slice of a profile shown next to a post or comment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorProfile {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
}

impl From<ProfileRow> for AuthorProfile {
    fn from(row: ProfileRow) -> Self {
        AuthorProfile {
            id: row.id,
            username: row.username,
            avatar_url: row.avatar_url,
        }
    }
}

/// A full profile page. Kept apart from [`AuthorProfile`] on purpose: it
/// carries fields the feed never loads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileDetails {
    pub id: String,
    pub username: String,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub post_count: u64,
}

/// A post plus everything enrichment could find out about it. Missing
/// enrichment leaves `author` empty and the counters at zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedPost {
    pub post: PostRow,
    pub author: Option<AuthorProfile>,
    pub like_count: u64,
    pub comment_count: u64,
    pub is_liked: bool,
}

impl FeedPost {
    pub fn id(&self) -> &str {
        &self.post.id
    }

    pub(crate) fn bare(post: PostRow) -> Self {
        FeedPost {
            post,
            author: None,
            like_count: 0,
            comment_count: 0,
            is_liked: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub author: Option<AuthorProfile>,
}
