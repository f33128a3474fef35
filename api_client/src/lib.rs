//! API client module for the photo journal backend.
//!
//! The backend is a hosted relational store plus object storage. Components in
//! the other crates only ever see the [`RemoteDataStore`], [`RemoteObjectStore`]
//! and [`TransformApi`] traits so they can run against in-memory fakes.

mod image;
mod rest;
mod transform;

pub use image::{HttpImageSource, ImageSource};
pub use rest::{parse_content_range_total, BackendClient};
pub use transform::HttpTransformApi;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Schemaless record as returned by the relational store.
pub type Row = Map<String, Value>;

pub mod tables {
    pub const GALLERY: &str = "gallery_images";
    pub const POSTS: &str = "posts";
    pub const LIKES: &str = "likes";
    pub const COMMENTS: &str = "comments";
    pub const PROFILES: &str = "profiles";
}

pub const GALLERY_BUCKET: &str = "gallery";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiClientError {
    #[error("Request Error: {0}")]
    RequestError(String),
    #[error("Backend Error ({status}): {message}")]
    BackendError { status: u16, message: String },
    #[error("Decode Error: {0}")]
    DecodeError(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Not found")]
    NotFound,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Other Error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for ApiClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiClientError::Timeout
        } else if e.is_decode() {
            ApiClientError::DecodeError(e.to_string())
        } else {
            ApiClientError::RequestError(e.to_string())
        }
    }
}

/// Equality filter on a single column.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter {
            column: column.to_string(),
            value: value.into(),
        }
    }

    /// Plain text form of the value, without JSON quoting.
    pub fn value_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub columns: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: &str) -> Self {
        self.columns = Some(columns.to_string());
        self
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            descending: true,
        });
        self
    }

    pub fn order_asc(mut self, column: &str) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            descending: false,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn range(mut self, offset: usize, limit: usize) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
pub trait RemoteDataStore: Send + Sync {
    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Row>, ApiClientError>;
    async fn insert(&self, table: &str, row: Row) -> Result<Row, ApiClientError>;
    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Row, ApiClientError>;
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), ApiClientError>;
    /// Number of rows matching `filters`, without transferring them.
    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, ApiClientError>;
}

#[async_trait]
pub trait RemoteObjectStore: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), ApiClientError>;
    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        expiry_secs: u64,
    ) -> Result<String, ApiClientError>;
    fn public_url(&self, bucket: &str, path: &str) -> String;
    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), ApiClientError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleParameters {
    pub style: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<f32>,
}

impl Default for StyleParameters {
    fn default() -> Self {
        StyleParameters {
            style: "watercolor".to_string(),
            prompt: None,
            strength: None,
        }
    }
}

/// Single-shot image stylization. Returns the URL of the finished image.
#[async_trait]
pub trait TransformApi: Send + Sync {
    async fn submit(&self, image: Bytes, style: &StyleParameters) -> Result<String, ApiClientError>;
}

/// Decode a schemaless row into one of the entity types below.
pub fn decode_row<T: DeserializeOwned>(row: &Row) -> Result<T, ApiClientError> {
    serde_json::from_value(Value::Object(row.clone()))
        .map_err(|e| ApiClientError::DecodeError(e.to_string()))
}

/// Encode an entity into a row for insertion.
pub fn encode_row<T: Serialize>(value: &T) -> Result<Row, ApiClientError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ApiClientError::DecodeError(format!(
            "expected an object, got {}",
            other
        ))),
        Err(e) => Err(ApiClientError::DecodeError(e.to_string())),
    }
}

/// One stored photo in a user's gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryRecord {
    pub user_id: String,
    #[serde(rename = "storage_path")]
    pub identity_path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Signed URL for `identity_path`; derived, never stored remotely.
    #[serde(skip)]
    pub access_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRow {
    pub id: String,
    pub user_id: String,
    pub image_url: String,
    #[serde(default)]
    pub caption: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    pub user_id: String,
    pub image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikeRow {
    pub post_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRow {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewComment {
    pub post_id: String,
    pub user_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRow {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}
