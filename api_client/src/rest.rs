use crate::{ApiClientError, Filter, Query, RemoteDataStore, RemoteObjectStore, Row};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the hosted backend: relational tables under `/rest/v1` and
/// object storage under `/storage/v1`.
///
/// Constructed once and handed to every component that needs it. Cloning is
/// cheap and clones share the access token.
#[derive(Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Arc<RwLock<Option<String>>>,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_client(base_url, api_key, client)
    }

    pub fn with_client(base_url: &str, api_key: &str, client: reqwest::Client) -> Self {
        BackendClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            access_token: Arc::new(RwLock::new(None)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Use a user session token instead of the anonymous key.
    pub fn set_access_token(&self, token: Option<String>) {
        match self.access_token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    fn bearer(&self) -> String {
        let token = match self.access_token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        format!("Bearer {}", token.unwrap_or_else(|| self.api_key.clone()))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .header(AUTHORIZATION, self.bearer())
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path)
    }

    fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
        filters
            .iter()
            .map(|f| (f.column.clone(), format!("eq.{}", f.value_text())))
            .collect()
    }

    fn query_params(query: &Query) -> Vec<(String, String)> {
        let mut params = vec![(
            "select".to_string(),
            query.columns.clone().unwrap_or_else(|| "*".to_string()),
        )];
        params.extend(Self::filter_params(&query.filters));
        if let Some(order) = &query.order {
            let dir = if order.descending { "desc" } else { "asc" };
            params.push(("order".to_string(), format!("{}.{}", order.column, dir)));
        }
        if let Some(offset) = query.offset {
            params.push(("offset".to_string(), offset.to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

async fn check_status(response: Response) -> Result<Response, ApiClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(match status {
        StatusCode::NOT_FOUND => ApiClientError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiClientError::Unauthorized,
        _ => ApiClientError::BackendError {
            status: status.as_u16(),
            message,
        },
    })
}

/// Total from a `Content-Range` header such as `0-9/42` or `*/42`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl RemoteDataStore for BackendClient {
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self, query)))]
    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Row>, ApiClientError> {
        let response = self
            .authorized(self.client.get(self.table_url(table)))
            .query(&Self::query_params(query))
            .send()
            .await?;
        let rows = check_status(response).await?.json::<Vec<Row>>().await?;
        tracing::debug!(table, rows = rows.len(), "query complete");
        Ok(rows)
    }

    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self, row)))]
    async fn insert(&self, table: &str, row: Row) -> Result<Row, ApiClientError> {
        let response = self
            .authorized(self.client.post(self.table_url(table)))
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        let rows = check_status(response).await?.json::<Vec<Row>>().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ApiClientError::Other("No row returned".into()))
    }

    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self, filters, patch)))]
    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> Result<Row, ApiClientError> {
        let response = self
            .authorized(self.client.patch(self.table_url(table)))
            .query(&Self::filter_params(filters))
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return=representation")
            .json(&patch)
            .send()
            .await?;
        let rows = check_status(response).await?.json::<Vec<Row>>().await?;
        // An empty representation means the filters matched nothing we may see.
        rows.into_iter().next().ok_or(ApiClientError::NotFound)
    }

    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self, filters)))]
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), ApiClientError> {
        let response = self
            .authorized(self.client.delete(self.table_url(table)))
            .query(&Self::filter_params(filters))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, ApiClientError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(Self::filter_params(filters));
        let response = self
            .authorized(self.client.head(self.table_url(table)))
            .query(&params)
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| ApiClientError::DecodeError("missing Content-Range total".into()))
    }
}

#[async_trait]
impl RemoteObjectStore for BackendClient {
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self, bytes)))]
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), ApiClientError> {
        let size = bytes.len();
        let response = self
            .authorized(self.client.post(self.object_url(bucket, path)))
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;
        check_status(response).await?;
        tracing::info!(bucket, path, size, "object uploaded");
        Ok(())
    }

    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        expiry_secs: u64,
    ) -> Result<String, ApiClientError> {
        let url = format!("{}/storage/v1/object/sign/{}/{}", self.base_url, bucket, path);
        let response = self
            .authorized(self.client.post(url))
            .json(&json!({ "expiresIn": expiry_secs }))
            .send()
            .await?;
        let signed = check_status(response)
            .await?
            .json::<SignedUrlResponse>()
            .await?;
        if signed.signed_url.starts_with("http") {
            Ok(signed.signed_url)
        } else {
            Ok(format!("{}/storage/v1{}", self.base_url, signed.signed_url))
        }
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, path)
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), ApiClientError> {
        let url = format!("{}/storage/v1/object/{}", self.base_url, bucket);
        let response = self
            .authorized(self.client.delete(url))
            .json(&json!({ "prefixes": paths }))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables;
    use mockito::{Matcher, Server};

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("0-9/42"), Some(42));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-9/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[tokio::test]
    async fn test_query_request_format() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/v1/gallery_images")
            .match_header("apikey", "anon")
            .match_header("authorization", "Bearer anon")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("select".into(), "*".into()),
                Matcher::UrlEncoded("user_id".into(), "eq.u1".into()),
                Matcher::UrlEncoded("order".into(), "created_at.desc".into()),
                Matcher::UrlEncoded("offset".into(), "0".into()),
                Matcher::UrlEncoded("limit".into(), "20".into()),
            ]))
            .with_status(200)
            .with_body(r#"[{"user_id":"u1","storage_path":"u1/a.png","created_at":"2024-01-01T00:00:00Z"}]"#)
            .create_async()
            .await;

        let client = BackendClient::new(&server.url(), "anon");
        let query = Query::new()
            .eq("user_id", "u1")
            .order_desc("created_at")
            .range(0, 20);
        let rows = client.query(tables::GALLERY, &query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["storage_path"], "u1/a.png");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_session_token_replaces_anon_key() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("DELETE", "/rest/v1/likes")
            .match_header("authorization", "Bearer session")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("post_id".into(), "eq.p1".into()),
                Matcher::UrlEncoded("user_id".into(), "eq.u1".into()),
            ]))
            .with_status(204)
            .create_async()
            .await;

        let client = BackendClient::new(&server.url(), "anon");
        client.set_access_token(Some("session".into()));
        client
            .delete(
                tables::LIKES,
                &[Filter::eq("post_id", "p1"), Filter::eq("user_id", "u1")],
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_statuses_are_mapped() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/rest/v1/posts")
            .with_status(403)
            .with_body("forbidden")
            .create_async()
            .await;
        let _m2 = server
            .mock("GET", "/rest/v1/posts")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = BackendClient::new(&server.url(), "anon");
        let err = client.insert(tables::POSTS, Row::new()).await.unwrap_err();
        assert_eq!(err, ApiClientError::Unauthorized);
        let err = client.query(tables::POSTS, &Query::new()).await.unwrap_err();
        assert_eq!(
            err,
            ApiClientError::BackendError {
                status: 500,
                message: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn test_count_reads_content_range() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("HEAD", "/rest/v1/likes")
            .match_query(Matcher::UrlEncoded("post_id".into(), "eq.p1".into()))
            .match_header("prefer", "count=exact")
            .with_status(200)
            .with_header("content-range", "*/12")
            .create_async()
            .await;

        let client = BackendClient::new(&server.url(), "anon");
        let n = client
            .count(tables::LIKES, &[Filter::eq("post_id", "p1")])
            .await
            .unwrap();
        assert_eq!(n, 12);
    }

    #[tokio::test]
    async fn test_signed_url_is_absolute() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/storage/v1/object/sign/gallery/u1/a.png")
            .match_body(Matcher::Json(json!({ "expiresIn": 3600 })))
            .with_status(200)
            .with_body(r#"{"signedURL":"/object/sign/gallery/u1/a.png?token=abc"}"#)
            .create_async()
            .await;

        let client = BackendClient::new(&server.url(), "anon");
        let url = client.signed_url("gallery", "u1/a.png", 3600).await.unwrap();
        assert_eq!(
            url,
            format!("{}/storage/v1/object/sign/gallery/u1/a.png?token=abc", server.url())
        );
        assert_eq!(
            client.public_url("avatars", "u1.png"),
            format!("{}/storage/v1/object/public/avatars/u1.png", server.url())
        );
    }

    #[tokio::test]
    async fn test_upload_request_format() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/storage/v1/object/gallery/u1/job.png")
            .match_header("content-type", "image/png")
            .match_header("x-upsert", "true")
            .match_body("PNGDATA")
            .with_status(200)
            .with_body(r#"{"Key":"gallery/u1/job.png"}"#)
            .create_async()
            .await;

        let client = BackendClient::new(&server.url(), "anon");
        client
            .upload("gallery", "u1/job.png", Bytes::from_static(b"PNGDATA"), "image/png")
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
