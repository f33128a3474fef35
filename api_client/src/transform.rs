use crate::{ApiClientError, StyleParameters, TransformApi};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stylization can take a while on the remote side.
const TRANSFORM_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct TransformRequest<'a> {
    image: String,
    #[serde(flatten)]
    style: &'a StyleParameters,
}

#[derive(Deserialize)]
struct TransformResponse {
    #[serde(default)]
    output_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpTransformApi {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpTransformApi {
    pub fn new(endpoint: &str, api_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(TRANSFORM_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        HttpTransformApi {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl TransformApi for HttpTransformApi {
    #[cfg_attr(feature = "trace-spans", tracing::instrument(skip(self, image)))]
    async fn submit(&self, image: Bytes, style: &StyleParameters) -> Result<String, ApiClientError> {
        let body = TransformRequest {
            image: STANDARD.encode(&image),
            style,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ApiClientError::BackendError {
                status: status.as_u16(),
                message,
            });
        }

        let parsed = response.json::<TransformResponse>().await?;
        if let Some(error) = parsed.error {
            return Err(ApiClientError::BackendError {
                status: status.as_u16(),
                message: error,
            });
        }
        parsed
            .output_url
            .ok_or_else(|| ApiClientError::DecodeError("response has no output_url".into()))
    }
}
