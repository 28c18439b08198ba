//! Detail view API client

use crate::config::DetailApiConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DetailApiError {
    #[error("Detail API timed out after {0:?}")]
    Timeout(Duration),

    #[error("Detail API request failed: {0}")]
    Transport(String),

    #[error("Detail API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Detail API returned an unusable body: {0}")]
    InvalidBody(String),
}

impl DetailApiError {
    /// Whether a later attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DetailApiError::Timeout(_) | DetailApiError::Transport(_) => true,
            DetailApiError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            DetailApiError::InvalidBody(_) => false,
        }
    }
}

/// Looks up the detail view of one listing link.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DetailApi: Send + Sync {
    /// Returns the JSON object the API produced for `link`
    async fn fetch_detail(&self, link: &str) -> Result<Map<String, Value>, DetailApiError>;
}

#[derive(Serialize)]
struct DetailRequest<'a> {
    url: &'a str,
}

/// `reqwest` implementation posting `{"url": link}`
pub struct HttpDetailApi {
    client: Client,
    config: DetailApiConfig,
}

impl HttpDetailApi {
    pub fn new(config: DetailApiConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn request_error(&self, err: reqwest::Error) -> DetailApiError {
        if err.is_timeout() {
            DetailApiError::Timeout(self.config.timeout)
        } else {
            DetailApiError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl DetailApi for HttpDetailApi {
    async fn fetch_detail(&self, link: &str) -> Result<Map<String, Value>, DetailApiError> {
        debug!(api = %self.config.url, link, "Calling detail view API");

        let response = self
            .client
            .post(&self.config.url)
            .json(&DetailRequest { url: link })
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetailApiError::Status { status, body });
        }

        let bytes = response.bytes().await.map_err(|e| self.request_error(e))?;
        match serde_json::from_slice(&bytes) {
            Ok(Value::Object(detail)) => Ok(detail),
            Ok(_) => Err(DetailApiError::InvalidBody("expected a JSON object".to_string())),
            Err(e) => Err(DetailApiError::InvalidBody(e.to_string())),
        }
    }
}
