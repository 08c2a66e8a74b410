//! # HTTP Feed Client
//!
//! A thin asynchronous wrapper around `reqwest` that speaks the feed API:
//! a GET on the owner-supplied explore URL and a GET on the answer URL,
//! both authenticated by a fixed credential header.
//!
//! No retries happen here. A transport error is handed back to the engine,
//! which counts it and moves on; retrying an accept call would double-count
//! against the owner's daily quota.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use std::time::Duration;

use crate::core::{ApiReply, FeedApi, FeedError};

/// Placeholder substituted with the url-encoded candidate id.
pub const USER_ID_PLACEHOLDER: &str = "{user_id}";

/// Client settings. The defaults match the production feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFeedConfig {
    /// Accept endpoint with a [`USER_ID_PLACEHOLDER`].
    pub answer_url_template: String,
    /// Header carrying the credential.
    pub credential_header: String,
    /// Total timeout of one request.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for HttpFeedConfig {
    fn default() -> Self {
        Self {
            answer_url_template: "https://api.meeff.com/user/undoableAnswer/v5/?userId={user_id}&isOkay=1"
                .to_string(),
            credential_header: "meeff-access-token".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: "okhttp/5.1.0 (Linux; Android 13; Pixel 6 Build/TQ3A.230901.001)".to_string(),
        }
    }
}

/// [`FeedApi`] over HTTP. Cheap to share: one connection pool serves every
/// engine of the process.
#[derive(Debug, Clone)]
pub struct HttpFeedApi {
    client: reqwest::Client,
    credential_header: HeaderName,
    answer_url_template: String,
}

impl HttpFeedApi {
    /// Builds the client.
    ///
    /// # Errors
    /// Returns [`FeedError::Build`] when the header name, the user agent or
    /// the answer template is unusable.
    pub fn new(config: HttpFeedConfig) -> Result<Self, FeedError> {
        let credential_header = HeaderName::from_bytes(config.credential_header.as_bytes())
            .map_err(|e| FeedError::Build(format!("credential header: {}", e)))?;
        if !config.answer_url_template.contains(USER_ID_PLACEHOLDER) {
            return Err(FeedError::Build(format!(
                "answer url template lacks {}",
                USER_ID_PLACEHOLDER
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| FeedError::Build(format!("user agent: {}", e)))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            credential_header,
            answer_url_template: config.answer_url_template,
        })
    }

    /// The accept URL for one candidate.
    pub fn answer_url(&self, candidate_id: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(candidate_id.as_bytes()).collect();
        self.answer_url_template.replace(USER_ID_PLACEHOLDER, &encoded)
    }

    async fn get(&self, url: &str, credential: &str) -> Result<ApiReply, FeedError> {
        let token = HeaderValue::from_str(credential)
            .map_err(|e| FeedError::Build(format!("credential: {}", e)))?;
        let response = self
            .client
            .get(url)
            .header(self.credential_header.clone(), token)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(ApiReply::new(status, body))
    }
}

#[async_trait]
impl FeedApi for HttpFeedApi {
    async fn fetch_page(&self, feed_url: &str, credential: &str) -> Result<ApiReply, FeedError> {
        self.get(feed_url, credential).await
    }

    async fn answer(&self, candidate_id: &str, credential: &str) -> Result<ApiReply, FeedError> {
        let url = self.answer_url(candidate_id);
        self.get(&url, credential).await
    }
}
