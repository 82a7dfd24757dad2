//! Collector client with connection pooling

use crate::config::HttpClientConfig;
use crate::error::{HttpError, HttpResult};
use crate::response::{from_reqwest, CollectorResponse};
use http::header::CONTENT_TYPE;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Out-of-band header identifying the project a payload belongs to
pub const PROJECT_KEY_HEADER: &str = "X-Project-Key";

/// Connection-pooled client for the collection endpoint
///
/// # Example
///
/// ```ignore
/// use perfmon_http::{CollectorClient, HttpClientConfig};
///
/// let client = CollectorClient::new(HttpClientConfig::new().timeout_secs(5.0))?;
/// let response = client
///     .post_json("https://collector.example.com/v1/performance/collect", "pk_123", &record, None)
///     .await?;
/// response.ensure_accepted()?;
/// ```
#[derive(Clone)]
pub struct CollectorClient {
    inner: Arc<CollectorClientInner>,
}

struct CollectorClientInner {
    client: reqwest::Client,
    config: HttpClientConfig,
}

impl CollectorClient {
    /// Create a new client with the given configuration
    pub fn new(config: HttpClientConfig) -> HttpResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .user_agent(&config.user_agent)
            .gzip(config.gzip)
            .build()?;

        Ok(Self {
            inner: Arc::new(CollectorClientInner { client, config }),
        })
    }

    /// Default timeout applied when a request does not set its own
    pub fn default_timeout(&self) -> Duration {
        self.inner.config.timeout
    }

    /// POST a JSON body to `url`, tagged with the project key.
    ///
    /// The body is encoded up front so encoding failures surface as
    /// [`HttpError::Json`] rather than as transport errors.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        project_key: &str,
        body: &T,
        timeout: Option<Duration>,
    ) -> HttpResult<CollectorResponse> {
        let url = url::Url::parse(url)?;
        let payload = serde_json::to_vec(body).map_err(|e| HttpError::Json(e.to_string()))?;

        let mut request = self
            .inner
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(PROJECT_KEY_HEADER, project_key)
            .body(payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let start = Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout(e.to_string())
            } else if e.is_connect() {
                HttpError::Connection(e.to_string())
            } else {
                HttpError::Reqwest(e)
            }
        })?;
        let latency_ms = start.elapsed().as_millis() as u64;

        tracing::trace!(
            status = response.status().as_u16(),
            latency_ms = latency_ms,
            "Collector responded"
        );

        from_reqwest(response, latency_ms).await
    }
}

impl std::fmt::Debug for CollectorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorClient")
            .field("timeout", &self.inner.config.timeout)
            .field("user_agent", &self.inner.config.user_agent)
            .finish()
    }
}
