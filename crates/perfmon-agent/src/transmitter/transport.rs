//! Delivery transports

use async_trait::async_trait;
use perfmon_http::{CollectorClient, HttpClientConfig};

use crate::config::Config;
use crate::error::Result;
use crate::record::{BatchPayload, PerformanceRecord};

/// Single-record submission path
pub const COLLECT_PATH: &str = "/v1/performance/collect";

/// Batch submission path
pub const BATCH_PATH: &str = "/v1/performance/batch";

/// Something that can deliver records to the collection backend.
///
/// One attempt per call; retries belong to the caller. `config` is the
/// snapshot current when the delivery started.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_one(&self, record: &PerformanceRecord, config: &Config) -> Result<()>;

    async fn send_batch(&self, records: &[PerformanceRecord], config: &Config) -> Result<()>;
}

/// Default transport: JSON over HTTP to the collector API
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: CollectorClient,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let client = CollectorClient::new(
            HttpClientConfig::new()
                .timeout(config.request_timeout)
                .user_agent(user_agent(&config.sdk_version)),
        )?;
        Ok(Self { client })
    }

    /// Build on an existing client
    pub fn with_client(client: CollectorClient) -> Self {
        Self { client }
    }
}

/// `User-Agent` sent with every delivery
pub fn user_agent(sdk_version: &str) -> String {
    format!("performance-monitor-sdk/{}", sdk_version)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_one(&self, record: &PerformanceRecord, config: &Config) -> Result<()> {
        let response = self
            .client
            .post_json(
                &config.endpoint_url(COLLECT_PATH),
                &config.project_key,
                record,
                Some(config.request_timeout),
            )
            .await?;
        response.ensure_accepted()?;

        tracing::debug!(trace_id = %record.trace_id, latency_ms = response.latency_ms, "Record delivered");
        Ok(())
    }

    async fn send_batch(&self, records: &[PerformanceRecord], config: &Config) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        // Batches get twice the single-request budget
        let response = self
            .client
            .post_json(
                &config.endpoint_url(BATCH_PATH),
                &config.project_key,
                &BatchPayload::new(records),
                Some(config.request_timeout.saturating_mul(2)),
            )
            .await?;
        response.ensure_accepted()?;

        tracing::debug!(batch_size = records.len(), latency_ms = response.latency_ms, "Batch delivered");
        Ok(())
    }
}
