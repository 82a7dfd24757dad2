//! Wire-level performance record

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::Config;
use crate::context::{RequestContext, ResponseContext};
use crate::system;

/// Replacement value for redacted headers
pub const REDACTED: &str = "[FILTERED]";

/// Headers never shipped in clear text (compared case-insensitively)
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "api-key",
    "x-api-key",
    "x-auth-token",
    "x-csrf-token",
    "x-access-token",
];

/// Generate a fresh trace id: `trace_` followed by 16 hex chars
pub fn new_trace_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("trace_{}", &hex[..16])
}

/// Whether a header carries credentials
pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|sensitive| sensitive.eq_ignore_ascii_case(name))
}

/// Copy headers, replacing sensitive values with [`REDACTED`]
pub fn redact_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if is_sensitive_header(name) {
                REDACTED.to_string()
            } else {
                value.clone()
            };
            (name.clone(), value)
        })
        .collect()
}

/// One node of the flattened call tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    pub call_id: String,
    pub parent_call_id: Option<String>,
    pub function_name: String,
    pub file_path: String,
    pub line_number: u32,
    /// Seconds
    pub duration: f64,
    pub depth: u32,
    pub call_order: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub query_params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub user_agent: Option<String>,
    pub remote_ip: Option<String>,
}

impl RequestInfo {
    /// Capture a request, redacting sensitive headers
    pub fn capture(ctx: &RequestContext) -> Self {
        Self {
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            query_params: ctx.query_params.clone(),
            headers: redact_headers(&ctx.headers),
            user_agent: ctx.header_value("user-agent").map(str::to_string),
            remote_ip: ctx.remote_addr.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status_code: u16,
    pub response_size: u64,
    pub content_type: String,
}

impl From<&ResponseContext> for ResponseInfo {
    fn from(ctx: &ResponseContext) -> Self {
        Self {
            status_code: ctx.status_code,
            response_size: ctx.response_size,
            content_type: ctx.content_type.clone(),
        }
    }
}

/// Megabytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub peak_memory: f64,
    pub memory_delta: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMetrics {
    pub query_count: u64,
    pub query_time: f64,
    pub slow_queries: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_time: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Wall-clock seconds
    pub total_duration: f64,
    /// CPU seconds
    pub cpu_time: f64,
    pub memory_usage: MemoryUsage,
    pub database_metrics: DatabaseMetrics,
    pub cache_metrics: CacheMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub app_version: Option<String>,
    pub git_commit: Option<String>,
    pub deploy_time: Option<String>,
}

impl From<&Config> for VersionInfo {
    fn from(config: &Config) -> Self {
        Self {
            app_version: config.app_version.clone(),
            git_commit: config.git_commit.clone(),
            deploy_time: config.deploy_time.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub runtime: String,
    pub sdk_version: String,
    pub framework_version: Option<String>,
    pub server_info: String,
}

impl From<&Config> for EnvironmentInfo {
    fn from(config: &Config) -> Self {
        Self {
            runtime: "rust".to_string(),
            sdk_version: config.sdk_version.clone(),
            framework_version: config.framework_version.clone(),
            server_info: system::server_info(),
        }
    }
}

/// Everything captured for one profiled request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub trace_id: String,
    pub request_info: RequestInfo,
    pub response_info: ResponseInfo,
    pub performance_metrics: PerformanceMetrics,
    pub function_calls: Vec<CallFrame>,
    pub version_info: VersionInfo,
    pub environment: EnvironmentInfo,
}

/// Body of a batch submission
#[derive(Debug, Serialize)]
pub struct BatchPayload<'a> {
    pub records: &'a [PerformanceRecord],
    pub batch_size: usize,
}

impl<'a> BatchPayload<'a> {
    pub fn new(records: &'a [PerformanceRecord]) -> Self {
        Self {
            records,
            batch_size: records.len(),
        }
    }
}
