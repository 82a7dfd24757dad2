//! Agent configuration
//!
//! `Config` is loaded once at startup (from code, a YAML/JSON file, or the
//! environment) and published through [`SharedConfig`]. Runtime updates swap
//! the whole snapshot, so readers never observe a half-applied change.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PerfmonError, Result};
use perfmon_http::RetryConfig;

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "PERFORMANCE_MONITOR_";

/// Key wrapping the agent's section in shared config files
const FILE_SECTION: &str = "performance_monitor";

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Required
    pub project_key: String,
    pub api_endpoint: String,

    // Basics
    pub enabled: bool,
    /// Fraction of eligible requests to profile, in `[0, 1]`
    pub sampling_rate: f64,
    /// Queue records for background delivery instead of sending inline
    pub async_send: bool,

    // Path filters (glob syntax, `*` and `?`)
    pub exclude_patterns: Vec<String>,
    pub include_patterns: Vec<String>,

    // Transmission
    pub batch_size: usize,
    #[serde(with = "duration_secs")]
    pub batch_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub retry_times: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_retry_delay: Duration,
    /// Size of the delivery worker pool
    pub max_workers: usize,
    /// Bound on records waiting for the batching loop
    pub max_queue_size: usize,
    /// How long `close` waits for pending deliveries
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,

    // Call tree filtering
    /// Frames whose file path contains any of these substrings are dropped
    pub noise_patterns: Vec<String>,
    #[serde(with = "duration_secs")]
    pub min_frame_duration: Duration,

    /// Sessions older than this are considered abandoned
    #[serde(with = "duration_secs")]
    pub max_session_age: Duration,

    // Version info
    pub sdk_version: String,
    pub app_version: Option<String>,
    pub git_commit: Option<String>,
    pub deploy_time: Option<String>,
    pub framework_version: Option<String>,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_key: String::new(),
            api_endpoint: String::new(),
            enabled: true,
            sampling_rate: 0.3,
            async_send: true,
            exclude_patterns: vec![
                "/health".to_string(),
                "/metrics".to_string(),
                "/static/*".to_string(),
                "*.css".to_string(),
                "*.js".to_string(),
                "*.ico".to_string(),
            ],
            include_patterns: Vec::new(),
            batch_size: 50,
            batch_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            retry_times: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            max_workers: 3,
            max_queue_size: 1000,
            shutdown_timeout: Duration::from_secs(30),
            noise_patterns: vec![
                "/.cargo/registry/".to_string(),
                "/.cargo/git/".to_string(),
                "/rustc/".to_string(),
                "/.rustup/".to_string(),
                "<unknown>".to_string(),
                "perfmon-agent/src/".to_string(),
            ],
            min_frame_duration: Duration::from_millis(1),
            max_session_age: Duration::from_secs(300),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            app_version: None,
            git_commit: None,
            deploy_time: None,
            framework_version: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create a config with the two required options and defaults for the rest
    pub fn new(project_key: impl Into<String>, api_endpoint: impl Into<String>) -> Self {
        Self {
            project_key: project_key.into(),
            api_endpoint: api_endpoint.into(),
            ..Default::default()
        }
    }

    /// Load from a YAML (`.yaml`/`.yml`) or JSON file.
    ///
    /// A top-level `performance_monitor` section is unwrapped when present.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PerfmonError::Config(format!("{}: {}", path.display(), e)))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let config: Config = if is_yaml {
            let mut value: serde_yaml::Value = serde_yaml::from_str(&text)?;
            if let Some(section) = value.get(FILE_SECTION) {
                value = section.clone();
            }
            serde_yaml::from_value(value)?
        } else {
            let mut value: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| PerfmonError::Config(e.to_string()))?;
            if let Some(section) = value.get(FILE_SECTION) {
                value = section.clone();
            }
            serde_json::from_value(value).map_err(|e| PerfmonError::Config(e.to_string()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Write the config to a YAML or JSON file under the `performance_monitor` section
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut wrapper = std::collections::BTreeMap::new();
        wrapper.insert(FILE_SECTION, self);

        let text = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(&wrapper)?,
            _ => serde_json::to_string_pretty(&wrapper)?,
        };
        std::fs::write(path, text)?;

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Load from `PERFORMANCE_MONITOR_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_prefix(ENV_PREFIX)
    }

    /// Load from environment variables with a custom prefix.
    ///
    /// `PROJECT_KEY` and `API_ENDPOINT` are required. Values that fail to
    /// parse are logged and left at their defaults.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self> {
        let var = |name: &str| std::env::var(format!("{}{}", prefix, name)).ok();

        let (Some(project_key), Some(api_endpoint)) = (var("PROJECT_KEY"), var("API_ENDPOINT"))
        else {
            return Err(PerfmonError::Config(format!(
                "{prefix}PROJECT_KEY and {prefix}API_ENDPOINT are required"
            )));
        };

        let mut config = Config::new(project_key, api_endpoint);

        fn parsed<T: FromStr>(prefix: &str, name: &str, raw: Option<String>) -> Option<T>
        where
            T::Err: fmt::Display,
        {
            let raw = raw?;
            match raw.trim().parse::<T>() {
                Ok(value) => Some(value),
                Err(e) => {
                    let variable = format!("{}{}", prefix, name);
                    tracing::warn!(
                        variable = %variable,
                        error = %e,
                        "Ignoring unparsable environment variable"
                    );
                    None
                }
            }
        }

        let flag = |name: &str| {
            var(name).map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        };
        let secs = |name: &str| {
            parsed::<f64>(prefix, name, var(name))
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64)
        };
        let list = |name: &str| {
            var(name).map(|v| {
                v.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
            })
        };

        if let Some(v) = flag("ENABLED") {
            config.enabled = v;
        }
        if let Some(v) = parsed(prefix, "SAMPLING_RATE", var("SAMPLING_RATE")) {
            config.sampling_rate = v;
        }
        if let Some(v) = flag("ASYNC_SEND") {
            config.async_send = v;
        }
        if let Some(v) = parsed(prefix, "BATCH_SIZE", var("BATCH_SIZE")) {
            config.batch_size = v;
        }
        if let Some(v) = secs("BATCH_TIMEOUT") {
            config.batch_timeout = v;
        }
        if let Some(v) = secs("REQUEST_TIMEOUT") {
            config.request_timeout = v;
        }
        if let Some(v) = parsed(prefix, "RETRY_TIMES", var("RETRY_TIMES")) {
            config.retry_times = v;
        }
        if let Some(v) = secs("RETRY_DELAY") {
            config.retry_delay = v;
        }
        if let Some(v) = parsed(prefix, "MAX_WORKERS", var("MAX_WORKERS")) {
            config.max_workers = v;
        }
        if let Some(v) = parsed(prefix, "MAX_QUEUE_SIZE", var("MAX_QUEUE_SIZE")) {
            config.max_queue_size = v;
        }
        if let Some(v) = secs("SHUTDOWN_TIMEOUT") {
            config.shutdown_timeout = v;
        }
        if let Some(v) = list("EXCLUDE_PATTERNS") {
            config.exclude_patterns = v;
        }
        if let Some(v) = list("INCLUDE_PATTERNS") {
            config.include_patterns = v;
        }
        if let Some(v) = var("APP_VERSION") {
            config.app_version = Some(v);
        }
        if let Some(v) = var("GIT_COMMIT") {
            config.git_commit = Some(v);
        }
        if let Some(v) = var("DEPLOY_TIME") {
            config.deploy_time = Some(v);
        }
        if let Some(v) = var("FRAMEWORK_VERSION") {
            config.framework_version = Some(v);
        }
        if let Some(v) = var("LOG_LEVEL") {
            config.log_level = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check required fields and numeric ranges
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(PerfmonError::Config(msg.to_string()));

        if self.project_key.trim().is_empty() {
            return invalid("project_key must not be empty");
        }
        if self.api_endpoint.trim().is_empty() {
            return invalid("api_endpoint must not be empty");
        }
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return invalid("sampling_rate must be between 0 and 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than 0");
        }
        if self.batch_timeout.is_zero() {
            return invalid("batch_timeout must be greater than 0");
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout must be greater than 0");
        }
        if self.max_workers == 0 {
            return invalid("max_workers must be greater than 0");
        }
        if self.max_queue_size == 0 {
            return invalid("max_queue_size must be greater than 0");
        }
        Ok(())
    }

    /// Build the full URL for a collector path such as `/v1/performance/batch`
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}", self.api_endpoint.trim_end_matches('/'), path)
    }

    /// Retry policy derived from `retry_times` / `retry_delay`
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::exponential(self.retry_times, self.retry_delay, self.max_retry_delay)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key_prefix: String = self.project_key.chars().take(8).collect();
        write!(
            f,
            "Config(project_key={}..., api_endpoint={}, enabled={}, sampling_rate={})",
            key_prefix, self.api_endpoint, self.enabled, self.sampling_rate
        )
    }
}

/// Partial update applied to a live configuration
///
/// Every field is optional; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub project_key: Option<String>,
    pub api_endpoint: Option<String>,
    pub enabled: Option<bool>,
    pub sampling_rate: Option<f64>,
    pub async_send: Option<bool>,
    pub exclude_patterns: Option<Vec<String>>,
    pub include_patterns: Option<Vec<String>>,
    pub batch_size: Option<usize>,
    #[serde(with = "duration_secs_opt")]
    pub batch_timeout: Option<Duration>,
    #[serde(with = "duration_secs_opt")]
    pub request_timeout: Option<Duration>,
    pub retry_times: Option<u32>,
    #[serde(with = "duration_secs_opt")]
    pub retry_delay: Option<Duration>,
    pub noise_patterns: Option<Vec<String>>,
    #[serde(with = "duration_secs_opt")]
    pub min_frame_duration: Option<Duration>,
    #[serde(with = "duration_secs_opt")]
    pub max_session_age: Option<Duration>,
    pub app_version: Option<String>,
    pub git_commit: Option<String>,
    pub deploy_time: Option<String>,
}

impl ConfigUpdate {
    /// Create an empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sampling rate
    pub fn sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = Some(rate);
        self
    }

    /// Set the enabled flag
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Set the batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Set the exclude patterns
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = Some(patterns);
        self
    }

    /// Set the include patterns
    pub fn include_patterns(mut self, patterns: Vec<String>) -> Self {
        self.include_patterns = Some(patterns);
        self
    }

    /// Apply onto a copy of `base`, returning the new config and the names of changed fields
    pub fn apply(&self, base: &Config) -> (Config, Vec<&'static str>) {
        let mut next = base.clone();
        let mut changed = Vec::new();

        macro_rules! apply_field {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = &self.$field {
                        next.$field = value.clone();
                        changed.push(stringify!($field));
                    }
                )*
            };
        }
        apply_field!(
            project_key,
            api_endpoint,
            enabled,
            sampling_rate,
            async_send,
            exclude_patterns,
            include_patterns,
            batch_size,
            batch_timeout,
            request_timeout,
            retry_times,
            retry_delay,
            noise_patterns,
            min_frame_duration,
            max_session_age,
        );

        macro_rules! apply_optional {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = &self.$field {
                        next.$field = Some(value.clone());
                        changed.push(stringify!($field));
                    }
                )*
            };
        }
        apply_optional!(app_version, git_commit, deploy_time);

        (next, changed)
    }
}

/// Concurrently readable, atomically replaceable configuration
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current consistent snapshot
    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.read().clone()
    }

    /// Replace the whole configuration
    pub fn replace(&self, config: Config) {
        *self.inner.write() = Arc::new(config);
    }

    /// Apply an update, publishing it only if the result validates.
    ///
    /// The write lock is held across read-modify-write so concurrent updates
    /// serialize instead of losing each other's fields.
    pub fn update(&self, update: &ConfigUpdate) -> Result<(Arc<Config>, Vec<&'static str>)> {
        let mut guard = self.inner.write();
        let (next, changed) = update.apply(&guard);
        next.validate()?;
        let next = Arc::new(next);
        *guard = next.clone();
        Ok((next, changed))
    }
}

/// Durations as floating-point seconds
mod duration_secs {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(D::Error::custom(format!("invalid duration: {}", secs)));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

mod duration_secs_opt {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) if !secs.is_finite() || secs < 0.0 => {
                Err(D::Error::custom(format!("invalid duration: {}", secs)))
            }
            Some(secs) => Ok(Some(Duration::from_secs_f64(secs))),
            None => Ok(None),
        }
    }
}
