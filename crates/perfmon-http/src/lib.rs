//! perfmon-http: transport client for the performance collection service
//!
//! Delivers serialized performance records to the remote ingestion endpoint.
//! Provides connection pooling, per-request timeouts, latency measurement and
//! the retry/backoff primitives used by the agent's transmitter.
//!
//! # Architecture
//!
//! - `CollectorClient`: connection-pooled async client that POSTs JSON bodies
//! - `CollectorResponse`: response wrapper that understands the service's
//!   `{code, msg, data}` envelope
//! - `RetryConfig`: capped exponential backoff between attempts
//!
//! The profiling pipeline itself lives in `perfmon-agent`.

pub mod client;
pub mod config;
pub mod error;
pub mod response;

pub use client::{CollectorClient, PROJECT_KEY_HEADER};
pub use config::{HttpClientConfig, RetryConfig};
pub use error::{HttpError, HttpErrorCategory, HttpResult};
pub use response::{CollectorResponse, Envelope};
