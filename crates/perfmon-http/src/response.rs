//! Collector response types

use crate::error::{HttpError, HttpResult};
use serde::Deserialize;

/// Response envelope returned by the collection service
///
/// `code == 0` means the payload was accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Response from the collection endpoint with latency measurement
#[derive(Debug, Clone)]
pub struct CollectorResponse {
    /// HTTP status code
    pub status_code: u16,

    /// Response body as bytes
    pub body: Vec<u8>,

    /// Request latency in milliseconds
    pub latency_ms: u64,
}

impl CollectorResponse {
    /// Create a new response
    pub fn new(status_code: u16, body: Vec<u8>, latency_ms: u64) -> Self {
        Self {
            status_code,
            body,
            latency_ms,
        }
    }

    /// Check if status is success (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Get body as text (lossy UTF-8)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse the `{code, msg, data}` envelope, if the body carries one
    pub fn envelope(&self) -> Option<Envelope> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Check that the collector accepted the payload.
    ///
    /// Accepted means a 2xx status and, when the body is an envelope,
    /// `code == 0`. A 2xx body without an envelope counts as accepted.
    pub fn ensure_accepted(&self) -> HttpResult<()> {
        if !self.is_success() {
            let message: String = self.text().chars().take(256).collect();
            return Err(HttpError::Status {
                status: self.status_code,
                message,
            });
        }

        match self.envelope() {
            Some(envelope) if envelope.code != 0 => Err(HttpError::Rejected {
                code: envelope.code,
                message: envelope.msg.unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }
}

/// Convert reqwest Response to CollectorResponse
pub async fn from_reqwest(
    response: reqwest::Response,
    latency_ms: u64,
) -> HttpResult<CollectorResponse> {
    let status_code = response.status().as_u16();

    let body = response.bytes().await?.to_vec();

    Ok(CollectorResponse {
        status_code,
        body,
        latency_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_envelope() {
        let response = CollectorResponse::new(200, br#"{"code": 0, "msg": "success"}"#.to_vec(), 3);
        assert!(response.ensure_accepted().is_ok());
    }

    #[test]
    fn test_rejected_envelope() {
        let response = CollectorResponse::new(
            200,
            br#"{"code": 20003, "msg": "invalid project key"}"#.to_vec(),
            3,
        );
        match response.ensure_accepted() {
            Err(HttpError::Rejected { code, message }) => {
                assert_eq!(code, 20003);
                assert_eq!(message, "invalid project key");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_long_non_ascii_body_is_shortened() {
        let response = CollectorResponse::new(502, "é".repeat(400).into_bytes(), 1);
        match response.ensure_accepted() {
            Err(HttpError::Status { message, .. }) => assert_eq!(message.chars().count(), 256),
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_success_body() {
        let response = CollectorResponse::new(204, Vec::new(), 1);
        assert!(response.ensure_accepted().is_ok());
    }

    #[test]
    fn test_server_error_status() {
        let response = CollectorResponse::new(503, b"try later".to_vec(), 1);
        match response.ensure_accepted() {
            Err(HttpError::Status { status, .. }) => assert_eq!(status, 503),
            other => panic!("expected status error, got {:?}", other),
        }
    }
}
