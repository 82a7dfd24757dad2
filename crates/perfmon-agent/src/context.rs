//! Request/response contexts supplied by framework adapters, and execution
//! context identity.

use std::collections::BTreeMap;
use std::fmt;
use std::thread::ThreadId;

/// Identity of the execution context (thread or task) handling a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    /// An OS thread
    Thread(ThreadId),
    /// An adapter-managed identity, e.g. an async task id
    Raw(u64),
}

impl ContextKey {
    /// Key for the calling thread
    pub fn current() -> Self {
        ContextKey::Thread(std::thread::current().id())
    }

    /// Key for an identity managed by the adapter
    pub fn from_raw(id: u64) -> Self {
        ContextKey::Raw(id)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKey::Thread(id) => write!(f, "{:?}", id),
            ContextKey::Raw(id) => write!(f, "raw:{}", id),
        }
    }
}

/// What an adapter extracts from an incoming request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub remote_addr: Option<String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            path: "/".to_string(),
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            remote_addr: None,
        }
    }
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a query parameter
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(name.into(), value.into());
        self
    }

    /// Set the client address
    pub fn remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Get a header value (case-insensitive)
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What an adapter extracts from the outgoing response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseContext {
    pub status_code: u16,
    pub response_size: u64,
    pub content_type: String,
}

impl Default for ResponseContext {
    fn default() -> Self {
        Self {
            status_code: 200,
            response_size: 0,
            content_type: "application/json".to_string(),
        }
    }
}

impl ResponseContext {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            ..Default::default()
        }
    }

    /// Set the body size in bytes
    pub fn response_size(mut self, size: u64) -> Self {
        self.response_size = size;
        self
    }

    /// Set the content type
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}
