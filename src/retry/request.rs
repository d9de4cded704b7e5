//! Request model and the transport contract consumed by the executor.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::failure::Failure;

/// Header carrying the per-call idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// HTTP method of an API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
}

impl Method {
    /// Whether the method only reads. Safe requests can be repeated freely
    /// and never carry an idempotency key.
    pub fn is_safe(self) -> bool {
        matches!(self, Method::Get)
    }

    /// Upper-case method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single logical API request.
///
/// Encoding and transmission are the transport's business; the executor only
/// reads the method and touches the headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Identifier used in logs.
    pub id: String,
    /// HTTP method.
    pub method: Method,
    /// Path relative to the API base URL.
    pub path: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Encoded body, if any.
    pub body: Option<Vec<u8>>,
}

impl Request {
    /// Create a request with no headers and no body.
    ///
    /// The id is a fresh UUID; override it with [`with_id`](Self::with_id).
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            path: path.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// `GET` request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// `POST` request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    /// `PUT` request.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    /// `DELETE` request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Set the log identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach an encoded body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// The idempotency key, if one has been attached.
    ///
    /// Header names compare ASCII case-insensitively.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(IDEMPOTENCY_KEY_HEADER))
            .map(|(_, value)| value.as_str())
    }

    /// Attach an idempotency key to a mutating request.
    ///
    /// `GET` requests are left untouched, as is a request that already
    /// carries a key under any spelling of the header name.
    pub(crate) fn ensure_idempotency_key(&mut self) {
        if self.method.is_safe() || self.idempotency_key().is_some() {
            return;
        }
        self.headers.insert(
            IDEMPOTENCY_KEY_HEADER.to_string(),
            Uuid::new_v4().to_string(),
        );
    }
}

/// Sends requests to the remote API.
///
/// Each call is one attempt; retries, backoff and the overall deadline are
/// layered on top by [`RetryingExecutor`](crate::RetryingExecutor).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Decoded response value.
    type Response: Send + 'static;

    /// Perform a single attempt of `request`.
    async fn execute(&self, request: Request) -> Result<Self::Response, Failure>;
}
