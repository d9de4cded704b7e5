//! Failure taxonomy surfaced by the executor and the polling operation.

use thiserror::Error;

/// Terminal callback of an operation. Invoked exactly once.
pub type Completion<T> = Box<dyn FnOnce(Result<T, Failure>) + Send + 'static>;

/// Status codes for which a server or decoding failure is worth retrying,
/// in addition to the whole `5xx` range.
pub const RETRYABLE_STATUS_CODES: [u16; 4] = [408, 409, 425, 429];

/// A failure delivered through an operation's completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// The network could not be reached.
    #[error("network is unreachable")]
    NetworkUnreachable,
    /// The request, or the whole operation, ran out of time.
    #[error("operation timed out")]
    Timeout,
    /// The operation was cancelled before it completed.
    #[error("operation was cancelled")]
    Cancelled,
    /// The server answered with an error status.
    #[error("server responded with status {status_code}")]
    Server {
        /// Raw error body, if the server sent one.
        body: Option<String>,
        /// HTTP status code.
        status_code: u16,
    },
    /// The response could not be decoded.
    #[error("failed to decode response with status {status_code}: {message}")]
    Decoding {
        /// HTTP status code of the undecodable response.
        status_code: u16,
        /// Decoder diagnostic.
        message: String,
    },
    /// Anything else; never retried.
    #[error("internal failure: {0}")]
    Internal(String),
}

impl Failure {
    /// Build a server failure without a body.
    pub fn server(status_code: u16) -> Self {
        Self::Server {
            body: None,
            status_code,
        }
    }

    /// Status code carried by the failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Server { status_code, .. } | Self::Decoding { status_code, .. } => {
                Some(*status_code)
            }
            _ => None,
        }
    }

    /// Returns true if this is [`Failure::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if this is [`Failure::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Default retry classification for API calls.
    ///
    /// Connectivity problems and timeouts are always retried. Server and
    /// decoding failures are retried only for request-timeout, conflict,
    /// too-early, rate-limit and `5xx` statuses. Cancellation, internal
    /// failures and every other `4xx` are final.
    ///
    /// ```rust
    /// use paysub::Failure;
    ///
    /// assert!(Failure::NetworkUnreachable.is_retryable());
    /// assert!(Failure::server(503).is_retryable());
    /// assert!(Failure::server(429).is_retryable());
    /// assert!(!Failure::server(404).is_retryable());
    /// assert!(!Failure::Cancelled.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkUnreachable | Self::Timeout => true,
            Self::Server { status_code, .. } | Self::Decoding { status_code, .. } => {
                is_retryable_status(*status_code)
            }
            Self::Cancelled | Self::Internal(_) => false,
        }
    }
}

fn is_retryable_status(status_code: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status_code) || (500..=599).contains(&status_code)
}
