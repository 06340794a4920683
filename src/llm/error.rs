//! Classified LLM errors and retry policy.

use std::time::Duration;

/// Broad category of an LLM failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429 or provider-side throttling.
    RateLimited,
    /// Connection reset, DNS failure, request timeout.
    Network,
    /// 5xx from the provider.
    ServerError,
    /// 4xx other than rate limiting (bad request, auth).
    ClientError,
    /// The provider answered with something we could not understand.
    Parse,
    /// Context window or token budget exhausted.
    LimitExceeded,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Network => write!(f, "network"),
            Self::ServerError => write!(f, "server_error"),
            Self::ClientError => write!(f, "client_error"),
            Self::Parse => write!(f, "parse"),
            Self::LimitExceeded => write!(f, "limit_exceeded"),
        }
    }
}

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// An error returned by an [`LlmClient`](super::LlmClient).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    /// Server-provided hint (Retry-After) for rate limits.
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(LlmErrorKind::RateLimited, message)
        }
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Network, message)
    }

    pub fn server_error(status: u16, body: impl Into<String>) -> Self {
        Self::new(
            LlmErrorKind::ServerError,
            format!("HTTP {}: {}", status, body.into()),
        )
    }

    pub fn client_error(status: u16, body: impl Into<String>) -> Self {
        Self::new(
            LlmErrorKind::ClientError,
            format!("HTTP {}: {}", status, body.into()),
        )
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Parse, message)
    }

    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::LimitExceeded, message)
    }

    /// Classification carried by the error kind.
    pub fn class(&self) -> ErrorClass {
        match self.kind {
            LlmErrorKind::RateLimited | LlmErrorKind::Network | LlmErrorKind::ServerError => {
                ErrorClass::Retryable
            }
            LlmErrorKind::ClientError | LlmErrorKind::Parse | LlmErrorKind::LimitExceeded => {
                ErrorClass::Terminal
            }
        }
    }

    pub fn is_limit_exceeded(&self) -> bool {
        self.kind == LlmErrorKind::LimitExceeded
    }

    /// Delay before retry `attempt` (0-based): the server hint if present, else
    /// exponential backoff from one second, capped at a minute.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(delay) = self.retry_after {
            return delay;
        }
        let secs = 1u64.checked_shl(attempt.min(6)).unwrap_or(60).min(60);
        Duration::from_secs(secs)
    }
}

/// Map an HTTP status code onto an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        413 => LlmErrorKind::LimitExceeded,
        400..=499 => LlmErrorKind::ClientError,
        500..=599 => LlmErrorKind::ServerError,
        _ => LlmErrorKind::ServerError,
    }
}

/// Retry policy for transient LLM failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Upper bound on the total time spent retrying one request.
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 6,
            max_retry_duration: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    pub fn should_retry(&self, error: &LlmError) -> bool {
        error.class() == ErrorClass::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(LlmError::network_error("reset").class(), ErrorClass::Retryable);
        assert_eq!(LlmError::server_error(502, "bad gateway").class(), ErrorClass::Retryable);
        assert_eq!(LlmError::rate_limited("slow down", None).class(), ErrorClass::Retryable);
        assert_eq!(LlmError::limit_exceeded("too many tokens").class(), ErrorClass::Terminal);
        assert_eq!(LlmError::client_error(401, "unauthorized").class(), ErrorClass::Terminal);
    }

    #[test]
    fn test_classify_http_status() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(413), LlmErrorKind::LimitExceeded);
        assert_eq!(classify_http_status(404), LlmErrorKind::ClientError);
        assert_eq!(classify_http_status(503), LlmErrorKind::ServerError);
    }

    #[test]
    fn test_suggested_delay() {
        let err = LlmError::network_error("reset");
        assert_eq!(err.suggested_delay(0), Duration::from_secs(1));
        assert_eq!(err.suggested_delay(3), Duration::from_secs(8));
        assert_eq!(err.suggested_delay(30), Duration::from_secs(60));

        let hinted = LlmError::rate_limited("wait", Some(Duration::from_millis(250)));
        assert_eq!(hinted.suggested_delay(5), Duration::from_millis(250));
    }
}
