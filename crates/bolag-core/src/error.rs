use thiserror::Error;
use uuid::Uuid;

/// Application-specific error types for the scraping engine.
///
/// Retries happen at the lowest capable layer: the rate limiter retries
/// `Network` and 5xx `UpstreamStatus` errors, the proxy gateway retries
/// transient gateway statuses, and the session wrapper retries 403/empty
/// responses with a fresh session. Everything else propagates to the stage
/// boundary where the job controller records it.
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream HTTP {status}")]
    UpstreamStatus { status: u16 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Proxy authentication failed (407): {0}")]
    ProxyAuth(String),

    #[error("Proxy capacity exhausted: {0}")]
    ProxyExhausted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job stopped by operator")]
    Stopped,
}

impl ScrapeError {
    pub fn configuration<T: std::fmt::Display>(message: T) -> Self {
        ScrapeError::Configuration(message.to_string())
    }

    pub fn network<T: std::fmt::Display>(message: T) -> Self {
        ScrapeError::Network(message.to_string())
    }

    pub fn parse<T: std::fmt::Display>(message: T) -> Self {
        ScrapeError::Parse(message.to_string())
    }

    pub fn storage<T: std::fmt::Display>(message: T) -> Self {
        ScrapeError::Storage(message.to_string())
    }

    /// Upstream HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ScrapeError::UpstreamStatus { status } => Some(*status),
            ScrapeError::ProxyAuth(_) => Some(407),
            _ => None,
        }
    }

    /// Whether the rate limiter's retry ladder applies to this error.
    ///
    /// 404 and 403 are never retried at the limiter (404 is a benign miss in
    /// stage 3; 403 is handled by the session wrapper). 429 goes through the
    /// rate-limit handler first but stays retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScrapeError::Network(_) => true,
            ScrapeError::UpstreamStatus { status } => !matches!(status, 403 | 404 | 407),
            _ => false,
        }
    }

    /// Whether this error ends the job rather than the single operation.
    pub fn is_fatal_for_job(&self) -> bool {
        matches!(
            self,
            ScrapeError::Configuration(_)
                | ScrapeError::ProxyAuth(_)
                | ScrapeError::ProxyExhausted(_)
        )
    }

    /// Process exit code for CLI surfaces.
    pub fn exit_code(&self) -> i32 {
        match self {
            ScrapeError::Configuration(_) => 1,
            ScrapeError::ProxyAuth(_) | ScrapeError::ProxyExhausted(_) => 2,
            ScrapeError::Parse(_) => 3,
            ScrapeError::JobNotFound(_) => 4,
            ScrapeError::Stopped => 5,
            _ => 1,
        }
    }
}

impl From<rusqlite::Error> for ScrapeError {
    fn from(err: rusqlite::Error) -> Self {
        ScrapeError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ScrapeError {
    fn from(err: serde_json::Error) -> Self {
        ScrapeError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for ScrapeError {
    fn from(err: std::io::Error) -> Self {
        ScrapeError::Storage(err.to_string())
    }
}

/// Result type alias for convenience
pub type ScrapeResult<T> = Result<T, ScrapeError>;
