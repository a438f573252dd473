use std::time::Duration;
use thiserror::Error;

/// Failures raised while talking to the watchlist site or the metadata provider.
///
/// Only [`SourceError::Transient`] and [`SourceError::Throttled`] are retried;
/// every other variant is surfaced to the caller on first occurrence.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Session missing, expired or rejected (401/403). Re-authentication is external.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Timeouts, connection errors, 5xx and 429 responses
    #[error("transient fetch failure for {url}: {message}")]
    Transient {
        url: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Non-retryable HTTP failures other than 404
    #[error("fetch failed for {url}: {message}")]
    Permanent { url: String, message: String },

    /// 404; never retried
    #[error("fetch failed for {url}: HTTP 404")]
    NotFound { url: String },

    #[error("no request slot for {host} within {waited:?}")]
    RateLimitTimeout { host: String, waited: Duration },

    /// Unrecognised or structurally broken page body
    #[error("could not parse page: {0}")]
    Parse(String),

    /// An HTML page from the site that carries no listing at all
    #[error("could not parse page: {0}")]
    NoListing(String),

    /// The metadata provider asked us to slow down
    #[error("provider throttled the request")]
    Throttled { retry_after: Option<Duration> },

    #[error("page cap of {cap} exceeded for {url}")]
    PageCapExceeded { url: String, cap: u32 },
}

impl SourceError {
    pub fn transient(url: impl Into<String>, message: impl Into<String>) -> Self {
        SourceError::Transient {
            url: url.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(url: impl Into<String>, message: impl Into<String>) -> Self {
        SourceError::Permanent {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient { .. } | SourceError::Throttled { .. })
    }

    /// Server-provided hint (`Retry-After`) for the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::Transient { retry_after, .. } | SourceError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// True for the answers the site gives when asked for the page after
    /// the last one: a 404, a page without a listing, or a request past the
    /// page cap. Only meaningful when the previous page reported no next page.
    pub fn ends_listing(&self) -> bool {
        matches!(
            self,
            SourceError::NotFound { .. } | SourceError::NoListing(_) | SourceError::PageCapExceeded { .. }
        )
    }

    /// Short label for logs and batch summaries
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Auth(_) => "auth",
            SourceError::Transient { .. } => "fetch_transient",
            SourceError::Permanent { .. } => "fetch_permanent",
            SourceError::NotFound { .. } => "not_found",
            SourceError::RateLimitTimeout { .. } => "rate_limit_timeout",
            SourceError::Parse(_) => "parse",
            SourceError::NoListing(_) => "no_listing",
            SourceError::Throttled { .. } => "throttled",
            SourceError::PageCapExceeded { .. } => "page_cap_exceeded",
        }
    }
}
