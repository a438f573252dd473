use crate::error::SourceError;
use crate::parser::{parse_friends_page, parse_page, WatchlistPage};
use crate::retry::RetryPolicy;
use crate::session::{SessionContext, SessionManager};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use watchmatch_models::{Friend, FriendId};

/// Raw HTTP response as seen by the fetcher
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub retry_after: Option<Duration>,
}

/// Single GET request against the site. Network failures map to
/// `SourceError::Transient`; HTTP status handling stays in the fetcher.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn get(&self, url: &str, session: &SessionContext) -> Result<TransportResponse, SourceError>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::permanent("", format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageTransport for ReqwestTransport {
    async fn get(&self, url: &str, session: &SessionContext) -> Result<TransportResponse, SourceError> {
        let mut request = self.client.get(url);
        if let Some(cookie) = &session.cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        for (name, value) in &session.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            let kind = if e.is_timeout() { "timeout" } else { "network error" };
            SourceError::transient(url, format!("{}: {}", kind, e))
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::transient(url, format!("failed to read body: {}", e)))?;

        Ok(TransportResponse {
            status,
            content_type,
            body,
            retry_after,
        })
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-2xx status to the error taxonomy
pub fn classify_status(url: &str, status: u16, retry_after: Option<Duration>) -> Result<(), SourceError> {
    match status {
        200..=299 => Ok(()),
        401 | 403 => Err(SourceError::Auth(format!("HTTP {} for {}", status, url))),
        408 | 429 | 500..=599 => Err(SourceError::Transient {
            url: url.to_string(),
            message: format!("HTTP {}", status),
            retry_after,
        }),
        404 => Err(SourceError::NotFound { url: url.to_string() }),
        _ => Err(SourceError::permanent(url, format!("HTTP {}", status))),
    }
}

/// Fetches watchlist pages for one owner at a time.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// URL of page `page_index` (1-based) of `owner`'s watchlist
    fn watchlist_url(&self, owner: &FriendId, page_index: u32) -> String;

    async fn fetch_page(&self, url: &str, page_index: u32) -> Result<WatchlistPage, SourceError>;
}

/// Site fetcher: session + rate limit slot + retry around every request
pub struct HttpPageFetcher {
    sessions: Arc<SessionManager>,
    transport: Arc<dyn PageTransport>,
    retry: RetryPolicy,
    base_url: String,
    host: String,
    page_cap: u32,
}

impl HttpPageFetcher {
    /// Create a fetcher
    ///
    /// # Arguments
    /// * `sessions` - Shared session manager (one per batch or process)
    /// * `transport` - HTTP transport
    /// * `base_url` - Site root, e.g. `https://letterboxd.com`
    /// * `host` - Rate limit bucket key for the site
    pub fn new(
        sessions: Arc<SessionManager>,
        transport: Arc<dyn PageTransport>,
        base_url: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            transport,
            retry: RetryPolicy::default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            host: host.into(),
            page_cap: 200,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_page_cap(mut self, page_cap: u32) -> Self {
        self.page_cap = page_cap.max(1);
        self
    }

    fn check_page_cap(&self, url: &str, page_index: u32) -> Result<(), SourceError> {
        if page_index > self.page_cap {
            warn!(
                operation = "fetch_page",
                url = %url,
                page = page_index,
                page_cap = self.page_cap,
                "Page cap exceeded"
            );
            return Err(SourceError::PageCapExceeded {
                url: url.to_string(),
                cap: self.page_cap,
            });
        }
        Ok(())
    }

    async fn get_once(&self, url: &str) -> Result<TransportResponse, SourceError> {
        let session = self.sessions.acquire().await?;
        self.sessions.acquire_slot(&self.host).await?;
        let response = self.transport.get(url, &session).await?;
        classify_status(url, response.status, response.retry_after)?;
        Ok(response)
    }

    /// Fetch with retry; returns the successful response
    async fn get_with_retry(&self, url: &str) -> Result<TransportResponse, SourceError> {
        let outcome = self.retry.run(move |_| self.get_once(url)).await;
        if outcome.attempts > 1 {
            debug!(url = %url, attempts = outcome.attempts, ok = outcome.result.is_ok(), "Request needed retries");
        }
        outcome.result
    }

    /// All accounts `owner` follows, across every page of the following list
    pub async fn fetch_friends(&self, owner: &str) -> Result<Vec<Friend>, SourceError> {
        let owner_id = FriendId::new(owner);
        let mut friends: Vec<Friend> = Vec::new();
        let mut page_index = 1;

        loop {
            let url = format!("{}/{}/following/page/{}/", self.base_url, owner_id, page_index);
            self.check_page_cap(&url, page_index)?;

            let response = self.get_with_retry(&url).await?;
            let page = parse_friends_page(&response.body, &owner_id)?;
            let before = friends.len();
            for friend in page.friends {
                if !friends.iter().any(|f| f.id == friend.id) {
                    friends.push(friend);
                }
            }
            debug!(owner = %owner_id, page = page_index, new_friends = friends.len() - before, "Fetched following page");

            if !page.has_next {
                break;
            }
            page_index += 1;
        }

        info!(
            operation = "fetch_friends",
            owner = %owner_id,
            count = friends.len(),
            "Fetched friend list"
        );
        Ok(friends)
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    fn watchlist_url(&self, owner: &FriendId, page_index: u32) -> String {
        format!("{}/{}/watchlist/page/{}/", self.base_url, owner, page_index)
    }

    async fn fetch_page(&self, url: &str, page_index: u32) -> Result<WatchlistPage, SourceError> {
        self.check_page_cap(url, page_index)?;
        let response = self.get_with_retry(url).await?;
        let page = parse_page(&response.body, response.content_type.as_deref())?;
        debug!(
            url = %url,
            page = page_index,
            entries = page.entries.len(),
            has_next = page.has_next,
            "Fetched watchlist page"
        );
        Ok(page)
    }
}
