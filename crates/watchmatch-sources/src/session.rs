use crate::error::SourceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

type HostLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Authenticated session material attached to every site request.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub cookie: Option<String>,
    pub headers: Vec<(String, String)>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionContext {
    pub fn with_cookie(cookie: impl Into<String>) -> Self {
        Self {
            cookie: Some(cookie.into()),
            ..Self::default()
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// Supplies a ready-to-use session. Logging in and refreshing cookies happen
/// outside this crate.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn session(&self) -> Result<SessionContext, SourceError>;
}

/// Hands out the same session every time (cookie from `credentials.toml`,
/// or anonymous access to public watchlists)
pub struct StaticSessionProvider {
    context: SessionContext,
}

impl StaticSessionProvider {
    pub fn new(context: SessionContext) -> Self {
        Self { context }
    }

    pub fn anonymous() -> Self {
        Self::new(SessionContext::default())
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn session(&self) -> Result<SessionContext, SourceError> {
        Ok(self.context.clone())
    }
}

/// Session plus per-host request budget, shared by every worker in a batch.
///
/// Each host gets its own token bucket with a burst of one, so however many
/// workers call [`SessionManager::acquire_slot`] concurrently, consecutive
/// requests to one host are spaced at least `1 / rate` apart.
pub struct SessionManager {
    provider: Arc<dyn SessionProvider>,
    default_rate: NonZeroU32,
    host_rates: HashMap<String, NonZeroU32>,
    acquire_timeout: Duration,
    limiters: Mutex<HashMap<String, Arc<HostLimiter>>>,
}

impl SessionManager {
    /// Create a session manager
    ///
    /// # Arguments
    /// * `provider` - Source of the authenticated session
    /// * `requests_per_second` - Default per-host rate (zero is treated as one)
    /// * `acquire_timeout` - Longest a caller may wait for a slot
    pub fn new(provider: Arc<dyn SessionProvider>, requests_per_second: u32, acquire_timeout: Duration) -> Self {
        Self {
            provider,
            default_rate: NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN),
            host_rates: HashMap::new(),
            acquire_timeout,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Give `host` its own rate instead of the default (metadata provider bucket)
    pub fn with_host_rate(mut self, host: impl Into<String>, requests_per_second: u32) -> Self {
        self.host_rates.insert(
            host.into().to_lowercase(),
            NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN),
        );
        self
    }

    /// Get a valid session, or `Auth` when the provider's session has expired
    pub async fn acquire(&self) -> Result<SessionContext, SourceError> {
        let context = self.provider.session().await?;
        if !context.is_valid(Utc::now()) {
            warn!(operation = "session_acquire", status = "expired", "Session has expired");
            return Err(SourceError::Auth(
                "session expired; provide a fresh session cookie".to_string(),
            ));
        }
        Ok(context)
    }

    /// Wait for a request token for `host`
    ///
    /// # Errors
    /// `RateLimitTimeout` if no token becomes available within the acquire timeout.
    pub async fn acquire_slot(&self, host: &str) -> Result<(), SourceError> {
        let limiter = self.limiter_for(host);
        match tokio::time::timeout(self.acquire_timeout, limiter.until_ready()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(
                    operation = "acquire_slot",
                    host = %host,
                    waited_ms = self.acquire_timeout.as_millis() as u64,
                    "Timed out waiting for rate limit slot"
                );
                Err(SourceError::RateLimitTimeout {
                    host: host.to_string(),
                    waited: self.acquire_timeout,
                })
            }
        }
    }

    fn limiter_for(&self, host: &str) -> Arc<HostLimiter> {
        let host = host.to_lowercase();
        // Poisoning cannot leave the map half-updated
        let mut limiters = self.limiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        limiters
            .entry(host.clone())
            .or_insert_with(|| {
                let rate = self.host_rates.get(&host).copied().unwrap_or(self.default_rate);
                debug!(operation = "limiter_create", host = %host, rate = rate.get(), "Creating host rate limiter");
                Arc::new(RateLimiter::direct(Quota::per_second(rate).allow_burst(NonZeroU32::MIN)))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn manager(rate: u32, timeout: Duration) -> SessionManager {
        SessionManager::new(Arc::new(StaticSessionProvider::anonymous()), rate, timeout)
    }

    #[tokio::test]
    async fn test_expired_session_is_auth_error() {
        let context = SessionContext {
            cookie: Some("c=1".to_string()),
            headers: Vec::new(),
            expires_at: Some(Utc::now() - chrono::Duration::minutes(1)),
        };
        let sessions = SessionManager::new(
            Arc::new(StaticSessionProvider::new(context)),
            1,
            Duration::from_secs(1),
        );
        assert!(matches!(sessions.acquire().await, Err(SourceError::Auth(_))));
    }

    #[tokio::test]
    async fn test_concurrent_workers_respect_host_rate() {
        // 10 rps with burst 1 means acquisition k can happen no earlier than k * 100ms
        let sessions = Arc::new(manager(10, Duration::from_secs(5)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let sessions = sessions.clone();
            handles.push(tokio::spawn(async move {
                let mut stamps = Vec::new();
                for _ in 0..2 {
                    sessions.acquire_slot("letterboxd.com").await.unwrap();
                    stamps.push(start.elapsed());
                }
                stamps
            }));
        }

        let mut stamps = Vec::new();
        for handle in handles {
            stamps.extend(handle.await.unwrap());
        }
        stamps.sort();

        assert_eq!(stamps.len(), 8);
        for (k, stamp) in stamps.iter().enumerate() {
            let earliest = Duration::from_millis(100 * k as u64).saturating_sub(Duration::from_millis(15));
            assert!(*stamp >= earliest, "acquisition {} at {:?} is earlier than {:?}", k, stamp, earliest);
        }
    }

    #[tokio::test]
    async fn test_hosts_have_independent_buckets() {
        let sessions = manager(1, Duration::from_secs(5)).with_host_rate("api.themoviedb.org", 1);
        let start = Instant::now();
        sessions.acquire_slot("letterboxd.com").await.unwrap();
        sessions.acquire_slot("api.themoviedb.org").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_slot_timeout() {
        let sessions = manager(1, Duration::from_millis(50));
        sessions.acquire_slot("letterboxd.com").await.unwrap();
        let result = sessions.acquire_slot("letterboxd.com").await;
        assert!(matches!(result, Err(SourceError::RateLimitTimeout { .. })));
    }
}
