use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use watchmatch_models::MatchMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
}

/// The primary user whose watchlist every friend is compared against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per-request timeout; a timeout counts as a transient failure
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Worker pool size
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Hard ceiling on pages fetched for one friend
    #[serde(default = "default_page_cap")]
    pub page_cap: u32,
    /// Friends synced more recently than this are not re-fetched unless forced
    #[serde(default = "default_resync_threshold_hours")]
    pub resync_threshold_hours: u32,
    /// When unset, `watchmatch matches` requires `--mode`
    #[serde(default)]
    pub match_mode: Option<MatchMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per second against the watchlist site
    #[serde(default = "default_site_rps")]
    pub site_requests_per_second: u32,
    /// Requests per second against the metadata provider (separate bucket)
    #[serde(default = "default_metadata_rps")]
    pub metadata_requests_per_second: u32,
    /// How long a worker may wait for a token before giving up
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metadata_base_url")]
    pub base_url: String,
    #[serde(default = "default_image_base_url")]
    pub image_base_url: String,
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,
    /// Pending lookups grouped per provider round
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "https://letterboxd.com".to_string()
}

fn default_user_agent() -> String {
    format!("watchmatch/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_concurrency() -> usize {
    4
}

fn default_page_cap() -> u32 {
    200
}

fn default_resync_threshold_hours() -> u32 {
    24
}

fn default_site_rps() -> u32 {
    1
}

fn default_metadata_rps() -> u32 {
    4
}

fn default_acquire_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_metadata_base_url() -> String {
    "https://api.themoviedb.org/3".to_string()
}

fn default_image_base_url() -> String {
    "https://image.tmdb.org/t/p/w500".to_string()
}

fn default_ttl_days() -> u32 {
    30
}

fn default_batch_size() -> usize {
    20
}

fn default_schedule() -> String {
    "0 0 */6 * * *".to_string() // Every 6 hours
}

pub fn default_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        schedule: default_schedule(),
        run_on_startup: default_true(),
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            page_cap: default_page_cap(),
            resync_threshold_hours: default_resync_threshold_hours(),
            match_mode: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            site_requests_per_second: default_site_rps(),
            metadata_requests_per_second: default_metadata_rps(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_true(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            base_url: default_metadata_base_url(),
            image_base_url: default_image_base_url(),
            ttl_days: default_ttl_days(),
            batch_size: default_batch_size(),
        }
    }
}

impl SiteConfig {
    /// Host used as the rate-limit bucket key
    pub fn host(&self) -> String {
        host_of(&self.base_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl MetadataConfig {
    pub fn host(&self) -> String {
        host_of(&self.base_url)
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.ttl_days))
    }
}

impl RateLimitConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl SyncConfig {
    pub fn resync_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.resync_threshold_hours))
    }
}

/// Strip scheme, path and port from a URL, e.g. `https://api.x.org:443/3` -> `api.x.org`
fn host_of(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority
        .split(':')
        .next()
        .unwrap_or(authority)
        .to_lowercase()
}

impl Config {
    /// Minimal config for a primary user with every other section at its default
    pub fn for_user(username: impl Into<String>) -> Self {
        Self {
            account: AccountConfig {
                username: username.into(),
            },
            site: SiteConfig::default(),
            sync: SyncConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            metadata: MetadataConfig::default(),
            scheduler: None,
        }
    }

    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &PathBuf) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.account.username.trim().is_empty() || self.account.username == "YOUR_USERNAME" {
            return Err(anyhow::anyhow!("account.username is required"));
        }

        if !self.site.base_url.starts_with("http://") && !self.site.base_url.starts_with("https://") {
            return Err(anyhow::anyhow!("site.base_url must be an http(s) URL: {}", self.site.base_url));
        }
        if self.site.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("site.request_timeout_secs must be greater than zero"));
        }

        // Sync
        if self.sync.concurrency == 0 {
            return Err(anyhow::anyhow!("sync.concurrency must be at least 1"));
        }
        if self.sync.page_cap == 0 {
            return Err(anyhow::anyhow!("sync.page_cap must be at least 1"));
        }

        // Rate limits: a zero rate would block every request forever
        if self.rate_limit.site_requests_per_second == 0 {
            return Err(anyhow::anyhow!("rate_limit.site_requests_per_second must be at least 1"));
        }
        if self.rate_limit.metadata_requests_per_second == 0 {
            return Err(anyhow::anyhow!("rate_limit.metadata_requests_per_second must be at least 1"));
        }

        // Retry
        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow::anyhow!(
                "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            ));
        }

        if self.metadata.enabled {
            if self.metadata.ttl_days == 0 {
                return Err(anyhow::anyhow!("metadata.ttl_days must be at least 1"));
            }
            if self.metadata.batch_size == 0 {
                return Err(anyhow::anyhow!("metadata.batch_size must be at least 1"));
            }
        }

        if let Some(scheduler) = &self.scheduler {
            if scheduler.schedule.split_whitespace().count() != 6 {
                return Err(anyhow::anyhow!(
                    "scheduler.schedule must have six fields (sec min hour day month weekday): {}",
                    scheduler.schedule
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_load_and_save() {
        let file = NamedTempFile::new().unwrap();
        let mut config = Config::for_user("cinephile");
        config.sync.concurrency = 8;
        config.sync.match_mode = Some(MatchMode::Any);
        config.scheduler = Some(default_scheduler_config());

        let path = file.path().to_path_buf();
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.account.username, "cinephile");
        assert_eq!(loaded.sync.concurrency, 8);
        assert_eq!(loaded.sync.match_mode, Some(MatchMode::Any));
        assert!(loaded.scheduler.is_some());
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config: Config = toml::from_str("[account]\nusername = \"alice\"\n").unwrap();
        assert_eq!(config.sync.concurrency, 4);
        assert_eq!(config.sync.resync_threshold_hours, 24);
        assert_eq!(config.sync.match_mode, None);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.metadata.enabled);
        assert!(config.scheduler.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate() {
        let mut config = Config::for_user("YOUR_USERNAME");
        assert!(config.validate().is_err());

        config.account.username = "alice".to_string();
        assert!(config.validate().is_ok());

        config.sync.concurrency = 0;
        assert!(config.validate().is_err());
        config.sync.concurrency = 2;

        config.rate_limit.site_requests_per_second = 0;
        assert!(config.validate().is_err());
        config.rate_limit.site_requests_per_second = 2;

        config.retry.base_delay_ms = 60_000;
        assert!(config.validate().is_err());
        config.retry.base_delay_ms = 500;

        config.scheduler = Some(SchedulerConfig {
            schedule: "0 */6 * * *".to_string(),
            run_on_startup: true,
        });
        assert!(config.validate().is_err());
        config.scheduler = Some(default_scheduler_config());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_host_extraction() {
        let mut site = SiteConfig::default();
        site.base_url = "https://Letterboxd.com/".to_string();
        assert_eq!(site.host(), "letterboxd.com");

        let metadata = MetadataConfig::default();
        assert_eq!(metadata.host(), "api.themoviedb.org");
        assert_eq!(host_of("http://localhost:8080/x"), "localhost");
    }
}
