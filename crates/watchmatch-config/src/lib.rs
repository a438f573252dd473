pub mod config;
pub mod credentials;
pub mod paths;

pub use config::{AccountConfig, Config, MetadataConfig, RateLimitConfig, RetryConfig, SchedulerConfig, SiteConfig, SyncConfig, default_scheduler_config};
pub use credentials::CredentialStore;
pub use paths::{PathManager, container_base_path};
