use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};
use watchmatch_config::{Config, CredentialStore, PathManager};
use watchmatch_core::{MetadataClient, Store, SyncOrchestrator, WatchlistSnapshot};
use watchmatch_models::{Friend, MatchMode};
use watchmatch_sources::{
    HttpPageFetcher, ReqwestTransport, RetryPolicy, SessionContext, SessionManager, StaticSessionProvider,
    TmdbProvider,
};

/// Loaded configuration, credentials and the open store shared by every command
pub struct AppContext {
    pub paths: PathManager,
    pub config: Config,
    pub credentials: CredentialStore,
    pub store: Arc<Store>,
}

impl AppContext {
    pub fn load() -> Result<Self> {
        Self::load_from(PathManager::default())
    }

    pub fn load_from(paths: PathManager) -> Result<Self> {
        let config_file = paths.config_file();
        if !config_file.exists() {
            return Err(eyre!(
                "No configuration found at {}. Run 'watchmatch config' first.",
                config_file.display()
            ));
        }
        let config = Config::load_from_file(&config_file)
            .map_err(|e| eyre!("Failed to load config from {}: {}", config_file.display(), e))?;
        config
            .validate()
            .map_err(|e| eyre!("Invalid configuration: {}", e))?;

        let mut credentials = CredentialStore::new(paths.credentials_file());
        credentials
            .load()
            .map_err(|e| eyre!("Failed to load credentials: {}", e))?;

        paths
            .ensure_directories()
            .map_err(|e| eyre!("Failed to create data directories: {}", e))?;
        let database = paths.database_file();
        let store = Store::open(&database).wrap_err_with(|| format!("Failed to open {}", database.display()))?;

        Ok(Self {
            paths,
            config,
            credentials,
            store: Arc::new(store),
        })
    }

    /// The configured account as a `Friend`
    pub fn primary(&self) -> Friend {
        let username = &self.config.account.username;
        Friend::new(username, username)
    }

    /// `--mode` wins over `sync.match_mode`; one of them must be set
    pub fn match_mode(&self, requested: Option<MatchMode>) -> Result<MatchMode> {
        requested
            .or(self.config.sync.match_mode)
            .ok_or_else(|| eyre!("No match mode given. Pass --mode all|any or set sync.match_mode in the config"))
    }

    /// Session manager holding the site and metadata token buckets
    pub fn sessions(&self) -> Arc<SessionManager> {
        let context = SessionContext {
            cookie: self.credentials.get_session_cookie().cloned(),
            headers: Vec::new(),
            expires_at: self.credentials.get_session_expires(),
        };
        let rate = &self.config.rate_limit;
        let manager = SessionManager::new(
            Arc::new(StaticSessionProvider::new(context)),
            rate.site_requests_per_second,
            rate.acquire_timeout(),
        )
        .with_host_rate(self.config.metadata.host(), rate.metadata_requests_per_second);
        Arc::new(manager)
    }

    pub fn fetcher(&self, sessions: Arc<SessionManager>) -> Result<Arc<HttpPageFetcher>> {
        let site = &self.config.site;
        let transport = ReqwestTransport::new(&site.user_agent, site.request_timeout())?;
        let fetcher = HttpPageFetcher::new(sessions, Arc::new(transport), &site.base_url, site.host())
            .with_retry(RetryPolicy::from(&self.config.retry))
            .with_page_cap(self.config.sync.page_cap);
        Ok(Arc::new(fetcher))
    }

    /// `None` when enrichment is disabled or no API key is stored
    pub fn metadata_client(&self, sessions: Arc<SessionManager>) -> Result<Option<Arc<MetadataClient>>> {
        let metadata = &self.config.metadata;
        if !metadata.enabled {
            return Ok(None);
        }
        let Some(api_key) = self.credentials.get_tmdb_api_key() else {
            warn!(
                operation = "metadata_client",
                "Metadata enrichment enabled but no API key is stored; run 'watchmatch config tmdb'"
            );
            return Ok(None);
        };

        let provider = TmdbProvider::new(
            api_key.clone(),
            &metadata.base_url,
            &metadata.image_base_url,
            metadata.host(),
            self.config.site.request_timeout(),
        )?;
        let client = MetadataClient::new(self.store.clone(), Arc::new(provider), sessions)
            .with_retry(RetryPolicy::from(&self.config.retry))
            .with_ttl(metadata.ttl())
            .with_batch_size(metadata.batch_size);
        Ok(Some(Arc::new(client)))
    }

    /// Orchestrator wired to the live site, plus the fetcher for friend-list refreshes
    pub fn orchestrator(&self) -> Result<(SyncOrchestrator, Arc<HttpPageFetcher>)> {
        let sessions = self.sessions();
        let fetcher = self.fetcher(sessions.clone())?;
        let mut orchestrator = SyncOrchestrator::new(self.store.clone(), fetcher.clone())
            .with_resync_threshold(self.config.sync.resync_threshold());
        if let Some(client) = self.metadata_client(sessions)? {
            orchestrator = orchestrator.with_enrichment(client);
        }
        Ok((orchestrator, fetcher))
    }

    /// Fetch the primary user's follow list and store it
    pub async fn refresh_friends(&self, fetcher: &HttpPageFetcher) -> Result<Vec<Friend>> {
        let owner = self.config.account.username.clone();
        let friends = fetcher
            .fetch_friends(&owner)
            .await
            .wrap_err("Failed to fetch the friend list")?;
        let stored = friends.clone();
        self.store.call(move |store| store.upsert_friends(&stored)).await?;
        info!(operation = "refresh_friends", owner = %owner, count = friends.len(), "Friend list refreshed");
        Ok(friends)
    }

    /// The primary user's committed watchlist, without fetching
    pub async fn stored_primary(&self) -> Result<WatchlistSnapshot> {
        let primary = self
            .store
            .call(|store| store.primary_user())
            .await?
            .ok_or_else(|| eyre!("No primary watchlist stored yet. Run 'watchmatch sync' first."))?;
        let entries = self
            .store
            .call(move |store| store.load_watchlist(&primary.id))
            .await?;
        Ok(WatchlistSnapshot::from_entries(&entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(paths: &PathManager, config: &Config) {
        std::fs::create_dir_all(paths.config_dir()).unwrap();
        config.save_to_file(&paths.config_file()).unwrap();
    }

    #[test]
    fn test_missing_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = AppContext::load_from(PathManager::with_base(dir.path().to_path_buf()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("watchmatch config"));
    }

    #[test]
    fn test_match_mode_requires_explicit_choice() {
        let dir = TempDir::new().unwrap();
        let paths = PathManager::with_base(dir.path().to_path_buf());
        write_config(&paths, &Config::for_user("me"));

        let ctx = AppContext::load_from(paths).unwrap();
        assert!(ctx.match_mode(None).is_err());
        assert_eq!(ctx.match_mode(Some(MatchMode::Any)).unwrap(), MatchMode::Any);
    }

    #[test]
    fn test_configured_mode_is_used_when_flag_absent() {
        let dir = TempDir::new().unwrap();
        let paths = PathManager::with_base(dir.path().to_path_buf());
        let mut config = Config::for_user("me");
        config.sync.match_mode = Some(MatchMode::All);
        write_config(&paths, &config);

        let ctx = AppContext::load_from(paths).unwrap();
        assert_eq!(ctx.match_mode(None).unwrap(), MatchMode::All);
        assert_eq!(ctx.match_mode(Some(MatchMode::Any)).unwrap(), MatchMode::Any);
        assert_eq!(ctx.primary().handle, "me");
    }

    #[test]
    fn test_no_metadata_client_without_api_key() {
        let dir = TempDir::new().unwrap();
        let paths = PathManager::with_base(dir.path().to_path_buf());
        write_config(&paths, &Config::for_user("me"));

        let ctx = AppContext::load_from(paths).unwrap();
        assert!(ctx.metadata_client(ctx.sessions()).unwrap().is_none());
    }
}
