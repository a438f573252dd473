use super::prompts;
use crate::output::{heading, Output};
use crate::ConfigCommands;
use chrono::{Duration, Utc};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use comfy_table::{Attribute, Cell, Color, Table};
use serde_json::json;
use watchmatch_config::{default_scheduler_config, Config, CredentialStore, PathManager};
use watchmatch_models::MatchMode;

pub async fn run_config(cmd: ConfigCommands, output: &Output) -> Result<()> {
    let paths = PathManager::default();
    match cmd {
        ConfigCommands::Show { full } => show_config(&paths, full, output),
        ConfigCommands::Account { username } => configure_account(&paths, username, output),
        ConfigCommands::Session { cookie, expires_in_days } => {
            configure_session(&paths, cookie, expires_in_days, output)
        }
        ConfigCommands::Tmdb { api_key } => configure_tmdb(&paths, api_key, output),
        ConfigCommands::Sync {
            concurrency,
            page_cap,
            resync_hours,
            mode,
        } => configure_sync(&paths, concurrency, page_cap, resync_hours, mode, output),
        ConfigCommands::Schedule { cron, run_on_startup } => configure_schedule(&paths, cron, run_on_startup, output),
        ConfigCommands::Interactive => run_interactive_config(&paths, output),
    }
}

fn load_config(paths: &PathManager) -> Result<Option<Config>> {
    let config_file = paths.config_file();
    if !config_file.exists() {
        return Ok(None);
    }
    Config::load_from_file(&config_file)
        .map(Some)
        .map_err(|e| eyre!("Failed to load config from {}: {}", config_file.display(), e))
}

fn save_config(paths: &PathManager, config: &Config) -> Result<()> {
    config
        .validate()
        .map_err(|e| eyre!("Refusing to save invalid configuration: {}", e))?;
    let config_file = paths.config_file();
    config
        .save_to_file(&config_file)
        .map_err(|e| eyre!("Failed to save config to {}: {}", config_file.display(), e))
}

fn load_credentials(paths: &PathManager) -> Result<CredentialStore> {
    let mut store = CredentialStore::new(paths.credentials_file());
    store
        .load()
        .map_err(|e| eyre!("Failed to load credentials: {}", e))?;
    Ok(store)
}

fn save_credentials(store: &CredentialStore) -> Result<()> {
    store
        .save()
        .map_err(|e| eyre!("Failed to save credentials: {}", e))
}

/// Existing config, or a fresh one for `username` (prompted when absent)
fn load_or_init(paths: &PathManager, username: Option<String>) -> Result<Config> {
    if let Some(config) = load_config(paths)? {
        return Ok(config);
    }
    let username = match username {
        Some(u) => u,
        None => prompts::prompt_string("Your username on the site", None)?,
    };
    Ok(Config::for_user(username))
}

fn show_config(paths: &PathManager, full: bool, output: &Output) -> Result<()> {
    let config_file = paths.config_file();
    let Some(config) = load_config(paths)? else {
        output.warn(format!("Configuration file not found at: {}", config_file.display()));
        output.info("Create one with 'watchmatch config' or 'watchmatch config account <USERNAME>'.");
        return Ok(());
    };
    let credentials = load_credentials(paths)?;
    let secret = |value: Option<&String>| match value {
        Some(v) if full => v.clone(),
        Some(v) => mask_string(v),
        None => "<not set>".to_string(),
    };
    let session_cookie = secret(credentials.get_session_cookie());
    let session_expires = credentials
        .get_session_expires()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let tmdb_key = secret(credentials.get_tmdb_api_key());

    output.data(&json!({
        "config_file": config_file,
        "config": config,
        "credentials": {
            "session_cookie": session_cookie,
            "session_expires": session_expires,
            "tmdb_api_key": tmdb_key,
        },
    }));

    output.println(heading("Configuration"));
    output.println(format!("Config file: {}", config_file.display()));
    output.println(format!("Database:    {}", paths.database_file().display()));
    output.println("");

    let scheduler = config.scheduler.clone().unwrap_or_else(default_scheduler_config);
    let sections: Vec<(&str, Vec<(&str, String)>)> = vec![
        (
            "Account",
            vec![
                ("Username", config.account.username.clone()),
                ("Site", config.site.base_url.clone()),
                ("Request timeout", format!("{}s", config.site.request_timeout_secs)),
                ("Session cookie", session_cookie),
                ("Session expires", session_expires),
            ],
        ),
        (
            "Sync",
            vec![
                ("Concurrency", config.sync.concurrency.to_string()),
                ("Page cap", config.sync.page_cap.to_string()),
                ("Resync threshold", format!("{}h", config.sync.resync_threshold_hours)),
                (
                    "Match mode",
                    config
                        .sync
                        .match_mode
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "<pass --mode>".to_string()),
                ),
            ],
        ),
        (
            "Rate limits & retry",
            vec![
                ("Site req/s", config.rate_limit.site_requests_per_second.to_string()),
                ("Metadata req/s", config.rate_limit.metadata_requests_per_second.to_string()),
                ("Acquire timeout", format!("{}s", config.rate_limit.acquire_timeout_secs)),
                ("Max attempts", config.retry.max_attempts.to_string()),
                (
                    "Backoff",
                    format!(
                        "{}ms to {}ms{}",
                        config.retry.base_delay_ms,
                        config.retry.max_delay_ms,
                        if config.retry.jitter { " (jitter)" } else { "" }
                    ),
                ),
            ],
        ),
        (
            "Metadata",
            vec![
                ("Enabled", config.metadata.enabled.to_string()),
                ("Provider", config.metadata.base_url.clone()),
                ("Cache TTL", format!("{} days", config.metadata.ttl_days)),
                ("Batch size", config.metadata.batch_size.to_string()),
                ("API key", tmdb_key),
            ],
        ),
        (
            "Scheduler",
            vec![
                ("Schedule", scheduler.schedule.clone()),
                ("Run on startup", scheduler.run_on_startup.to_string()),
            ],
        ),
    ];

    for (title, rows) in sections {
        let mut table = Table::new();
        table.set_header(vec![
            Cell::new(title).fg(Color::Cyan).add_attribute(Attribute::Bold),
            Cell::new(""),
        ]);
        for (key, value) in rows {
            table.add_row(vec![Cell::new(key), Cell::new(value)]);
        }
        output.table(table);
    }
    Ok(())
}

fn configure_account(paths: &PathManager, username: Option<String>, output: &Output) -> Result<()> {
    let mut config = load_or_init(paths, username.clone())?;
    let username = match username {
        Some(u) => u,
        None => prompts::prompt_string("Your username on the site", Some(&config.account.username))?,
    };
    config.account.username = username.trim().to_string();
    save_config(paths, &config)?;
    output.success(format!("Account set to '{}'", config.account.username));
    Ok(())
}

fn configure_session(
    paths: &PathManager,
    cookie: Option<String>,
    expires_in_days: Option<i64>,
    output: &Output,
) -> Result<()> {
    let cookie = match cookie {
        Some(c) => Some(c),
        None => {
            output.println("Paste the session cookie from a signed-in browser (input is hidden).");
            prompts::prompt_secret("Session cookie")?
        }
    };
    let Some(cookie) = cookie else {
        output.info("Session cookie unchanged");
        return Ok(());
    };

    let mut credentials = load_credentials(paths)?;
    credentials.set_session_cookie(cookie.trim().to_string());
    if let Some(days) = expires_in_days {
        credentials.set_session_expires(Utc::now() + Duration::days(days));
    }
    save_credentials(&credentials)?;
    output.success("Session cookie saved");
    Ok(())
}

fn configure_tmdb(paths: &PathManager, api_key: Option<String>, output: &Output) -> Result<()> {
    let api_key = match api_key {
        Some(k) => Some(k),
        None => prompts::prompt_secret("Metadata provider API key")?,
    };
    let Some(api_key) = api_key else {
        output.info("API key unchanged");
        return Ok(());
    };

    let mut credentials = load_credentials(paths)?;
    credentials.set_tmdb_api_key(api_key.trim().to_string());
    save_credentials(&credentials)?;
    output.success("Metadata API key saved");
    Ok(())
}

fn configure_sync(
    paths: &PathManager,
    concurrency: Option<usize>,
    page_cap: Option<u32>,
    resync_hours: Option<u32>,
    mode: Option<MatchMode>,
    output: &Output,
) -> Result<()> {
    let mut config = load_config(paths)?.ok_or_else(|| eyre!("No configuration yet. Run 'watchmatch config' first."))?;
    let interactive = concurrency.is_none() && page_cap.is_none() && resync_hours.is_none() && mode.is_none();

    if interactive {
        prompt_sync_settings(&mut config)?;
    } else {
        if let Some(concurrency) = concurrency {
            config.sync.concurrency = concurrency;
        }
        if let Some(page_cap) = page_cap {
            config.sync.page_cap = page_cap;
        }
        if let Some(hours) = resync_hours {
            config.sync.resync_threshold_hours = hours;
        }
        if mode.is_some() {
            config.sync.match_mode = mode;
        }
    }

    save_config(paths, &config)?;
    output.success("Sync options saved");
    Ok(())
}

fn prompt_sync_settings(config: &mut Config) -> Result<()> {
    config.sync.concurrency = prompts::prompt_parsed("Friends to sync in parallel", config.sync.concurrency)?;
    config.sync.page_cap = prompts::prompt_parsed("Maximum pages per watchlist", config.sync.page_cap)?;
    config.sync.resync_threshold_hours = prompts::prompt_parsed(
        "Hours before a friend's watchlist is re-fetched",
        config.sync.resync_threshold_hours,
    )?;

    let current = match config.sync.match_mode {
        Some(MatchMode::All) => 1,
        Some(MatchMode::Any) => 2,
        None => 0,
    };
    config.sync.match_mode = match prompts::prompt_select(
        "Default match mode",
        &["none (pass --mode each time)", "all friends", "any friend"],
        current,
    )? {
        1 => Some(MatchMode::All),
        2 => Some(MatchMode::Any),
        _ => None,
    };
    Ok(())
}

fn configure_schedule(
    paths: &PathManager,
    cron: Option<String>,
    run_on_startup: Option<bool>,
    output: &Output,
) -> Result<()> {
    let mut config = load_config(paths)?.ok_or_else(|| eyre!("No configuration yet. Run 'watchmatch config' first."))?;
    let mut scheduler = config.scheduler.take().unwrap_or_else(default_scheduler_config);

    match cron {
        Some(cron) => scheduler.schedule = cron,
        None if run_on_startup.is_none() => {
            output.println("Cron format has six fields: sec min hour day month weekday.");
            scheduler.schedule = prompts::prompt_string("Schedule", Some(&scheduler.schedule))?;
        }
        None => {}
    }
    if let Some(run) = run_on_startup {
        scheduler.run_on_startup = run;
    }

    config.scheduler = Some(scheduler);
    save_config(paths, &config)?;
    output.success("Scheduler options saved");
    Ok(())
}

/// Guided setup: account, session, metadata and sync options in one pass
pub fn run_interactive_config(paths: &PathManager, output: &Output) -> Result<()> {
    output.println(heading("watchmatch setup"));
    let existing = load_config(paths)?;
    let current_user = existing.as_ref().map(|c| c.account.username.clone());
    let mut config = existing.unwrap_or_else(|| Config::for_user(""));

    config.account.username = prompts::prompt_string("Your username on the site", current_user.as_deref())?;

    let mut credentials = load_credentials(paths)?;
    output.println("");
    output.println("A session cookie lets watchmatch read friends' private or logged-in pages.");
    if let Some(cookie) = prompts::prompt_secret("Session cookie (leave empty to skip)")? {
        credentials.set_session_cookie(cookie);
    }

    output.println("");
    config.metadata.enabled = prompts::prompt_yes_no("Enrich matches with posters and ratings?", config.metadata.enabled)?;
    if config.metadata.enabled && credentials.get_tmdb_api_key().is_none() {
        match prompts::prompt_secret("Metadata provider API key (leave empty to skip)")? {
            Some(key) => credentials.set_tmdb_api_key(key),
            None => output.warn("No API key stored; matches will be shown without metadata"),
        }
    }

    output.println("");
    if prompts::prompt_yes_no("Adjust sync options?", false)? {
        prompt_sync_settings(&mut config)?;
    }

    save_config(paths, &config)?;
    save_credentials(&credentials)?;
    output.success(format!("Configuration saved to {}", paths.config_file().display()));
    Ok(())
}

fn mask_string(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.is_empty() {
        return "<not set>".to_string();
    }
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}***{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use tempfile::TempDir;

    fn quiet() -> Output {
        Output::new(OutputFormat::Human, true)
    }

    #[test]
    fn test_mask_string() {
        assert_eq!(mask_string(""), "<not set>");
        assert_eq!(mask_string("abc"), "***");
        assert_eq!(mask_string("abcdef123"), "ab***23");
        assert_eq!(mask_string("ééééé"), "éé***éé");
    }

    #[test]
    fn test_account_creates_config() {
        let dir = TempDir::new().unwrap();
        let paths = PathManager::with_base(dir.path().to_path_buf());
        configure_account(&paths, Some("  cinephile ".to_string()), &quiet()).unwrap();

        let config = load_config(&paths).unwrap().unwrap();
        assert_eq!(config.account.username, "cinephile");
    }

    #[test]
    fn test_sync_flags_update_only_given_fields() {
        let dir = TempDir::new().unwrap();
        let paths = PathManager::with_base(dir.path().to_path_buf());
        configure_account(&paths, Some("me".to_string()), &quiet()).unwrap();
        let before = load_config(&paths).unwrap().unwrap();

        configure_sync(&paths, Some(8), None, None, Some(MatchMode::All), &quiet()).unwrap();
        let after = load_config(&paths).unwrap().unwrap();
        assert_eq!(after.sync.concurrency, 8);
        assert_eq!(after.sync.page_cap, before.sync.page_cap);
        assert_eq!(after.sync.match_mode, Some(MatchMode::All));
    }

    #[test]
    fn test_invalid_values_are_not_saved() {
        let dir = TempDir::new().unwrap();
        let paths = PathManager::with_base(dir.path().to_path_buf());
        configure_account(&paths, Some("me".to_string()), &quiet()).unwrap();

        assert!(configure_sync(&paths, Some(0), None, None, None, &quiet()).is_err());
        assert_eq!(load_config(&paths).unwrap().unwrap().sync.concurrency, Config::for_user("me").sync.concurrency);
    }

    #[test]
    fn test_session_cookie_with_expiry() {
        let dir = TempDir::new().unwrap();
        let paths = PathManager::with_base(dir.path().to_path_buf());
        configure_session(&paths, Some("abc=123".to_string()), Some(7), &quiet()).unwrap();

        let credentials = load_credentials(&paths).unwrap();
        assert_eq!(credentials.get_session_cookie().map(String::as_str), Some("abc=123"));
        assert!(credentials.get_session_expires().unwrap() > Utc::now() + Duration::days(6));
    }

    #[test]
    fn test_schedule_flags() {
        let dir = TempDir::new().unwrap();
        let paths = PathManager::with_base(dir.path().to_path_buf());
        configure_account(&paths, Some("me".to_string()), &quiet()).unwrap();
        configure_schedule(&paths, Some("0 30 2 * * *".to_string()), Some(false), &quiet()).unwrap();

        let scheduler = load_config(&paths).unwrap().unwrap().scheduler.unwrap();
        assert_eq!(scheduler.schedule, "0 30 2 * * *");
        assert!(!scheduler.run_on_startup);
    }
}
