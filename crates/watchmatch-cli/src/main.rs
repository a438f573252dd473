use clap::{ArgAction, Parser, Subcommand};
use color_eyre::eyre::eyre;
use commands::clear::ClearOptions;
use commands::matches::{MatchesArgs, ShowArgs};
use commands::sync::SyncArgs;
use commands::{clear, config, daemon, friends, matches, stats, sync};
use watchmatch_config::PathManager;
use watchmatch_models::MatchMode;

mod commands;
mod logging;
mod output;

#[derive(Parser)]
#[command(name = "watchmatch")]
#[command(about = "watchmatch - find the films you and your friends all want to watch")]
#[command(version)]
struct Cli {
    /// Enable verbose output (use multiple times for more verbosity: -v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "human", value_enum)]
    output: output::OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch watchlists and compute matches
    #[command(long_about = "Sync your own watchlist and your friends' watchlists, then list the films on yours that your friends also want to watch. Recently synced friends are reused unless --force is given. Ctrl-C cancels the batch; friends already committed keep their new data.")]
    Sync(SyncArgs),

    /// List friends and their sync state
    Friends {
        /// Re-fetch the friend list from the site first
        #[arg(long)]
        refresh: bool,
    },

    /// Recompute matches from stored watchlists (no fetching)
    Matches(MatchesArgs),

    /// Show one friend's stored watchlist
    Show(ShowArgs),

    /// Store statistics and recent sync history
    Stats {
        /// Number of sync history rows to show
        #[arg(long, default_value_t = 20)]
        history: usize,

        /// Only history for this friend
        #[arg(long, value_name = "HANDLE")]
        friend: Option<String>,
    },

    /// Clear stored data
    #[command(long_about = "Clear stored data. --data wipes friends, watchlists, cached metadata and sync history; --metadata only purges expired metadata; --exports removes exported CSV files; --credentials removes the session cookie and API key; --all does everything.")]
    Clear {
        /// Clear everything
        #[arg(long, action = ArgAction::SetTrue)]
        all: bool,

        /// Clear friends, watchlists, metadata and sync history
        #[arg(long, action = ArgAction::SetTrue)]
        data: bool,

        /// Purge expired metadata cache entries
        #[arg(long, action = ArgAction::SetTrue)]
        metadata: bool,

        /// Remove exported files
        #[arg(long, action = ArgAction::SetTrue)]
        exports: bool,

        /// Remove stored credentials
        #[arg(long, action = ArgAction::SetTrue)]
        credentials: bool,
    },

    /// Configure account, credentials and settings
    #[command(long_about = "Manage configuration and credentials. Running without a subcommand starts the interactive setup wizard.")]
    Config {
        #[command(subcommand)]
        cmd: Option<ConfigCommands>,
    },

    /// Run as a daemon that re-syncs on a cron schedule
    #[command(long_about = "Run in the foreground and re-sync every known friend on the configured schedule, exporting matches to the data directory after each batch. An initial sync runs on startup unless --no-startup-sync is given.")]
    Daemon {
        /// Cron schedule with seconds, e.g. '0 0 */6 * * *' for every 6 hours
        #[arg(long, value_name = "SCHEDULE")]
        schedule: Option<String>,

        /// Skip the initial sync on startup
        #[arg(long, action = ArgAction::SetTrue)]
        no_startup_sync: bool,

        /// all or any (defaults to sync.match_mode)
        #[arg(long)]
        mode: Option<MatchMode>,

        /// Write logs to a daily-rotated file in the log directory instead of stderr
        #[arg(long, action = ArgAction::SetTrue)]
        log_file: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration (masks secrets)
    Show {
        /// Show secrets unmasked
        #[arg(long, action = ArgAction::SetTrue)]
        full: bool,
    },

    /// Set the primary account
    Account {
        /// Your username on the site (prompted if omitted)
        username: Option<String>,
    },

    /// Store the site session cookie
    #[command(long_about = "Store a session cookie copied from a signed-in browser. It is attached to every site request; the cookie itself is never refreshed by watchmatch.")]
    Session {
        /// Cookie header value (prompted with hidden input if omitted)
        #[arg(long)]
        cookie: Option<String>,

        /// Days until the cookie expires
        #[arg(long, value_name = "DAYS")]
        expires_in_days: Option<i64>,
    },

    /// Store the metadata provider API key
    Tmdb {
        /// API key (prompted with hidden input if omitted)
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Configure sync options (prompts when no flag is given)
    Sync {
        /// Worker pool size
        #[arg(long)]
        concurrency: Option<usize>,

        /// Maximum pages fetched per watchlist
        #[arg(long)]
        page_cap: Option<u32>,

        /// Hours before a friend's watchlist is re-fetched
        #[arg(long)]
        resync_hours: Option<u32>,

        /// Default match mode (all or any)
        #[arg(long)]
        mode: Option<MatchMode>,
    },

    /// Configure the daemon schedule
    Schedule {
        /// Cron schedule with seconds
        #[arg(long)]
        cron: Option<String>,

        /// Run a sync as soon as the daemon starts
        #[arg(long)]
        run_on_startup: Option<bool>,
    },

    /// Interactive setup wizard
    Interactive,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let logging_ready = match &cli.command {
        Commands::Daemon { log_file: true, .. } => {
            let log_path = PathManager::default().daemon_log_file();
            logging::init_logging_with_file(cli.verbose, cli.quiet, Some(&log_path))
        }
        _ => logging::init_logging(cli.verbose, cli.quiet),
    };
    logging_ready.map_err(|e| eyre!("{}", e))?;

    let output = output::Output::new(cli.output, cli.quiet);

    match cli.command {
        Commands::Sync(args) => sync::run_sync(args, &output).await,
        Commands::Friends { refresh } => friends::run_friends(refresh, &output).await,
        Commands::Matches(args) => matches::run_matches(args, &output).await,
        Commands::Show(args) => matches::run_show(args, &output).await,
        Commands::Stats { history, friend } => stats::run_stats(history, friend, &output).await,
        Commands::Clear {
            all,
            data,
            metadata,
            exports,
            credentials,
        } => {
            let options = ClearOptions {
                all,
                data,
                metadata,
                exports,
                credentials,
            };
            clear::run_clear(options, &output).await
        }
        Commands::Config { cmd } => config::run_config(cmd.unwrap_or(ConfigCommands::Interactive), &output).await,
        Commands::Daemon {
            schedule,
            no_startup_sync,
            mode,
            log_file: _,
        } => daemon::run_daemon(schedule, no_startup_sync, mode, &output).await,
    }
}
