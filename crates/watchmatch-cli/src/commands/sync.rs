use crate::commands::context::AppContext;
use crate::commands::matches::print_matches;
use crate::commands::sync_ui::SyncUI;
use crate::output::{heading, Output};
use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use comfy_table::{Attribute, Cell, CellAlignment, Color, Table};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use watchmatch_core::{
    export_matches_csv, BatchStatus, BatchSummary, SyncError, SyncHandle, SyncOptions, SyncOrchestrator,
    SyncRequest,
};
use watchmatch_models::{Friend, FriendId, JobState, MatchMode, SyncJob};

#[derive(Debug, Clone, Args)]
pub struct SyncArgs {
    /// Friend handle to sync (repeatable; defaults to every known friend)
    #[arg(short, long = "friend", value_name = "HANDLE")]
    pub friends: Vec<String>,

    /// all: on every selected friend's list; any: on at least one
    #[arg(long)]
    pub mode: Option<MatchMode>,

    /// Re-fetch watchlists even if they were synced recently
    #[arg(long)]
    pub force: bool,

    /// Re-fetch the friend list before syncing
    #[arg(long)]
    pub refresh_friends: bool,

    /// Worker pool size (overrides sync.concurrency)
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Write the matches to a CSV file
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,
}

/// A batch ready to start: primary synced, friends selected
pub struct PreparedBatch {
    orchestrator: SyncOrchestrator,
    request: SyncRequest,
}

impl PreparedBatch {
    pub fn friend_count(&self) -> usize {
        self.request.friend_ids.len()
    }

    pub fn start(self, cancel: CancellationToken) -> SyncHandle {
        self.orchestrator.start_sync_with(self.request, cancel)
    }
}

/// Sync the primary watchlist, load friends if needed and build the request
pub async fn prepare(ctx: &AppContext, args: &SyncArgs, mode: MatchMode) -> Result<PreparedBatch> {
    let (orchestrator, fetcher) = ctx.orchestrator()?;

    let primary_user = ctx.primary();
    let primary = orchestrator
        .sync_primary(&primary_user, args.force)
        .await
        .map_err(|e| eyre!("Could not load your own watchlist ({}): {}", primary_user.handle, e))?;
    info!(operation = "sync_primary", entries = primary.len(), "Primary watchlist ready");

    let mut known = ctx.store.call(|store| store.list_friends()).await?;
    if args.refresh_friends || known.is_empty() {
        match ctx.refresh_friends(&fetcher).await {
            Ok(friends) => known = friends,
            Err(e) if !known.is_empty() => {
                warn!(operation = "refresh_friends", error = %e, "Keeping the stored friend list");
            }
            Err(e) => return Err(e),
        }
    }

    let (friend_ids, added) = select_friends(&args.friends, &known, &primary_user.id);
    if !added.is_empty() {
        ctx.store.call(move |store| store.upsert_friends(&added)).await?;
    }

    let mut options = SyncOptions::from(&ctx.config.sync);
    options.force_refresh = args.force;
    if let Some(concurrency) = args.concurrency {
        options.concurrency = concurrency.max(1);
    }

    Ok(PreparedBatch {
        orchestrator,
        request: SyncRequest {
            primary: Arc::new(primary),
            friend_ids,
            options,
            mode,
        },
    })
}

/// Requested handles, or every known friend when none are given. Handles not
/// yet stored come back as new `Friend`s. The primary user is never selected.
pub fn select_friends(requested: &[String], known: &[Friend], primary: &FriendId) -> (BTreeSet<FriendId>, Vec<Friend>) {
    if requested.is_empty() {
        let ids = known.iter().map(|f| f.id.clone()).filter(|id| id != primary).collect();
        return (ids, Vec::new());
    }

    let mut ids = BTreeSet::new();
    let mut added = Vec::new();
    for handle in requested {
        let id = FriendId::new(handle);
        if id.as_str().is_empty() || &id == primary || !ids.insert(id.clone()) {
            continue;
        }
        if !known.iter().any(|f| f.id == id) {
            added.push(Friend::new(id.as_str(), handle.trim()));
        }
    }
    (ids, added)
}

pub async fn run_sync(args: SyncArgs, output: &Output) -> Result<()> {
    let ctx = AppContext::load()?;
    let mode = ctx.match_mode(args.mode)?;
    let batch = prepare(&ctx, &args, mode).await?;
    if batch.friend_count() == 0 {
        output.warn("No friends to sync. Follow someone on the site or pass --friend HANDLE.");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(operation = "sync_cancel", "Interrupted; stopping after in-flight pages");
                cancel.cancel();
            }
        })
    };

    let ui = Arc::new(SyncUI::new(batch.friend_count(), output.is_quiet() || !output.is_human()));
    let handle = batch.start(cancel);
    handle.subscribe(ui.clone());
    let result = handle.wait().await;
    ui.finish();
    ctrl_c.abort();

    let summary = match result {
        Ok(summary) => summary,
        Err(SyncError::AllJobsFailed { jobs }) => {
            print_jobs(output, &jobs);
            return Err(eyre!("All {} friend syncs failed", jobs.len()));
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(path) = &args.export {
        export_matches_csv(path, &summary.matches).map_err(|e| eyre!("{:#}", e))?;
        output.success(format!("Exported {} matches to {}", summary.matches.len(), path.display()));
    }
    print_summary(output, &summary);
    Ok(())
}

pub fn print_summary(output: &Output, summary: &BatchSummary) {
    output.data(summary);

    output.println(heading("Sync"));
    print_jobs(output, &summary.jobs);
    let counts = format!(
        "{} completed, {} failed, {} cancelled",
        summary.count(JobState::Completed),
        summary.count(JobState::Failed),
        summary.count(JobState::Cancelled)
    );
    match summary.status {
        BatchStatus::Completed => output.success(format!("Batch complete: {}", counts)),
        BatchStatus::PartiallyFailed => output.warn(format!("Batch partially failed: {}", counts)),
        BatchStatus::Cancelled => {
            output.warn(format!("Batch cancelled: {}", counts));
            return;
        }
        BatchStatus::Failed => output.error(format!("Batch failed: {}", counts)),
    }

    output.println("");
    output.println(heading(&format!("Matches ({} mode)", summary.mode)));
    print_matches(output, &summary.matches);
}

fn print_jobs(output: &Output, jobs: &[SyncJob]) {
    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("Friend").add_attribute(Attribute::Bold),
        Cell::new("State").add_attribute(Attribute::Bold),
        Cell::new("Pages").add_attribute(Attribute::Bold),
        Cell::new("Films").add_attribute(Attribute::Bold),
        Cell::new("Note").add_attribute(Attribute::Bold),
    ]);
    for job in jobs {
        let color = match job.state {
            JobState::Completed => Color::Green,
            JobState::Cancelled => Color::Yellow,
            JobState::Failed => Color::Red,
            _ => Color::Reset,
        };
        let note = match (&job.error, job.reused_cached) {
            (Some(error), _) => error.clone(),
            (None, true) => "recent, not re-fetched".to_string(),
            (None, false) => String::new(),
        };
        table.add_row(vec![
            Cell::new(&job.friend_id),
            Cell::new(job.state).fg(color),
            Cell::new(job.pages_fetched).set_alignment(CellAlignment::Right),
            Cell::new(job.entries_found).set_alignment(CellAlignment::Right),
            Cell::new(note),
        ]);
    }
    output.table(table);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> Vec<Friend> {
        vec![Friend::new("alice", "Alice"), Friend::new("bob", "Bob"), Friend::new("me", "Me")]
    }

    #[test]
    fn test_defaults_to_all_known_friends_except_primary() {
        let (ids, added) = select_friends(&[], &known(), &FriendId::new("me"));
        let ids: Vec<&str> = ids.iter().map(FriendId::as_str).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
        assert!(added.is_empty());
    }

    #[test]
    fn test_requested_handles_are_normalized_and_deduplicated() {
        let requested = vec!["Alice".to_string(), "alice/".to_string(), "carol".to_string(), "ME".to_string()];
        let (ids, added) = select_friends(&requested, &known(), &FriendId::new("me"));

        let ids: Vec<&str> = ids.iter().map(FriendId::as_str).collect();
        assert_eq!(ids, vec!["alice", "carol"]);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].id, FriendId::new("carol"));
    }
}
