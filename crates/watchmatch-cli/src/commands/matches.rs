use crate::commands::context::AppContext;
use crate::output::{heading, Output};
use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use comfy_table::{Attribute, Cell, CellAlignment, Color, Table};
use std::collections::BTreeSet;
use std::path::PathBuf;
use watchmatch_core::{
    committed_keys, compute_matches, export_matches_csv, friend_view, EnrichedMatch, FriendViewFilter,
    FriendViewRow,
};
use watchmatch_models::{FriendId, KeyConfidence, MatchMode};

#[derive(Debug, Args)]
pub struct MatchesArgs {
    /// Friend handle to compare against (repeatable; defaults to every known friend)
    #[arg(short, long = "friend", value_name = "HANDLE")]
    pub friends: Vec<String>,

    /// all: on every selected friend's list; any: on at least one
    #[arg(long)]
    pub mode: Option<MatchMode>,

    /// Skip metadata enrichment
    #[arg(long)]
    pub no_metadata: bool,

    /// Write the results to a CSV file
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Show at most this many rows
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Friend handle
    pub friend: String,

    /// Only movies on your own watchlist too
    #[arg(long)]
    pub common_only: bool,

    /// Filter titles by substring (case and accent insensitive)
    #[arg(long, value_name = "TEXT")]
    pub search: Option<String>,
}

/// Recompute matches from committed watchlists without touching the network
/// (apart from metadata lookups that miss the cache).
pub async fn run_matches(args: MatchesArgs, output: &Output) -> Result<()> {
    let ctx = AppContext::load()?;
    let mode = ctx.match_mode(args.mode)?;
    let primary = ctx.stored_primary().await?;

    let friend_ids: BTreeSet<FriendId> = if args.friends.is_empty() {
        ctx.store
            .call(|store| store.list_friends())
            .await?
            .into_iter()
            .map(|f| f.id)
            .collect()
    } else {
        args.friends.iter().map(FriendId::new).collect()
    };
    if friend_ids.is_empty() {
        output.warn("No friends selected. Run 'watchmatch friends --refresh' to load your friend list.");
        return Ok(());
    }

    let keys = ctx.store.call(move |store| committed_keys(store, &friend_ids)).await?;
    let results = compute_matches(&primary, &keys, mode);

    let client = if args.no_metadata {
        None
    } else {
        ctx.metadata_client(ctx.sessions())?
    };
    let mut matches = match client {
        Some(client) => client.enrich(results).await?,
        None => results.into_iter().map(EnrichedMatch::bare).collect(),
    };

    if let Some(path) = &args.export {
        export_matches_csv(path, &matches).map_err(|e| eyre!("{:#}", e))?;
        output.success(format!("Exported {} matches to {}", matches.len(), path.display()));
    }

    if let Some(limit) = args.limit {
        matches.truncate(limit);
    }
    output.println(heading(&format!("Matches ({} mode, {} friends)", mode, keys.len())));
    print_matches(output, &matches);
    output.data(&matches);
    Ok(())
}

pub async fn run_show(args: ShowArgs, output: &Output) -> Result<()> {
    let ctx = AppContext::load()?;
    let primary = ctx.stored_primary().await?;

    let id = FriendId::new(&args.friend);
    let lookup = id.clone();
    let friend = ctx
        .store
        .call(move |store| store.get_friend(&lookup))
        .await?
        .ok_or_else(|| eyre!("Unknown friend '{}'", args.friend))?;
    let entries = ctx.store.call(move |store| store.load_watchlist(&id)).await?;

    let filter = FriendViewFilter {
        common_only: args.common_only,
        title_contains: args.search,
    };
    let rows = friend_view(&primary, &entries, &filter);

    let synced = friend
        .last_synced_at
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".to_string());
    output.println(heading(&format!("{} ({})", friend.display_name, friend.handle)));
    output.println(format!("{} films shown · last synced {}", rows.len(), synced));
    print_friend_view(output, &rows);
    output.data(&rows);
    Ok(())
}

pub fn print_matches(output: &Output, matches: &[EnrichedMatch]) {
    if matches.is_empty() {
        output.info("No matches.");
        return;
    }

    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("#").add_attribute(Attribute::Bold),
        Cell::new("Title").add_attribute(Attribute::Bold),
        Cell::new("Year").add_attribute(Attribute::Bold),
        Cell::new("Friends").add_attribute(Attribute::Bold),
        Cell::new("Rating").add_attribute(Attribute::Bold),
        Cell::new("Runtime").add_attribute(Attribute::Bold),
        Cell::new("Director").add_attribute(Attribute::Bold),
    ]);
    let mut title_only = 0;
    for (rank, m) in matches.iter().enumerate() {
        let friends = m
            .result
            .matching_friend_ids
            .iter()
            .map(FriendId::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let rating = m
            .metadata
            .as_ref()
            .and_then(|md| md.rating)
            .map(|r| format!("{:.1}", r))
            .unwrap_or_default();
        let runtime = m
            .metadata
            .as_ref()
            .and_then(|md| md.runtime_minutes)
            .map(|minutes| format!("{}m", minutes))
            .unwrap_or_default();
        let director = m.metadata.as_ref().and_then(|md| md.director.clone()).unwrap_or_default();
        let year = match m.result.confidence {
            KeyConfidence::Low => {
                title_only += 1;
                Cell::new("?").fg(Color::Yellow)
            }
            KeyConfidence::High => Cell::new(m.result.year.map(|y| y.to_string()).unwrap_or_default()),
        };
        table.add_row(vec![
            Cell::new(rank + 1).set_alignment(CellAlignment::Right),
            Cell::new(&m.result.title),
            year,
            Cell::new(format!("{} ({})", m.result.friend_count(), friends)),
            Cell::new(rating).set_alignment(CellAlignment::Right),
            Cell::new(runtime).set_alignment(CellAlignment::Right),
            Cell::new(director),
        ]);
    }
    output.table(table);
    if title_only > 0 {
        output.info(format!(
            "{} match(es) marked '?' have no release year and matched on title alone",
            title_only
        ));
    }
}

fn print_friend_view(output: &Output, rows: &[FriendViewRow]) {
    if rows.is_empty() {
        output.info("Nothing to show.");
        return;
    }
    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("Title").add_attribute(Attribute::Bold),
        Cell::new("Year").add_attribute(Attribute::Bold),
        Cell::new("In common").add_attribute(Attribute::Bold),
    ]);
    for row in rows {
        let common = if row.in_common {
            Cell::new("✓").fg(Color::Green)
        } else {
            Cell::new("")
        };
        table.add_row(vec![
            Cell::new(&row.title),
            Cell::new(row.year.map(|y| y.to_string()).unwrap_or_default()),
            common.set_alignment(CellAlignment::Center),
        ]);
    }
    output.table(table);
}
