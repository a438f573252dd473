use crate::commands::context::AppContext;
use crate::output::{heading, Output};
use chrono::Utc;
use color_eyre::Result;
use comfy_table::{Attribute, Cell, CellAlignment, Color, Table};
use serde_json::json;
use watchmatch_models::{FriendId, JobState};

pub async fn run_stats(history: usize, friend: Option<String>, output: &Output) -> Result<()> {
    let ctx = AppContext::load()?;

    let stats = ctx.store.call(|store| store.stats(Utc::now())).await?;
    let friend_id = friend.as_deref().map(FriendId::new);
    let jobs = ctx
        .store
        .call(move |store| store.job_history(friend_id.as_ref(), history))
        .await?;

    output.data(&json!({ "stats": stats, "history": jobs }));

    output.println(heading("Store"));
    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("Item").add_attribute(Attribute::Bold),
        Cell::new("Count").add_attribute(Attribute::Bold),
    ]);
    let rows: [(&str, String); 7] = [
        ("Primary user", stats.primary_user.clone().unwrap_or_else(|| "-".to_string())),
        ("Friends", stats.friends.to_string()),
        ("Watchlist entries", stats.watchlist_entries.to_string()),
        ("Cached metadata", stats.metadata_cached.to_string()),
        ("  not found on provider", stats.metadata_not_found.to_string()),
        ("  expired", stats.metadata_expired.to_string()),
        ("Job history rows", stats.job_history.to_string()),
    ];
    for (label, value) in rows {
        table.add_row(vec![Cell::new(label), Cell::new(value).set_alignment(CellAlignment::Right)]);
    }
    output.table(table);

    if jobs.is_empty() {
        return Ok(());
    }
    output.println("");
    output.println(heading("Recent sync jobs"));
    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("Finished").add_attribute(Attribute::Bold),
        Cell::new("Friend").add_attribute(Attribute::Bold),
        Cell::new("Outcome").add_attribute(Attribute::Bold),
        Cell::new("Generation").add_attribute(Attribute::Bold),
        Cell::new("Films").add_attribute(Attribute::Bold),
        Cell::new("Error").add_attribute(Attribute::Bold),
    ]);
    for job in &jobs {
        let color = match job.outcome {
            JobState::Completed => Color::Green,
            JobState::Failed => Color::Red,
            _ => Color::Yellow,
        };
        table.add_row(vec![
            Cell::new(
                job.finished_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default(),
            ),
            Cell::new(&job.friend_id),
            Cell::new(job.outcome).fg(color),
            Cell::new(job.generation_id.map(|g| g.to_string()).unwrap_or_default()),
            Cell::new(job.entries_found).set_alignment(CellAlignment::Right),
            Cell::new(job.error.as_deref().unwrap_or("")),
        ]);
    }
    output.table(table);
    Ok(())
}
