use crate::commands::context::AppContext;
use crate::output::{heading, Output};
use color_eyre::Result;
use comfy_table::{Attribute, Cell, CellAlignment, Table};
use serde::Serialize;
use watchmatch_models::Friend;

#[derive(Debug, Serialize)]
struct FriendRow {
    #[serde(flatten)]
    friend: Friend,
    entries: usize,
}

pub async fn run_friends(refresh: bool, output: &Output) -> Result<()> {
    let ctx = AppContext::load()?;

    if refresh {
        let (_, fetcher) = ctx.orchestrator()?;
        let friends = ctx.refresh_friends(&fetcher).await?;
        output.success(format!("Friend list refreshed: {} accounts", friends.len()));
    }

    let rows = ctx
        .store
        .call(|store| {
            store
                .list_friends()?
                .into_iter()
                .map(|friend| {
                    let entries = store.load_watchlist(&friend.id)?.len();
                    Ok(FriendRow { friend, entries })
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await?;

    output.data(&rows);
    if rows.is_empty() {
        output.info("No friends stored. Run 'watchmatch friends --refresh'.");
        return Ok(());
    }

    output.println(heading(&format!("Friends ({})", rows.len())));
    let mut table = Table::new();
    table.set_header(vec![
        Cell::new("Handle").add_attribute(Attribute::Bold),
        Cell::new("Name").add_attribute(Attribute::Bold),
        Cell::new("Films").add_attribute(Attribute::Bold),
        Cell::new("Last synced").add_attribute(Attribute::Bold),
        Cell::new("State").add_attribute(Attribute::Bold),
    ]);
    for row in &rows {
        let friend = &row.friend;
        table.add_row(vec![
            Cell::new(&friend.handle),
            Cell::new(&friend.display_name),
            Cell::new(row.entries).set_alignment(CellAlignment::Right),
            Cell::new(
                friend
                    .last_synced_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string()),
            ),
            Cell::new(friend.sync_state.map(|s| s.to_string()).unwrap_or_default()),
        ]);
    }
    output.table(table);
    Ok(())
}
