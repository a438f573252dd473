use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::Mutex;
use std::time::Duration;
use watchmatch_core::{BatchSummary, ProgressEvent, SyncObserver};
use watchmatch_models::{FriendId, JobState, SyncJob};

/// Progress display for a sync batch.
///
/// On a terminal: one overall bar plus a spinner per friend. Otherwise the
/// bars are hidden and progress goes to structured logs.
pub struct SyncUI {
    multi: MultiProgress,
    overall: ProgressBar,
    friend_bars: Mutex<HashMap<FriendId, ProgressBar>>,
    interactive: bool,
}

impl SyncUI {
    pub fn new(total_friends: usize, quiet: bool) -> Self {
        let interactive = is_interactive() && !quiet;
        let multi = if interactive {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        let overall = multi.add(ProgressBar::new(total_friends as u64));
        overall.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} friends {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        overall.set_message("syncing");
        if interactive {
            overall.enable_steady_tick(Duration::from_millis(120));
        } else {
            tracing::info!(
                operation = "ui_init",
                mode = "non_interactive",
                friends = total_friends,
                "Progress bars disabled, using structured logging"
            );
        }

        Self {
            multi,
            overall,
            friend_bars: Mutex::new(HashMap::new()),
            interactive,
        }
    }

    fn bar_for(&self, friend_id: &FriendId) -> ProgressBar {
        let mut bars = self.friend_bars.lock().unwrap_or_else(|p| p.into_inner());
        bars.entry(friend_id.clone())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("  {spinner:.yellow} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner())
                        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
                );
                bar
            })
            .clone()
    }

    /// Clear any bars left running (e.g. after a store failure)
    pub fn finish(&self) {
        let bars = self.friend_bars.lock().unwrap_or_else(|p| p.into_inner());
        for bar in bars.values().filter(|b| !b.is_finished()) {
            bar.finish_and_clear();
        }
        if !self.overall.is_finished() {
            self.overall.finish_and_clear();
        }
    }
}

impl SyncObserver for SyncUI {
    fn on_progress(&self, event: &ProgressEvent) {
        if !self.interactive {
            tracing::info!(
                operation = "progress",
                friend = %event.friend_id,
                pages = event.pages_fetched,
                entries = event.entries_found,
                total = event.total_hint,
                "Sync progress"
            );
            return;
        }
        self.bar_for(&event.friend_id).set_message(progress_message(event));
    }

    fn on_friend_complete(&self, job: &SyncJob) {
        self.overall.inc(1);
        if !self.interactive {
            return;
        }
        let mark = match job.state {
            JobState::Completed => "✓".green().to_string(),
            JobState::Cancelled => "-".yellow().to_string(),
            _ => "✗".red().to_string(),
        };
        let detail = match (&job.error, job.reused_cached) {
            (Some(error), _) => error.clone(),
            (None, true) => format!("{} films (recent, not re-fetched)", job.entries_found),
            (None, false) => format!("{} films from {} pages", job.entries_found, job.pages_fetched),
        };
        self.bar_for(&job.friend_id)
            .finish_with_message(format!("{} {}: {}", mark, job.friend_id, detail));
    }

    fn on_batch_complete(&self, summary: &BatchSummary) {
        self.overall
            .finish_with_message(format!("{} matches", summary.matches.len()));
    }
}

fn progress_message(event: &ProgressEvent) -> String {
    match event.total_hint {
        Some(total) => format!(
            "{}: page {} · {}/{} films",
            event.friend_id, event.pages_fetched, event.entries_found, total
        ),
        None => format!(
            "{}: page {} · {} films",
            event.friend_id, event.pages_fetched, event.entries_found
        ),
    }
}

pub fn is_interactive() -> bool {
    std::io::stdout().is_terminal() && std::io::stderr().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_message_shows_advertised_total() {
        let mut event = ProgressEvent {
            friend_id: FriendId::new("alice"),
            pages_fetched: 2,
            entries_found: 56,
            total_hint: Some(140),
            state: JobState::Running,
        };
        assert_eq!(progress_message(&event), "alice: page 2 · 56/140 films");

        event.total_hint = None;
        assert_eq!(progress_message(&event), "alice: page 2 · 56 films");
    }
}
