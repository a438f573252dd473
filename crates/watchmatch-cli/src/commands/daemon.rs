use crate::commands::context::AppContext;
use crate::commands::sync::{prepare, SyncArgs};
use crate::output::Output;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use watchmatch_config::{default_scheduler_config, SchedulerConfig};
use watchmatch_core::{export_matches_csv, BatchStatus, BatchSummary};
use watchmatch_models::MatchMode;

/// Runs one sync batch at a time on behalf of the scheduler
struct DaemonRunner {
    ctx: AppContext,
    mode: MatchMode,
    shutdown: CancellationToken,
    running: Mutex<()>,
}

impl DaemonRunner {
    async fn run_once(&self, trigger: &'static str) {
        // A batch still running when the next tick fires keeps going; the tick is dropped
        let Ok(_guard) = self.running.try_lock() else {
            warn!(operation = "daemon_sync_skipped", trigger, "Previous sync still running");
            return;
        };
        if self.shutdown.is_cancelled() {
            return;
        }

        let started = Instant::now();
        info!(operation = "daemon_sync_start", trigger, mode = %self.mode, "Starting sync");
        match self.sync().await {
            Ok(summary) => info!(
                operation = "daemon_sync_complete",
                trigger,
                batch = %summary.batch_id,
                status = ?summary.status,
                jobs = summary.jobs.len(),
                matches = summary.matches.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Sync completed"
            ),
            Err(e) => error!(
                operation = "daemon_sync_error",
                trigger,
                error = %e,
                duration_ms = started.elapsed().as_millis() as u64,
                "Sync failed"
            ),
        }
    }

    async fn sync(&self) -> Result<BatchSummary> {
        let args = SyncArgs {
            friends: Vec::new(),
            mode: Some(self.mode),
            force: false,
            refresh_friends: true,
            concurrency: None,
            export: None,
        };
        let batch = prepare(&self.ctx, &args, self.mode).await?;
        if batch.friend_count() == 0 {
            return Err(eyre!("No friends to sync"));
        }

        let summary = batch.start(self.shutdown.child_token()).wait().await?;
        if summary.status != BatchStatus::Cancelled {
            let path = self.ctx.paths.export_dir().join("matches.csv");
            export_matches_csv(&path, &summary.matches).map_err(|e| eyre!("{:#}", e))?;
        }
        Ok(summary)
    }
}

/// Effective scheduler settings after command-line overrides
fn resolve_settings(
    configured: Option<&SchedulerConfig>,
    schedule_override: Option<String>,
    no_startup_sync: bool,
) -> SchedulerConfig {
    let base = configured.cloned().unwrap_or_else(default_scheduler_config);
    SchedulerConfig {
        schedule: schedule_override.unwrap_or(base.schedule),
        run_on_startup: base.run_on_startup && !no_startup_sync,
    }
}

pub async fn run_daemon(
    schedule_override: Option<String>,
    no_startup_sync: bool,
    mode: Option<MatchMode>,
    output: &Output,
) -> Result<()> {
    let ctx = AppContext::load()?;
    let mode = ctx.match_mode(mode)?;
    let settings = resolve_settings(ctx.config.scheduler.as_ref(), schedule_override, no_startup_sync);
    let runner = Arc::new(DaemonRunner {
        ctx,
        mode,
        shutdown: CancellationToken::new(),
        running: Mutex::new(()),
    });

    let mut scheduler = JobScheduler::new().await?;
    let job_runner = Arc::clone(&runner);
    let job = Job::new_async(settings.schedule.as_str(), move |_id, _scheduler| {
        let runner = Arc::clone(&job_runner);
        Box::pin(async move {
            runner.run_once("scheduled").await;
        })
    })
    .map_err(|e| eyre!("Invalid schedule '{}': {}", settings.schedule, e))?;
    scheduler.add(job).await?;

    info!(
        operation = "scheduler_started",
        schedule = %settings.schedule,
        run_on_startup = settings.run_on_startup,
        mode = %mode,
        "Scheduler started"
    );
    output.info(format!("Daemon running on schedule '{}' (UTC). Press Ctrl-C to stop.", settings.schedule));

    if settings.run_on_startup {
        runner.run_once("startup").await;
    }
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    info!(operation = "scheduler_shutdown", "Shutting down; waiting for any running sync");
    runner.shutdown.cancel();
    let _idle = runner.running.lock().await;
    scheduler.shutdown().await?;
    output.info("Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_scheduler_section() {
        let settings = resolve_settings(None, None, false);
        assert_eq!(settings.schedule, default_scheduler_config().schedule);
        assert!(settings.run_on_startup);
    }

    #[test]
    fn test_overrides() {
        let configured = SchedulerConfig {
            schedule: "0 0 3 * * *".to_string(),
            run_on_startup: true,
        };
        let settings = resolve_settings(Some(&configured), Some("0 */15 * * * *".to_string()), true);
        assert_eq!(settings.schedule, "0 */15 * * * *");
        assert!(!settings.run_on_startup);

        let settings = resolve_settings(Some(&configured), None, false);
        assert_eq!(settings.schedule, "0 0 3 * * *");
    }
}
