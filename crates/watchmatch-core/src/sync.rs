use crate::enrichment::{EnrichedMatch, MetadataClient};
use crate::events::{EventHub, ProgressEvent, SyncEvent, SyncObserver};
use crate::matching::{compute_matches, WatchlistSnapshot};
use crate::store::{NormalizedEntry, Store, StoreError};
use crate::writer::{spawn_writer, WriterHandle};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use watchmatch_config::SyncConfig;
use watchmatch_models::{Friend, FriendId, JobState, MatchMode, NormalizedKey, SyncJob};
use watchmatch_sources::PageFetcher;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("All {} sync jobs failed", .jobs.len())]
    AllJobsFailed { jobs: Vec<SyncJob> },

    #[error("Sync task failed: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOptions {
    /// Worker pool size
    pub concurrency: usize,
    /// Re-fetch friends even when their committed watchlist is recent
    pub force_refresh: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            force_refresh: false,
        }
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            force_refresh: false,
        }
    }
}

/// Everything a batch needs, captured when it starts
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub primary: Arc<WatchlistSnapshot>,
    pub friend_ids: BTreeSet<FriendId>,
    pub options: SyncOptions,
    pub mode: MatchMode,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub mode: MatchMode,
    /// One entry per selected friend, ordered by friend id
    pub jobs: Vec<SyncJob>,
    /// Empty for cancelled and failed batches
    pub matches: Vec<EnrichedMatch>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchSummary {
    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &SyncJob> {
        self.jobs.iter().filter(|j| j.state == JobState::Failed)
    }
}

/// Handle to a running batch
pub struct SyncHandle {
    batch_id: Uuid,
    cancel: CancellationToken,
    hub: Arc<EventHub>,
    task: JoinHandle<Result<BatchSummary, SyncError>>,
}

impl SyncHandle {
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Request cooperative cancellation. Jobs stop at their next page
    /// boundary; in-flight requests finish first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Attach an observer; events already emitted are replayed first
    pub fn subscribe(&self, observer: Arc<dyn SyncObserver>) {
        self.hub.subscribe(observer);
    }

    pub fn events(&self) -> Arc<EventHub> {
        Arc::clone(&self.hub)
    }

    pub async fn wait(self) -> Result<BatchSummary, SyncError> {
        self.task
            .await
            .map_err(|e| SyncError::Internal(e.to_string()))?
    }
}

/// State shared by the jobs of one batch
struct BatchContext {
    batch_id: Uuid,
    store: Arc<Store>,
    fetcher: Arc<dyn PageFetcher>,
    writer: WriterHandle,
    events: mpsc::UnboundedSender<SyncEvent>,
    cancel: CancellationToken,
    force_refresh: bool,
    resync_threshold: chrono::Duration,
}

impl BatchContext {
    fn emit(&self, event: SyncEvent) {
        // Only fails once the dispatcher is gone, i.e. nobody is listening
        let _ = self.events.send(event);
    }

    fn progress(&self, job: &SyncJob) {
        self.emit(SyncEvent::Progress(ProgressEvent {
            friend_id: job.friend_id.clone(),
            pages_fetched: job.pages_fetched,
            entries_found: job.entries_found,
            total_hint: job.total_hint,
            state: job.state,
        }));
    }

    fn finish(&self, job: SyncJob) -> SyncJob {
        info!(
            operation = "sync_job_complete",
            batch = %self.batch_id,
            friend = %job.friend_id,
            state = %job.state,
            pages = job.pages_fetched,
            entries = job.entries_found,
            reused_cached = job.reused_cached,
            error = job.error.as_deref().unwrap_or(""),
            "Sync job finished"
        );
        self.emit(SyncEvent::FriendComplete(job.clone()));
        job
    }
}

/// Runs sync batches: fetch every selected friend's watchlist on a bounded
/// worker pool, commit each as a new generation, then match against the
/// primary user's snapshot and enrich the results.
#[derive(Clone)]
pub struct SyncOrchestrator {
    store: Arc<Store>,
    fetcher: Arc<dyn PageFetcher>,
    enrichment: Option<Arc<MetadataClient>>,
    resync_threshold: chrono::Duration,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<Store>, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            store,
            fetcher,
            enrichment: None,
            resync_threshold: chrono::Duration::hours(24),
        }
    }

    pub fn with_enrichment(mut self, client: Arc<MetadataClient>) -> Self {
        self.enrichment = Some(client);
        self
    }

    pub fn with_resync_threshold(mut self, threshold: chrono::Duration) -> Self {
        self.resync_threshold = threshold;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Start a batch in the background
    pub fn start_sync(&self, request: SyncRequest) -> SyncHandle {
        self.start_sync_with(request, CancellationToken::new())
    }

    /// Start a batch that is also cancelled when `cancel` is
    pub fn start_sync_with(&self, request: SyncRequest, cancel: CancellationToken) -> SyncHandle {
        let batch_id = Uuid::new_v4();
        let hub = Arc::new(EventHub::new());
        let task = tokio::spawn(self.clone().run_batch(batch_id, request, Arc::clone(&hub), cancel.clone()));
        SyncHandle {
            batch_id,
            cancel,
            hub,
            task,
        }
    }

    /// Fetch and commit the primary user's own watchlist, returning the
    /// snapshot to match against.
    ///
    /// A recently synced primary is reused unless `force_refresh` is set. If
    /// the fetch fails but an earlier generation exists, that generation is
    /// used.
    pub async fn sync_primary(&self, primary: &Friend, force_refresh: bool) -> Result<WatchlistSnapshot, SyncError> {
        let owner = primary.clone();
        self.store.call(move |store| store.set_primary_user(&owner)).await?;

        let request = SyncRequest {
            primary: Arc::new(WatchlistSnapshot::default()),
            friend_ids: [primary.id.clone()].into_iter().collect(),
            options: SyncOptions {
                concurrency: 1,
                force_refresh,
            },
            mode: MatchMode::Any,
        };

        match self.start_sync(request).wait().await {
            Ok(_) => {}
            Err(SyncError::AllJobsFailed { jobs }) => {
                let id = primary.id.clone();
                if self.store.call(move |store| store.current_generation(&id)).await?.is_none() {
                    return Err(SyncError::AllJobsFailed { jobs });
                }
                warn!(
                    operation = "sync_primary",
                    user = %primary.id,
                    "Primary watchlist fetch failed; using the last committed copy"
                );
            }
            Err(e) => return Err(e),
        }

        let id = primary.id.clone();
        let entries = self.store.call(move |store| store.load_watchlist(&id)).await?;
        info!(operation = "sync_primary", user = %primary.id, entries = entries.len(), "Primary watchlist ready");
        Ok(WatchlistSnapshot::from_entries(&entries))
    }

    async fn run_batch(
        self,
        batch_id: Uuid,
        request: SyncRequest,
        hub: Arc<EventHub>,
        cancel: CancellationToken,
    ) -> Result<BatchSummary, SyncError> {
        let started_at = Utc::now();
        let concurrency = request.options.concurrency.max(1);
        info!(
            operation = "sync_start",
            batch = %batch_id,
            friends = request.friend_ids.len(),
            concurrency = concurrency,
            force_refresh = request.options.force_refresh,
            mode = %request.mode,
            "Starting sync batch"
        );

        let (events, dispatcher) = hub.spawn_dispatcher();
        let (writer, writer_task) = spawn_writer(Arc::clone(&self.store), concurrency);
        let ctx = BatchContext {
            batch_id,
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            writer,
            events: events.clone(),
            cancel: cancel.clone(),
            force_refresh: request.options.force_refresh,
            resync_threshold: self.resync_threshold,
        };

        let outcomes: Vec<Result<SyncJob, StoreError>> = stream::iter(request.friend_ids.iter().cloned())
            .map(|friend_id| {
                let ctx = &ctx;
                async move {
                    let outcome = run_job(ctx, friend_id).await;
                    if outcome.is_err() {
                        // Store failures are fatal; stop the remaining jobs early
                        ctx.cancel.cancel();
                    }
                    outcome
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        drop(ctx);
        if let Err(e) = writer_task.await {
            error!(operation = "sync_batch", batch = %batch_id, error = %e, "Writer task panicked");
        }

        let mut jobs = Vec::with_capacity(outcomes.len());
        let mut store_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    store_error.get_or_insert(e);
                }
            }
        }
        jobs.sort_by(|a, b| a.friend_id.cmp(&b.friend_id));

        let result = match store_error {
            Some(e) => {
                error!(operation = "sync_batch", batch = %batch_id, error = %e, "Store failure aborted the batch");
                Err(SyncError::Store(e))
            }
            None => self.finish_batch(batch_id, &request, jobs, started_at, &cancel).await,
        };

        match &result {
            Ok(summary) => {
                let _ = events.send(SyncEvent::BatchComplete(summary.clone()));
            }
            Err(SyncError::AllJobsFailed { jobs }) => {
                let summary = BatchSummary {
                    batch_id,
                    status: BatchStatus::Failed,
                    mode: request.mode,
                    jobs: jobs.clone(),
                    matches: Vec::new(),
                    started_at,
                    finished_at: Utc::now(),
                };
                let _ = events.send(SyncEvent::BatchComplete(summary));
            }
            Err(_) => {}
        }
        drop(events);
        if let Err(e) = dispatcher.await {
            error!(operation = "sync_batch", batch = %batch_id, error = %e, "Event dispatcher panicked");
        }
        result
    }

    async fn finish_batch(
        &self,
        batch_id: Uuid,
        request: &SyncRequest,
        jobs: Vec<SyncJob>,
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, SyncError> {
        let history: Vec<SyncJob> = jobs.iter().filter(|j| j.started_at.is_some()).cloned().collect();
        let batch = batch_id.to_string();
        self.store
            .call(move |store| history.iter().try_for_each(|job| store.record_job(&batch, job)))
            .await?;

        let failed = jobs.iter().filter(|j| j.state == JobState::Failed).count();
        let status = if cancel.is_cancelled() {
            BatchStatus::Cancelled
        } else if !jobs.is_empty() && failed == jobs.len() {
            BatchStatus::Failed
        } else if failed > 0 {
            BatchStatus::PartiallyFailed
        } else {
            BatchStatus::Completed
        };

        info!(
            operation = "sync_batch_complete",
            batch = %batch_id,
            status = ?status,
            completed = jobs.iter().filter(|j| j.state == JobState::Completed).count(),
            failed = failed,
            cancelled = jobs.iter().filter(|j| j.state == JobState::Cancelled).count(),
            "Sync batch finished"
        );

        match status {
            BatchStatus::Failed => return Err(SyncError::AllJobsFailed { jobs }),
            BatchStatus::Cancelled => {
                return Ok(BatchSummary {
                    batch_id,
                    status,
                    mode: request.mode,
                    jobs,
                    matches: Vec::new(),
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            BatchStatus::Completed | BatchStatus::PartiallyFailed => {}
        }

        let selected = request.friend_ids.clone();
        let keys = self.store.call(move |store| committed_keys(store, &selected)).await?;
        let matches = compute_matches(&request.primary, &keys, request.mode);
        debug!(operation = "compute_matches", batch = %batch_id, matches = matches.len(), "Computed matches");

        let matches = match &self.enrichment {
            Some(client) => client.enrich(matches).await?,
            None => matches.into_iter().map(EnrichedMatch::bare).collect(),
        };

        Ok(BatchSummary {
            batch_id,
            status,
            mode: request.mode,
            jobs,
            matches,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Fetch every page of one friend's watchlist and commit it.
///
/// Returns `Err` only for store failures; fetch problems fail the job and
/// leave the previously committed generation in place.
#[instrument(skip(ctx), fields(batch = %ctx.batch_id))]
async fn run_job(ctx: &BatchContext, friend_id: FriendId) -> Result<SyncJob, StoreError> {
    let mut job = SyncJob::new(friend_id.clone());

    if ctx.cancel.is_cancelled() {
        job.transition(JobState::Cancelled);
        return Ok(ctx.finish(job));
    }

    if !ctx.force_refresh {
        if let Some(reused) = reuse_fresh(ctx, &friend_id).await? {
            return Ok(ctx.finish(reused));
        }
    }

    job.transition(JobState::Running);
    let id = friend_id.clone();
    ctx.store
        .call(move |store| store.update_sync_state(&id, JobState::Running))
        .await?;
    ctx.progress(&job);

    let mut entries: Vec<NormalizedEntry> = Vec::new();
    let mut seen: HashSet<NormalizedKey> = HashSet::new();
    let mut page_index = 1u32;
    // The previous page reported no next page
    let mut past_last_page = false;

    loop {
        if ctx.cancel.is_cancelled() {
            debug!(friend = %friend_id, discarded = entries.len(), "Cancelled between pages");
            job.transition(JobState::Cancelled);
            break;
        }

        let url = ctx.fetcher.watchlist_url(&friend_id, page_index);
        let page = match ctx.fetcher.fetch_page(&url, page_index).await {
            Ok(page) => page,
            // Asking past the last page yields a 404, a page with no listing,
            // or the page cap; each confirms the end of the list
            Err(e) if past_last_page && e.ends_listing() => {
                debug!(
                    friend = %friend_id,
                    page = page_index,
                    kind = e.kind(),
                    "No page after the last one; list complete"
                );
                commit_job(ctx, &mut job, entries).await?;
                break;
            }
            Err(e) => {
                warn!(
                    operation = "fetch_page",
                    friend = %friend_id,
                    page = page_index,
                    kind = e.kind(),
                    error = %e,
                    "Watchlist fetch failed; keeping previous generation"
                );
                job.error = Some(e.to_string());
                job.transition(JobState::Failed);
                break;
            }
        };

        let mut new_entries = 0usize;
        for raw in &page.entries {
            let entry = NormalizedEntry::from_raw(raw);
            if seen.insert(entry.key.clone()) {
                entries.push(entry);
                new_entries += 1;
            }
        }
        job.pages_fetched += 1;
        job.entries_found = entries.len();
        if page.total_hint.is_some() {
            job.total_hint = page.total_hint;
        }
        ctx.progress(&job);

        // The list only ends on an explicit last page that adds nothing new
        if !page.has_next && new_entries == 0 {
            commit_job(ctx, &mut job, entries).await?;
            break;
        }
        past_last_page = !page.has_next;
        page_index += 1;
    }

    if job.state != JobState::Completed {
        let id = friend_id.clone();
        let state = job.state;
        ctx.store.call(move |store| store.update_sync_state(&id, state)).await?;
    }
    Ok(ctx.finish(job))
}

async fn commit_job(ctx: &BatchContext, job: &mut SyncJob, entries: Vec<NormalizedEntry>) -> Result<(), StoreError> {
    let generation = ctx.writer.commit(job.friend_id.clone(), entries).await?;
    job.generation_id = Some(generation);
    job.transition(JobState::Completed);
    Ok(())
}

/// Complete the job from the committed generation when the friend was
/// synced within the resync threshold
async fn reuse_fresh(ctx: &BatchContext, friend_id: &FriendId) -> Result<Option<SyncJob>, StoreError> {
    let id = friend_id.clone();
    let (friend, generation, entry_count) = ctx
        .store
        .call(move |store| {
            let friend = store.get_friend(&id)?;
            let generation = store.current_generation(&id)?;
            let count = match generation {
                Some(_) => store.load_watchlist(&id)?.len(),
                None => 0,
            };
            Ok((friend, generation, count))
        })
        .await?;

    let (Some(friend), Some(generation)) = (friend, generation) else {
        return Ok(None);
    };
    if !friend.is_fresh(Utc::now(), ctx.resync_threshold) {
        return Ok(None);
    }

    let mut job = SyncJob::new(friend_id.clone());
    job.transition(JobState::Running);
    job.generation_id = Some(generation);
    job.entries_found = entry_count;
    job.reused_cached = true;
    job.transition(JobState::Completed);
    Ok(Some(job))
}

/// Committed key sets for the selected friends. A friend with nothing
/// committed counts as an empty watchlist.
pub fn committed_keys(
    store: &Store,
    friend_ids: &BTreeSet<FriendId>,
) -> Result<BTreeMap<FriendId, BTreeSet<NormalizedKey>>, StoreError> {
    let mut keys = store.load_keys(friend_ids)?;
    for friend_id in friend_ids {
        keys.entry(friend_id.clone()).or_default();
    }
    Ok(keys)
}
