use super::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use watchmatch_models::RawEntry;
use watchmatch_sources::{SourceError, WatchlistPage};

type PageScript = Vec<Result<WatchlistPage, SourceError>>;

/// Serves scripted pages per owner; unknown pages are a 404
#[derive(Default)]
struct FakeFetcher {
    pages: Mutex<HashMap<String, PageScript>>,
    calls: AtomicU32,
    delay: Option<Duration>,
    page_cap: Option<u32>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeFetcher {
    fn set(&self, owner: &str, pages: PageScript) {
        self.pages.lock().unwrap().insert(owner.to_string(), pages);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    fn watchlist_url(&self, owner: &FriendId, page_index: u32) -> String {
        format!("fake://{}/{}", owner, page_index)
    }

    async fn fetch_page(&self, url: &str, page_index: u32) -> Result<WatchlistPage, SourceError> {
        if let Some(cap) = self.page_cap.filter(|cap| page_index > *cap) {
            return Err(SourceError::PageCapExceeded { url: url.to_string(), cap });
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(active, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let owner = url.trim_start_matches("fake://").split('/').next().unwrap_or_default();
        let pages = self.pages.lock().unwrap();
        pages
            .get(owner)
            .and_then(|script| script.get(page_index as usize - 1))
            .cloned()
            .unwrap_or_else(|| Err(SourceError::NotFound { url: url.to_string() }))
    }
}

fn page(titles: &[(&str, u16)], has_next: bool) -> Result<WatchlistPage, SourceError> {
    Ok(WatchlistPage {
        entries: titles.iter().map(|(t, y)| RawEntry::new(*t, Some(*y))).collect(),
        has_next,
        total_hint: None,
    })
}

/// A single-page list followed by the empty page that ends it
fn list(titles: &[(&str, u16)]) -> PageScript {
    vec![page(titles, false), page(&[], false)]
}

fn setup(fetcher: Arc<FakeFetcher>) -> (Arc<Store>, SyncOrchestrator) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let orchestrator = SyncOrchestrator::new(store.clone(), fetcher);
    (store, orchestrator)
}

fn request(primary: &[(&str, u16)], friends: &[&str], mode: MatchMode, force_refresh: bool) -> SyncRequest {
    SyncRequest {
        primary: Arc::new(WatchlistSnapshot::from_raw(
            primary.iter().map(|(t, y)| RawEntry::new(*t, Some(*y))),
        )),
        friend_ids: friends.iter().map(|f| FriendId::new(*f)).collect(),
        options: SyncOptions {
            concurrency: 4,
            force_refresh,
        },
        mode,
    }
}

fn titles(summary: &BatchSummary) -> Vec<&str> {
    summary.matches.iter().map(|m| m.result.title.as_str()).collect()
}

fn job<'a>(summary: &'a BatchSummary, friend: &str) -> &'a SyncJob {
    summary
        .jobs
        .iter()
        .find(|j| j.friend_id.as_str() == friend)
        .unwrap()
}

#[derive(Default)]
struct Recorder {
    progress: Mutex<Vec<ProgressEvent>>,
    completed: Mutex<Vec<FriendId>>,
    batches: Mutex<Vec<BatchStatus>>,
}

impl SyncObserver for Recorder {
    fn on_progress(&self, event: &ProgressEvent) {
        self.progress.lock().unwrap().push(event.clone());
    }

    fn on_friend_complete(&self, job: &SyncJob) {
        self.completed.lock().unwrap().push(job.friend_id.clone());
    }

    fn on_batch_complete(&self, summary: &BatchSummary) {
        self.batches.lock().unwrap().push(summary.status);
    }
}

const PRIMARY: &[(&str, u16)] = &[("Inception", 2010), ("Arrival", 2016)];

fn scenario_fetcher() -> Arc<FakeFetcher> {
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.set("alice", list(&[("Inception", 2010), ("Dune", 2021)]));
    fetcher.set("bob", list(&[("Inception", 2010), ("Arrival", 2016)]));
    fetcher
}

#[tokio::test]
async fn test_all_and_any_modes_end_to_end() {
    let (_store, orchestrator) = setup(scenario_fetcher());

    let all = orchestrator
        .start_sync(request(PRIMARY, &["alice", "bob"], MatchMode::All, false))
        .wait()
        .await
        .unwrap();
    assert_eq!(all.status, BatchStatus::Completed);
    assert_eq!(titles(&all), vec!["Inception"]);
    assert!(all.jobs.iter().all(|j| j.state == JobState::Completed && j.generation_id.is_some()));

    let any = orchestrator
        .start_sync(request(PRIMARY, &["alice", "bob"], MatchMode::Any, false))
        .wait()
        .await
        .unwrap();
    assert_eq!(titles(&any), vec!["Inception", "Arrival"]);
    assert_eq!(any.matches[0].result.friend_count(), 2);
}

#[tokio::test]
async fn test_resync_with_unchanged_data_is_idempotent() {
    let (_store, orchestrator) = setup(scenario_fetcher());
    let first = orchestrator
        .start_sync(request(PRIMARY, &["alice", "bob"], MatchMode::Any, true))
        .wait()
        .await
        .unwrap();
    let second = orchestrator
        .start_sync(request(PRIMARY, &["alice", "bob"], MatchMode::Any, true))
        .wait()
        .await
        .unwrap();

    assert_eq!(first.matches, second.matches);
    assert!(job(&second, "alice").generation_id > job(&first, "alice").generation_id);
}

#[tokio::test]
async fn test_cancel_before_start_leaves_store_untouched() {
    let fetcher = scenario_fetcher();
    let (store, orchestrator) = setup(fetcher.clone());

    let handle = orchestrator.start_sync(request(PRIMARY, &["alice", "bob"], MatchMode::Any, true));
    handle.cancel();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.status, BatchStatus::Cancelled);
    assert!(summary.jobs.iter().all(|j| j.state == JobState::Cancelled));
    assert!(summary.matches.is_empty());
    assert_eq!(fetcher.calls(), 0);

    let stats = store.stats(Utc::now()).unwrap();
    assert_eq!((stats.friends, stats.watchlist_entries, stats.job_history), (0, 0, 0));
}

#[tokio::test]
async fn test_mid_fetch_failure_keeps_previous_generation() {
    let fetcher = scenario_fetcher();
    fetcher.set("alice", list(&[("Inception", 2010)]));
    let (store, orchestrator) = setup(fetcher.clone());
    orchestrator
        .start_sync(request(PRIMARY, &["alice", "bob"], MatchMode::Any, true))
        .wait()
        .await
        .unwrap();
    let alice = FriendId::new("alice");
    let before = store.current_generation(&alice).unwrap();

    fetcher.set(
        "alice",
        vec![
            page(&[("Inception", 2010), ("Heat", 1995)], true),
            Err(SourceError::permanent("fake://alice/2", "HTTP 404")),
        ],
    );
    fetcher.set("bob", list(&[("Arrival", 2016), ("Up", 2009)]));

    let summary = orchestrator
        .start_sync(request(PRIMARY, &["alice", "bob"], MatchMode::Any, true))
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.status, BatchStatus::PartiallyFailed);
    let failed = job(&summary, "alice");
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.pages_fetched, 1);
    assert!(failed.error.as_deref().is_some_and(|e| e.contains("404")));
    assert_eq!(job(&summary, "bob").state, JobState::Completed);

    assert_eq!(store.current_generation(&alice).unwrap(), before);
    let kept: Vec<String> = store.load_watchlist(&alice).unwrap().into_iter().map(|e| e.raw_title).collect();
    assert_eq!(kept, vec!["Inception"]);
    assert_eq!(store.get_friend(&alice).unwrap().unwrap().sync_state, Some(JobState::Failed));
    assert_eq!(store.load_watchlist(&FriendId::new("bob")).unwrap().len(), 2);

    // Stale data for the failed friend still counts
    assert_eq!(titles(&summary), vec!["Arrival", "Inception"]);
}

#[tokio::test]
async fn test_final_page_without_new_entries_ends_the_list() {
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.set(
        "alice",
        vec![
            page(&[("Heat", 1995), ("Alien", 1979)], true),
            page(&[("Jaws", 1975)], false),
            page(&[("Jaws", 1975)], false),
            page(&[("Never Fetched", 2000)], false),
        ],
    );
    let (store, orchestrator) = setup(fetcher.clone());

    let summary = orchestrator
        .start_sync(request(&[], &["alice"], MatchMode::Any, true))
        .wait()
        .await
        .unwrap();

    let alice = job(&summary, "alice");
    assert_eq!(alice.state, JobState::Completed);
    assert_eq!(alice.pages_fetched, 3);
    assert_eq!(alice.entries_found, 3);
    assert_eq!(fetcher.calls(), 3);
    assert_eq!(store.load_watchlist(&FriendId::new("alice")).unwrap().len(), 3);
}

#[tokio::test]
async fn test_every_job_failing_fails_the_batch() {
    let fetcher = Arc::new(FakeFetcher::default());
    let (store, orchestrator) = setup(fetcher);
    let recorder = Arc::new(Recorder::default());

    let handle = orchestrator.start_sync(request(PRIMARY, &["alice", "bob"], MatchMode::All, true));
    handle.subscribe(recorder.clone());
    let result = handle.wait().await;

    match result {
        Err(SyncError::AllJobsFailed { jobs }) => {
            assert_eq!(jobs.len(), 2);
            assert!(jobs.iter().all(|j| j.state == JobState::Failed));
        }
        other => panic!("expected AllJobsFailed, got {:?}", other.map(|s| s.status)),
    }
    assert_eq!(*recorder.batches.lock().unwrap(), vec![BatchStatus::Failed]);
    assert_eq!(store.job_history(None, 10).unwrap().len(), 2);
}

#[tokio::test]
async fn test_fresh_friends_are_not_refetched() {
    let fetcher = scenario_fetcher();
    let (_store, orchestrator) = setup(fetcher.clone());

    let first = orchestrator
        .start_sync(request(PRIMARY, &["alice", "bob"], MatchMode::Any, false))
        .wait()
        .await
        .unwrap();
    let calls = fetcher.calls();
    assert!(first.jobs.iter().all(|j| !j.reused_cached));

    let second = orchestrator
        .start_sync(request(PRIMARY, &["alice", "bob"], MatchMode::Any, false))
        .wait()
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), calls);
    assert!(second.jobs.iter().all(|j| j.reused_cached && j.state == JobState::Completed));
    assert_eq!(job(&second, "alice").generation_id, job(&first, "alice").generation_id);
    assert_eq!(job(&second, "bob").entries_found, 2);
    assert_eq!(second.matches, first.matches);

    // A zero threshold always re-fetches
    let stale = orchestrator.clone().with_resync_threshold(chrono::Duration::zero());
    stale
        .start_sync(request(PRIMARY, &["alice"], MatchMode::Any, false))
        .wait()
        .await
        .unwrap();
    assert!(fetcher.calls() > calls);
}

#[tokio::test]
async fn test_late_subscriber_receives_replay() {
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.set(
        "alice",
        vec![page(&[("Heat", 1995)], true), page(&[("Alien", 1979)], false), page(&[], false)],
    );
    let (_store, orchestrator) = setup(fetcher);

    let handle = orchestrator.start_sync(request(&[("Heat", 1995)], &["alice"], MatchMode::Any, true));
    let events = handle.events();
    handle.wait().await.unwrap();

    let recorder = Arc::new(Recorder::default());
    events.subscribe(recorder.clone());

    let progress = recorder.progress.lock().unwrap();
    let pages: Vec<u32> = progress.iter().map(|p| p.pages_fetched).collect();
    assert_eq!(pages, vec![0, 1, 2, 3]);
    assert_eq!(progress.last().map(|p| p.entries_found), Some(2));
    assert_eq!(*recorder.completed.lock().unwrap(), vec![FriendId::new("alice")]);
    assert_eq!(*recorder.batches.lock().unwrap(), vec![BatchStatus::Completed]);
}

#[tokio::test]
async fn test_store_failure_aborts_the_batch() {
    let fetcher = scenario_fetcher();
    fetcher.set("alice", list(&[("BOOM", 2000)]));
    let (store, orchestrator) = setup(fetcher);
    store
        .execute_raw(
            "CREATE TRIGGER fail_boom BEFORE INSERT ON watchlist_entries
             WHEN NEW.raw_title = 'BOOM' BEGIN SELECT RAISE(ABORT, 'boom'); END;",
        )
        .unwrap();

    let result = orchestrator
        .start_sync(request(PRIMARY, &["alice"], MatchMode::Any, true))
        .wait()
        .await;
    assert!(matches!(result, Err(SyncError::Store(_))));
    assert!(store.current_generation(&FriendId::new("alice")).unwrap().is_none());
}

#[tokio::test]
async fn test_worker_pool_is_bounded() {
    let fetcher = Arc::new(FakeFetcher {
        delay: Some(Duration::from_millis(5)),
        ..FakeFetcher::default()
    });
    let names = ["a", "b", "c", "d", "e", "f"];
    for name in names {
        fetcher.set(name, list(&[("Heat", 1995)]));
    }
    let (_store, orchestrator) = setup(fetcher.clone());

    let mut req = request(&[("Heat", 1995)], &names, MatchMode::All, true);
    req.options.concurrency = 2;
    let summary = orchestrator.start_sync(req).wait().await.unwrap();

    assert_eq!(summary.count(JobState::Completed), names.len());
    assert_eq!(titles(&summary), vec!["Heat"]);
    assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_sync_primary_records_the_user() {
    let fetcher = scenario_fetcher();
    fetcher.set("me", list(&[("Inception", 2010), ("Arrival", 2016)]));
    let (store, orchestrator) = setup(fetcher.clone());

    let me = Friend::new("me", "Me");
    let snapshot = orchestrator.sync_primary(&me, false).await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(store.primary_user().unwrap().map(|f| f.handle), Some("me".to_string()));
    assert!(store.list_friends().unwrap().is_empty());

    // A failed refresh falls back to the committed copy
    fetcher.set("me", vec![Err(SourceError::permanent("fake://me/1", "HTTP 500"))]);
    let fallback = orchestrator.sync_primary(&me, true).await.unwrap();
    assert_eq!(fallback, snapshot);
}

#[tokio::test]
async fn test_not_found_after_last_page_completes_the_job() {
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.set(
        "alice",
        vec![page(&[("Heat", 1995), ("Alien", 1979)], true), page(&[("Jaws", 1975)], false)],
    );
    let (store, orchestrator) = setup(fetcher.clone());

    let summary = orchestrator
        .start_sync(request(&[("Jaws", 1975)], &["alice"], MatchMode::Any, true))
        .wait()
        .await
        .unwrap();

    let alice = job(&summary, "alice");
    assert_eq!(alice.state, JobState::Completed);
    assert_eq!(alice.pages_fetched, 2);
    assert_eq!(fetcher.calls(), 3);
    assert_eq!(store.load_watchlist(&FriendId::new("alice")).unwrap().len(), 3);
    assert_eq!(titles(&summary), vec!["Jaws"]);
}

#[tokio::test]
async fn test_page_without_listing_after_last_page_completes_the_job() {
    let fetcher = Arc::new(FakeFetcher::default());
    fetcher.set(
        "alice",
        vec![
            page(&[("Heat", 1995)], false),
            Err(SourceError::NoListing("watchlist page has no poster list".into())),
        ],
    );
    fetcher.set("bob", vec![Err(SourceError::NoListing("watchlist page has no poster list".into()))]);
    let (store, orchestrator) = setup(fetcher);

    let summary = orchestrator
        .start_sync(request(&[("Heat", 1995)], &["alice", "bob"], MatchMode::Any, true))
        .wait()
        .await
        .unwrap();

    assert_eq!(job(&summary, "alice").state, JobState::Completed);
    assert_eq!(store.load_watchlist(&FriendId::new("alice")).unwrap().len(), 1);

    // Without an earlier last page the same answer is a format problem
    let bob = job(&summary, "bob");
    assert_eq!(bob.state, JobState::Failed);
    assert!(bob.error.as_deref().is_some_and(|e| e.contains("no poster list")));
    assert_eq!(summary.status, BatchStatus::PartiallyFailed);
}

#[tokio::test]
async fn test_list_exactly_at_page_cap_completes() {
    let fetcher = Arc::new(FakeFetcher {
        page_cap: Some(2),
        ..FakeFetcher::default()
    });
    fetcher.set("alice", vec![page(&[("Heat", 1995)], true), page(&[("Alien", 1979)], false)]);
    let (store, orchestrator) = setup(fetcher.clone());

    let summary = orchestrator
        .start_sync(request(&[], &["alice"], MatchMode::Any, true))
        .wait()
        .await
        .unwrap();

    let alice = job(&summary, "alice");
    assert_eq!(alice.state, JobState::Completed);
    assert_eq!(alice.pages_fetched, 2);
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(store.load_watchlist(&FriendId::new("alice")).unwrap().len(), 2);
}

#[tokio::test]
async fn test_next_page_beyond_cap_fails_the_job() {
    let fetcher = Arc::new(FakeFetcher {
        page_cap: Some(2),
        ..FakeFetcher::default()
    });
    fetcher.set(
        "alice",
        vec![
            page(&[("Heat", 1995)], true),
            page(&[("Alien", 1979)], true),
            page(&[("Jaws", 1975)], false),
        ],
    );
    fetcher.set("bob", list(&[("Heat", 1995)]));
    let (store, orchestrator) = setup(fetcher);

    let summary = orchestrator
        .start_sync(request(&[], &["alice", "bob"], MatchMode::Any, true))
        .wait()
        .await
        .unwrap();

    let alice = job(&summary, "alice");
    assert_eq!(alice.state, JobState::Failed);
    assert!(alice.error.as_deref().is_some_and(|e| e.contains("page cap of 2")));
    assert!(store.current_generation(&FriendId::new("alice")).unwrap().is_none());
}

/// Cancels the batch once a friend's first page has been reported
struct CancelAfterFirstPage {
    token: CancellationToken,
}

impl SyncObserver for CancelAfterFirstPage {
    fn on_progress(&self, event: &ProgressEvent) {
        if event.pages_fetched == 1 {
            self.token.cancel();
        }
    }
}

#[tokio::test]
async fn test_cancel_between_pages_discards_partial_entries() {
    let fetcher = Arc::new(FakeFetcher {
        delay: Some(Duration::from_millis(20)),
        ..FakeFetcher::default()
    });
    fetcher.set("alice", list(&[("Inception", 2010)]));
    let (store, orchestrator) = setup(fetcher.clone());
    orchestrator
        .start_sync(request(PRIMARY, &["alice"], MatchMode::Any, true))
        .wait()
        .await
        .unwrap();
    let alice = FriendId::new("alice");
    let before = store.current_generation(&alice).unwrap();
    assert!(before.is_some());

    let long_list: PageScript = (0..10u16)
        .map(|n| page(&[("Film", 1990 + n)], true))
        .collect();
    fetcher.set("alice", long_list);
    let calls_before = fetcher.calls();

    let token = CancellationToken::new();
    let handle = orchestrator.start_sync_with(request(PRIMARY, &["alice"], MatchMode::Any, true), token.clone());
    handle.subscribe(Arc::new(CancelAfterFirstPage { token }));
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.status, BatchStatus::Cancelled);
    assert!(summary.matches.is_empty());
    let cancelled = job(&summary, "alice");
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(cancelled.generation_id.is_none());

    // The page in flight when cancellation arrived still completed
    let fetched = fetcher.calls() - calls_before;
    assert!(fetched >= 1 && fetched < 10);
    assert_eq!(cancelled.pages_fetched, fetched);

    assert_eq!(store.current_generation(&alice).unwrap(), before);
    let kept: Vec<String> = store.load_watchlist(&alice).unwrap().into_iter().map(|e| e.raw_title).collect();
    assert_eq!(kept, vec!["Inception"]);
    assert_eq!(store.get_friend(&alice).unwrap().unwrap().sync_state, Some(JobState::Cancelled));
}

#[tokio::test]
async fn test_advertised_total_is_reported_in_progress() {
    let fetcher = Arc::new(FakeFetcher::default());
    let mut first = page(&[("Heat", 1995), ("Alien", 1979)], true);
    if let Ok(p) = first.as_mut() {
        p.total_hint = Some(3);
    }
    fetcher.set(
        "alice",
        vec![first, page(&[("Solaris", 1972)], false), page(&[], false)],
    );
    let (_store, orchestrator) = setup(fetcher);

    let handle = orchestrator.start_sync(request(&[("Heat", 1995)], &["alice"], MatchMode::Any, true));
    let events = handle.events();
    handle.wait().await.unwrap();

    let recorder = Arc::new(Recorder::default());
    events.subscribe(recorder.clone());

    let progress = recorder.progress.lock().unwrap();
    let hints: Vec<Option<usize>> = progress.iter().map(|p| p.total_hint).collect();
    // Later pages that omit the count keep the first advertised total
    assert_eq!(hints, vec![None, Some(3), Some(3), Some(3)]);
    assert_eq!(progress.last().map(|p| p.entries_found), Some(3));
}
