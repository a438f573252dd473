use crate::sync::BatchSummary;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use watchmatch_models::{FriendId, JobState, SyncJob};

/// Per-page progress for one friend
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub friend_id: FriendId,
    pub pages_fetched: u32,
    pub entries_found: usize,
    /// Advertised watchlist size, if the site reports one
    pub total_hint: Option<usize>,
    pub state: JobState,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Progress(ProgressEvent),
    FriendComplete(SyncJob),
    BatchComplete(BatchSummary),
}

/// Receives batch events. Callbacks run on the dispatcher task, never on a
/// sync worker, and must not block for long.
pub trait SyncObserver: Send + Sync {
    fn on_progress(&self, _event: &ProgressEvent) {}

    fn on_friend_complete(&self, _job: &SyncJob) {}

    fn on_batch_complete(&self, _summary: &BatchSummary) {}
}

fn deliver(observer: &dyn SyncObserver, event: &SyncEvent) {
    match event {
        SyncEvent::Progress(progress) => observer.on_progress(progress),
        SyncEvent::FriendComplete(job) => observer.on_friend_complete(job),
        SyncEvent::BatchComplete(summary) => observer.on_batch_complete(summary),
    }
}

#[derive(Default)]
struct HubState {
    history: Vec<SyncEvent>,
    observers: Vec<Arc<dyn SyncObserver>>,
}

/// Fan-out point for one batch's events.
///
/// Keeps every published event so an observer subscribing late is first
/// replayed the history, in order, and then receives live events. Replay and
/// publish share one lock, so no event is seen twice or skipped.
#[derive(Default)]
pub struct EventHub {
    state: Mutex<HubState>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn SyncObserver>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        for event in &state.history {
            deliver(observer.as_ref(), event);
        }
        state.observers.push(observer);
    }

    pub fn publish(&self, event: SyncEvent) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        for observer in &state.observers {
            deliver(observer.as_ref(), &event);
        }
        state.history.push(event);
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).history.len()
    }

    /// Start a task that forwards events from the returned sender into this
    /// hub. Workers send without waiting on observers. The task ends once
    /// every sender is dropped.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> (mpsc::UnboundedSender<SyncEvent>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                hub.publish(event);
            }
        });
        (tx, task)
    }
}
