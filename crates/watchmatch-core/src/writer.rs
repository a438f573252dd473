use crate::store::{NormalizedEntry, Store, StoreError};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use watchmatch_models::{FriendId, GenerationId};

/// One generation commit handed to the writer task
pub struct CommitRequest {
    pub friend_id: FriendId,
    pub entries: Vec<NormalizedEntry>,
    pub reply: oneshot::Sender<Result<GenerationId, StoreError>>,
}

/// Sender side of the single writer task. Cheap to clone; every sync job
/// in a batch holds one.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<CommitRequest>,
}

impl WriterHandle {
    /// Queue a generation commit and wait for its outcome
    pub async fn commit(&self, friend_id: FriendId, entries: Vec<NormalizedEntry>) -> Result<GenerationId, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CommitRequest { friend_id, entries, reply })
            .await
            .map_err(|_| StoreError::Worker("writer task stopped".to_string()))?;
        rx.await
            .map_err(|_| StoreError::Worker("writer task dropped the commit".to_string()))?
    }
}

/// Start the writer task. Commits are applied one at a time in arrival
/// order; the task exits once every [`WriterHandle`] is dropped.
pub fn spawn_writer(store: Arc<Store>, capacity: usize) -> (WriterHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<CommitRequest>(capacity.max(1));

    let task = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let CommitRequest { friend_id, entries, reply } = request;
            let id = friend_id.clone();
            let result = store
                .call(move |store| store.replace_watchlist(&friend_id, &entries))
                .await;

            if let Err(e) = &result {
                error!(operation = "commit_generation", friend = %id, error = %e, "Generation commit failed");
            }
            // The job may have been dropped while waiting; nothing to tell it then
            let _ = reply.send(result);
        }
        debug!("Writer task finished");
    });

    (WriterHandle { tx }, task)
}
