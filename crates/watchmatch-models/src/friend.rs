use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use crate::sync_job::JobState;

/// Stable identifier of a watchlist owner (a friend or the primary user).
///
/// Site handles are case-insensitive, so the id is the lower-cased handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct FriendId(String);

impl FriendId {
    pub fn new(handle: impl AsRef<str>) -> Self {
        Self(handle.as_ref().trim().trim_matches('/').to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FriendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FriendId {
    fn from(handle: &str) -> Self {
        Self::new(handle)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Friend {
    pub id: FriendId,
    pub display_name: String,
    /// Handle as it appears in profile URLs (e.g. `/{handle}/watchlist/`)
    pub handle: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// State of the most recent sync job; `None` until the first batch touches this friend
    pub sync_state: Option<JobState>,
}

impl Friend {
    pub fn new(handle: impl Into<String>, display_name: impl Into<String>) -> Self {
        let handle = handle.into();
        Self {
            id: FriendId::new(&handle),
            display_name: display_name.into(),
            handle,
            last_synced_at: None,
            sync_state: None,
        }
    }

    /// Whether the committed generation is recent enough to skip a re-fetch
    pub fn is_fresh(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        match (self.last_synced_at, self.sync_state) {
            (Some(synced), Some(JobState::Completed)) => now - synced < threshold,
            _ => false,
        }
    }
}
