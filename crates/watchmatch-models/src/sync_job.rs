use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use crate::friend::FriendId;
use crate::watchlist::GenerationId;

/// Lifecycle of one friend's job within a batch.
///
/// `Pending → Running → {Completed, Failed, Cancelled}`; a job that never
/// started can also go straight from `Pending` to `Cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Cancelled,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Cancelled | JobState::Completed | JobState::Failed)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Cancelled => "cancelled",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "cancelled" => Ok(JobState::Cancelled),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("Unknown job state: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncJob {
    pub friend_id: FriendId,
    /// Generation committed by this job (or reused, for fresh friends)
    pub generation_id: Option<GenerationId>,
    pub state: JobState,
    pub pages_fetched: u32,
    pub entries_found: usize,
    /// Watchlist size advertised by the site, when a page carried it
    #[serde(default)]
    pub total_hint: Option<usize>,
    pub error: Option<String>,
    /// The friend was synced recently and the committed generation was reused
    #[serde(default)]
    pub reused_cached: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn new(friend_id: FriendId) -> Self {
        Self {
            friend_id,
            generation_id: None,
            state: JobState::Pending,
            pages_fetched: 0,
            entries_found: 0,
            total_hint: None,
            error: None,
            reused_cached: false,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, stamping start/finish times.
    ///
    /// Returns `false` and leaves the job untouched when the transition is
    /// not allowed (terminal states are final for the batch).
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == JobState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = SyncJob::new(FriendId::new("alice"));
        assert!(job.transition(JobState::Running));
        assert!(job.started_at.is_some());
        assert!(job.transition(JobState::Completed));
        assert!(job.finished_at.is_some());

        assert!(!job.transition(JobState::Running));
        assert!(!job.transition(JobState::Failed));
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_pending_can_be_cancelled_but_not_completed() {
        let mut job = SyncJob::new(FriendId::new("bob"));
        assert!(!job.transition(JobState::Completed));
        assert!(job.transition(JobState::Cancelled));
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [JobState::Pending, JobState::Running, JobState::Cancelled, JobState::Completed, JobState::Failed] {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
    }
}
