//! Durable session queue abstraction

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a queued session row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Accepted, waiting for a worker
    Waiting,
    /// A worker is running the scheduler
    Running,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Running => write!(f, "running"),
        }
    }
}

impl FromStr for JobState {
    type Err = cued_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "running" => Ok(JobState::Running),
            other => Err(cued_common::Error::InvalidInput(format!("Unknown job state: {}", other))),
        }
    }
}

/// Payload of one session job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionJob {
    pub user_id: String,
    pub job_id: Uuid,
    pub poll_interval_ms: u64,
    pub total_runs: u32,
}

/// Stored job row as seen by this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job: SessionJob,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    /// False when the row belongs to another (dead) process instance
    pub active: bool,
}

/// Keyed, create-if-absent job queue
///
/// Keys are user ids; at most one row per key exists at any time.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert the job unless a row for its user already exists.
    /// Returns `true` when inserted.
    async fn enqueue(&self, job: &SessionJob) -> cued_common::Result<bool>;

    async fn get(&self, user_id: &str) -> cued_common::Result<Option<JobRecord>>;

    /// Delete the user's row unconditionally. Returns `true` if a row existed.
    async fn remove(&self, user_id: &str) -> cued_common::Result<bool>;

    /// Delete the user's row only if it still belongs to `job_id`
    async fn complete(&self, user_id: &str, job_id: Uuid) -> cued_common::Result<bool>;

    /// Move the user's `job_id` row to `running`. Returns `false` when the row
    /// is gone or was replaced.
    async fn mark_running(&self, user_id: &str, job_id: Uuid) -> cued_common::Result<bool>;

    /// Delete every row not owned by this process instance
    async fn evict_inactive(&self) -> cued_common::Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_round_trip_through_text() {
        for state in [JobState::Waiting, JobState::Running] {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn test_job_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobState::Running).unwrap(), "\"running\"");
    }
}
