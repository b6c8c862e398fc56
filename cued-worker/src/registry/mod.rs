//! Session registry
//!
//! At most one live session per user. `toggle` creates or removes it;
//! `status` reports on it. The durable job queue's create-if-absent insert
//! and the registry's handle lock together keep concurrent toggles for one
//! user from ever producing two sessions.

pub mod pool;
pub mod queue;

pub use pool::{PoolClosed, PoolJob, WorkerPool};
pub use queue::{JobQueue, JobRecord, JobState, SessionJob};

use chrono::{DateTime, Utc};
use cued_common::config::CuedConfig;
use cued_common::events::SessionEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::scheduler::{
    SchedulerConfig, SchedulerOutcome, SchedulerState, SessionEnvironment, SessionProgress,
    SessionScheduler,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Job queue error: {0}")]
    Queue(#[from] cued_common::Error),

    #[error("Session conflict for user {0}")]
    Conflict(String),

    #[error("Worker pool is shut down")]
    PoolClosed,
}

/// Result of a toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleAction {
    Created,
    Removed,
}

/// In-memory view of a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub user_id: String,
    pub job_id: Uuid,
    pub poll_interval_ms: u64,
    pub remaining_runs: u32,
    pub state: SchedulerState,
    pub started_at: DateTime<Utc>,
}

/// Status reported for a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub time_remaining_ms: u64,
    pub remaining_runs: u32,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
}

/// Parameters applied to every new session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub total_runs: u32,
    pub safety_margin_multiplier: u32,
}

impl From<&CuedConfig> for SessionSettings {
    fn from(config: &CuedConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            total_runs: config.total_runs,
            safety_margin_multiplier: config.safety_margin_multiplier,
        }
    }
}

struct SessionHandle {
    job_id: Uuid,
    cancel: CancellationToken,
    progress: Arc<SessionProgress>,
    started_at: DateTime<Utc>,
    poll_interval_ms: u64,
}

struct RegistryInner {
    env: SessionEnvironment,
    settings: SessionSettings,
    pool: WorkerPool,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    last_error: RwLock<Option<String>>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(env: SessionEnvironment, settings: SessionSettings, pool: WorkerPool) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                env,
                settings,
                pool,
                sessions: Mutex::new(HashMap::new()),
                last_error: RwLock::new(None),
            }),
        }
    }

    pub fn settings(&self) -> SessionSettings {
        self.inner.settings
    }

    /// Create the user's session if none is live, otherwise remove it
    pub async fn toggle(&self, user_id: &str) -> Result<ToggleAction, RegistryError> {
        let mut sessions = self.inner.sessions.lock().await;
        let queue = &self.inner.env.queue;

        if let Some(record) = queue.get(user_id).await? {
            if is_live(&sessions, &record) {
                if let Some(handle) = sessions.remove(user_id) {
                    handle.cancel.cancel();
                }
                queue.remove(user_id).await?;
                info!(user_id = %user_id, job_id = %record.job.job_id, "Session removed");
                return Ok(ToggleAction::Removed);
            }

            debug!(user_id = %user_id, job_id = %record.job.job_id, "Evicting orphaned session row");
            queue.remove(user_id).await?;
        }

        // A handle without a matching row belongs to a scheduler that already finished
        if let Some(stale) = sessions.remove(user_id) {
            stale.cancel.cancel();
        }

        let settings = self.inner.settings;
        let job = SessionJob {
            user_id: user_id.to_string(),
            job_id: Uuid::new_v4(),
            poll_interval_ms: settings.poll_interval.as_millis() as u64,
            total_runs: settings.total_runs,
        };

        if !queue.enqueue(&job).await? {
            warn!(user_id = %user_id, "Job row appeared while creating session");
            return Err(RegistryError::Conflict(user_id.to_string()));
        }

        let cancel = CancellationToken::new();
        let progress = Arc::new(SessionProgress::new(job.total_runs));
        let started_at = Utc::now();

        let scheduler = SessionScheduler::new(
            SchedulerConfig {
                user_id: job.user_id.clone(),
                job_id: job.job_id,
                poll_interval: settings.poll_interval,
                total_runs: job.total_runs,
                safety_margin_multiplier: settings.safety_margin_multiplier,
            },
            self.inner.env.clone(),
            Arc::clone(&progress),
            cancel.clone(),
        );

        let registry = self.clone();
        let task_user = job.user_id.clone();
        let job_id = job.job_id;
        let pool_job = PoolJob::new(user_id, cancel.clone(), async move {
            let outcome = match tokio::spawn(scheduler.run()).await {
                Ok(outcome) => outcome,
                Err(e) => SchedulerOutcome {
                    final_state: SchedulerState::Failed,
                    runs_completed: 0,
                    error: Some(format!("scheduler task aborted: {}", e)),
                },
            };
            registry.finish(&task_user, job_id, outcome).await;
        });

        if self.inner.pool.submit(pool_job).is_err() {
            queue.complete(user_id, job.job_id).await?;
            return Err(RegistryError::PoolClosed);
        }

        sessions.insert(
            user_id.to_string(),
            SessionHandle {
                job_id: job.job_id,
                cancel,
                progress,
                started_at,
                poll_interval_ms: job.poll_interval_ms,
            },
        );

        info!(user_id = %user_id, job_id = %job.job_id, total_runs = job.total_runs, "Session created");
        self.inner.env.event_bus.emit_lossy(SessionEvent::SessionQueued {
            user_id: user_id.to_string(),
            job_id: job.job_id,
            timestamp: started_at,
        });

        Ok(ToggleAction::Created)
    }

    /// Remaining time and runs of the user's live session, `None` otherwise.
    /// A row with no scheduler of this process behind it is evicted here.
    pub async fn status(&self, user_id: &str) -> Result<Option<SessionStatus>, RegistryError> {
        let mut sessions = self.inner.sessions.lock().await;
        let queue = &self.inner.env.queue;

        let Some(record) = queue.get(user_id).await? else {
            return Ok(None);
        };

        if !is_live(&sessions, &record) {
            debug!(user_id = %user_id, job_id = %record.job.job_id, "Evicting orphaned session row");
            queue.remove(user_id).await?;
            if let Some(stale) = sessions.remove(user_id) {
                stale.cancel.cancel();
            }
            return Ok(None);
        }

        let Some(handle) = sessions.get(user_id) else {
            return Ok(None);
        };

        let remaining_runs = handle.progress.remaining_runs();
        let status = SessionStatus {
            time_remaining_ms: u64::from(remaining_runs).saturating_mul(handle.poll_interval_ms),
            remaining_runs,
            state: record.state,
            started_at: handle.started_at,
        };

        Ok(Some(status))
    }

    /// In-memory snapshot of the user's session
    pub async fn session(&self, user_id: &str) -> Option<Session> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(user_id).map(|handle| Session {
            user_id: user_id.to_string(),
            job_id: handle.job_id,
            poll_interval_ms: handle.poll_interval_ms,
            remaining_runs: handle.progress.remaining_runs(),
            state: handle.progress.state(),
            started_at: handle.started_at,
        })
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Most recent session failure, if any
    pub async fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().await.clone()
    }

    /// Delete every job row left by a previous process instance
    pub async fn evict_orphans(&self) -> Result<u64, RegistryError> {
        let _sessions = self.inner.sessions.lock().await;
        let evicted = self.inner.env.queue.evict_inactive().await?;
        if evicted > 0 {
            info!(evicted, "Evicted orphaned sessions from a previous run");
        }
        Ok(evicted)
    }

    /// Cancel all sessions and wait for the workers to stop
    pub async fn shutdown(&self) {
        let handles: Vec<(String, SessionHandle)> = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.drain().collect()
        };

        for (user_id, handle) in &handles {
            debug!(user_id = %user_id, job_id = %handle.job_id, "Cancelling session for shutdown");
            handle.cancel.cancel();
        }

        for (user_id, handle) in &handles {
            if let Err(e) = self.inner.env.queue.complete(user_id, handle.job_id).await {
                warn!(user_id = %user_id, error = %e, "Failed to remove session row on shutdown");
            }
        }

        self.inner.pool.shutdown().await;
    }

    /// Called by the worker once a scheduler has terminated
    async fn finish(&self, user_id: &str, job_id: Uuid, outcome: SchedulerOutcome) {
        let mut sessions = self.inner.sessions.lock().await;

        if sessions.get(user_id).map(|h| h.job_id) == Some(job_id) {
            sessions.remove(user_id);
        }

        if let Err(e) = self.inner.env.queue.complete(user_id, job_id).await {
            warn!(user_id = %user_id, job_id = %job_id, error = %e, "Failed to remove finished session row");
        }

        if outcome.final_state == SchedulerState::Failed {
            let message = format!(
                "Session {} for user {} failed: {}",
                job_id,
                user_id,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            *self.inner.last_error.write().await = Some(message);
        }

        debug!(
            user_id = %user_id,
            job_id = %job_id,
            state = ?outcome.final_state,
            runs_completed = outcome.runs_completed,
            "Session finished"
        );
    }
}

/// Row owned by this process and backed by the scheduler that created it
fn is_live(sessions: &HashMap<String, SessionHandle>, record: &JobRecord) -> bool {
    record.active
        && sessions
            .get(&record.job.user_id)
            .is_some_and(|handle| handle.job_id == record.job.job_id)
}
