//! Session scheduler
//!
//! Drives one user's session: a bounded, fixed-cadence loop of controller
//! iterations.
//!
//! **State machine:**
//! ```text
//! Idle -> Running -> { Exhausted | Cancelled | Failed } -> Terminated
//! ```
//!
//! Each cycle starts an iteration and a timed wait together and awaits both,
//! so the cadence is `max(iteration, poll_interval)`. Cancellation is seen
//! between iterations and during the wait; an in-flight remote call always
//! runs to completion.

use chrono::Utc;
use cued_common::events::{EndReason, EventBus, SessionEvent};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::controller::{ControllerSettings, IterationOutcome, PollSkipController};
use crate::credentials::{CredentialError, CredentialLifecycle, ManagedCredential};
use crate::cues::CueResolver;
use crate::playback::{PlaybackControl, PlaybackError};
use crate::registry::queue::JobQueue;

/// Scheduler lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Running = 1,
    Exhausted = 2,
    Cancelled = 3,
    Failed = 4,
    Terminated = 5,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::Idle,
            1 => SchedulerState::Running,
            2 => SchedulerState::Exhausted,
            3 => SchedulerState::Cancelled,
            4 => SchedulerState::Failed,
            _ => SchedulerState::Terminated,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerState::Exhausted
                | SchedulerState::Cancelled
                | SchedulerState::Failed
                | SchedulerState::Terminated
        )
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error("Job queue error: {0}")]
    Queue(#[from] cued_common::Error),
}

/// Per-session parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub user_id: String,
    pub job_id: Uuid,
    pub poll_interval: Duration,
    pub total_runs: u32,
    pub safety_margin_multiplier: u32,
}

/// Progress shared between a running scheduler and status queries
#[derive(Debug)]
pub struct SessionProgress {
    remaining_runs: AtomicU32,
    state: AtomicU8,
}

impl SessionProgress {
    pub fn new(total_runs: u32) -> Self {
        Self {
            remaining_runs: AtomicU32::new(total_runs),
            state: AtomicU8::new(SchedulerState::Idle as u8),
        }
    }

    pub fn remaining_runs(&self) -> u32 {
        self.remaining_runs.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Saturating decrement; returns the new value
    fn consume_run(&self) -> u32 {
        let previous = self
            .remaining_runs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

/// Collaborators shared by every session
#[derive(Clone)]
pub struct SessionEnvironment {
    pub credentials: CredentialLifecycle,
    pub playback: Arc<dyn PlaybackControl>,
    pub cues: CueResolver,
    pub queue: Arc<dyn JobQueue>,
    pub event_bus: EventBus,
}

/// How a scheduler run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOutcome {
    pub final_state: SchedulerState,
    pub runs_completed: u32,
    pub error: Option<String>,
}

pub struct SessionScheduler {
    config: SchedulerConfig,
    env: SessionEnvironment,
    progress: Arc<SessionProgress>,
    cancel: CancellationToken,
    runs_completed: u32,
}

impl SessionScheduler {
    pub fn new(
        config: SchedulerConfig,
        env: SessionEnvironment,
        progress: Arc<SessionProgress>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            env,
            progress,
            cancel,
            runs_completed: 0,
        }
    }

    pub fn progress(&self) -> Arc<SessionProgress> {
        Arc::clone(&self.progress)
    }

    /// Run the session to a terminal state
    pub async fn run(mut self) -> SchedulerOutcome {
        let result = self.drive().await;

        let outcome = match result {
            Ok(state) => {
                self.progress.set_state(state);
                info!(
                    user_id = %self.config.user_id,
                    job_id = %self.config.job_id,
                    state = ?state,
                    runs_completed = self.runs_completed,
                    "Session ended"
                );
                let reason = match state {
                    SchedulerState::Exhausted => EndReason::Exhausted,
                    _ => EndReason::Cancelled,
                };
                self.env.event_bus.emit_lossy(SessionEvent::SessionEnded {
                    user_id: self.config.user_id.clone(),
                    job_id: self.config.job_id,
                    reason,
                    runs_completed: self.runs_completed,
                    timestamp: Utc::now(),
                });
                SchedulerOutcome {
                    final_state: state,
                    runs_completed: self.runs_completed,
                    error: None,
                }
            }
            Err(e) => {
                self.progress.set_state(SchedulerState::Failed);
                error!(
                    user_id = %self.config.user_id,
                    job_id = %self.config.job_id,
                    runs_completed = self.runs_completed,
                    error = %e,
                    "Session failed"
                );
                self.env.event_bus.emit_lossy(SessionEvent::SessionFailed {
                    user_id: self.config.user_id.clone(),
                    job_id: self.config.job_id,
                    error: e.to_string(),
                    runs_completed: self.runs_completed,
                    timestamp: Utc::now(),
                });
                SchedulerOutcome {
                    final_state: SchedulerState::Failed,
                    runs_completed: self.runs_completed,
                    error: Some(e.to_string()),
                }
            }
        };

        self.progress.set_state(SchedulerState::Terminated);
        outcome
    }

    /// Returns the terminal state for clean endings, `Err` for failures
    async fn drive(&mut self) -> Result<SchedulerState, SchedulerError> {
        if self.cancel.is_cancelled() {
            debug!(user_id = %self.config.user_id, "Session cancelled before start");
            return Ok(SchedulerState::Cancelled);
        }

        let user_id = self.config.user_id.clone();

        if !self.env.queue.mark_running(&user_id, self.config.job_id).await? {
            debug!(user_id = %user_id, job_id = %self.config.job_id, "Job row gone before start");
            return Ok(SchedulerState::Cancelled);
        }

        self.progress.set_state(SchedulerState::Running);
        info!(
            user_id = %user_id,
            job_id = %self.config.job_id,
            total_runs = self.config.total_runs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Session started"
        );
        self.env.event_bus.emit_lossy(SessionEvent::SessionStarted {
            user_id: user_id.clone(),
            job_id: self.config.job_id,
            total_runs: self.config.total_runs,
            timestamp: Utc::now(),
        });

        let mut credential = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(SchedulerState::Cancelled),
            acquired = self.env.credentials.acquire(&user_id) => acquired?,
        };

        let controller = PollSkipController::new(
            user_id.clone(),
            ControllerSettings {
                poll_interval_ms: self.config.poll_interval.as_millis() as u64,
                safety_margin_multiplier: self.config.safety_margin_multiplier,
            },
            Arc::clone(&self.env.playback),
            self.env.cues.clone(),
        );

        loop {
            if self.progress.remaining_runs() == 0 {
                return Ok(SchedulerState::Exhausted);
            }
            if self.cancel.is_cancelled() {
                return Ok(SchedulerState::Cancelled);
            }

            credential.ensure_fresh().await?;

            let (result, cancelled) = {
                let current = credential.credential().clone();
                tokio::join!(controller.run_iteration(&current), self.interval_wait())
            };

            match result {
                Ok(outcome) => self.record_outcome(outcome),
                Err(e) if cancelled => {
                    debug!(user_id = %user_id, error = %e, "Iteration failed after cancellation");
                    return Ok(SchedulerState::Cancelled);
                }
                Err(e) => self.recover(&mut credential, e).await?,
            }

            let remaining = self.progress.consume_run();
            self.runs_completed += 1;
            debug!(user_id = %user_id, remaining_runs = remaining, "Iteration complete");

            if cancelled {
                return Ok(SchedulerState::Cancelled);
            }
        }
    }

    /// Wait one poll interval; `true` if cancelled during the wait
    async fn interval_wait(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    fn record_outcome(&self, outcome: IterationOutcome) {
        if let IterationOutcome::Skipped {
            next_track_id,
            seek_to_ms,
        } = outcome
        {
            self.env.event_bus.emit_lossy(SessionEvent::SessionSkipped {
                user_id: self.config.user_id.clone(),
                job_id: self.config.job_id,
                next_track_id,
                seek_to_ms,
                timestamp: Utc::now(),
            });
        }
    }

    async fn recover(
        &self,
        credential: &mut ManagedCredential,
        error: PlaybackError,
    ) -> Result<(), SchedulerError> {
        let result = credential.recover_from(&error).await;
        if let Err(CredentialError::CooldownActive { .. }) = &result {
            error!(
                user_id = %self.config.user_id,
                playback_error = %error,
                "Remote call failed again inside refresh cooldown"
            );
        }
        result.map_err(SchedulerError::from)
    }
}
