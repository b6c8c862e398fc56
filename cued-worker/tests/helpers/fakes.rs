//! In-memory collaborators

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use cued_worker::credentials::{
    Credential, CredentialError, CredentialStore, RefreshedToken, TokenExchange,
};
use cued_worker::cues::{CuePreference, PreferenceStore};
use cued_worker::playback::{CurrentlyPlaying, ItemType, PlaybackControl, PlaybackError, TrackInfo};
use cued_worker::registry::{JobQueue, JobRecord, JobState, SessionJob};

pub fn track(id: &str, duration_ms: u64) -> TrackInfo {
    TrackInfo {
        track_id: id.to_string(),
        name: id.to_string(),
        duration_ms,
    }
}

pub fn playing_track(id: &str, progress_ms: u64, duration_ms: u64) -> CurrentlyPlaying {
    CurrentlyPlaying {
        item_type: ItemType::Track,
        is_playing: true,
        progress_ms,
        track: Some(track(id, duration_ms)),
    }
}

pub fn valid_credential() -> Credential {
    Credential {
        access_token: "access-0".to_string(),
        refresh_token: "refresh-0".to_string(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        account_ref: "acct-1".to_string(),
    }
}

type CurrentFn =
    dyn Fn(u32, Duration) -> Result<Option<CurrentlyPlaying>, PlaybackError> + Send + Sync;

/// Scripted remote player
///
/// `currently_playing` is answered by a closure of (call index, time since
/// the player was built).
pub struct FakePlayer {
    started: Instant,
    current: Box<CurrentFn>,
    queue: Vec<TrackInfo>,
    delay: Duration,
    polls: AtomicU32,
    skips: AtomicU32,
    seeks: Mutex<Vec<u64>>,
}

impl FakePlayer {
    pub fn idle() -> Self {
        Self::scripted(|_, _| Ok(None))
    }

    pub fn scripted<F>(current: F) -> Self
    where
        F: Fn(u32, Duration) -> Result<Option<CurrentlyPlaying>, PlaybackError> + Send + Sync + 'static,
    {
        Self {
            started: Instant::now(),
            current: Box::new(current),
            queue: Vec::new(),
            delay: Duration::ZERO,
            polls: AtomicU32::new(0),
            skips: AtomicU32::new(0),
            seeks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_queue(mut self, queue: Vec<TrackInfo>) -> Self {
        self.queue = queue;
        self
    }

    /// Each currently-playing call takes this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn skips(&self) -> u32 {
        self.skips.load(Ordering::SeqCst)
    }

    pub fn seeks(&self) -> Vec<u64> {
        self.seeks.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlaybackControl for FakePlayer {
    async fn currently_playing(&self, _: &Credential) -> Result<Option<CurrentlyPlaying>, PlaybackError> {
        let index = self.polls.fetch_add(1, Ordering::SeqCst);
        let elapsed = self.started.elapsed();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.current)(index, elapsed)
    }

    async fn queue(&self, _: &Credential) -> Result<Vec<TrackInfo>, PlaybackError> {
        Ok(self.queue.clone())
    }

    async fn skip_to_next(&self, _: &Credential) -> Result<(), PlaybackError> {
        self.skips.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn seek(&self, _: &Credential, position_ms: u64) -> Result<(), PlaybackError> {
        self.seeks.lock().unwrap().push(position_ms);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCredentials {
    credentials: Mutex<HashMap<String, Credential>>,
    saves: AtomicU32,
}

impl MemoryCredentials {
    pub fn with(users: &[&str], credential: Credential) -> Self {
        let store = Self::default();
        for user in users {
            store
                .credentials
                .lock()
                .unwrap()
                .insert(user.to_string(), credential.clone());
        }
        store
    }

    pub fn saves(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, user_id: &str) -> Option<Credential> {
        self.credentials.lock().unwrap().get(user_id).cloned()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentials {
    async fn load(&self, user_id: &str) -> cued_common::Result<Option<Credential>> {
        Ok(self.get(user_id))
    }

    async fn save(&self, user_id: &str, credential: &Credential) -> cued_common::Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.credentials
            .lock()
            .unwrap()
            .insert(user_id.to_string(), credential.clone());
        Ok(())
    }
}

/// Token endpoint that counts exchanges
#[derive(Default)]
pub struct FakeExchange {
    calls: AtomicU32,
    fail: bool,
}

impl FakeExchange {
    pub fn failing() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenExchange for FakeExchange {
    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedToken, CredentialError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(CredentialError::Exchange(400, "invalid_grant".to_string()));
        }
        Ok(RefreshedToken {
            access_token: format!("access-{}", n),
            expires_in: 3600,
            refresh_token: None,
        })
    }
}

pub struct NoCues;

#[async_trait]
impl PreferenceStore for NoCues {
    async fn find(&self, _: &str, _: &str) -> cued_common::Result<Option<CuePreference>> {
        Ok(None)
    }
}

/// Job queue kept in memory, every row owned by this process
#[derive(Default)]
pub struct MemoryQueue {
    rows: Mutex<HashMap<String, (SessionJob, JobState)>>,
}

impl MemoryQueue {
    pub fn state(&self, user_id: &str) -> Option<JobState> {
        self.rows.lock().unwrap().get(user_id).map(|(_, state)| *state)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &SessionJob) -> cued_common::Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&job.user_id) {
            return Ok(false);
        }
        rows.insert(job.user_id.clone(), (job.clone(), JobState::Waiting));
        Ok(true)
    }

    async fn get(&self, user_id: &str) -> cued_common::Result<Option<JobRecord>> {
        Ok(self.rows.lock().unwrap().get(user_id).map(|(job, state)| JobRecord {
            job: job.clone(),
            state: *state,
            enqueued_at: Utc::now(),
            active: true,
        }))
    }

    async fn remove(&self, user_id: &str) -> cued_common::Result<bool> {
        Ok(self.rows.lock().unwrap().remove(user_id).is_some())
    }

    async fn complete(&self, user_id: &str, job_id: Uuid) -> cued_common::Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        if rows.get(user_id).map(|(job, _)| job.job_id) == Some(job_id) {
            rows.remove(user_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn mark_running(&self, user_id: &str, job_id: Uuid) -> cued_common::Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(user_id) {
            Some((job, state)) if job.job_id == job_id => {
                *state = JobState::Running;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn evict_inactive(&self) -> cued_common::Result<u64> {
        Ok(0)
    }
}
