//! Poll-skip controller
//!
//! One decision-and-act cycle against the remote player:
//! 1. Read the currently playing item (idle / non-track → no-op)
//! 2. Resolve its cue window
//! 3. Stop unless the cue end falls within `multiplier * poll_interval`
//! 4. Read the queue (empty → no-op)
//! 5. Resolve the next track's cue start
//! 6. Skip, then seek; failures of these two commands are logged and dropped

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::credentials::Credential;
use crate::cues::CueResolver;
use crate::playback::{PlaybackControl, PlaybackError, PlaybackSnapshot};

/// Timing inputs for the act/no-act decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub poll_interval_ms: u64,
    pub safety_margin_multiplier: u32,
}

impl ControllerSettings {
    /// Largest remaining margin at which an iteration still acts
    pub fn action_window_ms(&self) -> i64 {
        let window = self
            .poll_interval_ms
            .saturating_mul(u64::from(self.safety_margin_multiplier));
        i64::try_from(window).unwrap_or(i64::MAX)
    }

    /// True when the cue end is close enough that the next cycles could miss it
    pub fn within_margin(&self, preferred_end_ms: u64, progress_ms: u64) -> bool {
        margin_ms(preferred_end_ms, progress_ms) <= self.action_window_ms()
    }
}

fn margin_ms(preferred_end_ms: u64, progress_ms: u64) -> i64 {
    let end = i64::try_from(preferred_end_ms).unwrap_or(i64::MAX);
    let progress = i64::try_from(progress_ms).unwrap_or(i64::MAX);
    end.saturating_sub(progress)
}

/// What one iteration did; every variant is a success
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing playing, or a non-track item
    Idle,
    /// Cue end not reached within the action window
    NotYet { margin_ms: i64 },
    /// Within the window but nothing queued
    QueueEmpty,
    /// Skip and seek were issued (their results are not inspected)
    Skipped { next_track_id: String, seek_to_ms: u64 },
}

pub struct PollSkipController {
    user_id: String,
    settings: ControllerSettings,
    playback: Arc<dyn PlaybackControl>,
    cues: CueResolver,
}

impl PollSkipController {
    pub fn new(
        user_id: impl Into<String>,
        settings: ControllerSettings,
        playback: Arc<dyn PlaybackControl>,
        cues: CueResolver,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            settings,
            playback,
            cues,
        }
    }

    pub fn settings(&self) -> ControllerSettings {
        self.settings
    }

    /// Run one iteration; only the two read queries can fail it
    pub async fn run_iteration(&self, credential: &Credential) -> Result<IterationOutcome, PlaybackError> {
        let current = self.playback.currently_playing(credential).await?;

        let Some(mut snapshot) = current.and_then(PlaybackSnapshot::from_current) else {
            debug!(user_id = %self.user_id, "No playing track, nothing to do");
            return Ok(IterationOutcome::Idle);
        };

        let window = self
            .cues
            .resolve(&self.user_id, &snapshot.track.track_id, snapshot.track.duration_ms)
            .await;

        debug!(
            user_id = %self.user_id,
            track = %snapshot.track.name,
            progress_ms = snapshot.progress_ms,
            preferred_end_ms = window.end_ms,
            "Current track"
        );

        if !self.settings.within_margin(window.end_ms, snapshot.progress_ms) {
            let margin_ms = margin_ms(window.end_ms, snapshot.progress_ms);
            debug!(user_id = %self.user_id, margin_ms, "Track will not end before next poll");
            return Ok(IterationOutcome::NotYet { margin_ms });
        }

        let queue = self.playback.queue(credential).await?;
        snapshot.queue_head = queue.into_iter().next();

        let Some(next) = snapshot.queue_head else {
            debug!(user_id = %self.user_id, "No next track in queue");
            return Ok(IterationOutcome::QueueEmpty);
        };

        let next_window = self
            .cues
            .resolve(&self.user_id, &next.track_id, next.duration_ms)
            .await;

        // The playback API reports spurious errors on these two calls even
        // when they take effect
        if let Err(e) = self.playback.skip_to_next(credential).await {
            warn!(user_id = %self.user_id, error = %e, "Skip to next reported an error, ignoring");
        }
        if let Err(e) = self.playback.seek(credential, next_window.start_ms).await {
            warn!(user_id = %self.user_id, error = %e, "Seek reported an error, ignoring");
        }

        info!(
            user_id = %self.user_id,
            next_track = %next.name,
            seek_to_ms = next_window.start_ms,
            "Skipped to next track"
        );

        Ok(IterationOutcome::Skipped {
            next_track_id: next.track_id,
            seek_to_ms: next_window.start_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cues::{CuePreference, PreferenceStore};
    use crate::playback::{CurrentlyPlaying, ItemType, TrackInfo};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        CurrentlyPlaying,
        Queue,
        Skip,
        Seek(u64),
    }

    struct ScriptedPlayer {
        current: Option<CurrentlyPlaying>,
        queue: Vec<TrackInfo>,
        fail_commands: bool,
        fail_queue: bool,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedPlayer {
        fn new(current: Option<CurrentlyPlaying>, queue: Vec<TrackInfo>) -> Self {
            Self {
                current,
                queue,
                fail_commands: false,
                fail_queue: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        async fn calls(&self) -> Vec<Call> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl PlaybackControl for ScriptedPlayer {
        async fn currently_playing(&self, _: &Credential) -> Result<Option<CurrentlyPlaying>, PlaybackError> {
            self.calls.lock().await.push(Call::CurrentlyPlaying);
            Ok(self.current.clone())
        }

        async fn queue(&self, _: &Credential) -> Result<Vec<TrackInfo>, PlaybackError> {
            self.calls.lock().await.push(Call::Queue);
            if self.fail_queue {
                return Err(PlaybackError::Api(503, "unavailable".to_string()));
            }
            Ok(self.queue.clone())
        }

        async fn skip_to_next(&self, _: &Credential) -> Result<(), PlaybackError> {
            self.calls.lock().await.push(Call::Skip);
            if self.fail_commands {
                return Err(PlaybackError::Parse("unexpected end of JSON input".to_string()));
            }
            Ok(())
        }

        async fn seek(&self, _: &Credential, position_ms: u64) -> Result<(), PlaybackError> {
            self.calls.lock().await.push(Call::Seek(position_ms));
            if self.fail_commands {
                return Err(PlaybackError::Parse("unexpected end of JSON input".to_string()));
            }
            Ok(())
        }
    }

    struct Cues(HashMap<String, CuePreference>);

    #[async_trait]
    impl PreferenceStore for Cues {
        async fn find(&self, _user_id: &str, track_id: &str) -> cued_common::Result<Option<CuePreference>> {
            Ok(self.0.get(track_id).cloned())
        }
    }

    fn cues(entries: Vec<(&str, Option<u64>, Option<u64>)>) -> CueResolver {
        CueResolver::new(Arc::new(Cues(
            entries
                .into_iter()
                .map(|(track, start, end)| {
                    (
                        track.to_string(),
                        CuePreference {
                            user_id: "u1".to_string(),
                            track_id: track.to_string(),
                            preferred_start_ms: start,
                            preferred_end_ms: end,
                        },
                    )
                })
                .collect(),
        )))
    }

    fn track(id: &str, duration_ms: u64) -> TrackInfo {
        TrackInfo {
            track_id: id.to_string(),
            name: id.to_string(),
            duration_ms,
        }
    }

    fn playing(progress_ms: u64, duration_ms: u64) -> Option<CurrentlyPlaying> {
        Some(CurrentlyPlaying {
            item_type: ItemType::Track,
            is_playing: true,
            progress_ms,
            track: Some(track("current", duration_ms)),
        })
    }

    fn credential() -> Credential {
        Credential {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            account_ref: "acct".to_string(),
        }
    }

    const SETTINGS: ControllerSettings = ControllerSettings {
        poll_interval_ms: 5000,
        safety_margin_multiplier: 2,
    };

    fn controller(player: Arc<ScriptedPlayer>, resolver: CueResolver) -> PollSkipController {
        PollSkipController::new("u1", SETTINGS, player, resolver)
    }

    #[test]
    fn test_margin_law_boundaries() {
        let end = 120_000;
        let p = SETTINGS.poll_interval_ms;
        assert!(!SETTINGS.within_margin(end, end - 2 * p - 1));
        assert!(SETTINGS.within_margin(end, end - 2 * p));
        assert!(SETTINGS.within_margin(end, end - 2 * p + 1));
        assert!(SETTINGS.within_margin(end, end + 3_000), "past the cue end still acts");
    }

    #[test]
    fn test_multiplier_scales_window() {
        let wide = ControllerSettings {
            poll_interval_ms: 5000,
            safety_margin_multiplier: 3,
        };
        assert_eq!(wide.action_window_ms(), 15_000);
        assert!(wide.within_margin(120_000, 106_000));
        assert!(!SETTINGS.within_margin(120_000, 106_000));
    }

    #[tokio::test]
    async fn test_nothing_playing_is_idle() {
        let player = Arc::new(ScriptedPlayer::new(None, vec![]));
        let outcome = controller(player.clone(), cues(vec![]))
            .run_iteration(&credential())
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Idle);
        assert_eq!(player.calls().await, vec![Call::CurrentlyPlaying]);
    }

    #[tokio::test]
    async fn test_non_track_item_is_idle() {
        let episode = Some(CurrentlyPlaying {
            item_type: ItemType::Episode,
            is_playing: true,
            progress_ms: 119_000,
            track: Some(track("episode", 120_000)),
        });
        let player = Arc::new(ScriptedPlayer::new(episode, vec![track("x", 1)]));
        let outcome = controller(player.clone(), cues(vec![]))
            .run_iteration(&credential())
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Idle);
        assert_eq!(player.calls().await, vec![Call::CurrentlyPlaying]);
    }

    #[tokio::test]
    async fn test_outside_margin_is_noop_without_queue_lookup() {
        let player = Arc::new(ScriptedPlayer::new(
            playing(120_000 - 10_000 - 1, 120_000),
            vec![track("x", 200_000)],
        ));
        let outcome = controller(player.clone(), cues(vec![]))
            .run_iteration(&credential())
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::NotYet { margin_ms: 10_001 });
        assert_eq!(player.calls().await, vec![Call::CurrentlyPlaying]);
    }

    #[tokio::test]
    async fn test_just_inside_margin_attempts_skip() {
        let player = Arc::new(ScriptedPlayer::new(
            playing(120_000 - 10_000 + 1, 120_000),
            vec![track("x", 200_000)],
        ));
        let outcome = controller(player.clone(), cues(vec![]))
            .run_iteration(&credential())
            .await
            .unwrap();
        assert!(matches!(outcome, IterationOutcome::Skipped { .. }));
        assert!(player.calls().await.contains(&Call::Skip));
    }

    #[tokio::test]
    async fn test_skip_then_seek_to_next_cue_start() {
        let player = Arc::new(ScriptedPlayer::new(
            playing(118_000, 240_000),
            vec![track("trackX", 200_000), track("trackY", 200_000)],
        ));
        let resolver = cues(vec![
            ("current", None, Some(120_000)),
            ("trackX", Some(15_000), None),
        ]);

        let outcome = controller(player.clone(), resolver)
            .run_iteration(&credential())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            IterationOutcome::Skipped {
                next_track_id: "trackX".to_string(),
                seek_to_ms: 15_000
            }
        );
        assert_eq!(
            player.calls().await,
            vec![Call::CurrentlyPlaying, Call::Queue, Call::Skip, Call::Seek(15_000)]
        );
    }

    #[tokio::test]
    async fn test_cue_end_overrides_track_duration() {
        // 60s before the real end, but 2s before the cue end
        let player = Arc::new(ScriptedPlayer::new(playing(178_000, 240_000), vec![track("x", 1)]));
        let resolver = cues(vec![("current", Some(0), Some(180_000))]);

        let outcome = controller(player, resolver).run_iteration(&credential()).await.unwrap();
        assert!(matches!(outcome, IterationOutcome::Skipped { seek_to_ms: 0, .. }));
    }

    #[tokio::test]
    async fn test_empty_queue_issues_no_commands() {
        let player = Arc::new(ScriptedPlayer::new(playing(118_000, 120_000), vec![]));
        let outcome = controller(player.clone(), cues(vec![]))
            .run_iteration(&credential())
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::QueueEmpty);
        assert_eq!(player.calls().await, vec![Call::CurrentlyPlaying, Call::Queue]);
    }

    #[tokio::test]
    async fn test_command_errors_are_swallowed_and_seek_still_attempted() {
        let mut scripted = ScriptedPlayer::new(playing(118_000, 120_000), vec![track("x", 200_000)]);
        scripted.fail_commands = true;
        let player = Arc::new(scripted);

        let outcome = controller(player.clone(), cues(vec![("x", Some(750), None)]))
            .run_iteration(&credential())
            .await;

        assert!(matches!(outcome, Ok(IterationOutcome::Skipped { seek_to_ms: 750, .. })));
        assert_eq!(
            player.calls().await,
            vec![Call::CurrentlyPlaying, Call::Queue, Call::Skip, Call::Seek(750)]
        );
    }

    #[tokio::test]
    async fn test_queue_errors_propagate() {
        let mut scripted = ScriptedPlayer::new(playing(118_000, 120_000), vec![]);
        scripted.fail_queue = true;
        let player = Arc::new(scripted);

        let outcome = controller(player.clone(), cues(vec![]))
            .run_iteration(&credential())
            .await;

        assert!(matches!(outcome, Err(PlaybackError::Api(503, _))));
        assert!(!player.calls().await.contains(&Call::Skip));
    }
}
