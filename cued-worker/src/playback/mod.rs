//! Remote playback-control surface
//!
//! The core only talks to [`PlaybackControl`]; `spotify` provides the
//! Spotify Web API implementation.

pub mod spotify;

pub use spotify::SpotifyClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::Credential;

/// Playback API errors
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Network error: {0}")]
    Network(String),

    /// Bearer credential rejected (expired or revoked)
    #[error("Unauthorized")]
    Unauthorized,

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Kind of item the remote player is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Track,
    Episode,
    Ad,
    #[serde(other)]
    Unknown,
}

/// Track metadata needed for cue resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Playback URI, e.g. `spotify:track:4cOdK2wGLETKBW3PvgPWqT`
    pub track_id: String,
    pub name: String,
    pub duration_ms: u64,
}

/// Response of the currently-playing query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentlyPlaying {
    pub item_type: ItemType,
    pub is_playing: bool,
    pub progress_ms: u64,
    /// Absent for ads and some private sessions
    pub track: Option<TrackInfo>,
}

/// One poll's view of the player; never reused across iterations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub track: TrackInfo,
    pub progress_ms: u64,
    pub is_playing: bool,
    pub queue_head: Option<TrackInfo>,
}

impl PlaybackSnapshot {
    /// Snapshot of a playing track, or `None` when there is nothing to act on
    pub fn from_current(current: CurrentlyPlaying) -> Option<Self> {
        if !current.is_playing || current.item_type != ItemType::Track {
            return None;
        }
        current.track.map(|track| Self {
            track,
            progress_ms: current.progress_ms,
            is_playing: current.is_playing,
            queue_head: None,
        })
    }
}

/// Command/query capability over a user's remote player
#[async_trait]
pub trait PlaybackControl: Send + Sync {
    /// `None` when nothing is playing
    async fn currently_playing(
        &self,
        credential: &Credential,
    ) -> Result<Option<CurrentlyPlaying>, PlaybackError>;

    /// Upcoming tracks, next first
    async fn queue(&self, credential: &Credential) -> Result<Vec<TrackInfo>, PlaybackError>;

    async fn skip_to_next(&self, credential: &Credential) -> Result<(), PlaybackError>;

    async fn seek(&self, credential: &Credential, position_ms: u64) -> Result<(), PlaybackError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> TrackInfo {
        TrackInfo {
            track_id: "spotify:track:a".to_string(),
            name: "A".to_string(),
            duration_ms: 180_000,
        }
    }

    #[test]
    fn test_snapshot_requires_playing_track() {
        let playing = CurrentlyPlaying {
            item_type: ItemType::Track,
            is_playing: true,
            progress_ms: 1000,
            track: Some(track()),
        };
        let snapshot = PlaybackSnapshot::from_current(playing.clone()).unwrap();
        assert_eq!(snapshot.progress_ms, 1000);
        assert!(snapshot.queue_head.is_none());

        let paused = CurrentlyPlaying {
            is_playing: false,
            ..playing.clone()
        };
        assert!(PlaybackSnapshot::from_current(paused).is_none());

        let episode = CurrentlyPlaying {
            item_type: ItemType::Episode,
            ..playing.clone()
        };
        assert!(PlaybackSnapshot::from_current(episode).is_none());

        let ad = CurrentlyPlaying {
            item_type: ItemType::Track,
            track: None,
            ..playing
        };
        assert!(PlaybackSnapshot::from_current(ad).is_none());
    }

    #[test]
    fn test_item_type_unknown_fallback() {
        let parsed: ItemType = serde_json::from_str("\"audiobook\"").unwrap();
        assert_eq!(parsed, ItemType::Unknown);
        let parsed: ItemType = serde_json::from_str("\"track\"").unwrap();
        assert_eq!(parsed, ItemType::Track);
    }
}
