//! Spotify Web API playback client
//!
//! Endpoints used:
//! - `GET  /me/player/currently-playing` (204 when idle)
//! - `GET  /me/player/queue`
//! - `POST /me/player/next`
//! - `PUT  /me/player/seek?position_ms=`

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use super::{CurrentlyPlaying, ItemType, PlaybackControl, PlaybackError, TrackInfo};
use crate::credentials::Credential;

const USER_AGENT: &str = concat!("cued/", env!("CARGO_PKG_VERSION"));

/// Spotify Web API client
#[derive(Clone)]
pub struct SpotifyClient {
    http_client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SpotifyItem {
    uri: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    duration_ms: u64,
}

#[derive(Debug, Deserialize)]
struct SpotifyCurrentlyPlaying {
    #[serde(default)]
    progress_ms: Option<u64>,
    #[serde(default)]
    is_playing: bool,
    currently_playing_type: ItemType,
    #[serde(default)]
    item: Option<SpotifyItem>,
}

#[derive(Debug, Deserialize)]
struct SpotifyQueue {
    #[serde(default)]
    queue: Vec<SpotifyItem>,
}

impl From<SpotifyItem> for TrackInfo {
    fn from(item: SpotifyItem) -> Self {
        Self {
            track_id: item.uri,
            name: item.name,
            duration_ms: item.duration_ms,
        }
    }
}

impl From<SpotifyCurrentlyPlaying> for CurrentlyPlaying {
    fn from(raw: SpotifyCurrentlyPlaying) -> Self {
        Self {
            item_type: raw.currently_playing_type,
            is_playing: raw.is_playing,
            progress_ms: raw.progress_ms.unwrap_or(0),
            track: raw.item.map(TrackInfo::from),
        }
    }
}

pub(crate) fn parse_currently_playing(body: &str) -> Result<CurrentlyPlaying, PlaybackError> {
    serde_json::from_str::<SpotifyCurrentlyPlaying>(body)
        .map(CurrentlyPlaying::from)
        .map_err(|e| PlaybackError::Parse(e.to_string()))
}

pub(crate) fn parse_queue(body: &str) -> Result<Vec<TrackInfo>, PlaybackError> {
    serde_json::from_str::<SpotifyQueue>(body)
        .map(|q| q.queue.into_iter().map(TrackInfo::from).collect())
        .map_err(|e| PlaybackError::Parse(e.to_string()))
}

impl SpotifyClient {
    /// `request_timeout` bounds every call so a hung request stalls one
    /// iteration at most
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, PlaybackError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| PlaybackError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map non-success statuses to errors; returns the body for successes
    async fn read_body(response: reqwest::Response) -> Result<(StatusCode, String), PlaybackError> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(PlaybackError::Unauthorized);
        }

        let body = response
            .text()
            .await
            .map_err(|e| PlaybackError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(PlaybackError::Api(status.as_u16(), body));
        }

        Ok((status, body))
    }
}

#[async_trait]
impl PlaybackControl for SpotifyClient {
    async fn currently_playing(
        &self,
        credential: &Credential,
    ) -> Result<Option<CurrentlyPlaying>, PlaybackError> {
        let response = self
            .http_client
            .get(self.url("/me/player/currently-playing"))
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(|e| PlaybackError::Network(e.to_string()))?;

        let (status, body) = Self::read_body(response).await?;
        if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
            return Ok(None);
        }

        parse_currently_playing(&body).map(Some)
    }

    async fn queue(&self, credential: &Credential) -> Result<Vec<TrackInfo>, PlaybackError> {
        let response = self
            .http_client
            .get(self.url("/me/player/queue"))
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(|e| PlaybackError::Network(e.to_string()))?;

        let (_, body) = Self::read_body(response).await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }

        parse_queue(&body)
    }

    async fn skip_to_next(&self, credential: &Credential) -> Result<(), PlaybackError> {
        let response = self
            .http_client
            .post(self.url("/me/player/next"))
            .bearer_auth(&credential.access_token)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .await
            .map_err(|e| PlaybackError::Network(e.to_string()))?;

        Self::read_body(response).await.map(|_| ())
    }

    async fn seek(&self, credential: &Credential, position_ms: u64) -> Result<(), PlaybackError> {
        let response = self
            .http_client
            .put(self.url("/me/player/seek"))
            .query(&[("position_ms", position_ms)])
            .bearer_auth(&credential.access_token)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .await
            .map_err(|e| PlaybackError::Network(e.to_string()))?;

        Self::read_body(response).await.map(|_| ())
    }
}
