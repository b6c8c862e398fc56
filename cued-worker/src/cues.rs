//! Cue resolution
//!
//! Maps (user, track) to the preferred playback window. Missing preferences
//! and store outages both resolve to the full track.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// A user's stored cue points for one track; either bound may be unset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuePreference {
    pub user_id: String,
    pub track_id: String,
    pub preferred_start_ms: Option<u64>,
    pub preferred_end_ms: Option<u64>,
}

/// Resolved playback window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CueWindow {
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Read-only lookup of stored cue preferences
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn find(&self, user_id: &str, track_id: &str) -> cued_common::Result<Option<CuePreference>>;
}

#[derive(Clone)]
pub struct CueResolver {
    store: Arc<dyn PreferenceStore>,
}

impl CueResolver {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, user_id: &str, track_id: &str, fallback_duration_ms: u64) -> CueWindow {
        let preference = match self.store.find(user_id, track_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    track_id = %track_id,
                    error = %e,
                    "Cue lookup failed, using full track"
                );
                None
            }
        };

        match preference {
            Some(p) => CueWindow {
                start_ms: p.preferred_start_ms.unwrap_or(0),
                end_ms: p.preferred_end_ms.unwrap_or(fallback_duration_ms),
            },
            None => CueWindow {
                start_ms: 0,
                end_ms: fallback_duration_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedStore {
        cues: HashMap<(String, String), CuePreference>,
        lookups: AtomicUsize,
    }

    impl FixedStore {
        fn new(cues: Vec<CuePreference>) -> Self {
            Self {
                cues: cues
                    .into_iter()
                    .map(|c| ((c.user_id.clone(), c.track_id.clone()), c))
                    .collect(),
                lookups: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PreferenceStore for FixedStore {
        async fn find(&self, user_id: &str, track_id: &str) -> cued_common::Result<Option<CuePreference>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.cues.get(&(user_id.to_string(), track_id.to_string())).cloned())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl PreferenceStore for BrokenStore {
        async fn find(&self, _: &str, _: &str) -> cued_common::Result<Option<CuePreference>> {
            Err(cued_common::Error::Internal("store offline".to_string()))
        }
    }

    fn cue(user: &str, track: &str, start: Option<u64>, end: Option<u64>) -> CuePreference {
        CuePreference {
            user_id: user.to_string(),
            track_id: track.to_string(),
            preferred_start_ms: start,
            preferred_end_ms: end,
        }
    }

    #[tokio::test]
    async fn test_stored_preference_wins() {
        let resolver = CueResolver::new(Arc::new(FixedStore::new(vec![cue(
            "u1",
            "spotify:track:x",
            Some(15_000),
            Some(90_000),
        )])));

        let window = resolver.resolve("u1", "spotify:track:x", 200_000).await;
        assert_eq!(window, CueWindow { start_ms: 15_000, end_ms: 90_000 });
    }

    #[tokio::test]
    async fn test_missing_preference_is_full_track_and_repeatable() {
        let store = Arc::new(FixedStore::new(vec![]));
        let resolver = CueResolver::new(store.clone());

        let first = resolver.resolve("u1", "spotify:track:x", 200_000).await;
        let second = resolver.resolve("u1", "spotify:track:x", 200_000).await;

        assert_eq!(first, CueWindow { start_ms: 0, end_ms: 200_000 });
        assert_eq!(first, second);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
        assert!(store.cues.is_empty(), "resolution never writes");
    }

    #[tokio::test]
    async fn test_preference_is_per_user() {
        let resolver = CueResolver::new(Arc::new(FixedStore::new(vec![cue(
            "u1",
            "spotify:track:x",
            Some(15_000),
            None,
        )])));

        let other = resolver.resolve("u2", "spotify:track:x", 200_000).await;
        assert_eq!(other, CueWindow { start_ms: 0, end_ms: 200_000 });
    }

    #[tokio::test]
    async fn test_partial_preference_falls_back_per_field() {
        let resolver = CueResolver::new(Arc::new(FixedStore::new(vec![
            cue("u1", "start-only", Some(5_000), None),
            cue("u1", "end-only", None, Some(60_000)),
        ])));

        assert_eq!(
            resolver.resolve("u1", "start-only", 100_000).await,
            CueWindow { start_ms: 5_000, end_ms: 100_000 }
        );
        assert_eq!(
            resolver.resolve("u1", "end-only", 100_000).await,
            CueWindow { start_ms: 0, end_ms: 60_000 }
        );
    }

    #[tokio::test]
    async fn test_store_outage_is_treated_as_no_preference() {
        let resolver = CueResolver::new(Arc::new(BrokenStore));
        let window = resolver.resolve("u1", "spotify:track:x", 180_000).await;
        assert_eq!(window, CueWindow { start_ms: 0, end_ms: 180_000 });
    }
}
