//! Session lifecycle events
//!
//! Events are broadcast via [`EventBus`] and serialized for observers such
//! as the worker's SSE stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Why a session stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// All runs used up
    Exhausted,
    /// Stopped through the registry
    Cancelled,
    /// Unrecoverable error
    Failed,
}

/// Cued event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// Session accepted by the registry and queued for a worker
    SessionQueued {
        user_id: String,
        job_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A worker started the session's scheduler
    SessionStarted {
        user_id: String,
        job_id: Uuid,
        total_runs: u32,
        timestamp: DateTime<Utc>,
    },

    /// The controller skipped to the next track and sought to its cue start
    SessionSkipped {
        user_id: String,
        job_id: Uuid,
        next_track_id: String,
        seek_to_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Credential refreshed after expiry or a remote failure
    CredentialRefreshed {
        user_id: String,
        expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// Session finished without error
    SessionEnded {
        user_id: String,
        job_id: Uuid,
        reason: EndReason,
        runs_completed: u32,
        timestamp: DateTime<Utc>,
    },

    /// Session terminated by an unrecoverable error
    SessionFailed {
        user_id: String,
        job_id: Uuid,
        error: String,
        runs_completed: u32,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::SessionQueued { .. } => "session_queued",
            SessionEvent::SessionStarted { .. } => "session_started",
            SessionEvent::SessionSkipped { .. } => "session_skipped",
            SessionEvent::CredentialRefreshed { .. } => "credential_refreshed",
            SessionEvent::SessionEnded { .. } => "session_ended",
            SessionEvent::SessionFailed { .. } => "session_failed",
        }
    }

    /// User the event belongs to
    pub fn user_id(&self) -> &str {
        match self {
            SessionEvent::SessionQueued { user_id, .. }
            | SessionEvent::SessionStarted { user_id, .. }
            | SessionEvent::SessionSkipped { user_id, .. }
            | SessionEvent::CredentialRefreshed { user_id, .. }
            | SessionEvent::SessionEnded { user_id, .. }
            | SessionEvent::SessionFailed { user_id, .. } => user_id,
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: SessionEvent,
    ) -> Result<usize, broadcast::error::SendError<SessionEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        let job_id = Uuid::new_v4();
        bus.emit(SessionEvent::SessionQueued {
            user_id: "user-1".to_string(),
            job_id,
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            SessionEvent::SessionQueued { user_id, job_id: got, .. } => {
                assert_eq!(user_id, "user-1");
                assert_eq!(got, job_id);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_errors_but_lossy_does_not() {
        let bus = EventBus::new(10);
        let event = SessionEvent::SessionEnded {
            user_id: "user-1".to_string(),
            job_id: Uuid::new_v4(),
            reason: EndReason::Exhausted,
            runs_completed: 3,
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 10);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SessionEvent::SessionFailed {
            user_id: "user-9".to_string(),
            job_id: Uuid::nil(),
            error: "refresh cooldown active".to_string(),
            runs_completed: 12,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SessionFailed");
        assert_eq!(json["user_id"], "user-9");
        assert_eq!(event.user_id(), "user-9");
        assert_eq!(event.event_type(), "session_failed");
    }
}
