//! Server-Sent Events stream of session lifecycle events

use async_stream::stream;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    /// Only forward events for this user
    pub user_id: Option<String>,
}

/// GET /events
///
/// Streams queued, started, skipped, credential-refreshed, ended and failed
/// events as they are emitted. `?user_id=` narrows the stream to one user.
pub async fn session_event_stream(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(user_id = ?filter.user_id, "SSE client connected to session events");

    let mut rx = state.event_bus.subscribe();

    let stream = stream! {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE: client lagged, events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if let Some(user_id) = filter.user_id.as_deref() {
                if event.user_id() != user_id {
                    continue;
                }
            }

            let event_type = event.event_type();
            match serde_json::to_string(&event) {
                Ok(json) => {
                    debug!("SSE: Broadcasting {}", event_type);
                    yield Ok(Event::default().event(event_type).data(json));
                }
                Err(e) => warn!("SSE: Failed to serialize event {}: {}", event_type, e),
            }
        }
        debug!("SSE: event bus closed, ending stream");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

/// Build event stream routes
pub fn event_routes() -> Router<AppState> {
    Router::new().route("/events", get(session_event_stream))
}
