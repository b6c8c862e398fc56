//! cued-worker library interface
//!
//! The continuity engine (credentials, cues, controller, scheduler,
//! registry), its SQLite stores and Spotify client, and the HTTP surface.

pub mod api;
pub mod controller;
pub mod credentials;
pub mod cues;
pub mod db;
pub mod error;
pub mod playback;
pub mod registry;
pub mod scheduler;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use cued_common::events::EventBus;
use tower_http::trace::TraceLayer;

use crate::registry::SessionRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    /// Source of the `/events` SSE stream
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(registry: SessionRegistry, event_bus: EventBus) -> Self {
        Self {
            registry,
            event_bus,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::session_routes())
        .merge(api::event_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
