//! HTTP API handlers for cued-worker

pub mod events;
pub mod health;
pub mod sessions;

pub use events::event_routes;
pub use health::health_routes;
pub use sessions::session_routes;
