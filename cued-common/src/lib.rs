//! # Cued Common Library
//!
//! Shared code for the Cued services:
//! - Error and result types
//! - Configuration loading (TOML, environment, defaults)
//! - Session lifecycle events (SessionEvent enum, EventBus)
//! - Database initialization
//! - Time helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
