//! SQLite stores for cued-worker
//!
//! Schema creation lives in `cued_common::db`; this module holds the
//! implementations of the collaborator traits.

pub mod accounts;
pub mod jobs;
pub mod track_cues;

pub use accounts::{SqliteCredentialStore, SPOTIFY_PROVIDER};
pub use jobs::SqliteJobQueue;
pub use track_cues::SqliteCueStore;
