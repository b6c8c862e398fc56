//! Database initialization
//!
//! Creates the database on first run and the Cued tables idempotently on
//! every start.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL lets the API read while the schedulers write
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    sqlx::query("PRAGMA busy_timeout = 250")
        .execute(&pool)
        .await?;

    create_tables(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema
///
/// Each SQLite `:memory:` connection is its own database, so the pool is
/// pinned to one connection that never expires.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    create_tables(&pool).await?;
    Ok(pool)
}

/// Create all Cued tables (idempotent)
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    create_accounts_table(pool).await?;
    create_track_cues_table(pool).await?;
    create_session_jobs_table(pool).await?;
    Ok(())
}

/// Linked provider accounts holding the bearer credential
pub async fn create_accounts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            account_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            access_token_expires_at TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (user_id, provider_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-user cue points; either bound may be absent
pub async fn create_track_cues_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS track_cues (
            user_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            preferred_start_ms INTEGER,
            preferred_end_ms INTEGER,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (user_id, track_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Durable session queue, one row per user
pub async fn create_session_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_jobs (
            user_id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            owner TEXT NOT NULL,
            state TEXT NOT NULL,
            poll_interval_ms INTEGER NOT NULL,
            total_runs INTEGER NOT NULL,
            enqueued_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
