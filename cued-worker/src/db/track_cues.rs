//! Cue preference storage

use async_trait::async_trait;
use cued_common::{Error, Result};
use sqlx::{Row, SqlitePool};

use crate::cues::{CuePreference, PreferenceStore};
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

pub struct SqliteCueStore {
    pool: SqlitePool,
}

impl SqliteCueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a user's cue points for a track
    pub async fn set_cue(&self, cue: &CuePreference) -> Result<()> {
        let start = cue.preferred_start_ms.map(|v| v as i64);
        let end = cue.preferred_end_ms.map(|v| v as i64);

        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Err(Error::InvalidInput(format!(
                    "Cue start {} must precede end {}",
                    s, e
                )));
            }
        }

        retry_on_lock("set_track_cue", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            sqlx::query(
                r#"
                INSERT INTO track_cues (user_id, track_id, preferred_start_ms, preferred_end_ms, updated_at)
                VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(user_id, track_id) DO UPDATE SET
                    preferred_start_ms = excluded.preferred_start_ms,
                    preferred_end_ms = excluded.preferred_end_ms,
                    updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(&cue.user_id)
            .bind(&cue.track_id)
            .bind(start)
            .bind(end)
            .execute(&self.pool)
            .await
            .map_err(Error::from)
        })
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for SqliteCueStore {
    async fn find(&self, user_id: &str, track_id: &str) -> Result<Option<CuePreference>> {
        let row = sqlx::query(
            r#"
            SELECT preferred_start_ms, preferred_end_ms
            FROM track_cues
            WHERE user_id = ? AND track_id = ?
            "#,
        )
        .bind(user_id)
        .bind(track_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let start: Option<i64> = row.get("preferred_start_ms");
            let end: Option<i64> = row.get("preferred_end_ms");
            CuePreference {
                user_id: user_id.to_string(),
                track_id: track_id.to_string(),
                preferred_start_ms: start.map(|v| v.max(0) as u64),
                preferred_end_ms: end.map(|v| v.max(0) as u64),
            }
        }))
    }
}
