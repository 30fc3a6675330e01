use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sqlx::{PgPool, Row};

use crate::engine::{Fragment, FragmentStore, PartTally, StoreError};

/// Postgres-backed fragment store. Conditional creates map onto
/// `INSERT .. ON CONFLICT DO NOTHING`; the row count tells the caller whether
/// this write created the record.
#[derive(Clone)]
pub struct Repo {
    pool: PgPool,
}

impl Repo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Offset of the last record whose submission settled, 0 before any.
    pub async fn stream_checkpoint(&self, stream_id: &str) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT committed_offset FROM stream_checkpoints WHERE stream_id=$1")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| row.get::<i64, _>("committed_offset"))
            .unwrap_or(0))
    }

    /// Advances the checkpoint; never moves it backwards.
    pub async fn commit_stream_checkpoint(
        &self,
        stream_id: &str,
        offset: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO stream_checkpoints (stream_id, committed_offset, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (stream_id) DO UPDATE
            SET committed_offset = GREATEST(stream_checkpoints.committed_offset, EXCLUDED.committed_offset),
                updated_at = EXCLUDED.updated_at"#,
        )
        .bind(stream_id)
        .bind(offset)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn unavailable(op: &str, err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(format!("{op} failed: {err}"))
}

#[async_trait]
impl FragmentStore for Repo {
    async fn try_put_part(&self, fragment: &Fragment) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO message_parts (message_id, part_index, total_parts, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (message_id, part_index) DO NOTHING"#,
        )
        .bind(&fragment.message_id)
        .bind(fragment.part_index as i32)
        .bind(fragment.total_parts as i32)
        .bind(&fragment.payload[..])
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|err| unavailable("part insert", err))?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_parts(&self, message_id: &str) -> Result<Option<PartTally>, StoreError> {
        let row = sqlx::query(
            r#"SELECT COUNT(*) AS stored, MIN(total_parts) AS total_min, MAX(total_parts) AS total_max
            FROM message_parts WHERE message_id=$1"#,
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| unavailable("part count", err))?;

        let total_min: Option<i32> = row.get("total_min");
        let total_max: Option<i32> = row.get("total_max");
        let stored: i64 = row.get("stored");
        match (total_min, total_max) {
            (Some(total_min), Some(total_max)) => Ok(Some(PartTally {
                stored: stored.max(0) as u64,
                total_parts_min: total_min.max(0) as u32,
                total_parts_max: total_max.max(0) as u32,
            })),
            _ => Ok(None),
        }
    }

    async fn get_all_parts(
        &self,
        message_id: &str,
        total_parts: u32,
    ) -> Result<Vec<Bytes>, StoreError> {
        let rows = sqlx::query(
            "SELECT part_index, payload FROM message_parts WHERE message_id=$1 ORDER BY part_index",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| unavailable("part read", err))?;

        let mut parts = Vec::with_capacity(total_parts as usize);
        for row in rows {
            let index: i32 = row.get("part_index");
            if index != parts.len() as i32 {
                return Err(StoreError::MissingPart {
                    message_id: message_id.to_string(),
                    part_index: parts.len() as u32,
                });
            }
            let payload: Vec<u8> = row.get("payload");
            parts.push(Bytes::from(payload));
        }
        if parts.len() < total_parts as usize {
            return Err(StoreError::MissingPart {
                message_id: message_id.to_string(),
                part_index: parts.len() as u32,
            });
        }
        Ok(parts)
    }

    async fn try_mark_complete(&self, message_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO message_completions (message_id, completed, completed_at)
            VALUES ($1, TRUE, $2)
            ON CONFLICT (message_id) DO NOTHING"#,
        )
        .bind(message_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|err| unavailable("completion insert", err))?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_complete(&self, message_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM message_completions WHERE message_id=$1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|err| unavailable("completion delete", err))?;
        Ok(())
    }

    async fn is_complete(&self, message_id: &str) -> Result<bool, StoreError> {
        let row =
            sqlx::query("SELECT EXISTS(SELECT 1 FROM message_completions WHERE message_id=$1) AS done")
                .bind(message_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|err| unavailable("completion check", err))?;
        Ok(row.get::<bool, _>("done"))
    }

    async fn open_messages(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"SELECT COUNT(DISTINCT p.message_id) AS open
            FROM message_parts p
            LEFT JOIN message_completions c ON c.message_id = p.message_id
            WHERE c.message_id IS NULL"#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|err| unavailable("open message count", err))?;
        Ok(row.get::<i64, _>("open").max(0) as u64)
    }
}
