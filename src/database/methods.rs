use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Acquire, Postgres};
use tracing::instrument;

use super::types::{AnchorEntry, MetadataEntry, RequestEntry, RequestStatus};
use super::Error;
use crate::metadata::GenesisFields;

/// Composable single queries. Each method acquires from `self`, so they can
/// run against the pool directly or inside a caller-owned transaction.
#[async_trait]
pub trait DbMethods<'c>: Acquire<'c, Database = Postgres> + Sized + Send {
    /// Newest non-terminal request for the pair; this is the row intake
    /// returns instead of inserting a duplicate.
    #[instrument(skip(self), level = "debug")]
    async fn get_active_request(
        self,
        stream_id: &str,
        cid: &str,
    ) -> Result<Option<RequestEntry>, Error> {
        let mut conn = self.acquire().await?;

        let entry = sqlx::query_as::<_, RequestEntry>(
            r#"
            SELECT * FROM requests
            WHERE  stream_id = $1
            AND    cid = $2
            AND    status = ANY($3)
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(stream_id)
        .bind(cid)
        .bind(vec!["PENDING", "READY", "PROCESSING"])
        .fetch_optional(&mut *conn)
        .await?;

        Ok(entry)
    }

    #[instrument(skip(self), level = "debug")]
    async fn insert_request(
        self,
        stream_id: &str,
        cid: &str,
        timestamp: Option<DateTime<Utc>>,
        origin: Option<&str>,
    ) -> Result<RequestEntry, Error> {
        let mut conn = self.acquire().await?;

        let entry = sqlx::query_as::<_, RequestEntry>(
            r#"
            INSERT INTO requests (stream_id, cid, status, timestamp, origin)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(stream_id)
        .bind(cid)
        .bind(<&str>::from(RequestStatus::Pending))
        .bind(timestamp)
        .bind(origin)
        .fetch_one(&mut *conn)
        .await?;

        Ok(entry)
    }

    /// Newest request carrying this commit CID, regardless of stream.
    async fn get_request_by_cid(self, cid: &str) -> Result<Option<RequestEntry>, Error> {
        let mut conn = self.acquire().await?;

        let entry = sqlx::query_as::<_, RequestEntry>(
            r#"
            SELECT * FROM requests
            WHERE  cid = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(cid)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(entry)
    }

    async fn get_request(self, id: i64) -> Result<Option<RequestEntry>, Error> {
        let mut conn = self.acquire().await?;

        let entry = sqlx::query_as::<_, RequestEntry>("SELECT * FROM requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(entry)
    }

    async fn count_batchable_requests(self) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM requests WHERE status = ANY($1)
            "#,
        )
        .bind(vec!["PENDING", "READY"])
        .fetch_one(&mut *conn)
        .await?;

        Ok(count.0)
    }

    async fn oldest_pending_created_at(self) -> Result<Option<DateTime<Utc>>, Error> {
        let mut conn = self.acquire().await?;

        let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
            r#"
            SELECT MIN(created_at) FROM requests WHERE status = $1
            "#,
        )
        .bind(<&str>::from(RequestStatus::Pending))
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.0)
    }

    /// Atomically transitions up to `max_size` PENDING/READY requests to
    /// READY tagged with this worker, oldest first. Idempotent: re-selecting
    /// READY rows just re-tags them.
    #[instrument(skip(self), level = "debug")]
    async fn select_ready_batch(
        self,
        max_size: i64,
        scheduler_id: &str,
    ) -> Result<Vec<RequestEntry>, Error> {
        let mut conn = self.acquire().await?;

        let mut batch = sqlx::query_as::<_, RequestEntry>(
            r#"
            UPDATE requests
            SET    status = $1, scheduler_id = $2, updated_at = CURRENT_TIMESTAMP
            WHERE  id IN (
                SELECT id FROM requests
                WHERE  status = ANY($3)
                ORDER BY created_at ASC, id ASC
                LIMIT $4
            )
            RETURNING *
            "#,
        )
        .bind(<&str>::from(RequestStatus::Ready))
        .bind(scheduler_id)
        .bind(vec!["PENDING", "READY"])
        .bind(max_size)
        .fetch_all(&mut *conn)
        .await?;

        // RETURNING gives no ordering guarantee.
        batch.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        Ok(batch)
    }

    #[instrument(skip(self), level = "debug")]
    async fn mark_processing(self, ids: &[i64], scheduler_id: &str) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE requests
            SET    status = $2, scheduler_id = $3, updated_at = CURRENT_TIMESTAMP
            WHERE  id = ANY($1)
            "#,
        )
        .bind(ids.to_vec())
        .bind(<&str>::from(RequestStatus::Processing))
        .bind(scheduler_id)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), level = "debug")]
    async fn update_request_statuses(
        self,
        ids: &[i64],
        status: RequestStatus,
        message: Option<&str>,
    ) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE requests
            SET    status = $2,
                   message = COALESCE($3, message),
                   updated_at = CURRENT_TIMESTAMP
            WHERE  id = ANY($1)
            "#,
        )
        .bind(ids.to_vec())
        .bind(<&str>::from(status))
        .bind(message)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Returns READY/PROCESSING rows that a dead or aborted worker left
    /// behind to PENDING, clearing the worker tag.
    async fn reset_stale_requests(self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE requests
            SET    status = $1, scheduler_id = NULL, updated_at = CURRENT_TIMESTAMP
            WHERE  status = ANY($2)
            AND    updated_at < $3
            "#,
        )
        .bind(<&str>::from(RequestStatus::Pending))
        .bind(vec!["READY", "PROCESSING"])
        .bind(cutoff)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    async fn expire_requests(self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE requests
            SET    status = $1, message = 'request expired', updated_at = CURRENT_TIMESTAMP
            WHERE  status = $2
            AND    created_at < $3
            "#,
        )
        .bind(<&str>::from(RequestStatus::Failed))
        .bind(<&str>::from(RequestStatus::Pending))
        .bind(cutoff)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), level = "debug")]
    async fn insert_anchor(
        self,
        request_id: i64,
        path: &str,
        cid: &str,
        proof_cid: &str,
    ) -> Result<AnchorEntry, Error> {
        let mut conn = self.acquire().await?;

        let entry = sqlx::query_as::<_, AnchorEntry>(
            r#"
            INSERT INTO anchors (request_id, path, cid, proof_cid)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(request_id)
        .bind(path)
        .bind(cid)
        .bind(proof_cid)
        .fetch_one(&mut *conn)
        .await?;

        Ok(entry)
    }

    async fn get_anchor_for_request(self, request_id: i64) -> Result<Option<AnchorEntry>, Error> {
        let mut conn = self.acquire().await?;

        let entry =
            sqlx::query_as::<_, AnchorEntry>("SELECT * FROM anchors WHERE request_id = $1")
                .bind(request_id)
                .fetch_optional(&mut *conn)
                .await?;

        Ok(entry)
    }

    async fn get_metadata(self, stream_id: &str) -> Result<Option<MetadataEntry>, Error> {
        let mut conn = self.acquire().await?;

        let entry =
            sqlx::query_as::<_, MetadataEntry>("SELECT * FROM metadata WHERE stream_id = $1")
                .bind(stream_id)
                .fetch_optional(&mut *conn)
                .await?;

        Ok(entry)
    }

    async fn put_metadata(self, stream_id: &str, fields: &GenesisFields) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO metadata (stream_id, metadata)
            VALUES ($1, $2)
            ON CONFLICT (stream_id)
            DO UPDATE SET metadata = EXCLUDED.metadata,
                          updated_at = CURRENT_TIMESTAMP,
                          used_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(stream_id)
        .bind(Json(fields))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Advances `used_at` for every stream a batch referenced.
    async fn touch_metadata(self, stream_ids: &[String]) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE metadata SET used_at = CURRENT_TIMESTAMP WHERE stream_id = ANY($1)
            "#,
        )
        .bind(stream_ids.to_vec())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn evict_metadata(self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query("DELETE FROM metadata WHERE used_at < $1")
            .bind(cutoff)
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected())
    }

    async fn count_requests_by_status(self, status: RequestStatus) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM requests WHERE status = $1")
            .bind(<&str>::from(status))
            .fetch_one(&mut *conn)
            .await?;

        Ok(count.0)
    }
}

impl<'c, T> DbMethods<'c> for T where T: Acquire<'c, Database = Postgres> + Sized + Send {}
