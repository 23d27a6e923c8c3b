use async_trait::async_trait;
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::stream::{PendingMessage, Stream, StreamMessage};
use sqlx::{PgPool, Row};

fn storage_err(e: sqlx::Error) -> MeshError {
    MeshError::StorageError(e.to_string())
}

/// Append-only log emulation of Redis Streams, backed by
/// `mesh_stream`/`mesh_stream_group`/`mesh_stream_pending`. A consumer
/// group's position is one `last_delivered` cursor; claiming is an ordinary
/// row scan against `delivered_at` rather than `XAUTOCLAIM`.
#[derive(Clone)]
pub struct SqlStream {
    pool: PgPool,
}

impl SqlStream {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Stream for SqlStream {
    async fn create_consumer_group(&self, stream: &str, group: &str) -> MeshResult<()> {
        sqlx::query(
            "INSERT INTO mesh_stream_group (stream, grp, last_delivered) VALUES ($1, $2, 0)
             ON CONFLICT (stream, grp) DO NOTHING",
        )
        .bind(stream)
        .bind(group)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn publish_message(&self, stream: &str, data: &StreamMessage) -> MeshResult<String> {
        let payload = serde_json::to_string(data).map_err(|e| MeshError::StorageError(e.to_string()))?;
        let row = sqlx::query("INSERT INTO mesh_stream (stream, payload) VALUES ($1, $2) RETURNING id")
            .bind(stream)
            .bind(payload)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let id: i64 = row.get("id");
        Ok(id.to_string())
    }

    async fn read_one(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> MeshResult<Option<(String, StreamMessage)>> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let cursor: i64 = sqlx::query("SELECT last_delivered FROM mesh_stream_group WHERE stream = $1 AND grp = $2")
            .bind(stream)
            .bind(group)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
            .map(|r| r.get("last_delivered"))
            .unwrap_or(0);

        let row = sqlx::query(
            "SELECT id, payload FROM mesh_stream WHERE stream = $1 AND id > $2 ORDER BY id ASC LIMIT 1",
        )
        .bind(stream)
        .bind(cursor)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            tx.commit().await.map_err(storage_err)?;
            return Ok(None);
        };
        let id: i64 = row.get("id");
        let payload: String = row.get("payload");

        sqlx::query("UPDATE mesh_stream_group SET last_delivered = $3 WHERE stream = $1 AND grp = $2")
            .bind(stream)
            .bind(group)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        sqlx::query(
            "INSERT INTO mesh_stream_pending (stream, grp, id, consumer) VALUES ($1, $2, $3, $4)
             ON CONFLICT (stream, grp, id) DO UPDATE SET consumer = EXCLUDED.consumer, delivered_at = now()",
        )
        .bind(stream)
        .bind(group)
        .bind(id)
        .bind(consumer)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        let msg: StreamMessage =
            serde_json::from_str(&payload).map_err(|e| MeshError::StorageError(e.to_string()))?;
        Ok(Some((id.to_string(), msg)))
    }

    async fn ack(&self, stream: &str, group: &str, id: &str, delete: bool) -> MeshResult<()> {
        let id: i64 = id.parse().map_err(|_| MeshError::StorageError(format!("bad message id {id}")))?;
        sqlx::query("DELETE FROM mesh_stream_pending WHERE stream = $1 AND grp = $2 AND id = $3")
            .bind(stream)
            .bind(group)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if delete {
            sqlx::query("DELETE FROM mesh_stream WHERE stream = $1 AND id = $2")
                .bind(stream)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> MeshResult<Vec<PendingMessage>> {
        let rows = sqlx::query(
            "SELECT id, consumer, EXTRACT(EPOCH FROM (now() - delivered_at)) * 1000 AS idle_ms
             FROM mesh_stream_pending WHERE stream = $1 AND grp = $2",
        )
        .bind(stream)
        .bind(group)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let id: i64 = r.get("id");
                let idle_ms: f64 = r.get("idle_ms");
                PendingMessage {
                    id: id.to_string(),
                    consumer: r.get("consumer"),
                    idle_ms: idle_ms.max(0.0) as u64,
                }
            })
            .collect())
    }

    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> MeshResult<Vec<String>> {
        let rows = sqlx::query(
            "UPDATE mesh_stream_pending SET consumer = $4, delivered_at = now()
             WHERE stream = $1 AND grp = $2
               AND EXTRACT(EPOCH FROM (now() - delivered_at)) * 1000 >= $3
             RETURNING id",
        )
        .bind(stream)
        .bind(group)
        .bind(min_idle_ms as f64)
        .bind(consumer)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows
            .into_iter()
            .map(|r| r.get::<i64, _>("id").to_string())
            .collect())
    }

    async fn xlen(&self, stream: &str) -> MeshResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM mesh_stream WHERE stream = $1")
            .bind(stream)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }
}
