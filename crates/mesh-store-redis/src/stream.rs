use async_trait::async_trait;
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::stream::{PendingMessage, Stream, StreamMessage};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

fn storage_err(e: redis::RedisError) -> MeshError {
    MeshError::StorageError(e.to_string())
}

/// Redis Streams-backed `Stream`. Consumer-group semantics map directly onto
/// `XGROUP CREATE`/`XREADGROUP`/`XACK`/`XAUTOCLAIM` — no translation layer,
/// unlike `mesh-store-sql`'s emulation.
#[derive(Clone)]
pub struct RedisStream {
    conn: ConnectionManager,
}

impl RedisStream {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Stream for RedisStream {
    async fn create_consumer_group(&self, stream: &str, group: &str) -> MeshResult<()> {
        let mut conn = self.conn();
        let res: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match res {
            Ok(()) => Ok(()),
            // BUSYGROUP: group already exists — treat as success.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn publish_message(&self, stream: &str, data: &StreamMessage) -> MeshResult<String> {
        let payload = serde_json::to_string(data).map_err(|e| MeshError::StorageError(e.to_string()))?;
        let mut conn = self.conn();
        let id: String = conn
            .xadd(stream, "*", &[("data", payload)])
            .await
            .map_err(storage_err)?;
        Ok(id)
    }

    async fn read_one(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> MeshResult<Option<(String, StreamMessage)>> {
        let mut conn = self.conn();
        let opts = StreamReadOptions::default().group(group, consumer).count(1);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(storage_err)?;
        for key in reply.keys {
            for id in key.ids {
                let Some(raw) = id.map.get("data") else { continue };
                let raw: String = redis::from_redis_value(raw).map_err(storage_err)?;
                let msg: StreamMessage =
                    serde_json::from_str(&raw).map_err(|e| MeshError::StorageError(e.to_string()))?;
                return Ok(Some((id.id, msg)));
            }
        }
        Ok(None)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str, delete: bool) -> MeshResult<()> {
        let mut conn = self.conn();
        let _: u64 = conn.xack(stream, group, &[id]).await.map_err(storage_err)?;
        if delete {
            let _: u64 = conn.xdel(stream, &[id]).await.map_err(storage_err)?;
        }
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> MeshResult<Vec<PendingMessage>> {
        let mut conn = self.conn();
        let reply: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(100)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingMessage {
                id: p.id,
                consumer: p.consumer,
                idle_ms: p.time_since_delivered as u64,
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
        let mut conn = self.conn();
        let reply: redis::streams::StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(reply.claimed.into_iter().map(|id| id.id).collect())
    }

    async fn xlen(&self, stream: &str) -> MeshResult<u64> {
        let mut conn = self.conn();
        let len: u64 = conn.xlen(stream).await.map_err(storage_err)?;
        Ok(len)
    }
}
