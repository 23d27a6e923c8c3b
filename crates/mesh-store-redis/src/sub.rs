use async_trait::async_trait;
use futures_util::StreamExt;
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::sub::{Sub, SubCallback, SubscriptionId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

fn storage_err(e: redis::RedisError) -> MeshError {
    MeshError::StorageError(e.to_string())
}

fn channel(kind: &str, app_id: &str, subtopic: Option<&str>) -> String {
    match subtopic {
        Some(t) => format!("hmsh:{app_id}:{kind}:{t}"),
        None => format!("hmsh:{app_id}:{kind}"),
    }
}

/// Redis pub/sub backed `Sub`. `publish` uses the shared `ConnectionManager`;
/// each `subscribe`/`psubscribe` opens its own dedicated pub/sub connection
/// (Redis multiplexes subscriber connections separately from command
/// connections) and spawns a task that forwards deliveries to the callback
/// until `unsubscribe` aborts it.
#[derive(Clone)]
pub struct RedisSub {
    conn: ConnectionManager,
    client: redis::Client,
    next_id: Arc<AtomicU64>,
    handles: Arc<std::sync::Mutex<std::collections::HashMap<SubscriptionId, JoinHandle<()>>>>,
}

impl RedisSub {
    pub fn new(conn: ConnectionManager, client: redis::Client) -> Self {
        Self {
            conn,
            client,
            next_id: Arc::new(AtomicU64::new(1)),
            handles: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
        }
    }

    fn alloc_id(&self) -> SubscriptionId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn spawn_listener(&self, channel_or_pattern: String, glob: bool, callback: SubCallback) -> SubscriptionId {
        let client = self.client.clone();
        let id = self.alloc_id();
        let handle = tokio::spawn(async move {
            let Ok(mut pubsub) = client.get_async_pubsub().await else {
                return;
            };
            let subscribed = if glob {
                pubsub.psubscribe(&channel_or_pattern).await
            } else {
                pubsub.subscribe(&channel_or_pattern).await
            };
            if subscribed.is_err() {
                return;
            }
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                if let Ok(raw) = msg.get_payload::<String>() {
                    if let Ok(v) = serde_json::from_str(&raw) {
                        callback(v);
                    }
                }
            }
        });
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handle);
        id
    }
}

#[async_trait]
impl Sub for RedisSub {
    async fn publish(
        &self,
        kind: &str,
        payload: &serde_json::Value,
        app_id: &str,
        subtopic: Option<&str>,
    ) -> MeshResult<()> {
        let ch = channel(kind, app_id, subtopic);
        let body = payload.to_string();
        let mut conn = self.conn.clone();
        let _: u64 = conn.publish(&ch, body).await.map_err(storage_err)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        kind: &str,
        app_id: &str,
        subtopic: Option<&str>,
        callback: SubCallback,
    ) -> MeshResult<SubscriptionId> {
        let ch = channel(kind, app_id, subtopic);
        Ok(self.spawn_listener(ch, false, callback))
    }

    async fn psubscribe(
        &self,
        kind: &str,
        app_id: &str,
        pattern: &str,
        callback: SubCallback,
    ) -> MeshResult<SubscriptionId> {
        let ch = format!("hmsh:{app_id}:{kind}:{pattern}");
        Ok(self.spawn_listener(ch, true, callback))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> MeshResult<()> {
        if let Some(handle) = self.handles.lock().unwrap_or_else(|e| e.into_inner()).remove(&id) {
            handle.abort();
        }
        Ok(())
    }

    async fn punsubscribe(&self, id: SubscriptionId) -> MeshResult<()> {
        self.unsubscribe(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_stable_and_distinct() {
        assert_eq!(channel("quorum", "app1", None), "hmsh:app1:quorum");
        assert_eq!(
            channel("quorum", "app1", Some("worker")),
            "hmsh:app1:quorum:worker"
        );
        assert_ne!(
            channel("quorum", "app1", None),
            channel("quorum", "app2", None)
        );
    }
}
