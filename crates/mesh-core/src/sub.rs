//! Sub: topic pub/sub, exact and wildcard. Delivery is
//! at-least-once to all live subscribers in the cluster; the concrete
//! backend (Redis pub/sub, Postgres LISTEN/NOTIFY) owns the fan-out.

use crate::error::MeshResult;
use async_trait::async_trait;
use serde_json::Value as Json;

pub type SubscriptionId = u64;

#[async_trait]
pub trait Sub: Send + Sync {
    async fn publish(
        &self,
        kind: &str,
        payload: &Json,
        app_id: &str,
        subtopic: Option<&str>,
    ) -> MeshResult<()>;

    /// Register a callback for exact-topic delivery. Returns a handle for
    /// `unsubscribe`.
    async fn subscribe(
        &self,
        kind: &str,
        app_id: &str,
        subtopic: Option<&str>,
        callback: SubCallback,
    ) -> MeshResult<SubscriptionId>;

    /// Register a callback for wildcard-pattern delivery.
    async fn psubscribe(
        &self,
        kind: &str,
        app_id: &str,
        pattern: &str,
        callback: SubCallback,
    ) -> MeshResult<SubscriptionId>;

    async fn unsubscribe(&self, id: SubscriptionId) -> MeshResult<()>;
    async fn punsubscribe(&self, id: SubscriptionId) -> MeshResult<()>;
}

/// A boxed callback invoked with the delivered payload. `Send + Sync` so it
/// can be stashed across suspension points by the backend's dispatch loop.
pub type SubCallback = std::sync::Arc<dyn Fn(Json) + Send + Sync>;
