//! Activities: the polymorphic family sharing
//! one lifecycle (`create → consume → process → produce → transition`).
//! Each variant lives in its own module; [`Activity`] is the shared trait
//! the engine's dispatch table calls through — a tagged-variant struct per
//! activity kind rather than an inheritance hierarchy.

pub mod awaiting;
pub mod cycle;
#[cfg(test)]
pub mod fakes;
pub mod hook;
pub mod interrupt;
pub mod signal;
pub mod trigger;
pub mod worker;

use crate::error::MeshResult;
use crate::keyminter::KeyMinter;
use crate::store::{Store, Transaction};
use crate::stream::{StreamMessage, StreamMetadata};
use std::sync::Arc;

/// The dimensional path of one activity execution (`,d1,d2,...`), stored as
/// the raw comma-joined suffix since that's the form every key/field
/// composition needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dimensions(pub String);

impl Dimensions {
    pub fn root() -> Self {
        Self(",0".to_string())
    }

    pub fn suffix(&self) -> &str {
        &self.0
    }
}

/// Everything one activity leg needs: identity, the inbound message, and
/// handles to the backend. Constructed fresh per `process()` call from
/// `(schema, data, metadata, hookData, engine, context)`.
pub struct ActivityContext<'a> {
    pub app_id: String,
    pub activity_id: String,
    pub job_id: String,
    pub dims: Dimensions,
    pub minter: &'a KeyMinter,
    pub store: Arc<dyn Store>,
    pub metadata: StreamMetadata,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub hook_data: Option<serde_json::Value>,
}

/// The state-machine contract per activity: `pending → entered →
/// processed → transitioned → completed`. `process` drives a leg end to end;
/// callers observe only the terminal outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum LegOutcome {
    /// Collation did not yet reach the completion threshold: transition
    /// messages were emitted for every edge whose conditions held.
    Transitioned(Vec<StreamMessage>),
    /// Collation reached the completion threshold: the caller should run
    /// `runJobCompletionTasks`.
    Completed,
    /// A duplicate delivery observed the counter already past its required
    /// threshold; at-least-once delivery makes this a deliberate no-op.
    NoOp,
}

#[async_trait::async_trait]
pub trait Activity: Send + Sync {
    /// Orchestrate this leg: resolve mappings, write state, increment
    /// collation, and emit transition messages (or drive completion).
    async fn process(&self, ctx: &mut ActivityContext<'_>) -> MeshResult<LegOutcome>;

    /// For activities awaiting an external result (`await`, `worker`).
    async fn process_event(
        &self,
        ctx: &mut ActivityContext<'_>,
        _status: crate::stream::MessageStatus,
        _code: i32,
    ) -> MeshResult<LegOutcome> {
        self.process(ctx).await
    }

    async fn process_web_hook_event(
        &self,
        ctx: &mut ActivityContext<'_>,
        _status: crate::stream::MessageStatus,
        _code: i32,
    ) -> MeshResult<LegOutcome> {
        self.process(ctx).await
    }

    async fn process_time_hook_event(&self, ctx: &mut ActivityContext<'_>) -> MeshResult<LegOutcome> {
        self.process(ctx).await
    }
}

/// `collate(jobId, activityId, delta, dIds, tx)` plus the threshold check
/// every variant's `process` ends with: below threshold emits transitions,
/// at/below zero means job completion.
pub async fn collate_and_decide(
    ctx: &ActivityContext<'_>,
    delta: f64,
    tx: Option<&mut Transaction>,
) -> MeshResult<bool> {
    let counter = ctx.store.collate(&ctx.job_id, &ctx.activity_id, delta, tx).await?;
    Ok(counter <= 0.0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::keyminter::KeyMinter;

    pub fn context<'a>(
        minter: &'a KeyMinter,
        store: Arc<dyn Store>,
        job_id: &str,
        activity_id: &str,
    ) -> ActivityContext<'a> {
        ActivityContext {
            app_id: "app1".to_string(),
            activity_id: activity_id.to_string(),
            job_id: job_id.to_string(),
            dims: Dimensions::root(),
            minter,
            store,
            metadata: StreamMetadata {
                jid: job_id.to_string(),
                aid: activity_id.to_string(),
                ..Default::default()
            },
            data: serde_json::Map::new(),
            hook_data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::FakeStore;
    use super::test_support::context;
    use super::*;
    use crate::keyminter::KeyMinter;

    #[tokio::test]
    async fn collate_and_decide_reaches_threshold_at_zero() {
        let minter = KeyMinter::new("test");
        let fake = Arc::new(FakeStore::default());
        let store: Arc<dyn Store> = fake.clone();
        let ctx = context(&minter, store, "job1", "a1");

        assert!(!collate_and_decide(&ctx, -1.0, None).await.unwrap());
        assert!(collate_and_decide(&ctx, -1.0, None).await.unwrap());
        assert_eq!(fake.collation_of("job1", "a1"), -2.0);
    }

    #[tokio::test]
    async fn collate_and_decide_stays_done_past_zero() {
        let minter = KeyMinter::new("test");
        let store: Arc<dyn Store> = Arc::new(FakeStore::default());
        let ctx = context(&minter, store.clone(), "job1", "a1");

        assert!(collate_and_decide(&ctx, -5.0, None).await.unwrap());
        assert!(collate_and_decide(&ctx, 0.0, None).await.unwrap());
    }
}
