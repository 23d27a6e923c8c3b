//! `await`: invokes a subordinate job — bound by parent via
//! `pj/pa`, or detached when `await=false` — and pauses until a `RESULT`
//! typed stream message arrives.

use super::{Activity, ActivityContext, LegOutcome};
use crate::error::MeshResult;
use crate::stream::{MessageStatus, MessageType, StreamMessage};
use std::collections::BTreeMap;

pub struct AwaitActivity {
    pub child_topic: String,
    /// When `false`, the subordinate job is detached: its completion never
    /// publishes a `RESULT` back here.
    pub bound: bool,
}

#[async_trait::async_trait]
impl Activity for AwaitActivity {
    async fn process(&self, ctx: &mut ActivityContext<'_>) -> MeshResult<LegOutcome> {
        let mut metadata = ctx.metadata.clone();
        metadata.topic = Some(self.child_topic.clone());
        if self.bound {
            metadata.pj = Some(ctx.job_id.clone());
            metadata.pa = Some(ctx.activity_id.clone());
            metadata.pg = Some(ctx.metadata.gid.clone());
            metadata.pd = Some(ctx.dims.suffix().to_string());
        }
        let message = StreamMessage {
            kind: MessageType::Await,
            status: None,
            code: None,
            metadata,
            data: ctx.data.clone().into_iter().collect(),
            stack: None,
        };
        Ok(LegOutcome::Transitioned(vec![message]))
    }

    async fn process_event(
        &self,
        ctx: &mut ActivityContext<'_>,
        status: MessageStatus,
        code: i32,
    ) -> MeshResult<LegOutcome> {
        let delta = match status {
            MessageStatus::Success => 1.0,
            MessageStatus::Pending => 0.0,
            MessageStatus::Error => 1.0,
        };
        if delta == 0.0 {
            return Ok(LegOutcome::NoOp);
        }
        let mut fields = BTreeMap::new();
        fields.insert("code".to_string(), code.to_string());
        ctx.store.set_state(&ctx.job_id, &fields, None, None).await?;
        let completed = super::collate_and_decide(ctx, -delta, None).await?;
        if completed {
            Ok(LegOutcome::Completed)
        } else {
            Ok(LegOutcome::NoOp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::fakes::FakeStore;
    use crate::activities::test_support::context;
    use crate::keyminter::KeyMinter;
    use crate::store::Store;
    use std::sync::Arc;

    #[tokio::test]
    async fn bound_await_stamps_parent_linkage() {
        let minter = KeyMinter::new("test");
        let store: Arc<dyn Store + 'static> = Arc::new(FakeStore::default());
        let mut ctx = context(&minter, store, "parent-job", "p1");
        let activity = AwaitActivity {
            child_topic: "child.topic".to_string(),
            bound: true,
        };

        match activity.process(&mut ctx).await.unwrap() {
            LegOutcome::Transitioned(messages) => {
                let m = &messages[0].metadata;
                assert_eq!(m.pj.as_deref(), Some("parent-job"));
                assert_eq!(m.pa.as_deref(), Some("p1"));
                assert_eq!(m.topic.as_deref(), Some("child.topic"));
            }
            other => panic!("expected Transitioned, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn detached_await_never_stamps_parent_linkage() {
        let minter = KeyMinter::new("test");
        let store: Arc<dyn Store + 'static> = Arc::new(FakeStore::default());
        let mut ctx = context(&minter, store, "parent-job", "p1");
        let activity = AwaitActivity {
            child_topic: "child.topic".to_string(),
            bound: false,
        };

        match activity.process(&mut ctx).await.unwrap() {
            LegOutcome::Transitioned(messages) => {
                assert!(messages[0].metadata.pj.is_none());
                assert!(messages[0].metadata.pa.is_none());
            }
            other => panic!("expected Transitioned, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pending_event_is_a_no_op() {
        let minter = KeyMinter::new("test");
        let store: Arc<dyn Store + 'static> = Arc::new(FakeStore::default());
        let mut ctx = context(&minter, store, "parent-job", "p1");
        let activity = AwaitActivity {
            child_topic: "child.topic".to_string(),
            bound: true,
        };

        let outcome = activity
            .process_event(&mut ctx, MessageStatus::Pending, 0)
            .await
            .unwrap();
        assert_eq!(outcome, LegOutcome::NoOp);
    }
}
