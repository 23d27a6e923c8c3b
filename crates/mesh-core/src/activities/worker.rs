//! `worker`: emits a message to `streams(appId, topic=subtype)`
//! for a worker pool consumed by the `WORKER` consumer group. On a `RESULT`
//! typed response, records success/pending/error and transitions.

use super::{Activity, ActivityContext, LegOutcome};
use crate::error::MeshResult;
use crate::stream::{MessageStatus, MessageType, StreamMessage};
use std::collections::BTreeMap;

pub struct WorkerActivity {
    pub subtype: String,
    pub outgoing: Vec<String>,
}

#[async_trait::async_trait]
impl Activity for WorkerActivity {
    async fn process(&self, ctx: &mut ActivityContext<'_>) -> MeshResult<LegOutcome> {
        let mut metadata = ctx.metadata.clone();
        metadata.topic = Some(self.subtype.clone());
        let message = StreamMessage {
            kind: MessageType::Worker,
            status: Some(MessageStatus::Pending),
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
        if matches!(status, MessageStatus::Pending) {
            return Ok(LegOutcome::NoOp);
        }
        let mut fields = BTreeMap::new();
        fields.insert("code".to_string(), code.to_string());
        fields.insert(
            "status".to_string(),
            match status {
                MessageStatus::Success => "success".to_string(),
                MessageStatus::Error => "error".to_string(),
                MessageStatus::Pending => unreachable!(),
            },
        );
        ctx.store.set_state(&ctx.job_id, &fields, None, None).await?;

        let completed = super::collate_and_decide(ctx, 1.0, None).await?;
        if completed {
            return Ok(LegOutcome::Completed);
        }
        let messages = self
            .outgoing
            .iter()
            .map(|to| {
                let mut m = ctx.metadata.clone();
                m.aid = to.clone();
                StreamMessage {
                    kind: MessageType::Transition,
                    status: None,
                    code: None,
                    metadata: m,
                    data: BTreeMap::new(),
                    stack: None,
                }
            })
            .collect();
        Ok(LegOutcome::Transitioned(messages))
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
    async fn process_emits_a_worker_message_on_the_subtype_stream() {
        let minter = KeyMinter::new("test");
        let store: Arc<dyn Store + 'static> = Arc::new(FakeStore::default());
        let mut ctx = context(&minter, store, "job1", "w1");
        let worker = WorkerActivity {
            subtype: "send-email".to_string(),
            outgoing: vec!["w2".to_string()],
        };

        match worker.process(&mut ctx).await.unwrap() {
            LegOutcome::Transitioned(messages) => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].metadata.topic.as_deref(), Some("send-email"));
                assert_eq!(messages[0].status, Some(MessageStatus::Pending));
            }
            other => panic!("expected Transitioned, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pending_result_is_a_no_op() {
        let minter = KeyMinter::new("test");
        let store: Arc<dyn Store + 'static> = Arc::new(FakeStore::default());
        let mut ctx = context(&minter, store, "job1", "w1");
        let worker = WorkerActivity {
            subtype: "send-email".to_string(),
            outgoing: vec!["w2".to_string()],
        };

        let outcome = worker
            .process_event(&mut ctx, MessageStatus::Pending, 0)
            .await
            .unwrap();
        assert_eq!(outcome, LegOutcome::NoOp);
    }

    #[tokio::test]
    async fn success_result_emits_transition_messages() {
        let minter = KeyMinter::new("test");
        let store: Arc<dyn Store + 'static> = Arc::new(FakeStore::default());
        let mut ctx = context(&minter, store, "job1", "w1");
        let worker = WorkerActivity {
            subtype: "send-email".to_string(),
            outgoing: vec!["w2".to_string()],
        };

        let outcome = worker
            .process_event(&mut ctx, MessageStatus::Success, 200)
            .await
            .unwrap();
        match outcome {
            LegOutcome::Transitioned(messages) => {
                assert_eq!(messages[0].metadata.aid, "w2");
            }
            other => panic!("expected Transitioned, got {other:?}"),
        }
    }
}
