//! `hook`: re-entrant; receives `WEBHOOK` or `TIMEHOOK` events. Executes in a
//! dimensional scope distinct from the activity's main flow, using
//! `collate_synthetic` so re-entries never collide with the main collation
//! counter on the job.
//!
//! A hook node is reached twice over its lifetime, through two different
//! entry points: once via a normal `TRANSITION` (the graph flowing into it
//! for the first time), and then one or more times via `WEBHOOK`/`TIMEHOOK`
//! events once something outside the graph (a callback, a timer) re-enters
//! it. The first arrival registers how many re-entries are expected by
//! seeding the synthetic counter to `-reentries`; each later re-entry adds
//! `+1.0`, and the node transitions once the counter crosses zero. Seeding
//! happens exactly once per job: `process` only writes the seed when the
//! counter is still at its untouched default, so a redelivered `TRANSITION`
//! does not push the threshold further away.

use super::{Activity, ActivityContext, LegOutcome};
use crate::error::MeshResult;
use crate::stream::MessageStatus;

pub struct HookActivity {
    pub guid: String,
    pub outgoing: Vec<String>,
    /// Number of `WEBHOOK`/`TIMEHOOK` re-entries required before this node
    /// transitions. One for a plain callback/timer hook; greater than one
    /// for a fan-in hook awaiting several signals.
    pub reentries: u32,
}

impl HookActivity {
    async fn transition_messages(&self, ctx: &ActivityContext<'_>) -> Vec<crate::stream::StreamMessage> {
        self.outgoing
            .iter()
            .map(|to| {
                let mut m = ctx.metadata.clone();
                m.aid = to.clone();
                crate::stream::StreamMessage {
                    kind: crate::stream::MessageType::Transition,
                    status: None,
                    code: None,
                    metadata: m,
                    data: Default::default(),
                    stack: None,
                }
            })
            .collect()
    }

    async fn reenter(&self, ctx: &mut ActivityContext<'_>) -> MeshResult<LegOutcome> {
        let threshold_met = ctx
            .store
            .collate_synthetic(&ctx.job_id, &self.guid, 1.0, None)
            .await?
            <= 0.0;
        if !threshold_met {
            return Ok(LegOutcome::NoOp);
        }
        Ok(LegOutcome::Transitioned(self.transition_messages(ctx).await))
    }
}

#[async_trait::async_trait]
impl Activity for HookActivity {
    async fn process(&self, ctx: &mut ActivityContext<'_>) -> MeshResult<LegOutcome> {
        let current = ctx
            .store
            .collate_synthetic(&ctx.job_id, &self.guid, 0.0, None)
            .await?;
        if current == 0.0 {
            let seed = -(f64::from(self.reentries.max(1)));
            ctx.store
                .collate_synthetic(&ctx.job_id, &self.guid, seed, None)
                .await?;
        }
        Ok(LegOutcome::NoOp)
    }

    async fn process_web_hook_event(
        &self,
        ctx: &mut ActivityContext<'_>,
        _status: MessageStatus,
        _code: i32,
    ) -> MeshResult<LegOutcome> {
        self.reenter(ctx).await
    }

    async fn process_time_hook_event(&self, ctx: &mut ActivityContext<'_>) -> MeshResult<LegOutcome> {
        self.reenter(ctx).await
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
    async fn first_arrival_seeds_the_counter_and_is_a_no_op() {
        let minter = KeyMinter::new("test");
        let fake = Arc::new(FakeStore::default());
        let store: Arc<dyn Store + 'static> = fake.clone();
        let mut ctx = context(&minter, store, "job1", "h1");
        let hook = HookActivity {
            guid: "synthetic-1".to_string(),
            outgoing: vec!["h2".to_string()],
            reentries: 1,
        };

        let outcome = hook.process(&mut ctx).await.unwrap();
        assert_eq!(outcome, LegOutcome::NoOp);

        let seeded = fake
            .collate_synthetic("job1", "synthetic-1", 0.0, None)
            .await
            .unwrap();
        assert_eq!(seeded, -1.0);
    }

    #[tokio::test]
    async fn redelivered_first_arrival_does_not_reseed() {
        let minter = KeyMinter::new("test");
        let fake = Arc::new(FakeStore::default());
        let store: Arc<dyn Store + 'static> = fake.clone();
        let mut ctx = context(&minter, store, "job1", "h1");
        let hook = HookActivity {
            guid: "synthetic-1".to_string(),
            outgoing: vec!["h2".to_string()],
            reentries: 2,
        };

        hook.process(&mut ctx).await.unwrap();
        // a partial re-entry moves the counter off its -2 seed ...
        hook.process_time_hook_event(&mut ctx).await.unwrap();
        // ... so a redelivered TRANSITION must not seed it back to -2.
        hook.process(&mut ctx).await.unwrap();

        let current = fake
            .collate_synthetic("job1", "synthetic-1", 0.0, None)
            .await
            .unwrap();
        assert_eq!(current, -1.0);
    }

    #[tokio::test]
    async fn re_entry_reaches_threshold_and_transitions() {
        let minter = KeyMinter::new("test");
        let fake = Arc::new(FakeStore::default());
        let store: Arc<dyn Store + 'static> = fake;
        let mut ctx = context(&minter, store, "job1", "h1");
        let hook = HookActivity {
            guid: "synthetic-1".to_string(),
            outgoing: vec!["h2".to_string()],
            reentries: 1,
        };

        hook.process(&mut ctx).await.unwrap();
        match hook.process_time_hook_event(&mut ctx).await.unwrap() {
            LegOutcome::Transitioned(messages) => assert_eq!(messages[0].metadata.aid, "h2"),
            other => panic!("expected Transitioned, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_re_entry_of_a_fan_in_hook_is_a_no_op() {
        let minter = KeyMinter::new("test");
        let fake = Arc::new(FakeStore::default());
        let store: Arc<dyn Store + 'static> = fake;
        let mut ctx = context(&minter, store, "job1", "h1");
        let hook = HookActivity {
            guid: "synthetic-fanin".to_string(),
            outgoing: vec!["h2".to_string()],
            reentries: 2,
        };

        hook.process(&mut ctx).await.unwrap();
        let first = hook.process_time_hook_event(&mut ctx).await.unwrap();
        assert_eq!(first, LegOutcome::NoOp);
        let second = hook.process_time_hook_event(&mut ctx).await.unwrap();
        match second {
            LegOutcome::Transitioned(messages) => assert_eq!(messages[0].metadata.aid, "h2"),
            other => panic!("expected Transitioned, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn synthetic_collation_is_isolated_per_guid() {
        let minter = KeyMinter::new("test");
        let fake = Arc::new(FakeStore::default());
        let store: Arc<dyn Store + 'static> = fake;
        let mut ctx_a = context(&minter, store.clone(), "job1", "h1");
        let mut ctx_b = context(&minter, store, "job1", "h1");
        let hook_a = HookActivity {
            guid: "synthetic-a".to_string(),
            outgoing: vec![],
            reentries: 1,
        };
        let hook_b = HookActivity {
            guid: "synthetic-b".to_string(),
            outgoing: vec![],
            reentries: 1,
        };

        hook_a.process(&mut ctx_a).await.unwrap();
        let outcome_a = hook_a
            .process_web_hook_event(&mut ctx_a, MessageStatus::Success, 200)
            .await
            .unwrap();
        // guid B never had its first-arrival seeding step run, so its
        // re-entry counter is still at the backend default and stays open.
        let outcome_b = hook_b
            .process_web_hook_event(&mut ctx_b, MessageStatus::Success, 200)
            .await
            .unwrap();
        assert_eq!(outcome_a, LegOutcome::Transitioned(vec![]));
        assert_eq!(outcome_b, LegOutcome::NoOp);
    }

    #[tokio::test]
    async fn web_hook_event_completes_after_seeding() {
        let minter = KeyMinter::new("test");
        let fake = Arc::new(FakeStore::default());
        let store: Arc<dyn Store + 'static> = fake;
        let mut ctx = context(&minter, store, "job1", "h1");
        let hook = HookActivity {
            guid: "synthetic-1".to_string(),
            outgoing: vec![],
            reentries: 1,
        };

        hook.process(&mut ctx).await.unwrap();
        let outcome = hook
            .process_web_hook_event(&mut ctx, MessageStatus::Success, 200)
            .await
            .unwrap();
        assert_eq!(outcome, LegOutcome::Transitioned(vec![]));
    }
}
