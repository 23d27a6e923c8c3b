//! `signal`: emits a signal message identified by a resolved
//! topic+key, used to wake a `hook` activity elsewhere in the mesh that is
//! parked waiting on that exact key.

use super::{Activity, ActivityContext, LegOutcome};
use crate::error::MeshResult;

pub struct SignalActivity {
    pub topic: String,
    pub key: String,
}

#[async_trait::async_trait]
impl Activity for SignalActivity {
    async fn process(&self, ctx: &mut ActivityContext<'_>) -> MeshResult<LegOutcome> {
        ctx.store
            .set_hook_signal(&ctx.app_id, &self.topic, &self.key, &ctx.job_id)
            .await?;
        let completed = super::collate_and_decide(ctx, 1.0, None).await?;
        Ok(if completed {
            LegOutcome::Completed
        } else {
            LegOutcome::NoOp
        })
    }
}
