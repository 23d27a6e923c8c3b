//! `interrupt`: terminates a target
//! job. The cooperative cancellation primitive: decrements `:` by 1e9 and
//! writes an error record; any later transition attempt observes status ≤ 0
//! and must not re-enter.

use super::{Activity, ActivityContext, LegOutcome};
use crate::error::MeshResult;
use crate::store::InterruptOptions;

pub struct InterruptActivity {
    pub options: InterruptOptions,
}

#[async_trait::async_trait]
impl Activity for InterruptActivity {
    async fn process(&self, ctx: &mut ActivityContext<'_>) -> MeshResult<LegOutcome> {
        let topic = ctx.metadata.topic.clone().unwrap_or_default();
        ctx.store
            .interrupt(&topic, &ctx.job_id, self.options.clone())
            .await?;
        Ok(LegOutcome::Completed)
    }
}
