//! `cycle`: re-enters an ancestor with updated input. The
//! ancestor was marked `cycle=true` at deploy time (`bindCycleTarget`,
//! `crate::compiler::deploy`), so the runtime never needs to walk the graph
//! to find its re-entry point.

use super::{Activity, ActivityContext, LegOutcome};
use crate::error::MeshResult;
use crate::stream::{MessageType, StreamMessage};

pub struct CycleActivity {
    pub ancestor_id: String,
}

#[async_trait::async_trait]
impl Activity for CycleActivity {
    async fn process(&self, ctx: &mut ActivityContext<'_>) -> MeshResult<LegOutcome> {
        let mut metadata = ctx.metadata.clone();
        metadata.aid = self.ancestor_id.clone();
        let message = StreamMessage {
            kind: MessageType::Transition,
            status: None,
            code: None,
            metadata,
            data: ctx.data.clone().into_iter().collect(),
            stack: None,
        };
        Ok(LegOutcome::Transitioned(vec![message]))
    }
}
