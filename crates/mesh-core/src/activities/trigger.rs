//! `trigger`: creates the job, stamps job metadata
//! (`jid, app, vrs, tpc, ts, ngn, pj, pg, pd, pa, trc, spn`), writes initial
//! state with collation counter `jc`, emits transitions to children.

use super::{Activity, ActivityContext, LegOutcome};
use crate::error::MeshResult;
use crate::store::Transaction;
use crate::stream::{MessageType, StreamMessage};
use std::collections::BTreeMap;

pub struct TriggerActivity {
    /// Outgoing transition edges, resolved at deploy time and handed to the
    /// runtime so it never has to re-read the manifest mid-flight.
    pub outgoing: Vec<String>,
    /// Initial collation threshold: the number of direct children whose
    /// completion this trigger's job waits on.
    pub initial_status: f64,
    /// Active app version, stamped onto every job this trigger creates.
    pub app_version: String,
}

#[async_trait::async_trait]
impl Activity for TriggerActivity {
    async fn process(&self, ctx: &mut ActivityContext<'_>) -> MeshResult<LegOutcome> {
        let created = ctx
            .store
            .set_state_nx(&ctx.job_id, Some(self.initial_status), None)
            .await?;
        if !created {
            // At-least-once redelivery of the same trigger message: the job
            // already exists, so this leg is a no-op.
            return Ok(LegOutcome::NoOp);
        }

        let mut fields = BTreeMap::new();
        fields.insert("jid".to_string(), tag_encode_string(&ctx.job_id));
        fields.insert("app".to_string(), tag_encode_string(&ctx.app_id));
        fields.insert("vrs".to_string(), tag_encode_string(&self.app_version));
        fields.insert("ts".to_string(), chrono::Utc::now().timestamp_millis().to_string());
        if let Some(topic) = &ctx.metadata.topic {
            fields.insert("tpc".to_string(), tag_encode_string(topic));
        }
        if let Some(ngn) = &ctx.metadata.ngn {
            fields.insert("ngn".to_string(), tag_encode_string(ngn));
        }
        if let Some(pj) = &ctx.metadata.pj {
            fields.insert("pj".to_string(), tag_encode_string(pj));
        }
        if let Some(pg) = &ctx.metadata.pg {
            fields.insert("pg".to_string(), tag_encode_string(pg));
        }
        if let Some(pd) = &ctx.metadata.pd {
            fields.insert("pd".to_string(), tag_encode_string(pd));
        }
        if let Some(pa) = &ctx.metadata.pa {
            fields.insert("pa".to_string(), tag_encode_string(pa));
        }
        if let Some(trc) = &ctx.metadata.trc {
            fields.insert("trc".to_string(), tag_encode_string(trc));
        }
        if let Some(spn) = &ctx.metadata.spn {
            fields.insert("spn".to_string(), tag_encode_string(spn));
        }
        let mut tx = Transaction::new();
        ctx.store
            .set_state(&ctx.job_id, &fields, Some(self.initial_status), Some(&mut tx))
            .await?;
        ctx.store.commit(tx).await?;

        if self.outgoing.is_empty() {
            let done = super::collate_and_decide(ctx, 0.0, None).await?;
            if done {
                return Ok(LegOutcome::Completed);
            }
        }

        let messages = self
            .outgoing
            .iter()
            .map(|to| transition_message(ctx, to))
            .collect();
        Ok(LegOutcome::Transitioned(messages))
    }
}

/// A bare string is a valid tag-encoded scalar as
/// long as it doesn't collide with the tag prefixes or the value-symbol
/// token space; job identifiers are minted UUIDs, so that never applies.
fn tag_encode_string(s: &str) -> String {
    s.to_string()
}

fn transition_message(ctx: &ActivityContext<'_>, to: &str) -> StreamMessage {
    let mut metadata = ctx.metadata.clone();
    metadata.aid = to.to_string();
    StreamMessage {
        kind: MessageType::Transition,
        status: None,
        code: None,
        metadata,
        data: BTreeMap::new(),
        stack: None,
    }
}
