//! Collator: assigns a stable collation code to each activity and
//! synthesizes extra DAG nodes for cycle/hook re-entry points, so the
//! runtime can distinguish "first time through this activity" from
//! "re-entered via a cycle or hook" without inspecting the manifest at
//! runtime.

use crate::compiler::ir::GraphIr;
use std::collections::BTreeMap;

/// A synthetic node injected for every `cycle`/`hook` activity, carrying the
/// guid `collate_synthetic` keys its counter on — a bare guid, outside the
/// key-symbol space, so it can never collide with a user-reserved prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticNode {
    pub activity_id: String,
    pub guid: String,
}

#[derive(Clone, Debug, Default)]
pub struct CollationPlan {
    /// Stable per-activity collation code, assigned in activity-id order so
    /// redeploys of an unchanged graph reproduce identical codes.
    pub codes: BTreeMap<String, u32>,
    pub synthetic_nodes: Vec<SyntheticNode>,
}

pub struct Collator;

impl Collator {
    /// `compile(graphs)`. Deterministic: iterates activities in sorted id
    /// order so the same manifest always yields the same plan.
    pub fn compile(graphs: &[GraphIr]) -> CollationPlan {
        let mut plan = CollationPlan::default();
        let mut next_code = 0u32;
        for g in graphs {
            for (id, activity) in &g.activities {
                plan.codes.insert(id.clone(), next_code);
                next_code += 1;
                if activity.cycle || matches!(activity.kind, crate::manifest::ActivityType::Hook) {
                    plan.synthetic_nodes.push(SyntheticNode {
                        activity_id: id.clone(),
                        guid: format!("syn:{id}"),
                    });
                }
            }
        }
        plan
    }
}
