//! Compiled intermediate representation: dynamic named-parameter manifests
//! turned into strongly typed structs with an "extras" bag for unknown
//! fields.
//!
//! `ActivityIr` is the typed, compiler-populated counterpart to
//! [`crate::manifest::ActivityManifest`]; `GraphIr` wraps the manifest graph
//! in a [`petgraph::graph::DiGraph`] so deploy steps (`bindParents`,
//! `bindCycleTarget`, `resolveMappingDependencies`) can walk edges instead of
//! re-deriving them from the transitions map each time.

use crate::manifest::{ActivityType, GraphManifest};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::BTreeMap;

/// One compiled activity. Carries both the user-declared fields and the
/// compiler-populated ones (`consumes`, `produces`, `cycle`, `ancestor`,
/// `parent`) as plain fields rather than an "extras" map — every key this
/// system produces is a fixed, known one, so there's no unknown-key bag to
/// carry forward.
#[derive(Clone, Debug)]
pub struct ActivityIr {
    pub id: String,
    pub kind: ActivityType,
    pub topic: Option<String>,
    pub subtype: Option<String>,
    pub job: BTreeMap<String, serde_json::Value>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,

    pub consumes: Vec<String>,
    pub produces: Vec<String>,
    pub cycle: bool,
    pub ancestor: Option<String>,
    pub parent: Option<String>,

    pub trigger: Option<String>,
    pub subscribes: Option<String>,
    pub publishes: Option<String>,
    pub expire: Option<u64>,
    pub persistent: bool,
}

#[derive(Clone, Debug)]
pub struct TransitionEdge {
    pub to: String,
    pub conditions: Option<serde_json::Value>,
}

/// One graph, lowered into a traversable form. Node weights are activity ids
/// (looked up in `activities`); edge weights are the transition targets.
pub struct GraphIr {
    pub subscribes: String,
    pub publishes: Option<String>,
    pub expire: Option<u64>,
    pub persistent: bool,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub activities: BTreeMap<String, ActivityIr>,
    pub graph: DiGraph<String, TransitionEdge>,
    pub nodes: BTreeMap<String, NodeIndex>,
    pub hooks: BTreeMap<String, Vec<TransitionEdge>>,
}

impl GraphIr {
    /// Build the traversable graph from a parsed manifest graph. This is a
    /// pure structural lowering — no symbol binding, no validation beyond
    /// "every transition target must name a known activity" (surfaced as
    /// `None` lookups the caller turns into `MeshError::ValidationError`).
    pub fn from_manifest(g: &GraphManifest) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = BTreeMap::new();
        let mut activities = BTreeMap::new();

        for (id, am) in &g.activities {
            let idx = graph.add_node(id.clone());
            nodes.insert(id.clone(), idx);
            activities.insert(
                id.clone(),
                ActivityIr {
                    id: id.clone(),
                    kind: am.kind,
                    topic: am.topic.clone(),
                    subtype: am.subtype.clone(),
                    job: am.job.clone(),
                    input: am.input.as_ref().and_then(|s| s.schema.clone()),
                    output: am.output.as_ref().and_then(|s| s.schema.clone()),
                    consumes: Vec::new(),
                    produces: Vec::new(),
                    cycle: false,
                    ancestor: None,
                    parent: None,
                    trigger: None,
                    subscribes: None,
                    publishes: None,
                    expire: None,
                    persistent: false,
                },
            );
        }

        for (from, targets) in &g.transitions {
            let Some(&from_idx) = nodes.get(from) else {
                continue;
            };
            for t in targets {
                let Some(&to_idx) = nodes.get(&t.to) else {
                    continue;
                };
                graph.add_edge(
                    from_idx,
                    to_idx,
                    TransitionEdge {
                        to: t.to.clone(),
                        conditions: t.conditions.clone(),
                    },
                );
            }
        }

        let hooks = g
            .hooks
            .iter()
            .map(|(topic, targets)| {
                (
                    topic.clone(),
                    targets
                        .iter()
                        .map(|t| TransitionEdge {
                            to: t.to.clone(),
                            conditions: t.conditions.clone(),
                        })
                        .collect(),
                )
            })
            .collect();

        Self {
            subscribes: g.subscribes.clone(),
            publishes: g.publishes.clone(),
            expire: g.expire,
            persistent: g.persistent,
            input: g.input.as_ref().and_then(|s| s.schema.clone()),
            output: g.output.as_ref().and_then(|s| s.schema.clone()),
            activities,
            graph,
            nodes,
            hooks,
        }
    }

    /// The graph's entry activity: the lone `trigger` node. Malformed graphs
    /// (zero or more than one trigger) are a validator concern, not this
    /// accessor's — it returns the first one found.
    pub fn find_trigger(&self) -> Option<&ActivityIr> {
        self.activities
            .values()
            .find(|a| matches!(a.kind, ActivityType::Trigger))
    }

    pub fn outgoing(&self, activity_id: &str) -> Vec<&TransitionEdge> {
        let Some(&idx) = self.nodes.get(activity_id) else {
            return Vec::new();
        };
        self.graph
            .edges(idx)
            .map(|e| e.weight())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    #[test]
    fn lowers_activities_and_transitions_into_a_graph() {
        let yaml = r#"
app:
  id: orders
  version: "1"
  graphs:
    - subscribes: order.created
      activities:
        t1:
          type: trigger
        t2:
          type: hook
      transitions:
        t1:
          - to: t2
"#;
        let m = Manifest::parse(yaml).unwrap();
        let ir = GraphIr::from_manifest(&m.app.graphs[0]);
        assert_eq!(ir.activities.len(), 2);
        let out = ir.outgoing("t1");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, "t2");
        assert!(ir.find_trigger().is_some());
    }
}
