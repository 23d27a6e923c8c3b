//! Manifest: the declarative
//! input to the compiler. YAML or JSON; `serde_yaml`/`serde_json` both
//! deserialize into these types since they share the same logical shape.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub app: AppManifest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppManifest {
    pub id: String,
    pub version: String,
    pub graphs: Vec<GraphManifest>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphManifest {
    /// The public topic this graph's trigger subscribes to. A leading `.`
    /// marks a private (intra-app) topic.
    pub subscribes: String,
    #[serde(default)]
    pub publishes: Option<String>,
    #[serde(default)]
    pub expire: Option<u64>,
    #[serde(default)]
    pub persistent: bool,
    pub activities: BTreeMap<String, ActivityManifest>,
    #[serde(default)]
    pub transitions: BTreeMap<String, Vec<TransitionTarget>>,
    #[serde(default)]
    pub hooks: BTreeMap<String, Vec<TransitionTarget>>,
    #[serde(default)]
    pub input: Option<SchemaRef>,
    #[serde(default)]
    pub output: Option<SchemaRef>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitionTarget {
    pub to: String,
    #[serde(default)]
    pub conditions: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaRef {
    #[serde(default)]
    pub schema: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Trigger,
    Await,
    Worker,
    Hook,
    Signal,
    Cycle,
    Interrupt,
    /// Legacy alias for `Hook`, folded in by `convertActivitiesToHooks`.
    Activity,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityManifest {
    #[serde(rename = "type")]
    pub kind: ActivityType,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    /// Field-mapping rules (`{a.x.y}` strings, or nested mapping objects).
    #[serde(default)]
    pub job: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub input: Option<SchemaRef>,
    #[serde(default)]
    pub output: Option<SchemaRef>,

    // ── populated by the compiler, not the user ──
    #[serde(default)]
    pub consumes: Vec<String>,
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub cycle: bool,
    #[serde(default)]
    pub ancestor: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,

    // ── back-bound from the graph at deploy time ──
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub subscribes: Option<String>,
    #[serde(default)]
    pub publishes: Option<String>,
    #[serde(default)]
    pub expire: Option<u64>,
    #[serde(default)]
    pub persistent: bool,
}

impl Manifest {
    pub fn parse(input: &str) -> Result<Self, serde_yaml::Error> {
        // YAML is a superset of JSON for our purposes; serde_yaml parses both.
        serde_yaml::from_str(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml_manifest() {
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
        assert_eq!(m.app.id, "orders");
        assert_eq!(m.app.graphs.len(), 1);
        assert_eq!(m.app.graphs[0].activities.len(), 2);
    }
}
