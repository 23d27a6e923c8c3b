//! Validator: enforces unique activity ids across
//! graphs and that every mapping reference resolves to a known activity, a
//! system var, a context var, or a registered function. Other checks
//! (transition conditions, schema shape, topic uniqueness, hook mappings,
//! stats) are declared as stub passes — each returns `Ok(())`
//! unconditionally, deferred to a later pass.

use crate::compiler::ir::GraphIr;
use crate::compiler::mapping::{self, PipeStep, CONTEXT_VARS, SYSTEM_VARS};
use crate::error::{MeshError, MeshResult};
use crate::manifest::AppManifest;
use std::collections::BTreeSet;

pub fn validate(app: &AppManifest) -> MeshResult<()> {
    check_unique_activity_ids(app)?;
    for g in &app.graphs {
        let ir = GraphIr::from_manifest(g);
        check_mapping_references(&ir)?;
    }
    check_transition_conditions(app)?;
    check_schema_shape(app)?;
    check_topic_uniqueness(app)?;
    check_hook_mappings(app)?;
    Ok(())
}

fn check_unique_activity_ids(app: &AppManifest) -> MeshResult<()> {
    let mut seen = BTreeSet::new();
    for g in &app.graphs {
        for id in g.activities.keys() {
            if !seen.insert(id.clone()) {
                return Err(MeshError::ValidationError(format!(
                    "duplicate activity id across graphs: {id}"
                )));
            }
        }
    }
    Ok(())
}

fn check_mapping_references(ir: &GraphIr) -> MeshResult<()> {
    for activity in ir.activities.values() {
        for value in activity.job.values() {
            walk_json_strings(value, &mut |s| {
                if !mapping::is_mapping_rule(s) {
                    return Ok(());
                }
                let step = mapping::parse_rule(s)?;
                check_step_references(&step, ir)
            })?;
        }
    }
    Ok(())
}

fn check_step_references(step: &PipeStep, ir: &GraphIr) -> MeshResult<()> {
    match step {
        PipeStep::Literal(_) => Ok(()),
        PipeStep::Ref { scope, .. } => {
            if SYSTEM_VARS.contains(&scope.as_str())
                || CONTEXT_VARS.contains(&scope.as_str())
                || ir.activities.contains_key(scope)
            {
                Ok(())
            } else {
                Err(MeshError::ValidationError(format!(
                    "mapping reference to unknown activity or variable: {scope}"
                )))
            }
        }
        PipeStep::Call { args, .. } => {
            for a in args {
                check_step_references(a, ir)?;
            }
            Ok(())
        }
    }
}

fn walk_json_strings(
    value: &serde_json::Value,
    visit: &mut impl FnMut(&str) -> MeshResult<()>,
) -> MeshResult<()> {
    match value {
        serde_json::Value::String(s) => visit(s),
        serde_json::Value::Array(items) => {
            for i in items {
                walk_json_strings(i, visit)?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                walk_json_strings(v, visit)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_transition_conditions(_app: &AppManifest) -> MeshResult<()> {
    Ok(())
}

fn check_schema_shape(_app: &AppManifest) -> MeshResult<()> {
    Ok(())
}

fn check_topic_uniqueness(_app: &AppManifest) -> MeshResult<()> {
    Ok(())
}

fn check_hook_mappings(_app: &AppManifest) -> MeshResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    #[test]
    fn rejects_duplicate_activity_ids() {
        let yaml = r#"
app:
  id: a
  version: "1"
  graphs:
    - subscribes: t
      activities:
        t1:
          type: trigger
    - subscribes: u
      activities:
        t1:
          type: trigger
"#;
        let m = Manifest::parse(yaml).unwrap();
        assert!(validate(&m.app).is_err());
    }

    #[test]
    fn rejects_mapping_reference_to_unknown_activity() {
        let yaml = r#"
app:
  id: a
  version: "1"
  graphs:
    - subscribes: t
      activities:
        t1:
          type: trigger
        t2:
          type: hook
          job:
            x: "{ghost.output.data.y}"
"#;
        let m = Manifest::parse(yaml).unwrap();
        assert!(validate(&m.app).is_err());
    }

    #[test]
    fn accepts_reference_to_system_var_and_sibling_activity() {
        let yaml = r#"
app:
  id: a
  version: "1"
  graphs:
    - subscribes: t
      activities:
        t1:
          type: trigger
        t2:
          type: hook
          job:
            x: "{t1.output.data.y}"
            y: "{$job.jid}"
"#;
        let m = Manifest::parse(yaml).unwrap();
        assert!(validate(&m.app).is_ok());
    }
}
