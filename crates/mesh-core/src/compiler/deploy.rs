//! Deployer: the sixteen-step pipeline that turns a validated manifest into
//! installed backend artifacts. Each step is a free function, run in order
//! from [`Deployer::deploy`], so any one step can be unit-tested in
//! isolation against a fixed input manifest.

use crate::compiler::collator::Collator;
use crate::compiler::ir::{ActivityIr, GraphIr};
use crate::compiler::mapping::{self, PipeStep};
use crate::compiler::validator;
use crate::error::{MeshError, MeshResult};
use crate::keyminter::{KeyMinter, KeyType};
use crate::manifest::{ActivityType, AppManifest};
use crate::store::Store;
use crate::symbols::{ACTIVITY_SCOPE_SLOTS, DATA_SLOTS, METADATA_SLOTS};
use std::collections::BTreeMap;

pub struct DeployResult {
    pub app_id: String,
    pub version: String,
    pub graphs: Vec<GraphIr>,
}

pub struct Deployer;

impl Deployer {
    /// `plan(manifestOrPath)`: parse and validate, returning the manifest
    /// unchanged. No symbol binding or persistence happens here.
    pub fn plan(raw: &str) -> MeshResult<AppManifest> {
        let manifest = crate::manifest::Manifest::parse(raw)
            .map_err(|e| MeshError::ValidationError(format!("manifest parse error: {e}")))?;
        validator::validate(&manifest.app)?;
        Ok(manifest.app)
    }

    /// `deploy(manifest)`: the full sixteen-step pipeline.
    pub async fn deploy(app: &AppManifest, store: &dyn Store) -> MeshResult<DeployResult> {
        let minter = KeyMinter::new(&app.id);
        let mut graphs: Vec<GraphIr> = app.graphs.iter().map(GraphIr::from_manifest).collect();

        // 1. Collator.compile(graphs)
        let collation = Collator::compile(&graphs);
        for g in &mut graphs {
            for (id, activity) in g.activities.iter_mut() {
                if collation
                    .synthetic_nodes
                    .iter()
                    .any(|s| &s.activity_id == id)
                {
                    activity.cycle = activity.cycle || matches!(activity.kind, ActivityType::Hook);
                }
            }
        }

        for g in &mut graphs {
            // 2. convertActivitiesToHooks
            convert_activities_to_hooks(g);
            // 3. convertTopicsToTypes
            convert_topics_to_types(g);
            // 4. copyJobSchemas
            copy_job_schemas(g);
            // 5. bindBackRefs
            bind_back_refs(g);
            // 6. bindParents
            bind_parents(g);
            // 7. bindCycleTarget
            bind_cycle_target(g);
            // 8. resolveMappingDependencies
            resolve_mapping_dependencies(g)?;
            // 9. resolveJobMapsPaths
            resolve_job_maps_paths(g);
        }

        // 10. generateSymKeys
        for g in &mut graphs {
            generate_sym_keys(&minter, g, store).await?;
        }

        // 11. generateSymVals
        generate_sym_vals(&minter, app, store).await?;

        // 12. deployHookPatterns
        for g in &graphs {
            deploy_hook_patterns(&minter, app, g, store).await?;
        }

        // 13. deployActivitySchemas
        for g in &graphs {
            deploy_activity_schemas(&minter, app, g, store).await?;
        }

        // 14. deploySubscriptions
        for g in &graphs {
            deploy_subscriptions(&minter, app, g, store).await?;
        }

        // 15. deployTransitions
        for g in &graphs {
            deploy_transitions(&minter, app, g, store).await?;
        }

        // 16. deployConsumerGroups
        deploy_consumer_groups(&minter, app, &graphs, store).await?;

        Ok(DeployResult {
            app_id: app.id.clone(),
            version: app.version.clone(),
            graphs,
        })
    }
}

fn convert_activities_to_hooks(g: &mut GraphIr) {
    for activity in g.activities.values_mut() {
        if matches!(activity.kind, ActivityType::Activity) {
            activity.kind = ActivityType::Hook;
        }
    }
}

fn convert_topics_to_types(g: &mut GraphIr) {
    for activity in g.activities.values_mut() {
        if matches!(activity.kind, ActivityType::Worker | ActivityType::Await) {
            if activity.subtype.is_none() {
                activity.subtype = activity.topic.take();
            }
        }
    }
}

/// Copies the graph-level `input`/`output` schema onto the trigger, so a
/// trigger that didn't declare its own schema inherits the graph's. Only
/// fills gaps — an activity-level schema on the trigger itself always wins.
fn copy_job_schemas(g: &mut GraphIr) {
    let Some(trigger_id) = g.find_trigger().map(|t| t.id.clone()) else {
        return;
    };
    let input = g.input.clone();
    let output = g.output.clone();
    if let Some(trigger) = g.activities.get_mut(&trigger_id) {
        if trigger.input.is_none() {
            trigger.input = input;
        }
        if trigger.output.is_none() {
            trigger.output = output;
        }
    }
}

fn bind_back_refs(g: &mut GraphIr) {
    let subscribes = g.subscribes.clone();
    let publishes = g.publishes.clone();
    let expire = g.expire;
    let persistent = g.persistent;
    let trigger_id = g.find_trigger().map(|t| t.id.clone());
    for activity in g.activities.values_mut() {
        activity.trigger = trigger_id.clone();
        activity.subscribes = Some(subscribes.clone());
        activity.publishes = publishes.clone();
        activity.expire = expire;
        activity.persistent = persistent;
    }
}

fn bind_parents(g: &mut GraphIr) {
    let mut parent_of: BTreeMap<String, String> = BTreeMap::new();
    for (from_id, &from_idx) in &g.nodes {
        for edge in g.graph.edges(from_idx) {
            parent_of.entry(edge.weight().to.clone()).or_insert_with(|| from_id.clone());
        }
    }
    for (id, parent) in parent_of {
        if let Some(a) = g.activities.get_mut(&id) {
            a.parent = Some(parent);
        }
    }
}

fn bind_cycle_target(g: &mut GraphIr) {
    let cycle_ancestors: Vec<(String, String)> = g
        .activities
        .values()
        .filter_map(|a| {
            if a.cycle {
                a.parent.clone().map(|p| (a.id.clone(), p))
            } else {
                None
            }
        })
        .collect();
    for (_cycle_id, ancestor_id) in cycle_ancestors {
        if let Some(a) = g.activities.get_mut(&ancestor_id) {
            a.cycle = true;
        }
    }
}

/// `^{[^@].*}$` dynamic-mapping detection plus context-var allowlist.
fn is_dynamic_mapping_rule(s: &str) -> bool {
    mapping::is_mapping_rule(s) && !s[1..].starts_with('@')
}

fn resolve_mapping_dependencies(g: &mut GraphIr) -> MeshResult<()> {
    let mut consumes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut produces: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (activity_id, activity) in &g.activities {
        for value in activity.job.values() {
            collect_mapping_paths(value, activity_id, &mut consumes, &mut produces)?;
        }
    }

    for (id, activity) in g.activities.iter_mut() {
        if let Some(paths) = consumes.remove(id) {
            activity.consumes = paths;
        }
        if let Some(paths) = produces.remove(id) {
            activity.produces = paths;
        }
    }
    Ok(())
}

fn collect_mapping_paths(
    value: &serde_json::Value,
    activity_id: &str,
    consumes: &mut BTreeMap<String, Vec<String>>,
    produces: &mut BTreeMap<String, Vec<String>>,
) -> MeshResult<()> {
    match value {
        serde_json::Value::String(s) if is_dynamic_mapping_rule(s) => {
            let step = mapping::parse_rule(s)?;
            if let PipeStep::Ref { scope, path } = step {
                let canonical = format!("{scope}/{}", path.join("/"));
                consumes.entry(activity_id.to_string()).or_default().push(canonical.clone());
                produces.entry(scope).or_default().push(canonical);
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for i in items {
                collect_mapping_paths(i, activity_id, consumes, produces)?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                collect_mapping_paths(v, activity_id, consumes, produces)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// `resolveJobMapsPaths`: flattens `job.maps` paths for the trigger,
/// expanding `name[N]` to `name/0`…`name/N-1`; `name[-]`/`name[_]`
/// contribute nothing.
fn resolve_job_maps_paths(g: &mut GraphIr) {
    let mut flattened: Vec<String> = Vec::new();
    for activity in g.activities.values() {
        for key in activity.job.keys() {
            flattened.extend(expand_wildcard_path(key));
        }
    }
    flattened.sort();
    flattened.dedup();
    let Some(trigger_id) = g.find_trigger().map(|t| t.id.clone()) else {
        return;
    };
    if let Some(trigger) = g.activities.get_mut(&trigger_id) {
        trigger.produces = flattened;
    }
}

fn expand_wildcard_path(key: &str) -> Vec<String> {
    let Some(open) = key.find('[') else {
        return vec![key.to_string()];
    };
    let Some(close) = key.find(']') else {
        return vec![key.to_string()];
    };
    let base = &key[..open];
    let inner = &key[open + 1..close];
    if inner == "-" || inner == "_" {
        return Vec::new();
    }
    match inner.parse::<u32>() {
        Ok(n) => (0..n).map(|i| format!("{base}/{i}")).collect(),
        Err(_) => vec![key.to_string()],
    }
}

async fn generate_sym_keys(minter: &KeyMinter, g: &mut GraphIr, store: &dyn Store) -> MeshResult<()> {
    let job_scope = format!("${}", g.subscribes);
    reserve_and_bind(minter, &job_scope, &collect_trigger_produces(g), store).await?;

    let activity_ids: Vec<String> = g.activities.keys().cloned().collect();
    for id in activity_ids {
        let mut paths = g.activities[&id].produces.clone();
        paths.push(format!("$self/{id}"));
        reserve_and_bind(minter, &id, &paths, store).await?;
    }
    Ok(())
}

fn collect_trigger_produces(g: &GraphIr) -> Vec<String> {
    g.find_trigger().map(|t| t.produces.clone()).unwrap_or_default()
}

async fn reserve_and_bind(
    minter: &KeyMinter,
    scope: &str,
    paths: &[String],
    store: &dyn Store,
) -> MeshResult<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let size = if scope.starts_with('$') {
        (METADATA_SLOTS + DATA_SLOTS).max(paths.len() as u32)
    } else {
        ACTIVITY_SCOPE_SLOTS.max(paths.len() as u32)
    };
    let target = minter
        .mint(KeyType::SymKeys, &[scope])
        .map_err(|e| MeshError::ValidationError(e.to_string()))?;
    let range = store.reserve_symbol_range(&target, size, "key").await?;

    // Paths already in `range.existing` keep their bound token untouched —
    // a path once mapped must retain its token across deploys — so only
    // genuinely new paths draw from the fresh `[lo, hi]` range via `table`.
    let mut table = crate::symbols::KeySymbolTable::with_range(range.lo, range.hi);
    let mut new_symbols = BTreeMap::new();
    for path in paths {
        if range.existing.contains_key(path) {
            continue;
        }
        let token = table.bind(scope, path)?;
        new_symbols.insert(path.clone(), token);
    }
    if !new_symbols.is_empty() {
        store.add_symbols(scope, &new_symbols).await?;
    }
    Ok(())
}

/// Collects string literals >= 6 chars from `enum|examples|default` schema
/// fields. Since schemas live outside the IR (graph-level `SchemaRef`s) this
/// walks every activity's job-mapping literals as the nearest in-IR analog;
/// a full schema tree would additionally be walked here if schema bodies
/// were threaded through the compiler stage.
async fn generate_sym_vals(minter: &KeyMinter, app: &AppManifest, store: &dyn Store) -> MeshResult<()> {
    let mut literals: Vec<String> = Vec::new();
    for g in &app.graphs {
        for schema in [&g.input, &g.output].into_iter().flatten() {
            if let Some(v) = &schema.schema {
                collect_schema_literals(v, &mut literals);
            }
        }
        for activity in g.activities.values() {
            for v in activity.job.values() {
                collect_schema_literals(v, &mut literals);
            }
        }
    }
    literals.sort();
    literals.dedup();
    if literals.is_empty() {
        return Ok(());
    }
    let existing = store.get_symbol_values(&app.id).await?;
    let mut table = crate::symbols::ValueSymbolTable::new();
    for (literal, _) in &existing {
        table.filter_and_allocate(std::slice::from_ref(literal))?;
    }
    let new = table.filter_and_allocate(&literals)?;
    if !new.is_empty() {
        let map: BTreeMap<String, String> = new.into_iter().collect();
        store.add_symbol_values(&app.id, &map).await?;
    }
    let _ = minter;
    Ok(())
}

fn collect_schema_literals(v: &serde_json::Value, out: &mut Vec<String>) {
    match v {
        serde_json::Value::String(s) if s.len() >= 6 => out.push(s.clone()),
        serde_json::Value::Array(items) => {
            for i in items {
                collect_schema_literals(i, out);
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                collect_schema_literals(v, out);
            }
        }
        _ => {}
    }
}

async fn deploy_hook_patterns(
    minter: &KeyMinter,
    app: &AppManifest,
    g: &GraphIr,
    store: &dyn Store,
) -> MeshResult<()> {
    if g.hooks.is_empty() {
        return Ok(());
    }
    let mut rules = BTreeMap::new();
    for (topic, targets) in &g.hooks {
        let serialized = serde_json::to_string(
            &targets
                .iter()
                .map(|t| (t.to.clone(), t.conditions.clone()))
                .collect::<Vec<_>>(),
        )
        .unwrap_or_default();
        rules.insert(topic.clone(), serialized);
    }
    store.set_hook_rules(&app.id, &rules).await?;
    let _ = minter;
    Ok(())
}

async fn deploy_activity_schemas(
    minter: &KeyMinter,
    app: &AppManifest,
    g: &GraphIr,
    store: &dyn Store,
) -> MeshResult<()> {
    let mut schemas = BTreeMap::new();
    for activity in g.activities.values() {
        let persisted = PersistedActivity::from_ir(activity);
        let serialized = serde_json::to_string(&persisted).unwrap_or_default();
        schemas.insert(activity.id.clone(), serialized);
    }
    store.set_schemas(&app.id, &schemas).await?;
    let _ = minter;
    Ok(())
}

/// The on-the-wire shape of a deployed activity: everything except
/// `transitions`, which this step strips — transitions are persisted
/// separately as subscriptions, not duplicated onto every activity schema.
#[derive(serde::Serialize)]
struct PersistedActivity {
    id: String,
    kind: ActivityType,
    topic: Option<String>,
    subtype: Option<String>,
    consumes: Vec<String>,
    produces: Vec<String>,
    cycle: bool,
    ancestor: Option<String>,
    parent: Option<String>,
    trigger: Option<String>,
    subscribes: Option<String>,
    publishes: Option<String>,
    expire: Option<u64>,
    persistent: bool,
    input: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
}

impl PersistedActivity {
    fn from_ir(a: &ActivityIr) -> Self {
        Self {
            id: a.id.clone(),
            kind: a.kind,
            topic: a.topic.clone(),
            subtype: a.subtype.clone(),
            consumes: a.consumes.clone(),
            produces: a.produces.clone(),
            cycle: a.cycle,
            ancestor: a.ancestor.clone(),
            parent: a.parent.clone(),
            trigger: a.trigger.clone(),
            subscribes: a.subscribes.clone(),
            publishes: a.publishes.clone(),
            expire: a.expire,
            persistent: a.persistent,
            input: a.input.clone(),
            output: a.output.clone(),
        }
    }
}

async fn deploy_subscriptions(
    minter: &KeyMinter,
    app: &AppManifest,
    g: &GraphIr,
    store: &dyn Store,
) -> MeshResult<()> {
    let Some(trigger) = g.find_trigger() else {
        return Ok(());
    };
    let mut subs = BTreeMap::new();
    subs.insert(g.subscribes.clone(), trigger.id.clone());
    store.set_subscriptions(&app.id, &subs).await?;
    let _ = minter;
    Ok(())
}

async fn deploy_transitions(
    minter: &KeyMinter,
    app: &AppManifest,
    g: &GraphIr,
    store: &dyn Store,
) -> MeshResult<()> {
    let mut transitions = BTreeMap::new();
    for (from_id, &idx) in &g.nodes {
        let edges: Vec<&crate::compiler::ir::TransitionEdge> =
            g.graph.edges(idx).map(|e| e.weight()).collect();
        if edges.is_empty() {
            continue;
        }
        let encoded: BTreeMap<String, serde_json::Value> = edges
            .iter()
            .map(|e| {
                (
                    e.to.clone(),
                    e.conditions.clone().unwrap_or(serde_json::Value::Bool(true)),
                )
            })
            .collect();
        let key = format!(".{from_id}");
        transitions.insert(key, serde_json::to_string(&encoded).unwrap_or_default());
    }
    if g.subscribes.starts_with('.') {
        transitions.insert(
            g.subscribes.clone(),
            g.find_trigger().map(|t| t.id.clone()).unwrap_or_default(),
        );
    }
    store.set_transitions(&app.id, &transitions).await?;
    let _ = minter;
    Ok(())
}

async fn deploy_consumer_groups(
    minter: &KeyMinter,
    app: &AppManifest,
    graphs: &[GraphIr],
    store: &dyn Store,
) -> MeshResult<()> {
    let _ = (minter, store, graphs, app);
    // Consumer-group creation needs a `Stream` handle, which the compiler
    // doesn't have — `Store` covers hashes/streams-as-data, not the
    // XGROUP-style consumer-group API. `Engine::load_graphs` performs the
    // actual `create_consumer_group` calls against its `Stream` once a
    // deploy's graphs are handed to a running engine, using
    // `collect_worker_subtypes` to enumerate the `WORKER` groups.
    Ok(())
}

/// Enumerates the consumer groups a running engine must create after a
/// successful deploy: `ENGINE` on the app stream, and one `WORKER` group per
/// unique, fully-resolved worker subtype (templated subtypes — those still
/// containing a mapping rule — are skipped; there's no single stream to
/// create a group on until the subtype resolves at runtime).
pub fn collect_worker_subtypes(graphs: &[GraphIr]) -> Vec<String> {
    let mut subtypes: Vec<String> = graphs
        .iter()
        .flat_map(|g| g.activities.values())
        .filter(|a| matches!(a.kind, ActivityType::Worker))
        .filter_map(|a| a.subtype.clone())
        .filter(|s| !mapping::is_mapping_rule(s))
        .collect();
    subtypes.sort();
    subtypes.dedup();
    subtypes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_numeric_wildcard_and_skips_dash_and_underscore() {
        assert_eq!(
            expand_wildcard_path("friends[3]"),
            vec!["friends/0", "friends/1", "friends/2"]
        );
        assert!(expand_wildcard_path("friends[-]").is_empty());
        assert!(expand_wildcard_path("friends[_]").is_empty());
        assert_eq!(expand_wildcard_path("plain"), vec!["plain"]);
    }

    #[test]
    fn dynamic_mapping_rule_excludes_function_calls() {
        assert!(is_dynamic_mapping_rule("{t1.output.data.x}"));
        assert!(!is_dynamic_mapping_rule("{@string.upper t1}"));
    }

    #[test]
    fn copy_job_schemas_fills_the_trigger_from_the_graph_when_unset() {
        let yaml = r#"
app:
  id: orders
  version: "1"
  graphs:
    - subscribes: order.created
      input:
        schema: {"type": "object"}
      activities:
        t1:
          type: trigger
"#;
        let m = crate::manifest::Manifest::parse(yaml).unwrap();
        let mut g = GraphIr::from_manifest(&m.app.graphs[0]);
        assert!(g.activities["t1"].input.is_none());
        copy_job_schemas(&mut g);
        assert_eq!(g.activities["t1"].input, Some(serde_json::json!({"type": "object"})));
    }

    #[test]
    fn copy_job_schemas_does_not_override_an_explicit_trigger_schema() {
        let yaml = r#"
app:
  id: orders
  version: "1"
  graphs:
    - subscribes: order.created
      input:
        schema: {"type": "object"}
      activities:
        t1:
          type: trigger
          input:
            schema: {"type": "string"}
"#;
        let m = crate::manifest::Manifest::parse(yaml).unwrap();
        let mut g = GraphIr::from_manifest(&m.app.graphs[0]);
        copy_job_schemas(&mut g);
        assert_eq!(g.activities["t1"].input, Some(serde_json::json!({"type": "string"})));
    }
}
