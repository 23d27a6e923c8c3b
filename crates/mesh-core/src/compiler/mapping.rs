//! Mapping expression language ("Pipe"): an AST interpreter over a fixed
//! function registry.
//!
//! A mapping statement is either:
//! - a literal JSON value,
//! - a dynamic reference `{a.x.y}` (resolved against job/activity state), or
//! - a function call `{@namespace.name arg1 arg2 ...}`.
//!
//! Functions are total and side-effect-free; an implementer must provide the
//! standard library below. Unknown function references fail the mapping
//! statement (`MeshError::ValidationError`), never panic.

use crate::error::{MeshError, MeshResult};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Context variables bound implicitly during `@reduce` iteration or activity
/// resolution.
pub const CONTEXT_VARS: &[&str] = &["$input", "$output", "$item", "$key", "$index"];
/// System variables always resolvable without a consumes entry.
pub const SYSTEM_VARS: &[&str] = &["$app", "$self", "$graph", "$job"];

/// One step in a resolved pipe: either a dependency reference into job/activity
/// state, or a function application over already-resolved child steps.
#[derive(Clone, Debug, PartialEq)]
pub enum PipeStep {
    Literal(Json),
    /// `{scope.path...}` — a dependency on another activity's (or the job's)
    /// state. `scope` is `$job`/`$self`/an activity id; `path` is the
    /// remaining dot-separated segments.
    Ref { scope: String, path: Vec<String> },
    /// `{@namespace.name}` applied to resolved child steps.
    Call {
        namespace: String,
        name: String,
        args: Vec<PipeStep>,
    },
}

/// A string is a dynamic mapping rule if it's wrapped in braces and the
/// inner content does not start with `@` directly after context-var style
/// dereference syntax... actually: any `{...}` that is NOT a context var
/// literal keyword is a dynamic rule (functions `{@...}` included).
pub fn is_mapping_rule(s: &str) -> bool {
    s.len() >= 2 && s.starts_with('{') && s.ends_with('}')
}

/// Parse one mapping rule string into a `PipeStep`. Grammar (deliberately
/// small — this is not a general expression language):
///
/// ```text
/// rule       := '{' body '}'
/// body       := call | reference
/// call       := '@' namespace '.' name (' ' arg)*
/// arg        := reference | literal
/// reference  := scope ('.' segment)*
/// scope      := '$job' | '$self' | '$app' | '$graph' | '$input' | '$output'
///             | '$item' | '$key' | '$index' | activity_id
/// ```
pub fn parse_rule(raw: &str) -> MeshResult<PipeStep> {
    if !is_mapping_rule(raw) {
        return Err(MeshError::ValidationError(format!(
            "not a mapping rule: {raw}"
        )));
    }
    let body = &raw[1..raw.len() - 1];
    parse_body(body)
}

fn parse_body(body: &str) -> MeshResult<PipeStep> {
    let body = body.trim();
    if let Some(rest) = body.strip_prefix('@') {
        let mut parts = rest.splitn(2, ' ');
        let head = parts.next().unwrap_or_default();
        let args_str = parts.next().unwrap_or_default().trim();
        let (namespace, name) = head
            .split_once('.')
            .ok_or_else(|| MeshError::ValidationError(format!("malformed function ref: {head}")))?;
        if !FUNCTION_REGISTRY.contains(&(namespace, name)) {
            return Err(MeshError::ValidationError(format!(
                "unknown function reference: @{namespace}.{name}"
            )));
        }
        let args = if args_str.is_empty() {
            vec![]
        } else {
            args_str
                .split(',')
                .map(|a| parse_arg(a.trim()))
                .collect::<MeshResult<Vec<_>>>()?
        };
        Ok(PipeStep::Call {
            namespace: namespace.to_string(),
            name: name.to_string(),
            args,
        })
    } else {
        parse_reference(body)
    }
}

fn parse_arg(s: &str) -> MeshResult<PipeStep> {
    if s.starts_with('{') && s.ends_with('}') {
        parse_body(&s[1..s.len() - 1])
    } else if let Ok(v) = serde_json::from_str::<Json>(s) {
        Ok(PipeStep::Literal(v))
    } else {
        Ok(PipeStep::Literal(Json::String(s.to_string())))
    }
}

fn parse_reference(body: &str) -> MeshResult<PipeStep> {
    let mut segments = body.split('.');
    let scope = segments
        .next()
        .ok_or_else(|| MeshError::ValidationError("empty mapping reference".into()))?
        .to_string();
    let path: Vec<String> = segments.map(|s| s.to_string()).collect();
    Ok(PipeStep::Ref { scope, path })
}

/// The closed set of `(namespace, name)` functions this system provides.
/// Total and side-effect-free.
pub static FUNCTION_REGISTRY: &[(&str, &str)] = &[
    ("string", "concat"),
    ("string", "upper"),
    ("string", "lower"),
    ("number", "add"),
    ("number", "sub"),
    ("math", "add"),
    ("math", "sub"),
    ("math", "mul"),
    ("array", "join"),
    ("array", "length"),
    ("object", "set"),
    ("object", "get"),
    ("date", "now"),
    ("cron", "next_delay"),
    ("json", "parse"),
    ("json", "stringify"),
];

/// Evaluate a resolved `PipeStep` against a value-resolver closure. `resolve`
/// looks up `(scope, path)` references in job/activity state; `now_ms`
/// supplies the only non-deterministic primitive (`date.now`) so callers can
/// make it pure for tests.
pub fn evaluate(
    step: &PipeStep,
    resolve: &dyn Fn(&str, &[String]) -> MeshResult<Json>,
    now_ms: i64,
) -> MeshResult<Json> {
    match step {
        PipeStep::Literal(v) => Ok(v.clone()),
        PipeStep::Ref { scope, path } => resolve(scope, path),
        PipeStep::Call {
            namespace,
            name,
            args,
        } => {
            let resolved: Vec<Json> = args
                .iter()
                .map(|a| evaluate(a, resolve, now_ms))
                .collect::<MeshResult<Vec<_>>>()?;
            call_function(namespace, name, &resolved, now_ms)
        }
    }
}

fn call_function(namespace: &str, name: &str, args: &[Json], now_ms: i64) -> MeshResult<Json> {
    match (namespace, name) {
        ("string", "concat") => Ok(Json::String(
            args.iter().map(json_to_display).collect::<Vec<_>>().join(""),
        )),
        ("string", "upper") => Ok(Json::String(first_string(args)?.to_uppercase())),
        ("string", "lower") => Ok(Json::String(first_string(args)?.to_lowercase())),
        ("number", "add") | ("math", "add") => numeric_fold(args, 0.0, |a, b| a + b),
        ("number", "sub") | ("math", "sub") => numeric_fold(args, 0.0, |a, b| a - b),
        ("math", "mul") => numeric_fold(args, 1.0, |a, b| a * b),
        ("array", "join") => {
            let arr = first_array(args)?;
            let sep = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
            Ok(Json::String(
                arr.iter().map(json_to_display).collect::<Vec<_>>().join(sep),
            ))
        }
        ("array", "length") => Ok(Json::Number(first_array(args)?.len().into())),
        ("object", "set") => {
            let mut map: BTreeMap<String, Json> = BTreeMap::new();
            let key = args
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| MeshError::ValidationError("object.set requires a string key".into()))?;
            let value = args.get(1).cloned().unwrap_or(Json::Null);
            map.insert(key.to_string(), value);
            Ok(Json::Object(map.into_iter().collect()))
        }
        ("object", "get") => {
            let obj = args
                .first()
                .and_then(|v| v.as_object())
                .ok_or_else(|| MeshError::ValidationError("object.get requires an object".into()))?;
            let key = args
                .get(1)
                .and_then(|v| v.as_str())
                .ok_or_else(|| MeshError::ValidationError("object.get requires a string key".into()))?;
            Ok(obj.get(key).cloned().unwrap_or(Json::Null))
        }
        ("date", "now") => Ok(Json::Number(now_ms.into())),
        ("cron", "next_delay") => {
            // Minimal, total interpretation: a leading integer in the cron
            // string is read as a millisecond interval; anything else defaults
            // to zero. Full cron parsing is a client-surface concern out of
            // scope here.
            let s = first_string(args)?;
            let ms: i64 = s
                .split_whitespace()
                .next()
                .and_then(|t| t.parse().ok())
                .unwrap_or(0);
            Ok(Json::Number(ms.into()))
        }
        ("json", "parse") => {
            let s = first_string(args)?;
            serde_json::from_str::<Json>(&s)
                .map_err(|e| MeshError::ValidationError(format!("json.parse: {e}")))
        }
        ("json", "stringify") => Ok(Json::String(
            serde_json::to_string(args.first().unwrap_or(&Json::Null))
                .unwrap_or_default(),
        )),
        _ => Err(MeshError::ValidationError(format!(
            "unknown function: @{namespace}.{name}"
        ))),
    }
}

/// Resolve one activity's `job` mapping rules (manifest field -> literal or
/// mapping rule) into concrete output data. `dependency_state` holds the
/// job's current state restricted to this activity's `consumes` paths,
/// keyed the same way `resolveMappingDependencies` canonicalized them
/// (`scope/path/...`). Literal (non-rule) values pass through unchanged,
/// recursing into arrays/objects the same way `collect_mapping_paths` walks
/// the manifest; a reference with no matching dependency state fails the
/// mapping statement rather than defaulting silently, since it means the
/// upstream producer hasn't run yet.
pub fn resolve_job_maps(
    job_maps: &BTreeMap<String, Json>,
    dependency_state: &BTreeMap<String, Json>,
    now_ms: i64,
) -> MeshResult<serde_json::Map<String, Json>> {
    let mut out = serde_json::Map::new();
    for (field, rule) in job_maps {
        out.insert(field.clone(), resolve_value(rule, dependency_state, now_ms)?);
    }
    Ok(out)
}

fn resolve_value(value: &Json, dependency_state: &BTreeMap<String, Json>, now_ms: i64) -> MeshResult<Json> {
    match value {
        Json::String(s) if is_mapping_rule(s) => {
            let step = parse_rule(s)?;
            let resolve = |scope: &str, path: &[String]| -> MeshResult<Json> {
                let canonical = format!("{scope}/{}", path.join("/"));
                dependency_state.get(&canonical).cloned().ok_or_else(|| {
                    MeshError::ValidationError(format!("unresolved mapping reference: {canonical}"))
                })
            };
            evaluate(&step, &resolve, now_ms)
        }
        Json::Array(items) => Ok(Json::Array(
            items
                .iter()
                .map(|v| resolve_value(v, dependency_state, now_ms))
                .collect::<MeshResult<Vec<_>>>()?,
        )),
        Json::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, dependency_state, now_ms)?);
            }
            Ok(Json::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn json_to_display(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn first_string(args: &[Json]) -> MeshResult<String> {
    args.first()
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| MeshError::ValidationError("expected a string argument".into()))
}

fn first_array(args: &[Json]) -> MeshResult<Vec<Json>> {
    args.first()
        .and_then(|v| v.as_array())
        .cloned()
        .ok_or_else(|| MeshError::ValidationError("expected an array argument".into()))
}

fn numeric_fold(args: &[Json], init: f64, f: impl Fn(f64, f64) -> f64) -> MeshResult<Json> {
    let mut acc = init;
    let mut first = true;
    for a in args {
        let n = a
            .as_f64()
            .ok_or_else(|| MeshError::ValidationError("expected a numeric argument".into()))?;
        acc = if first { n } else { f(acc, n) };
        first = false;
    }
    serde_json::Number::from_f64(acc)
        .map(Json::Number)
        .ok_or_else(|| MeshError::ValidationError("numeric overflow".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_rule() {
        let step = parse_rule("{t1.output.data.x}").unwrap();
        match step {
            PipeStep::Ref { scope, path } => {
                assert_eq!(scope, "t1");
                assert_eq!(path, vec!["output", "data", "x"]);
            }
            _ => panic!("expected Ref"),
        }
    }

    #[test]
    fn parses_function_call_rule() {
        let step = parse_rule("{@string.upper {t1.output.data.name}}").unwrap();
        assert!(matches!(step, PipeStep::Call { .. }));
    }

    #[test]
    fn unknown_function_is_rejected() {
        let err = parse_rule("{@nope.nope}").unwrap_err();
        assert!(matches!(err, MeshError::ValidationError(_)));
    }

    #[test]
    fn evaluate_resolves_reference_and_applies_function() {
        let step = parse_rule("{@string.upper {t1.output.data.name}}").unwrap();
        let resolve = |scope: &str, path: &[String]| -> MeshResult<Json> {
            assert_eq!(scope, "t1");
            assert_eq!(path, ["output", "data", "name"]);
            Ok(Json::String("alice".to_string()))
        };
        let result = evaluate(&step, &resolve, 0).unwrap();
        assert_eq!(result, Json::String("ALICE".to_string()));
    }

    #[test]
    fn math_add_is_total_and_deterministic() {
        let step = parse_rule("{@math.add 2, 3}").unwrap();
        let resolve = |_: &str, _: &[String]| -> MeshResult<Json> { Ok(Json::Null) };
        assert_eq!(evaluate(&step, &resolve, 0).unwrap(), Json::from(5.0));
    }

    #[test]
    fn resolve_job_maps_applies_rules_and_passes_through_literals() {
        let mut job_maps = BTreeMap::new();
        job_maps.insert("greeting".to_string(), Json::String("{@string.upper {t1.output.data.name}}".to_string()));
        job_maps.insert("fixed".to_string(), Json::from(7));

        let mut dependency_state = BTreeMap::new();
        dependency_state.insert("t1/output/data/name".to_string(), Json::String("alice".to_string()));

        let resolved = resolve_job_maps(&job_maps, &dependency_state, 0).unwrap();
        assert_eq!(resolved.get("greeting").unwrap(), &Json::String("ALICE".to_string()));
        assert_eq!(resolved.get("fixed").unwrap(), &Json::from(7));
    }

    #[test]
    fn resolve_job_maps_fails_on_missing_dependency() {
        let mut job_maps = BTreeMap::new();
        job_maps.insert("x".to_string(), Json::String("{t1.output.data.missing}".to_string()));
        let err = resolve_job_maps(&job_maps, &BTreeMap::new(), 0).unwrap_err();
        assert!(matches!(err, MeshError::ValidationError(_)));
    }
}
