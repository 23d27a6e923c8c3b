//! Engine: owns one app instance. Dispatches
//! stream messages to the right activity leg, and runs job-completion
//! side effects once an activity's `process` reports [`LegOutcome::Completed`].
//! Implements [`MessageHandler`] so `Router` can drive it and [`ProfileSource`]
//! so `Quorum` can describe it in a `pong`, without either module depending
//! on `Engine` concretely.

use crate::activities::awaiting::AwaitActivity;
use crate::activities::cycle::CycleActivity;
use crate::activities::hook::HookActivity;
use crate::activities::interrupt::InterruptActivity;
use crate::activities::signal::SignalActivity;
use crate::activities::trigger::TriggerActivity;
use crate::activities::worker::WorkerActivity;
use crate::activities::{Activity, ActivityContext, Dimensions, LegOutcome};
use crate::cache::Cache;
use crate::compiler::ir::{ActivityIr, GraphIr};
use crate::compiler::mapping;
use crate::config::EngineConfig;
use crate::error::{MeshError, MeshResult};
use crate::keyminter::{KeyMinter, KeyType};
use crate::manifest::ActivityType;
use crate::quorum::{ProfileSource, QuorumProfile};
use crate::router::MessageHandler;
use crate::store::{InterruptOptions, Store};
use crate::stream::{MessageStatus, MessageType, Stream, StreamMessage, StreamMetadata};
use crate::sub::Sub;
use crate::task_service::{TaskService, TaskSink};
use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::RwLock as SyncRwLock;
use tokio::sync::RwLock;
use tokio::time::Duration;

pub struct Engine {
    app_id: String,
    guid: String,
    minter: KeyMinter,
    store: Arc<dyn Store>,
    stream: Arc<dyn Stream>,
    sub: Arc<dyn Sub>,
    #[allow(dead_code)]
    cache: Arc<Cache>,
    stream_key: String,
    graphs: RwLock<Vec<GraphIr>>,
    app_version: SyncRwLock<String>,
    task_service: Arc<TaskService>,
}

enum HookKind {
    Web,
    Time,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        minter: KeyMinter,
        store: Arc<dyn Store>,
        stream: Arc<dyn Stream>,
        sub: Arc<dyn Sub>,
        cache: Arc<Cache>,
    ) -> Self {
        let stream_key = minter
            .mint(KeyType::Streams, &[&config.app_id])
            .unwrap_or_else(|_| format!("hmsh:{}:streams:{}", config.namespace, config.app_id));
        let task_service = Arc::new(TaskService::new(config.app_id.clone(), store.clone(), config.tunables));
        Self {
            app_id: config.app_id.clone(),
            guid: config.guid.clone(),
            minter,
            store,
            stream,
            sub,
            cache,
            stream_key,
            graphs: RwLock::new(Vec::new()),
            app_version: SyncRwLock::new(String::new()),
            task_service,
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Records the active app version so freshly built `trigger` activities
    /// can stamp `vrs` on the jobs they create (set alongside
    /// [`Self::load_graphs`] when a deploy activates).
    pub fn set_app_version(&self, version: impl Into<String>) {
        *self.app_version.write().unwrap_or_else(|e| e.into_inner()) = version.into();
    }

    /// Swap in the compiled graphs for the active app version (called after
    /// `Deployer::deploy`/`Quorum::activate` observes a new version).
    ///
    /// `Deployer::deploy`'s step 16 only computes which consumer groups a
    /// deploy needs; it has no `Stream` handle to create them with. This is
    /// the engine-side half: it creates the `ENGINE` group the `Router`
    /// reads transitions/awaits/results from, plus one `WORKER-<subtype>`
    /// group per resolved worker subtype, before the new graphs go live.
    pub async fn load_graphs(&self, graphs: Vec<GraphIr>) -> MeshResult<()> {
        self.stream.create_consumer_group(&self.stream_key, "ENGINE").await?;
        for subtype in crate::compiler::deploy::collect_worker_subtypes(&graphs) {
            let group = format!("WORKER-{subtype}");
            self.stream.create_consumer_group(&self.stream_key, &group).await?;
        }
        *self.graphs.write().await = graphs;
        Ok(())
    }

    fn build_activity(&self, graph: &GraphIr, activity_id: &str) -> Option<Box<dyn Activity>> {
        let ir = graph.activities.get(activity_id)?;
        let outgoing: Vec<String> = graph.outgoing(activity_id).into_iter().map(|e| e.to.clone()).collect();
        let activity: Box<dyn Activity> = match ir.kind {
            ActivityType::Trigger | ActivityType::Activity => Box::new(TriggerActivity {
                initial_status: outgoing.len() as f64,
                outgoing,
                app_version: self.app_version.read().unwrap_or_else(|e| e.into_inner()).clone(),
            }),
            ActivityType::Worker => Box::new(WorkerActivity {
                subtype: ir.subtype.clone().unwrap_or_default(),
                outgoing,
            }),
            ActivityType::Await => Box::new(AwaitActivity {
                child_topic: ir.topic.clone().unwrap_or_default(),
                bound: !matches!(ir.job.get("await"), Some(Json::Bool(false))),
            }),
            ActivityType::Hook => Box::new(HookActivity {
                guid: format!("syn:{activity_id}"),
                outgoing,
                reentries: 1,
            }),
            ActivityType::Signal => Box::new(SignalActivity {
                topic: ir.topic.clone().unwrap_or_default(),
                key: ir.job.get("key").and_then(Json::as_str).unwrap_or_default().to_string(),
            }),
            ActivityType::Cycle => Box::new(CycleActivity {
                ancestor_id: ir.ancestor.clone().unwrap_or_default(),
            }),
            ActivityType::Interrupt => Box::new(InterruptActivity {
                options: interrupt_options_from_job(&ir.job),
            }),
        };
        Some(activity)
    }

    async fn activity_for(&self, activity_id: &str) -> MeshResult<Box<dyn Activity>> {
        let graphs = self.graphs.read().await;
        let graph = graphs
            .iter()
            .find(|g| g.activities.contains_key(activity_id))
            .ok_or_else(|| MeshError::ValidationError(format!("unknown activity {activity_id}")))?;
        self.build_activity(graph, activity_id)
            .ok_or_else(|| MeshError::ValidationError(format!("unknown activity {activity_id}")))
    }

    /// Same lookup as [`Self::activity_for`], but also hands back the
    /// compiled IR so the caller can resolve `job.maps` before running the
    /// leg (spec §4.8 "Mapping resolution").
    async fn activity_and_ir(&self, activity_id: &str) -> MeshResult<(Box<dyn Activity>, ActivityIr)> {
        let graphs = self.graphs.read().await;
        let graph = graphs
            .iter()
            .find(|g| g.activities.contains_key(activity_id))
            .ok_or_else(|| MeshError::ValidationError(format!("unknown activity {activity_id}")))?;
        let ir = graph
            .activities
            .get(activity_id)
            .cloned()
            .ok_or_else(|| MeshError::ValidationError(format!("unknown activity {activity_id}")))?;
        let activity = self
            .build_activity(graph, activity_id)
            .ok_or_else(|| MeshError::ValidationError(format!("unknown activity {activity_id}")))?;
        Ok((activity, ir))
    }

    /// Resolve an activity's `job` mapping rules into concrete data by
    /// reading its `consumes` paths out of the job hash and running them
    /// through the `Pipe` interpreter. Activities with no dynamic mappings
    /// (an empty `job` map) skip the store round-trip entirely.
    async fn resolve_job_maps(&self, ir: &ActivityIr, job_id: &str) -> MeshResult<serde_json::Map<String, Json>> {
        if ir.job.is_empty() {
            return Ok(serde_json::Map::new());
        }
        let raw = self.store.get_state(job_id, &ir.consumes).await.unwrap_or_default();
        let dependency_state = raw
            .into_iter()
            .map(|(k, v)| {
                let value = serde_json::from_str(&v).unwrap_or(Json::String(v));
                (k, value)
            })
            .collect();
        mapping::resolve_job_maps(&ir.job, &dependency_state, chrono::Utc::now().timestamp_millis())
    }

    async fn trigger_for_topic(&self, topic: &str) -> MeshResult<String> {
        let graphs = self.graphs.read().await;
        let graph = graphs
            .iter()
            .find(|g| g.subscribes == topic)
            .ok_or_else(|| MeshError::ValidationError(format!("no graph subscribes to {topic}")))?;
        let trigger = graph
            .find_trigger()
            .ok_or_else(|| MeshError::ValidationError(format!("graph for {topic} has no trigger")))?;
        Ok(trigger.id.clone())
    }

    async fn publishes_for(&self, activity_id: &str) -> Option<String> {
        let graphs = self.graphs.read().await;
        graphs
            .iter()
            .find(|g| g.activities.contains_key(activity_id))
            .and_then(|g| g.publishes.clone())
    }

    fn context_for(&self, msg: &StreamMessage, activity_id: &str, job_id: String) -> ActivityContext<'_> {
        ActivityContext {
            app_id: self.app_id.clone(),
            activity_id: activity_id.to_string(),
            job_id,
            dims: Dimensions(msg.metadata.pd.clone().unwrap_or_else(|| ",0".to_string())),
            minter: &self.minter,
            store: self.store.clone(),
            metadata: msg.metadata.clone(),
            data: to_activity_data(&msg.data),
            hook_data: None,
        }
    }

    async fn dispatch(&self, msg: StreamMessage) -> MeshResult<()> {
        let job_id = msg.metadata.jid.clone();
        let activity_id = msg.metadata.aid.clone();
        let result = match msg.kind {
            MessageType::Timehook => self.dispatch_hook_event(msg, HookKind::Time).await,
            MessageType::Webhook => self.dispatch_hook_event(msg, HookKind::Web).await,
            MessageType::Transition => self.dispatch_transition(msg).await,
            MessageType::Await => self.dispatch_await(msg).await,
            MessageType::Result => self.dispatch_result(msg).await,
            MessageType::Worker => self.dispatch_worker_result(msg).await,
        };
        if let Err(e) = &result {
            tracing::warn!(job_id = %job_id, activity_id = %activity_id, error = %e, "engine dispatch failed");
        }
        result
    }

    async fn dispatch_transition(&self, msg: StreamMessage) -> MeshResult<()> {
        let activity_id = msg.metadata.aid.clone();
        let job_id = msg.metadata.jid.clone();
        let (activity, ir) = self.activity_and_ir(&activity_id).await?;
        let mapped = self.resolve_job_maps(&ir, &job_id).await?;
        let mut ctx = self.context_for(&msg, &activity_id, job_id);
        ctx.data.extend(mapped);
        let outcome = activity.process(&mut ctx).await?;
        self.apply_outcome(&msg, outcome).await
    }

    /// A new subordinate job requested by an `await` activity elsewhere in
    /// the mesh: find the trigger for the child topic and run it, carrying
    /// the `pj`/`pa`/`pg`/`pd` parent linkage `AwaitActivity::process` already
    /// stamped onto `metadata`.
    async fn dispatch_await(&self, msg: StreamMessage) -> MeshResult<()> {
        let topic = msg
            .metadata
            .topic
            .clone()
            .ok_or_else(|| MeshError::ValidationError("await message missing topic".to_string()))?;
        let activity_id = self.trigger_for_topic(&topic).await?;
        let activity = self.activity_for(&activity_id).await?;
        let job_id = if msg.metadata.jid.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            msg.metadata.jid.clone()
        };
        let mut ctx = self.context_for(&msg, &activity_id, job_id);
        let outcome = activity.process(&mut ctx).await?;
        self.apply_outcome(&msg, outcome).await
    }

    /// A subordinate job's result, delivered back to the parent's `await`
    /// activity. Detached awaits
    /// never carry `pj`/`pa`, so there's nothing to resume.
    async fn dispatch_result(&self, msg: StreamMessage) -> MeshResult<()> {
        let Some(job_id) = msg.metadata.pj.clone() else {
            return Ok(());
        };
        let Some(activity_id) = msg.metadata.pa.clone() else {
            return Err(MeshError::ValidationError("result message missing pa".to_string()));
        };
        let activity = self.activity_for(&activity_id).await?;
        let status = msg.status.clone().unwrap_or(MessageStatus::Success);
        let code = msg.code.unwrap_or(200);
        let mut ctx = self.context_for(&msg, &activity_id, job_id);
        let outcome = activity.process_event(&mut ctx, status, code).await?;
        self.apply_outcome(&msg, outcome).await
    }

    /// The worker-response default branch: any
    /// message type not named above is a worker's reply.
    async fn dispatch_worker_result(&self, msg: StreamMessage) -> MeshResult<()> {
        let activity_id = msg.metadata.aid.clone();
        let activity = self.activity_for(&activity_id).await?;
        let status = msg.status.clone().unwrap_or(MessageStatus::Success);
        let code = msg.code.unwrap_or(200);
        let job_id = msg.metadata.jid.clone();
        let mut ctx = self.context_for(&msg, &activity_id, job_id);
        let outcome = activity.process_event(&mut ctx, status, code).await?;
        self.apply_outcome(&msg, outcome).await
    }

    async fn dispatch_hook_event(&self, msg: StreamMessage, kind: HookKind) -> MeshResult<()> {
        let activity_id = msg.metadata.aid.clone();
        let activity = self.activity_for(&activity_id).await?;
        let status = msg.status.clone().unwrap_or(MessageStatus::Success);
        let code = msg.code.unwrap_or(200);
        let job_id = msg.metadata.jid.clone();
        let mut ctx = self.context_for(&msg, &activity_id, job_id);
        let outcome = match kind {
            HookKind::Web => activity.process_web_hook_event(&mut ctx, status, code).await?,
            HookKind::Time => activity.process_time_hook_event(&mut ctx).await?,
        };
        self.apply_outcome(&msg, outcome).await
    }

    async fn apply_outcome(&self, msg: &StreamMessage, outcome: LegOutcome) -> MeshResult<()> {
        match outcome {
            LegOutcome::Transitioned(messages) => {
                for m in messages {
                    self.stream.publish_message(&self.stream_key, &m).await?;
                }
                Ok(())
            }
            LegOutcome::Completed => self.run_job_completion_tasks(msg).await,
            LegOutcome::NoOp => Ok(()),
        }
    }

    /// `runJobCompletionTasks`: notify the binding parent unless
    /// severed by `px`, deliver a one-time quorum job result when the job
    /// carries an `ngn` generator binding, publish permanently when the
    /// owning graph declares `publishes`, and register for cleanup unless
    /// the job opted into `emit` (explicit retention).
    async fn run_job_completion_tasks(&self, msg: &StreamMessage) -> MeshResult<()> {
        let meta = &msg.metadata;
        let job_id = if meta.jid.is_empty() {
            meta.pj.clone().unwrap_or_default()
        } else {
            meta.jid.clone()
        };

        if let (Some(pj), Some(pa)) = (&meta.pj, &meta.pa) {
            if meta.px != Some(true) {
                let result = StreamMessage {
                    kind: MessageType::Result,
                    status: Some(MessageStatus::Success),
                    code: Some(200),
                    metadata: StreamMetadata {
                        jid: job_id.clone(),
                        pj: Some(pj.clone()),
                        pa: Some(pa.clone()),
                        pg: meta.pg.clone(),
                        pd: meta.pd.clone(),
                        ..Default::default()
                    },
                    data: BTreeMap::new(),
                    stack: None,
                };
                self.stream.publish_message(&self.stream_key, &result).await?;
            }
        }

        let state = self
            .store
            .get_state(&job_id, &["ngn".to_string(), "emit".to_string()])
            .await?;

        if let Some(ngn) = state.get("ngn") {
            let payload = serde_json::json!({"type": "job", "guid": ngn, "job": job_id});
            self.sub.publish("quorum", &payload, &self.app_id, None).await?;
        }

        if let Some(topic) = self.publishes_for(&meta.aid).await {
            self.pub_(&topic, Json::Null).await?;
        }

        let retained = state.get("emit").map(|v| v == "true").unwrap_or(false);
        if !retained {
            self.task_service.register_job_for_cleanup(&job_id, None).await?;
        }
        tracing::debug!(job_id = %job_id, activity_id = %meta.aid, "job completion tasks ran");
        Ok(())
    }

    /// `pub(topic, data)`: fire a new job at the trigger subscribed to
    /// `topic`.
    pub async fn pub_(&self, topic: &str, data: Json) -> MeshResult<()> {
        let activity_id = self.trigger_for_topic(topic).await?;
        let message = StreamMessage {
            kind: MessageType::Transition,
            status: None,
            code: None,
            metadata: StreamMetadata {
                jid: uuid::Uuid::new_v4().to_string(),
                aid: activity_id,
                topic: Some(topic.to_string()),
                ..Default::default()
            },
            data: json_to_map(data),
            stack: None,
        };
        self.stream.publish_message(&self.stream_key, &message).await.map(|_| ())
    }

    /// `pubsub(topic, data, timeout)`: `pub` then block for the matching
    /// `result` until `timeout` elapses.
    pub async fn pubsub(&self, topic: &str, data: Json, timeout: Duration) -> MeshResult<Json> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let sub_id = self
            .sub
            .subscribe(
                "result",
                &self.app_id,
                None,
                Arc::new(move |payload: Json| {
                    if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                        let _ = tx.send(payload);
                    }
                }),
            )
            .await?;
        self.pub_(topic, data).await?;
        let outcome = tokio::time::timeout(timeout, rx).await;
        let _ = self.sub.unsubscribe(sub_id).await;
        match outcome {
            Ok(Ok(payload)) => Ok(payload),
            _ => Err(MeshError::Timeout { what: format!("pubsub({topic})") }),
        }
    }
}

#[async_trait]
impl MessageHandler for Engine {
    async fn handle(&self, data: StreamMessage) -> MeshResult<()> {
        self.dispatch(data).await
    }
}

impl ProfileSource for Engine {
    fn profile(&self) -> QuorumProfile {
        // `counts` is intentionally empty here: Router owns the live
        // per-topic tally behind an async RwLock, and this trait method is
        // synchronous (`Quorum` calls it from inside a pub/sub callback).
        // The profile's identity/health fields still make it a useful pong.
        QuorumProfile {
            engine_id: self.guid.clone(),
            stream: self.stream_key.clone(),
            counts: BTreeMap::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            throttle: 0,
            reclaim_delay_ms: 0,
            reclaim_count: 0,
            system_health: "ok".to_string(),
            worker_topic: None,
        }
    }
}

#[async_trait]
impl TaskSink for Engine {
    async fn hook_web(&self, topic: &str, data: Json, status: &str, code: i32) -> MeshResult<()> {
        let msg = StreamMessage {
            kind: MessageType::Webhook,
            status: Some(parse_status(status)),
            code: Some(code),
            metadata: StreamMetadata {
                topic: Some(topic.to_string()),
                aid: topic.to_string(),
                ..Default::default()
            },
            data: json_to_map(data),
            stack: None,
        };
        self.dispatch(msg).await
    }

    async fn hook_time(&self, job_id: &str, g_id: &str, activity_id: &str) -> MeshResult<()> {
        let msg = StreamMessage {
            kind: MessageType::Timehook,
            status: Some(MessageStatus::Success),
            code: Some(200),
            metadata: StreamMetadata {
                jid: job_id.to_string(),
                gid: g_id.to_string(),
                aid: activity_id.to_string(),
                ..Default::default()
            },
            data: BTreeMap::new(),
            stack: None,
        };
        self.dispatch(msg).await
    }

    async fn interrupt(&self, topic: &str, job_id: &str, options: InterruptOptions) -> MeshResult<()> {
        self.store.interrupt(topic, job_id, options).await
    }
}

fn parse_status(s: &str) -> MessageStatus {
    match s {
        "error" => MessageStatus::Error,
        "pending" => MessageStatus::Pending,
        _ => MessageStatus::Success,
    }
}

fn to_activity_data(data: &BTreeMap<String, Json>) -> serde_json::Map<String, Json> {
    data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn json_to_map(data: Json) -> BTreeMap<String, Json> {
    match data {
        Json::Object(map) => map.into_iter().collect(),
        Json::Null => BTreeMap::new(),
        other => {
            let mut m = BTreeMap::new();
            m.insert("value".to_string(), other);
            m
        }
    }
}

fn interrupt_options_from_job(job: &BTreeMap<String, Json>) -> InterruptOptions {
    InterruptOptions {
        // `options.throw !== false`: persist the error unless explicitly suppressed.
        throw: job.get("throw").and_then(Json::as_bool).unwrap_or(true),
        suppress: job.get("suppress").and_then(Json::as_bool).unwrap_or(false),
        expire: job.get("expire").and_then(Json::as_u64),
        descend: job.get("descend").and_then(Json::as_bool).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::store::{AppRecord, Command, NextTask, SymbolRange, Transaction};
    use std::collections::BTreeMap as Map;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        state: Mutex<Map<String, Map<String, String>>>,
        collate_counter: Mutex<f64>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn get_app(&self, _app_id: &str) -> MeshResult<Option<AppRecord>> {
            Ok(None)
        }
        async fn set_app(&self, _app: &AppRecord, _tx: Option<&mut Transaction>) -> MeshResult<()> {
            Ok(())
        }
        async fn activate_app_version(&self, _app_id: &str, _version: &str) -> MeshResult<()> {
            Ok(())
        }
        async fn reserve_scout_role(&self, _kind: &str, _ttl_sec: u64) -> MeshResult<bool> {
            Ok(true)
        }
        async fn reserve_symbol_range(&self, _t: &str, _s: u32, _k: &str) -> MeshResult<SymbolRange> {
            Ok(SymbolRange { lo: 0, hi: 0, existing: Map::new() })
        }
        async fn get_symbols(&self, _scope: &str) -> MeshResult<Map<String, String>> {
            Ok(Map::new())
        }
        async fn add_symbols(&self, _s: &str, _m: &Map<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_symbol_values(&self, _app_id: &str) -> MeshResult<Map<String, String>> {
            Ok(Map::new())
        }
        async fn add_symbol_values(&self, _a: &str, _m: &Map<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_symbol_keys(&self, _scope: &str) -> MeshResult<Vec<String>> {
            Ok(vec![])
        }
        async fn get_all_symbols(&self, _app_id: &str) -> MeshResult<Map<String, Map<String, String>>> {
            Ok(Map::new())
        }
        async fn set_state(
            &self,
            job_id: &str,
            fields: &Map<String, String>,
            _status: Option<f64>,
            _tx: Option<&mut Transaction>,
        ) -> MeshResult<()> {
            self.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(job_id.to_string())
                .or_default()
                .extend(fields.clone());
            Ok(())
        }
        async fn get_state(&self, job_id: &str, _fields: &[String]) -> MeshResult<Map<String, String>> {
            Ok(self.state.lock().unwrap().get(job_id).cloned().unwrap_or_default())
        }
        async fn get_query_state(&self, _j: &str, _f: &[String]) -> MeshResult<Map<String, String>> {
            Ok(Map::new())
        }
        async fn collate(&self, _j: &str, _a: &str, delta: f64, _tx: Option<&mut Transaction>) -> MeshResult<f64> {
            let mut c = self.collate_counter.lock().unwrap();
            *c -= delta;
            Ok(*c)
        }
        async fn collate_synthetic(&self, _j: &str, _g: &str, delta: f64, _tx: Option<&mut Transaction>) -> MeshResult<f64> {
            let mut c = self.collate_counter.lock().unwrap();
            *c -= delta;
            Ok(*c)
        }
        async fn set_status(&self, _j: &str, _d: f64) -> MeshResult<f64> {
            Ok(0.0)
        }
        async fn set_state_nx(&self, _j: &str, status: Option<f64>, _e: Option<&str>) -> MeshResult<bool> {
            *self.collate_counter.lock().unwrap() = status.unwrap_or(0.0);
            Ok(true)
        }
        async fn set_schemas(&self, _a: &str, _s: &Map<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_schemas(&self, _a: &str) -> MeshResult<Map<String, String>> {
            Ok(Map::new())
        }
        async fn set_subscriptions(&self, _a: &str, _s: &Map<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_subscriptions(&self, _a: &str) -> MeshResult<Map<String, String>> {
            Ok(Map::new())
        }
        async fn get_subscription(&self, _a: &str, _t: &str) -> MeshResult<Option<String>> {
            Ok(None)
        }
        async fn set_transitions(&self, _a: &str, _t: &Map<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_transitions(&self, _a: &str) -> MeshResult<Map<String, String>> {
            Ok(Map::new())
        }
        async fn set_hook_rules(&self, _a: &str, _r: &Map<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_hook_rules(&self, _a: &str) -> MeshResult<Map<String, String>> {
            Ok(Map::new())
        }
        async fn set_hook_signal(&self, _a: &str, _t: &str, _k: &str, _j: &str) -> MeshResult<()> {
            Ok(())
        }
        async fn get_hook_signal(&self, _a: &str, _t: &str, _k: &str) -> MeshResult<Option<String>> {
            Ok(None)
        }
        async fn delete_hook_signal(&self, _a: &str, _t: &str, _k: &str) -> MeshResult<()> {
            Ok(())
        }
        async fn add_task_queues(&self, _keys: &[String]) -> MeshResult<()> {
            Ok(())
        }
        async fn get_active_task_queue(&self) -> MeshResult<Option<String>> {
            Ok(None)
        }
        async fn process_task_queue(&self, _src: &str, _dst: &str) -> MeshResult<Option<String>> {
            Ok(None)
        }
        async fn delete_processed_task_queue(&self, _i: &str, _k: &str, _p: &str, _s: bool) -> MeshResult<()> {
            Ok(())
        }
        async fn register_time_hook(
            &self,
            _j: &str,
            _g: &str,
            _a: &str,
            _t: &str,
            _at: i64,
            _d: Option<&str>,
            _tx: Option<&mut Transaction>,
        ) -> MeshResult<()> {
            Ok(())
        }
        async fn get_next_task(&self, _list_key: Option<&str>) -> MeshResult<Option<NextTask>> {
            Ok(None)
        }
        async fn interrupt(&self, _t: &str, _j: &str, _o: InterruptOptions) -> MeshResult<()> {
            Ok(())
        }
        async fn scrub(&self, _job_id: &str) -> MeshResult<()> {
            Ok(())
        }
        async fn find_jobs(&self, _p: &str, _l: u32, _b: u32, _c: Option<String>) -> MeshResult<(Option<String>, Vec<String>)> {
            Ok((None, vec![]))
        }
        async fn set_throttle_rate(&self, _t: Option<&str>, _r: i64) -> MeshResult<()> {
            Ok(())
        }
        async fn get_throttle_rates(&self) -> MeshResult<Map<String, i64>> {
            Ok(Map::new())
        }
        async fn get_throttle_rate(&self, _t: &str) -> MeshResult<i64> {
            Ok(0)
        }
        async fn commit(&self, tx: Transaction) -> MeshResult<()> {
            let _ = tx;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeStream {
        published: Mutex<Vec<StreamMessage>>,
    }

    #[async_trait]
    impl Stream for FakeStream {
        async fn create_consumer_group(&self, _stream: &str, _group: &str) -> MeshResult<()> {
            Ok(())
        }
        async fn publish_message(&self, _stream: &str, data: &StreamMessage) -> MeshResult<String> {
            self.published.lock().unwrap_or_else(|e| e.into_inner()).push(data.clone());
            Ok("1-0".to_string())
        }
        async fn read_one(&self, _s: &str, _g: &str, _c: &str) -> MeshResult<Option<(String, StreamMessage)>> {
            Ok(None)
        }
        async fn ack(&self, _s: &str, _g: &str, _id: &str, _d: bool) -> MeshResult<()> {
            Ok(())
        }
        async fn pending(&self, _s: &str, _g: &str) -> MeshResult<Vec<crate::stream::PendingMessage>> {
            Ok(vec![])
        }
        async fn reclaim(&self, _s: &str, _g: &str, _c: &str, _m: u64) -> MeshResult<Vec<String>> {
            Ok(vec![])
        }
        async fn xlen(&self, _s: &str) -> MeshResult<u64> {
            Ok(0)
        }
    }

    struct FakeSub;

    #[async_trait]
    impl Sub for FakeSub {
        async fn publish(&self, _k: &str, _p: &Json, _a: &str, _s: Option<&str>) -> MeshResult<()> {
            Ok(())
        }
        async fn subscribe(&self, _k: &str, _a: &str, _s: Option<&str>, _cb: crate::sub::SubCallback) -> MeshResult<crate::sub::SubscriptionId> {
            Ok(1)
        }
        async fn psubscribe(&self, _k: &str, _a: &str, _p: &str, _cb: crate::sub::SubCallback) -> MeshResult<crate::sub::SubscriptionId> {
            Ok(1)
        }
        async fn unsubscribe(&self, _id: crate::sub::SubscriptionId) -> MeshResult<()> {
            Ok(())
        }
        async fn punsubscribe(&self, _id: crate::sub::SubscriptionId) -> MeshResult<()> {
            Ok(())
        }
    }

    fn build_engine() -> Engine {
        let config = EngineConfig::new("test", "app1", "engine1");
        let minter = KeyMinter::new("test");
        let store: Arc<dyn Store> = Arc::new(FakeStore::default());
        let stream: Arc<dyn Stream> = Arc::new(FakeStream::default());
        let sub: Arc<dyn Sub> = Arc::new(FakeSub);
        let cache = Arc::new(Cache::new());
        Engine::new(&config, minter, store, stream, sub, cache)
    }

    fn single_trigger_graph() -> GraphIr {
        let yaml = r#"
app:
  id: orders
  version: "1"
  graphs:
    - subscribes: order.created
      activities:
        t1:
          type: trigger
"#;
        let m = Manifest::parse(yaml).unwrap();
        GraphIr::from_manifest(&m.app.graphs[0])
    }

    #[tokio::test]
    async fn transition_dispatch_completes_a_childless_trigger() {
        let engine = build_engine();
        engine.load_graphs(vec![single_trigger_graph()]).await.unwrap();

        let msg = StreamMessage {
            kind: MessageType::Transition,
            status: None,
            code: None,
            metadata: StreamMetadata {
                jid: "job1".to_string(),
                aid: "t1".to_string(),
                topic: Some("order.created".to_string()),
                ..Default::default()
            },
            data: BTreeMap::new(),
            stack: None,
        };

        MessageHandler::handle(&engine, msg).await.unwrap();
    }

    #[tokio::test]
    async fn pub_rejects_unknown_topic() {
        let engine = build_engine();
        engine.load_graphs(vec![single_trigger_graph()]).await.unwrap();
        let err = engine.pub_("no.such.topic", Json::Null).await.unwrap_err();
        assert!(matches!(err, MeshError::ValidationError(_)));
    }

    #[tokio::test]
    async fn pub_publishes_trigger_message_for_known_topic() {
        let engine = build_engine();
        engine.load_graphs(vec![single_trigger_graph()]).await.unwrap();
        engine.pub_("order.created", Json::Null).await.unwrap();
    }

    #[test]
    fn profile_reports_engine_identity() {
        let engine = build_engine();
        let profile = engine.profile();
        assert_eq!(profile.engine_id, "engine1");
    }

    #[tokio::test]
    async fn transition_dispatch_resolves_job_maps_before_running_the_leg() {
        let config = EngineConfig::new("test", "app1", "engine1");
        let minter = KeyMinter::new("test");
        let fake_store = Arc::new(FakeStore::default());
        fake_store.state.lock().unwrap().insert(
            "job1".to_string(),
            Map::from([("t1/output/data/name".to_string(), "\"alice\"".to_string())]),
        );
        let store: Arc<dyn Store> = fake_store;
        let stream = Arc::new(FakeStream::default());
        let sub: Arc<dyn Sub> = Arc::new(FakeSub);
        let cache = Arc::new(Cache::new());
        let engine = Engine::new(&config, minter, store, stream.clone(), sub, cache);

        let mut graph = single_trigger_graph();
        let mut worker_ir = graph.activities.get("t1").unwrap().clone();
        worker_ir.id = "t2".to_string();
        worker_ir.kind = crate::manifest::ActivityType::Worker;
        worker_ir.subtype = Some("send-email".to_string());
        let mut job = Map::new();
        job.insert(
            "greeting".to_string(),
            serde_json::json!("{@string.upper {t1.output.data.name}}"),
        );
        worker_ir.job = job;
        worker_ir.consumes = vec!["t1/output/data/name".to_string()];
        let idx = graph.graph.add_node("t2".to_string());
        graph.nodes.insert("t2".to_string(), idx);
        graph.activities.insert("t2".to_string(), worker_ir);

        engine.load_graphs(vec![graph]).await.unwrap();

        let msg = StreamMessage {
            kind: MessageType::Transition,
            status: None,
            code: None,
            metadata: StreamMetadata {
                jid: "job1".to_string(),
                aid: "t2".to_string(),
                topic: Some("order.created".to_string()),
                ..Default::default()
            },
            data: BTreeMap::new(),
            stack: None,
        };

        MessageHandler::handle(&engine, msg).await.unwrap();

        let published = stream.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].data.get("greeting"),
            Some(&Json::String("ALICE".to_string()))
        );
    }
}
