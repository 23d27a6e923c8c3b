//! TaskService: scheduled work queues
//! (web-hooks, time-hooks, cleanup). Owns the `ZSET`-of-`LIST` time buckets
//! via `Store`; the actual per-job reaction lives behind [`TaskSink`] so this
//! module never depends on `Engine` directly — the same decoupling
//! `Router`/`Quorum` use for their engine callbacks.

use crate::config::Tunables;
use crate::error::MeshResult;
use crate::store::{InterruptOptions, Store};
use async_trait::async_trait;
use serde_json::Value as Json;
use std::sync::Arc;

/// What the engine must do in reaction to a scheduled task firing. One
/// method per task-type branch (`sleep`, `interrupt`/`expire`, `delist`);
/// `child` is intentionally absent — it's a no-op handled by the ancestor.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn hook_web(&self, topic: &str, data: Json, status: &str, code: i32) -> MeshResult<()>;
    async fn hook_time(&self, job_id: &str, g_id: &str, activity_id: &str) -> MeshResult<()>;
    async fn interrupt(&self, topic: &str, job_id: &str, options: InterruptOptions) -> MeshResult<()>;
}

pub struct TaskService {
    app_id: String,
    store: Arc<dyn Store>,
    tunables: Tunables,
}

impl TaskService {
    pub fn new(app_id: impl Into<String>, store: Arc<dyn Store>, tunables: Tunables) -> Self {
        Self { app_id: app_id.into(), store, tunables }
    }

    /// `processWebHooks(handler)`: pop items from the active web-hook queue
    /// and invoke `handler.hook_web`. Runs one drain pass; callers loop it on
    /// their own cadence (mirrors `getNextTask`'s "drain, don't block" shape).
    pub async fn process_web_hooks(&self, sink: &dyn TaskSink) -> MeshResult<u32> {
        let Some(active) = self.store.get_active_task_queue().await? else {
            return Ok(0);
        };
        let processed_key = format!("{active}:processing");
        let mut drained = 0;
        while let Some(item) = self.store.process_task_queue(&active, &processed_key).await? {
            let Some(task) = parse_task(&item) else {
                tracing::warn!(item = %item, "malformed web-hook task, dropping");
                continue;
            };
            sink.hook_web(&task.activity_id, Json::Null, "success", 200).await?;
            self.store
                .delete_processed_task_queue(&item, &active, &processed_key, false)
                .await?;
            drained += 1;
        }
        Ok(drained)
    }

    /// `processTimeHooks(handler)`: scout role `time`; on each fidelity tick
    /// drain `get_next_task` while work exists, dispatching by task type
    ///. Runs one tick; callers `loop { sleep(fidelity); tick()
    /// }` the way `OutboxDispatcher::run` sleeps between claim attempts.
    pub async fn process_time_hooks(&self, sink: &dyn TaskSink) -> MeshResult<u32> {
        let won_scout = self.store.reserve_scout_role("time", self.tunables.fidelity.as_secs().max(1)).await?;
        if !won_scout {
            return Ok(0);
        }
        let mut handled = 0;
        loop {
            let Some(task) = self.store.get_next_task(None).await? else {
                break;
            };
            match task.task_type.as_str() {
                "sleep" => {
                    sink.hook_time(&task.job_id, &task.g_id, &task.activity_id).await?;
                }
                "interrupt" | "expire" => {
                    sink.interrupt(
                        "",
                        &task.job_id,
                        InterruptOptions { throw: false, suppress: true, expire: Some(1), descend: false },
                    )
                    .await?;
                }
                "delist" => {
                    self.store.delete_hook_signal(&self.app_id, "", &task.g_id).await?;
                }
                "child" => {
                    // Handled by the ancestor; this entry is a deliberate no-op.
                }
                other => tracing::warn!(task_type = other, "unknown time-hook task type"),
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// `registerJobForCleanup(jobId, expireSec, opts)`: either expire the job
    /// directly (when `expire_sec == 0`) or enqueue a delayed expire task via
    /// `register_time_hook`, using `expire_default` when the caller supplies
    /// no explicit expiry.
    pub async fn register_job_for_cleanup(&self, job_id: &str, expire_sec: Option<u64>) -> MeshResult<()> {
        let ttl = expire_sec.unwrap_or(self.tunables.expire_default.as_secs());
        if ttl == 0 {
            self.store.scrub(job_id).await?;
            return Ok(());
        }
        let t_at = now_plus_seconds(ttl);
        self.store
            .register_time_hook(job_id, job_id, "cleanup", "expire", t_at, None, None)
            .await
    }
}

struct ParsedTask {
    activity_id: String,
}

/// Decode a `WORK_ITEMS` queue entry: `type|activityId|gId|dad|jobId`.
fn parse_task(raw: &str) -> Option<ParsedTask> {
    let mut parts = raw.splitn(5, '|');
    let _kind = parts.next()?;
    let activity_id = parts.next()?.to_string();
    Some(ParsedTask { activity_id })
}

/// Wall-clock epoch-ms timestamp `secs` in the future.
fn now_plus_seconds(secs: u64) -> i64 {
    chrono::Utc::now().timestamp_millis() + (secs as i64) * 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshResult;
    use crate::store::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        queue: Mutex<Vec<String>>,
        scrubbed: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
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
            Ok(SymbolRange { lo: 0, hi: 0, existing: BTreeMap::new() })
        }
        async fn get_symbols(&self, _scope: &str) -> MeshResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
        async fn add_symbols(&self, _s: &str, _m: &BTreeMap<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_symbol_values(&self, _app_id: &str) -> MeshResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
        async fn add_symbol_values(&self, _a: &str, _m: &BTreeMap<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_symbol_keys(&self, _scope: &str) -> MeshResult<Vec<String>> {
            Ok(vec![])
        }
        async fn get_all_symbols(&self, _app_id: &str) -> MeshResult<BTreeMap<String, BTreeMap<String, String>>> {
            Ok(BTreeMap::new())
        }
        async fn set_state(
            &self,
            _j: &str,
            _f: &BTreeMap<String, String>,
            _s: Option<f64>,
            _tx: Option<&mut Transaction>,
        ) -> MeshResult<()> {
            Ok(())
        }
        async fn get_state(&self, _j: &str, _f: &[String]) -> MeshResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
        async fn get_query_state(&self, _j: &str, _f: &[String]) -> MeshResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
        async fn collate(&self, _j: &str, _a: &str, _d: f64, _tx: Option<&mut Transaction>) -> MeshResult<f64> {
            Ok(0.0)
        }
        async fn collate_synthetic(&self, _j: &str, _g: &str, _d: f64, _tx: Option<&mut Transaction>) -> MeshResult<f64> {
            Ok(0.0)
        }
        async fn set_status(&self, _j: &str, _d: f64) -> MeshResult<f64> {
            Ok(0.0)
        }
        async fn set_state_nx(&self, _j: &str, _s: Option<f64>, _e: Option<&str>) -> MeshResult<bool> {
            Ok(true)
        }
        async fn set_schemas(&self, _a: &str, _s: &BTreeMap<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_schemas(&self, _a: &str) -> MeshResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
        async fn set_subscriptions(&self, _a: &str, _s: &BTreeMap<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_subscriptions(&self, _a: &str) -> MeshResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
        async fn get_subscription(&self, _a: &str, _t: &str) -> MeshResult<Option<String>> {
            Ok(None)
        }
        async fn set_transitions(&self, _a: &str, _t: &BTreeMap<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_transitions(&self, _a: &str) -> MeshResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
        async fn set_hook_rules(&self, _a: &str, _r: &BTreeMap<String, String>) -> MeshResult<()> {
            Ok(())
        }
        async fn get_hook_rules(&self, _a: &str) -> MeshResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
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
            Ok(Some("q1".to_string()))
        }
        async fn process_task_queue(&self, _src: &str, _dst: &str) -> MeshResult<Option<String>> {
            Ok(self.queue.lock().unwrap().pop())
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
        async fn scrub(&self, job_id: &str) -> MeshResult<()> {
            self.scrubbed.lock().unwrap().push(job_id.to_string());
            Ok(())
        }
        async fn find_jobs(
            &self,
            _p: &str,
            _l: u32,
            _b: u32,
            _c: Option<String>,
        ) -> MeshResult<(Option<String>, Vec<String>)> {
            Ok((None, vec![]))
        }
        async fn set_throttle_rate(&self, _t: Option<&str>, _r: i64) -> MeshResult<()> {
            Ok(())
        }
        async fn get_throttle_rates(&self) -> MeshResult<BTreeMap<String, i64>> {
            Ok(BTreeMap::new())
        }
        async fn get_throttle_rate(&self, _t: &str) -> MeshResult<i64> {
            Ok(0)
        }
        async fn commit(&self, _tx: Transaction) -> MeshResult<()> {
            Ok(())
        }
    }

    struct NoopSink;

    #[async_trait::async_trait]
    impl TaskSink for NoopSink {
        async fn hook_web(&self, _topic: &str, _data: Json, _status: &str, _code: i32) -> MeshResult<()> {
            Ok(())
        }
        async fn hook_time(&self, _job_id: &str, _g_id: &str, _activity_id: &str) -> MeshResult<()> {
            Ok(())
        }
        async fn interrupt(&self, _topic: &str, _job_id: &str, _options: InterruptOptions) -> MeshResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn process_web_hooks_drains_queue() {
        let store = Arc::new(FakeStore::default());
        store.queue.lock().unwrap().push("webhook|a1|g1|d1|j1".to_string());
        let svc = TaskService::new("app1", store, Tunables::default());
        let drained = svc.process_web_hooks(&NoopSink).await.unwrap();
        assert_eq!(drained, 1);
    }

    #[test]
    fn parse_task_extracts_activity_id() {
        let t = parse_task("sleep|a1|g1|d1|j1").unwrap();
        assert_eq!(t.activity_id, "a1");
    }

    #[test]
    fn parse_task_rejects_malformed_entries() {
        assert!(parse_task("not-enough-fields").is_none());
    }

    #[tokio::test]
    async fn register_job_for_cleanup_scrubs_on_zero_ttl() {
        let store = Arc::new(FakeStore::default());
        let svc = TaskService::new("app1", store.clone(), Tunables::default());
        svc.register_job_for_cleanup("j1", Some(0)).await.unwrap();
        assert_eq!(store.scrubbed.lock().unwrap().as_slice(), ["j1"]);
    }
}
