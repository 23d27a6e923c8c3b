//! In-memory `Store` test double shared by the activity test modules. Not a
//! backend — just enough state (job hash, collation counters, `setStateNX`
//! flags) to drive `Activity::process`/`process_event` without a live
//! Redis/Postgres instance.

use crate::error::MeshResult;
use crate::store::{
    AppRecord, Command, InterruptOptions, NextTask, Store, SymbolRange, Transaction,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeStore {
    pub created: Mutex<BTreeMap<String, bool>>,
    pub state: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    pub collation: Mutex<BTreeMap<(String, String), f64>>,
    pub synthetic: Mutex<BTreeMap<(String, String), f64>>,
    pub hook_signals: Mutex<BTreeMap<(String, String, String), String>>,
}

fn apply(state: &mut BTreeMap<String, BTreeMap<String, String>>, cmd: &Command) {
    match cmd {
        Command::HSet { key, fields } => {
            state.entry(key.clone()).or_default().extend(fields.clone());
        }
        Command::HSetNx { key, field, value } => {
            let entry = state.entry(key.clone()).or_default();
            entry.entry(field.clone()).or_insert_with(|| value.clone());
        }
        Command::HIncrByFloat { key, field, delta } => {
            let entry = state.entry(key.clone()).or_default();
            let current: f64 = entry.get(field).and_then(|v| v.parse().ok()).unwrap_or(0.0);
            entry.insert(field.clone(), (current + delta).to_string());
        }
        Command::HDel { key, fields } => {
            if let Some(entry) = state.get_mut(key) {
                for f in fields {
                    entry.remove(f);
                }
            }
        }
        Command::Del { key } => {
            state.remove(key);
        }
        Command::ZAddNx { .. } | Command::ZRem { .. } | Command::RPush { .. } | Command::Rename { .. } => {}
    }
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
    async fn reserve_symbol_range(
        &self,
        _target: &str,
        size: u32,
        _kind: &str,
    ) -> MeshResult<SymbolRange> {
        Ok(SymbolRange {
            lo: 0,
            hi: size.saturating_sub(1),
            existing: BTreeMap::new(),
        })
    }
    async fn get_symbols(&self, _scope: &str) -> MeshResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
    async fn add_symbols(&self, _scope: &str, _symbols: &BTreeMap<String, String>) -> MeshResult<()> {
        Ok(())
    }
    async fn get_symbol_values(&self, _app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
    async fn add_symbol_values(&self, _app_id: &str, _symbols: &BTreeMap<String, String>) -> MeshResult<()> {
        Ok(())
    }
    async fn get_symbol_keys(&self, _scope: &str) -> MeshResult<Vec<String>> {
        Ok(vec![])
    }
    async fn get_all_symbols(
        &self,
        _app_id: &str,
    ) -> MeshResult<BTreeMap<String, BTreeMap<String, String>>> {
        Ok(BTreeMap::new())
    }
    async fn set_state(
        &self,
        job_id: &str,
        fields: &BTreeMap<String, String>,
        status: Option<f64>,
        tx: Option<&mut Transaction>,
    ) -> MeshResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        let entry = state.entry(job_id.to_string()).or_default();
        entry.extend(fields.clone());
        if let Some(status) = status {
            entry.insert(":".to_string(), status.to_string());
        }
        if let Some(tx) = tx {
            for cmd in &tx.commands {
                apply(&mut state, cmd);
            }
        }
        Ok(())
    }
    async fn get_state(&self, job_id: &str, fields: &[String]) -> MeshResult<BTreeMap<String, String>> {
        let state = self.state.lock().expect("lock poisoned");
        let entry = state.get(job_id).cloned().unwrap_or_default();
        Ok(fields
            .iter()
            .filter_map(|f| entry.get(f).map(|v| (f.clone(), v.clone())))
            .collect())
    }
    async fn get_query_state(&self, job_id: &str, fields: &[String]) -> MeshResult<BTreeMap<String, String>> {
        self.get_state(job_id, fields).await
    }
    async fn collate(
        &self,
        job_id: &str,
        activity_id: &str,
        delta: f64,
        tx: Option<&mut Transaction>,
    ) -> MeshResult<f64> {
        let mut collation = self.collation.lock().expect("lock poisoned");
        let key = (job_id.to_string(), activity_id.to_string());
        let counter = collation.entry(key).or_insert(0.0);
        *counter += delta;
        if let Some(tx) = tx {
            tx.push(Command::HIncrByFloat {
                key: format!("collate:{job_id}:{activity_id}"),
                field: "as".to_string(),
                delta,
            });
        }
        Ok(*counter)
    }
    async fn collate_synthetic(
        &self,
        job_id: &str,
        guid: &str,
        delta: f64,
        _tx: Option<&mut Transaction>,
    ) -> MeshResult<f64> {
        let mut synthetic = self.synthetic.lock().expect("lock poisoned");
        let key = (job_id.to_string(), guid.to_string());
        let counter = synthetic.entry(key).or_insert(0.0);
        *counter += delta;
        Ok(*counter)
    }
    async fn set_status(&self, job_id: &str, delta: f64) -> MeshResult<f64> {
        let mut state = self.state.lock().expect("lock poisoned");
        let entry = state.entry(job_id.to_string()).or_default();
        let current: f64 = entry.get(":").and_then(|v| v.parse().ok()).unwrap_or(0.0);
        let updated = current + delta;
        entry.insert(":".to_string(), updated.to_string());
        Ok(updated)
    }
    async fn set_state_nx(
        &self,
        job_id: &str,
        status: Option<f64>,
        _entity: Option<&str>,
    ) -> MeshResult<bool> {
        let mut created = self.created.lock().expect("lock poisoned");
        if created.contains_key(job_id) {
            return Ok(false);
        }
        created.insert(job_id.to_string(), true);
        if let Some(status) = status {
            let mut state = self.state.lock().expect("lock poisoned");
            state
                .entry(job_id.to_string())
                .or_default()
                .insert(":".to_string(), status.to_string());
        }
        Ok(true)
    }
    async fn set_schemas(&self, _app_id: &str, _schemas: &BTreeMap<String, String>) -> MeshResult<()> {
        Ok(())
    }
    async fn get_schemas(&self, _app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
    async fn set_subscriptions(&self, _app_id: &str, _subs: &BTreeMap<String, String>) -> MeshResult<()> {
        Ok(())
    }
    async fn get_subscriptions(&self, _app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
    async fn get_subscription(&self, _app_id: &str, _topic: &str) -> MeshResult<Option<String>> {
        Ok(None)
    }
    async fn set_transitions(&self, _app_id: &str, _transitions: &BTreeMap<String, String>) -> MeshResult<()> {
        Ok(())
    }
    async fn get_transitions(&self, _app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
    async fn set_hook_rules(&self, _app_id: &str, _rules: &BTreeMap<String, String>) -> MeshResult<()> {
        Ok(())
    }
    async fn get_hook_rules(&self, _app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
    async fn set_hook_signal(&self, app_id: &str, topic: &str, key: &str, job_id: &str) -> MeshResult<()> {
        self.hook_signals.lock().expect("lock poisoned").insert(
            (app_id.to_string(), topic.to_string(), key.to_string()),
            job_id.to_string(),
        );
        Ok(())
    }
    async fn get_hook_signal(&self, app_id: &str, topic: &str, key: &str) -> MeshResult<Option<String>> {
        Ok(self
            .hook_signals
            .lock()
            .expect("lock poisoned")
            .get(&(app_id.to_string(), topic.to_string(), key.to_string()))
            .cloned())
    }
    async fn delete_hook_signal(&self, app_id: &str, topic: &str, key: &str) -> MeshResult<()> {
        self.hook_signals
            .lock()
            .expect("lock poisoned")
            .remove(&(app_id.to_string(), topic.to_string(), key.to_string()));
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
    async fn delete_processed_task_queue(
        &self,
        _item: &str,
        _key: &str,
        _processed_key: &str,
        _scrub: bool,
    ) -> MeshResult<()> {
        Ok(())
    }
    async fn register_time_hook(
        &self,
        _job_id: &str,
        _g_id: &str,
        _activity_id: &str,
        _task_type: &str,
        _t_at: i64,
        _dad: Option<&str>,
        _tx: Option<&mut Transaction>,
    ) -> MeshResult<()> {
        Ok(())
    }
    async fn get_next_task(&self, _list_key: Option<&str>) -> MeshResult<Option<NextTask>> {
        Ok(None)
    }
    async fn interrupt(&self, _topic: &str, job_id: &str, options: InterruptOptions) -> MeshResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        let entry = state.entry(job_id.to_string()).or_default();
        let current: f64 = entry.get(":").and_then(|v| v.parse().ok()).unwrap_or(1.0);
        if current <= 0.0 && !options.suppress {
            return Err(crate::error::MeshError::InterruptConflict {
                job_id: job_id.to_string(),
            });
        }
        entry.insert(":".to_string(), (current - 1_000_000_000.0).to_string());
        Ok(())
    }
    async fn scrub(&self, job_id: &str) -> MeshResult<()> {
        self.state.lock().expect("lock poisoned").remove(job_id);
        Ok(())
    }
    async fn find_jobs(
        &self,
        _pattern: &str,
        _limit: u32,
        _batch: u32,
        _cursor: Option<String>,
    ) -> MeshResult<(Option<String>, Vec<String>)> {
        Ok((None, vec![]))
    }
    async fn set_throttle_rate(&self, _topic: Option<&str>, _rate_ms: i64) -> MeshResult<()> {
        Ok(())
    }
    async fn get_throttle_rates(&self) -> MeshResult<BTreeMap<String, i64>> {
        Ok(BTreeMap::new())
    }
    async fn get_throttle_rate(&self, _topic: &str) -> MeshResult<i64> {
        Ok(0)
    }
    async fn commit(&self, tx: Transaction) -> MeshResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        for cmd in &tx.commands {
            apply(&mut state, cmd);
        }
        Ok(())
    }
}

impl FakeStore {
    pub fn collation_of(&self, job_id: &str, activity_id: &str) -> f64 {
        *self
            .collation
            .lock()
            .expect("lock poisoned")
            .get(&(job_id.to_string(), activity_id.to_string()))
            .unwrap_or(&0.0)
    }
}
