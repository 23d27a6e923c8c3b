//! Store: typed operations over the backend. One
//! async trait implemented by each backend crate (`mesh-store-redis`,
//! `mesh-store-sql`); `mesh-core` holds only the contract and the
//! transaction accumulator, keeping the trait definition backend-agnostic
//! while each crate provides its own concrete implementation.

use crate::error::MeshResult;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// One queued write. A `Transaction` is a plain accumulator — backends
/// translate each command into their native form (Redis MULTI/EXEC queue
/// entries, or parametric SQL statements inside `BEGIN…COMMIT`) and commit
/// them atomically. Activities never hold a backend lock across a
/// suspension point; they build a `Transaction` value and hand it
/// to `Store::commit`.
#[derive(Clone, Debug, Default)]
pub struct Transaction {
    pub commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cmd: Command) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Every write this system ever issues against the job hash / symbol tables
/// / work queues, named close to the underlying operation so a backend's
/// `commit` implementation reads like a direct translation table.
#[derive(Clone, Debug)]
pub enum Command {
    HSet {
        key: String,
        fields: BTreeMap<String, String>,
    },
    HSetNx {
        key: String,
        field: String,
        value: String,
    },
    HIncrByFloat {
        key: String,
        field: String,
        delta: f64,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    Del {
        key: String,
    },
    ZAddNx {
        key: String,
        member: String,
        score: f64,
    },
    ZRem {
        key: String,
        member: String,
    },
    RPush {
        key: String,
        value: String,
    },
    Rename {
        from: String,
        to: String,
    },
}

/// `reserveSymbolRange`'s result: an inclusive `[lo, hi]` range plus whatever
/// symbols the scope already had bound before this call, so the compiler can
/// skip re-binding them — re-deploying the same manifest reserves no new
/// key-symbols.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolRange {
    pub lo: u32,
    pub hi: u32,
    pub existing: BTreeMap<String, String>,
}

/// A single bucket of work popped by `getNextTask`: `(listKey, jobId, gId,
/// activityId, taskType)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NextTask {
    pub list_key: String,
    pub job_id: String,
    pub g_id: String,
    pub activity_id: String,
    pub task_type: String,
}

/// `throw` defaults to `true`: per spec, a stringified `metadata/err` is
/// persisted unless the caller explicitly opts out with `throw: false`.
#[derive(Clone, Debug)]
pub struct InterruptOptions {
    pub throw: bool,
    pub suppress: bool,
    pub expire: Option<u64>,
    pub descend: bool,
}

impl Default for InterruptOptions {
    fn default() -> Self {
        Self { throw: true, suppress: false, expire: None, descend: false }
    }
}

/// Backend contract, grouped into sections by concern so an implementer can
/// work through the file top to bottom one concern at a time.
#[async_trait]
pub trait Store: Send + Sync {
    // ── App ──
    async fn get_app(&self, app_id: &str) -> MeshResult<Option<AppRecord>>;
    async fn set_app(&self, app: &AppRecord, tx: Option<&mut Transaction>) -> MeshResult<()>;
    async fn activate_app_version(&self, app_id: &str, version: &str) -> MeshResult<()>;

    // ── Scouting ──
    async fn reserve_scout_role(&self, kind: &str, ttl_sec: u64) -> MeshResult<bool>;

    // ── Symbols ──
    async fn reserve_symbol_range(
        &self,
        target: &str,
        size: u32,
        kind: &str,
    ) -> MeshResult<SymbolRange>;
    async fn get_symbols(&self, scope: &str) -> MeshResult<BTreeMap<String, String>>;
    async fn add_symbols(
        &self,
        scope: &str,
        symbols: &BTreeMap<String, String>,
    ) -> MeshResult<()>;
    async fn get_symbol_values(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>>;
    async fn add_symbol_values(
        &self,
        app_id: &str,
        symbols: &BTreeMap<String, String>,
    ) -> MeshResult<()>;
    async fn get_symbol_keys(&self, scope: &str) -> MeshResult<Vec<String>>;
    async fn get_all_symbols(&self, app_id: &str) -> MeshResult<BTreeMap<String, BTreeMap<String, String>>>;

    // ── Job state ──
    async fn set_state(
        &self,
        job_id: &str,
        fields: &BTreeMap<String, String>,
        status: Option<f64>,
        tx: Option<&mut Transaction>,
    ) -> MeshResult<()>;
    async fn get_state(
        &self,
        job_id: &str,
        fields: &[String],
    ) -> MeshResult<BTreeMap<String, String>>;
    async fn get_query_state(
        &self,
        job_id: &str,
        fields: &[String],
    ) -> MeshResult<BTreeMap<String, String>>;
    async fn collate(
        &self,
        job_id: &str,
        activity_id: &str,
        delta: f64,
        tx: Option<&mut Transaction>,
    ) -> MeshResult<f64>;
    async fn collate_synthetic(
        &self,
        job_id: &str,
        guid: &str,
        delta: f64,
        tx: Option<&mut Transaction>,
    ) -> MeshResult<f64>;
    async fn set_status(&self, job_id: &str, delta: f64) -> MeshResult<f64>;
    async fn set_state_nx(
        &self,
        job_id: &str,
        status: Option<f64>,
        entity: Option<&str>,
    ) -> MeshResult<bool>;

    // ── Deployed artifacts ──
    async fn set_schemas(&self, app_id: &str, schemas: &BTreeMap<String, String>) -> MeshResult<()>;
    async fn get_schemas(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>>;
    async fn set_subscriptions(&self, app_id: &str, subs: &BTreeMap<String, String>) -> MeshResult<()>;
    async fn get_subscriptions(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>>;
    async fn get_subscription(&self, app_id: &str, topic: &str) -> MeshResult<Option<String>>;
    async fn set_transitions(&self, app_id: &str, transitions: &BTreeMap<String, String>) -> MeshResult<()>;
    async fn get_transitions(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>>;
    async fn set_hook_rules(&self, app_id: &str, rules: &BTreeMap<String, String>) -> MeshResult<()>;
    async fn get_hook_rules(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>>;
    async fn set_hook_signal(&self, app_id: &str, topic: &str, key: &str, job_id: &str) -> MeshResult<()>;
    async fn get_hook_signal(&self, app_id: &str, topic: &str, key: &str) -> MeshResult<Option<String>>;
    async fn delete_hook_signal(&self, app_id: &str, topic: &str, key: &str) -> MeshResult<()>;

    // ── Task queues ──
    async fn add_task_queues(&self, keys: &[String]) -> MeshResult<()>;
    async fn get_active_task_queue(&self) -> MeshResult<Option<String>>;
    async fn process_task_queue(&self, src: &str, dst: &str) -> MeshResult<Option<String>>;
    async fn delete_processed_task_queue(
        &self,
        item: &str,
        key: &str,
        processed_key: &str,
        scrub: bool,
    ) -> MeshResult<()>;

    // ── Time hooks ──
    async fn register_time_hook(
        &self,
        job_id: &str,
        g_id: &str,
        activity_id: &str,
        task_type: &str,
        t_at: i64,
        dad: Option<&str>,
        tx: Option<&mut Transaction>,
    ) -> MeshResult<()>;
    async fn get_next_task(&self, list_key: Option<&str>) -> MeshResult<Option<NextTask>>;

    // ── Lifecycle ──
    async fn interrupt(&self, topic: &str, job_id: &str, options: InterruptOptions) -> MeshResult<()>;
    async fn scrub(&self, job_id: &str) -> MeshResult<()>;
    async fn find_jobs(
        &self,
        pattern: &str,
        limit: u32,
        batch: u32,
        cursor: Option<String>,
    ) -> MeshResult<(Option<String>, Vec<String>)>;

    // ── Throttle ──
    async fn set_throttle_rate(&self, topic: Option<&str>, rate_ms: i64) -> MeshResult<()>;
    async fn get_throttle_rates(&self) -> MeshResult<BTreeMap<String, i64>>;
    async fn get_throttle_rate(&self, topic: &str) -> MeshResult<i64>;

    /// Commit an accumulated transaction atomically. A no-op on an empty
    /// transaction.
    async fn commit(&self, tx: Transaction) -> MeshResult<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppRecord {
    pub id: String,
    pub version: String,
    pub active: bool,
}
