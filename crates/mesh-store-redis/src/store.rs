use async_trait::async_trait;
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::keyminter::{KeyMinter, KeyType};
use mesh_core::store::{AppRecord, Command, InterruptOptions, NextTask, Store, SymbolRange, Transaction};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::BTreeMap;

fn storage_err(e: redis::RedisError) -> MeshError {
    MeshError::StorageError(e.to_string())
}

fn mint(km: &KeyMinter, kind: KeyType, params: &[&str]) -> MeshResult<String> {
    km.mint(kind, params)
        .map_err(|e| MeshError::StorageError(e.to_string()))
}

/// Native Redis `Store` implementation. Every operation maps directly onto
/// hash/list/sorted-set/string primitives; the symbol-range reservation
/// protocol uses `HSETNX`+`HINCRBYFLOAT` rather than a Lua script, so
/// behavior is auditable command by command.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    km: KeyMinter,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            km: KeyMinter::new(namespace),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Apply one `Command` against a live (non-transaction) connection.
    async fn apply(&self, cmd: &Command) -> MeshResult<()> {
        let mut conn = self.conn();
        match cmd {
            Command::HSet { key, fields } => {
                if !fields.is_empty() {
                    let pairs: Vec<(&String, &String)> = fields.iter().collect();
                    let _: () = conn.hset_multiple(key, &pairs).await.map_err(storage_err)?;
                }
            }
            Command::HSetNx { key, field, value } => {
                let _: bool = conn.hset_nx(key, field, value).await.map_err(storage_err)?;
            }
            Command::HIncrByFloat { key, field, delta } => {
                let _: f64 = redis::cmd("HINCRBYFLOAT")
                    .arg(key)
                    .arg(field)
                    .arg(*delta)
                    .query_async(&mut conn)
                    .await
                    .map_err(storage_err)?;
            }
            Command::HDel { key, fields } => {
                if !fields.is_empty() {
                    let _: u64 = conn.hdel(key, fields).await.map_err(storage_err)?;
                }
            }
            Command::Del { key } => {
                let _: u64 = conn.del(key).await.map_err(storage_err)?;
            }
            Command::ZAddNx { key, member, score } => {
                let _: u64 = redis::cmd("ZADD")
                    .arg(key)
                    .arg("NX")
                    .arg(score)
                    .arg(member)
                    .query_async(&mut conn)
                    .await
                    .map_err(storage_err)?;
            }
            Command::ZRem { key, member } => {
                let _: u64 = conn.zrem(key, member).await.map_err(storage_err)?;
            }
            Command::RPush { key, value } => {
                let _: u64 = conn.rpush(key, value).await.map_err(storage_err)?;
            }
            Command::Rename { from, to } => {
                let _: () = conn.rename(from, to).await.map_err(storage_err)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get_app(&self, app_id: &str) -> MeshResult<Option<AppRecord>> {
        let key = mint(&self.km, KeyType::App, &[app_id])?;
        let mut conn = self.conn();
        let fields: BTreeMap<String, String> = conn.hgetall(&key).await.map_err(storage_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let version = fields.get("version").cloned().unwrap_or_default();
        let active = fields.get("active").map(|s| s == "true").unwrap_or(false);
        Ok(Some(AppRecord {
            id: app_id.to_string(),
            version,
            active,
        }))
    }

    async fn set_app(&self, app: &AppRecord, tx: Option<&mut Transaction>) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::App, &[&app.id])?;
        let mut fields = BTreeMap::new();
        fields.insert("version".to_string(), app.version.clone());
        fields.insert("active".to_string(), app.active.to_string());
        fields.insert(
            format!("versions/{}", app.version),
            "deployed".to_string(),
        );
        let cmd = Command::HSet { key, fields };
        match tx {
            Some(tx) => {
                tx.push(cmd);
                Ok(())
            }
            None => self.apply(&cmd).await,
        }
    }

    async fn activate_app_version(&self, app_id: &str, version: &str) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::App, &[app_id])?;
        let mut conn = self.conn();
        let marker: Option<String> = conn
            .hget(&key, format!("versions/{version}"))
            .await
            .map_err(storage_err)?;
        if marker.is_none() {
            return Err(MeshError::ActivationError {
                app_id: app_id.to_string(),
                version: version.to_string(),
                attempts: 0,
            });
        }
        let mut fields = BTreeMap::new();
        fields.insert("version".to_string(), version.to_string());
        fields.insert("active".to_string(), "true".to_string());
        let ts = chrono::Utc::now().to_rfc3339();
        fields.insert(format!("versions/{version}"), format!("activated:{ts}"));
        let _: () = conn.hset_multiple(&key, &fields.into_iter().collect::<Vec<_>>()).await.map_err(storage_err)?;
        Ok(())
    }

    async fn reserve_scout_role(&self, kind: &str, ttl_sec: u64) -> MeshResult<bool> {
        let key = mint(&self.km, KeyType::Quorum, &["scout", kind])?;
        let mut conn = self.conn();
        let won: bool = redis::cmd("SET")
            .arg(&key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_sec.max(1))
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(storage_err)?
            .is_some();
        Ok(won)
    }

    async fn reserve_symbol_range(
        &self,
        target: &str,
        size: u32,
        kind: &str,
    ) -> MeshResult<SymbolRange> {
        let key = mint(&self.km, KeyType::SymKeys, &[kind, target, "range"])?;
        let mut conn = self.conn();
        let mut attempts = 0u32;
        loop {
            let won: bool = conn.hset_nx(&key, "pending", "?:?").await.map_err(storage_err)?;
            if won {
                let hi_exclusive: f64 = redis::cmd("HINCRBYFLOAT")
                    .arg(&key)
                    .arg(":cursor")
                    .arg(size as f64)
                    .query_async(&mut conn)
                    .await
                    .map_err(storage_err)?;
                let lo = (hi_exclusive as u32).saturating_sub(size);
                let hi = hi_exclusive as u32 - 1;
                let range_str = format!("{lo}:{hi}");
                let _: () = conn.hset(&key, "pending", &range_str).await.map_err(storage_err)?;
                let existing = self.get_symbols(target).await?;
                return Ok(SymbolRange { lo, hi, existing });
            }
            let marker: String = conn.hget(&key, "pending").await.map_err(storage_err)?;
            if marker != "?:?" {
                let mut parts = marker.split(':');
                let lo: u32 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| MeshError::StorageError(format!("malformed range marker {marker}")))?;
                let hi: u32 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| MeshError::StorageError(format!("malformed range marker {marker}")))?;
                let existing = self.get_symbols(target).await?;
                return Ok(SymbolRange { lo, hi, existing });
            }
            attempts += 1;
            if attempts > 5 {
                return Err(MeshError::SymbolContention {
                    scope: target.to_string(),
                    attempts,
                });
            }
            tokio::time::sleep(std::time::Duration::from_millis(10 * (1 << attempts))).await;
        }
    }

    async fn get_symbols(&self, scope: &str) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::SymKeys, &["table", scope])?;
        let mut conn = self.conn();
        conn.hgetall(&key).await.map_err(storage_err)
    }

    async fn add_symbols(&self, scope: &str, symbols: &BTreeMap<String, String>) -> MeshResult<()> {
        if symbols.is_empty() {
            return Ok(());
        }
        let key = mint(&self.km, KeyType::SymKeys, &["table", scope])?;
        let mut conn = self.conn();
        let pairs: Vec<(&String, &String)> = symbols.iter().collect();
        conn.hset_multiple(&key, &pairs).await.map_err(storage_err)
    }

    async fn get_symbol_values(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::SymVals, &[app_id])?;
        let mut conn = self.conn();
        conn.hgetall(&key).await.map_err(storage_err)
    }

    async fn add_symbol_values(&self, app_id: &str, symbols: &BTreeMap<String, String>) -> MeshResult<()> {
        if symbols.is_empty() {
            return Ok(());
        }
        let key = mint(&self.km, KeyType::SymVals, &[app_id])?;
        let mut conn = self.conn();
        let pairs: Vec<(&String, &String)> = symbols.iter().collect();
        conn.hset_multiple(&key, &pairs).await.map_err(storage_err)
    }

    async fn get_symbol_keys(&self, scope: &str) -> MeshResult<Vec<String>> {
        let key = mint(&self.km, KeyType::SymKeys, &["table", scope])?;
        let mut conn = self.conn();
        conn.hkeys(&key).await.map_err(storage_err)
    }

    async fn get_all_symbols(&self, app_id: &str) -> MeshResult<BTreeMap<String, BTreeMap<String, String>>> {
        // Scopes aren't independently enumerable from a flat hash namespace;
        // callers (cache warmup) track the scope list themselves and call
        // `get_symbols` per scope. This aggregate form only covers the app's
        // own job-root scope, matching how the compiler seeds it first.
        let mut out = BTreeMap::new();
        out.insert(app_id.to_string(), self.get_symbols(app_id).await?);
        Ok(out)
    }

    async fn set_state(
        &self,
        job_id: &str,
        fields: &BTreeMap<String, String>,
        status: Option<f64>,
        tx: Option<&mut Transaction>,
    ) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let mut all = fields.clone();
        if let Some(s) = status {
            all.insert(":".to_string(), s.to_string());
        }
        let cmd = Command::HSet { key, fields: all };
        match tx {
            Some(tx) => {
                tx.push(cmd);
                Ok(())
            }
            None => self.apply(&cmd).await,
        }
    }

    async fn get_state(&self, job_id: &str, fields: &[String]) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let mut conn = self.conn();
        if fields.is_empty() {
            let all: BTreeMap<String, String> = conn.hgetall(&key).await.map_err(storage_err)?;
            if !all.contains_key(":") {
                return Err(MeshError::NotFound {
                    app_id: String::new(),
                    job_id: job_id.to_string(),
                });
            }
            return Ok(all);
        }
        let values: Vec<Option<String>> = conn.hget(&key, fields).await.map_err(storage_err)?;
        let mut out = BTreeMap::new();
        let mut any = false;
        for (field, value) in fields.iter().zip(values) {
            if let Some(v) = value {
                any = true;
                out.insert(field.clone(), v);
            }
        }
        if !any {
            return Err(MeshError::NotFound {
                app_id: String::new(),
                job_id: job_id.to_string(),
            });
        }
        Ok(out)
    }

    async fn get_query_state(&self, job_id: &str, fields: &[String]) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let mut conn = self.conn();
        let qualified: Vec<String> = fields
            .iter()
            .map(|f| if f.starts_with('_') { f.clone() } else { format!("_{f}") })
            .collect();
        let values: Vec<Option<String>> = conn.hget(&key, &qualified).await.map_err(storage_err)?;
        let mut out = BTreeMap::new();
        for (field, value) in fields.iter().zip(values) {
            if let Some(v) = value {
                out.insert(field.clone(), v);
            }
        }
        Ok(out)
    }

    async fn collate(
        &self,
        job_id: &str,
        activity_id: &str,
        delta: f64,
        tx: Option<&mut Transaction>,
    ) -> MeshResult<f64> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let field = format!("{activity_id}/output/metadata/as");
        if let Some(tx) = tx {
            tx.push(Command::HIncrByFloat { key, field, delta });
            return Ok(delta);
        }
        let mut conn = self.conn();
        redis::cmd("HINCRBYFLOAT")
            .arg(&key)
            .arg(&field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)
    }

    async fn collate_synthetic(
        &self,
        job_id: &str,
        guid: &str,
        delta: f64,
        tx: Option<&mut Transaction>,
    ) -> MeshResult<f64> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let field = format!("synthetic/{guid}");
        if let Some(tx) = tx {
            tx.push(Command::HIncrByFloat { key, field, delta });
            return Ok(delta);
        }
        let mut conn = self.conn();
        redis::cmd("HINCRBYFLOAT")
            .arg(&key)
            .arg(&field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)
    }

    async fn set_status(&self, job_id: &str, delta: f64) -> MeshResult<f64> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let mut conn = self.conn();
        redis::cmd("HINCRBYFLOAT")
            .arg(&key)
            .arg(":")
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)
    }

    async fn set_state_nx(&self, job_id: &str, status: Option<f64>, entity: Option<&str>) -> MeshResult<bool> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let mut conn = self.conn();
        let won: bool = conn
            .hset_nx(&key, ":", status.unwrap_or(1.0).to_string())
            .await
            .map_err(storage_err)?;
        if won {
            if let Some(e) = entity {
                let _: () = conn.hset_nx(&key, "metadata/entity", e).await.map_err(storage_err)?;
            }
        }
        Ok(won)
    }

    async fn set_schemas(&self, app_id: &str, schemas: &BTreeMap<String, String>) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::Schemas, &[app_id])?;
        let mut conn = self.conn();
        if schemas.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(&String, &String)> = schemas.iter().collect();
        conn.hset_multiple(&key, &pairs).await.map_err(storage_err)
    }

    async fn get_schemas(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::Schemas, &[app_id])?;
        let mut conn = self.conn();
        conn.hgetall(&key).await.map_err(storage_err)
    }

    async fn set_subscriptions(&self, app_id: &str, subs: &BTreeMap<String, String>) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::Subscriptions, &[app_id])?;
        let mut conn = self.conn();
        if subs.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(&String, &String)> = subs.iter().collect();
        conn.hset_multiple(&key, &pairs).await.map_err(storage_err)
    }

    async fn get_subscriptions(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::Subscriptions, &[app_id])?;
        let mut conn = self.conn();
        conn.hgetall(&key).await.map_err(storage_err)
    }

    async fn get_subscription(&self, app_id: &str, topic: &str) -> MeshResult<Option<String>> {
        let key = mint(&self.km, KeyType::Subscriptions, &[app_id])?;
        let mut conn = self.conn();
        conn.hget(&key, topic).await.map_err(storage_err)
    }

    async fn set_transitions(&self, app_id: &str, transitions: &BTreeMap<String, String>) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::Subscriptions, &[app_id, "transitions"])?;
        let mut conn = self.conn();
        if transitions.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(&String, &String)> = transitions.iter().collect();
        conn.hset_multiple(&key, &pairs).await.map_err(storage_err)
    }

    async fn get_transitions(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::Subscriptions, &[app_id, "transitions"])?;
        let mut conn = self.conn();
        conn.hgetall(&key).await.map_err(storage_err)
    }

    async fn set_hook_rules(&self, app_id: &str, rules: &BTreeMap<String, String>) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::Hooks, &[app_id])?;
        let mut conn = self.conn();
        if rules.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(&String, &String)> = rules.iter().collect();
        conn.hset_multiple(&key, &pairs).await.map_err(storage_err)
    }

    async fn get_hook_rules(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::Hooks, &[app_id])?;
        let mut conn = self.conn();
        conn.hgetall(&key).await.map_err(storage_err)
    }

    async fn set_hook_signal(&self, app_id: &str, topic: &str, key: &str, job_id: &str) -> MeshResult<()> {
        let hkey = mint(&self.km, KeyType::Signals, &[app_id, topic])?;
        let mut conn = self.conn();
        conn.hset(&hkey, key, job_id).await.map_err(storage_err)
    }

    async fn get_hook_signal(&self, app_id: &str, topic: &str, key: &str) -> MeshResult<Option<String>> {
        let hkey = mint(&self.km, KeyType::Signals, &[app_id, topic])?;
        let mut conn = self.conn();
        conn.hget(&hkey, key).await.map_err(storage_err)
    }

    async fn delete_hook_signal(&self, app_id: &str, topic: &str, key: &str) -> MeshResult<()> {
        let hkey = mint(&self.km, KeyType::Signals, &[app_id, topic])?;
        let mut conn = self.conn();
        let _: u64 = conn.hdel(&hkey, key).await.map_err(storage_err)?;
        Ok(())
    }

    async fn add_task_queues(&self, keys: &[String]) -> MeshResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let zkey = mint(&self.km, KeyType::WorkItems, &["index"])?;
        let mut conn = self.conn();
        for k in keys {
            let now = now_secs();
            let _: u64 = redis::cmd("ZADD")
                .arg(&zkey)
                .arg("NX")
                .arg(now)
                .arg(k)
                .query_async(&mut conn)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn get_active_task_queue(&self) -> MeshResult<Option<String>> {
        let zkey = mint(&self.km, KeyType::WorkItems, &["index"])?;
        let mut conn = self.conn();
        let items: Vec<String> = conn.zrange(&zkey, 0, 0).await.map_err(storage_err)?;
        Ok(items.into_iter().next())
    }

    async fn process_task_queue(&self, src: &str, dst: &str) -> MeshResult<Option<String>> {
        let mut conn = self.conn();
        let item: Option<String> = redis::cmd("LMOVE")
            .arg(src)
            .arg(dst)
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(item)
    }

    async fn delete_processed_task_queue(
        &self,
        item: &str,
        key: &str,
        processed_key: &str,
        scrub: bool,
    ) -> MeshResult<()> {
        let zkey = mint(&self.km, KeyType::WorkItems, &["index"])?;
        let mut conn = self.conn();
        let _: u64 = conn.zrem(&zkey, item).await.map_err(storage_err)?;
        if scrub {
            let _: u64 = conn.del(processed_key).await.map_err(storage_err)?;
        } else {
            let _: () = conn.rename(key, processed_key).await.map_err(storage_err)?;
        }
        Ok(())
    }

    async fn register_time_hook(
        &self,
        job_id: &str,
        g_id: &str,
        activity_id: &str,
        task_type: &str,
        t_at: i64,
        dad: Option<&str>,
        tx: Option<&mut Transaction>,
    ) -> MeshResult<()> {
        let bucket = t_at.to_string();
        let list_key = mint(&self.km, KeyType::TimeRange, &[&bucket])?;
        let index_key = mint(&self.km, KeyType::TimeRange, &["index"])?;
        let item = format!(
            "{task_type}|{activity_id}|{g_id}|{}|{job_id}",
            dad.unwrap_or("")
        );
        let push = Command::RPush {
            key: list_key.clone(),
            value: item,
        };
        let index = Command::ZAddNx {
            key: index_key,
            member: list_key,
            score: t_at as f64,
        };
        match tx {
            Some(tx) => {
                tx.push(push);
                tx.push(index);
                Ok(())
            }
            None => {
                self.apply(&push).await?;
                self.apply(&index).await
            }
        }
    }

    async fn get_next_task(&self, list_key: Option<&str>) -> MeshResult<Option<NextTask>> {
        let mut conn = self.conn();
        let index_key = mint(&self.km, KeyType::TimeRange, &["index"])?;
        let key = match list_key {
            Some(k) => k.to_string(),
            None => {
                let now = now_secs() as f64;
                let buckets: Vec<String> = conn
                    .zrangebyscore_limit(&index_key, 0, now, 0, 1)
                    .await
                    .map_err(storage_err)?;
                let Some(b) = buckets.into_iter().next() else {
                    return Ok(None);
                };
                b
            }
        };
        let popped: Option<String> = conn.lpop(&key, None).await.map_err(storage_err)?;
        let Some(raw) = popped else {
            let _: u64 = conn.zrem(&index_key, &key).await.map_err(storage_err)?;
            return Ok(Some(NextTask {
                list_key: key,
                job_id: String::new(),
                g_id: String::new(),
                activity_id: String::new(),
                task_type: String::new(),
            }));
        };
        let mut parts = raw.splitn(5, '|');
        let task_type = parts.next().unwrap_or_default().to_string();
        let activity_id = parts.next().unwrap_or_default().to_string();
        let g_id = parts.next().unwrap_or_default().to_string();
        let _dad = parts.next().unwrap_or_default();
        let job_id = parts.next().unwrap_or_default().to_string();
        let remaining: isize = conn.llen(&key).await.map_err(storage_err)?;
        if remaining == 0 {
            let _: u64 = conn.zrem(&index_key, &key).await.map_err(storage_err)?;
        }
        Ok(Some(NextTask {
            list_key: key,
            job_id,
            g_id,
            activity_id,
            task_type,
        }))
    }

    async fn interrupt(&self, _topic: &str, job_id: &str, options: InterruptOptions) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let mut conn = self.conn();
        let status: Option<String> = conn.hget(&key, ":").await.map_err(storage_err)?;
        let status: f64 = status.and_then(|s| s.parse().ok()).unwrap_or(0.0);
        if status <= 0.0 && !options.suppress {
            return Err(MeshError::InterruptConflict {
                job_id: job_id.to_string(),
            });
        }
        if status <= 0.0 {
            return Ok(());
        }
        let _: f64 = redis::cmd("HINCRBYFLOAT")
            .arg(&key)
            .arg(":")
            .arg(-1_000_000_000.0)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        if options.throw {
            let err = serde_json::json!({
                "code": mesh_core::error::codes::INTERRUPT,
                "message": "job interrupted",
                "stack": "",
                "job_id": job_id,
            });
            let _: () = conn
                .hset(&key, "metadata/err", err.to_string())
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn scrub(&self, job_id: &str) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let mut conn = self.conn();
        let _: u64 = conn.del(&key).await.map_err(storage_err)?;
        Ok(())
    }

    async fn find_jobs(
        &self,
        pattern: &str,
        limit: u32,
        batch: u32,
        cursor: Option<String>,
    ) -> MeshResult<(Option<String>, Vec<String>)> {
        let mut conn = self.conn();
        let start: u64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(start)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(batch)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        let limited: Vec<String> = keys.into_iter().take(limit as usize).collect();
        let next_cursor = if next == 0 { None } else { Some(next.to_string()) };
        Ok((next_cursor, limited))
    }

    async fn set_throttle_rate(&self, topic: Option<&str>, rate_ms: i64) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::ThrottleRate, &[])?;
        let field = topic.unwrap_or("*");
        let clamped = rate_ms.clamp(-1, 60_000);
        let mut conn = self.conn();
        conn.hset(&key, field, clamped).await.map_err(storage_err)
    }

    async fn get_throttle_rates(&self) -> MeshResult<BTreeMap<String, i64>> {
        let key = mint(&self.km, KeyType::ThrottleRate, &[])?;
        let mut conn = self.conn();
        let raw: BTreeMap<String, String> = conn.hgetall(&key).await.map_err(storage_err)?;
        Ok(raw
            .into_iter()
            .filter_map(|(k, v)| v.parse().ok().map(|n| (k, n)))
            .collect())
    }

    async fn get_throttle_rate(&self, topic: &str) -> MeshResult<i64> {
        let key = mint(&self.km, KeyType::ThrottleRate, &[])?;
        let mut conn = self.conn();
        let v: Option<String> = conn.hget(&key, topic).await.map_err(storage_err)?;
        Ok(v.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    async fn commit(&self, tx: Transaction) -> MeshResult<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for cmd in &tx.commands {
            match cmd {
                Command::HSet { key, fields } => {
                    for (f, v) in fields {
                        pipe.hset(key, f, v);
                    }
                }
                Command::HSetNx { key, field, value } => {
                    pipe.cmd("HSETNX").arg(key).arg(field).arg(value);
                }
                Command::HIncrByFloat { key, field, delta } => {
                    pipe.cmd("HINCRBYFLOAT").arg(key).arg(field).arg(delta);
                }
                Command::HDel { key, fields } => {
                    if !fields.is_empty() {
                        pipe.cmd("HDEL").arg(key).arg(fields);
                    }
                }
                Command::Del { key } => {
                    pipe.del(key);
                }
                Command::ZAddNx { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg("NX").arg(score).arg(member);
                }
                Command::ZRem { key, member } => {
                    pipe.zrem(key, member);
                }
                Command::RPush { key, value } => {
                    pipe.rpush(key, value);
                }
                Command::Rename { from, to } => {
                    pipe.cmd("RENAME").arg(from).arg(to);
                }
            };
        }
        let mut conn = self.conn();
        let _: Vec<redis::Value> = pipe.query_async(&mut conn).await.map_err(storage_err)?;
        Ok(())
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
