use crate::glob_to_like;
use async_trait::async_trait;
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::keyminter::{KeyMinter, KeyType};
use mesh_core::store::{AppRecord, Command, InterruptOptions, NextTask, Store, SymbolRange, Transaction};
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

fn storage_err(e: sqlx::Error) -> MeshError {
    MeshError::StorageError(e.to_string())
}

fn mint(km: &KeyMinter, kind: KeyType, params: &[&str]) -> MeshResult<String> {
    km.mint(kind, params)
        .map_err(|e| MeshError::StorageError(e.to_string()))
}

/// Apply one `Command` inside an open transaction. Every Redis primitive the
/// spec names (hash/list/sorted-set/string) maps onto the matching
/// `kv_*` table from `migrations/0001_init.sql`.
async fn exec_command(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, cmd: &Command) -> MeshResult<()> {
    match cmd {
        Command::HSet { key, fields } => {
            for (field, value) in fields {
                sqlx::query(
                    "INSERT INTO kv_hash (key, field, value) VALUES ($1, $2, $3)
                     ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value",
                )
                .bind(key)
                .bind(field)
                .bind(value)
                .execute(&mut **tx)
                .await
                .map_err(storage_err)?;
            }
        }
        Command::HSetNx { key, field, value } => {
            sqlx::query(
                "INSERT INTO kv_hash (key, field, value) VALUES ($1, $2, $3)
                 ON CONFLICT (key, field) DO NOTHING",
            )
            .bind(key)
            .bind(field)
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }
        Command::HIncrByFloat { key, field, delta } => {
            sqlx::query(
                "INSERT INTO kv_hash (key, field, value) VALUES ($1, $2, $3::text)
                 ON CONFLICT (key, field) DO UPDATE
                 SET value = (kv_hash.value::float8 + $3)::text",
            )
            .bind(key)
            .bind(field)
            .bind(delta)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }
        Command::HDel { key, fields } => {
            if !fields.is_empty() {
                sqlx::query("DELETE FROM kv_hash WHERE key = $1 AND field = ANY($2)")
                    .bind(key)
                    .bind(fields)
                    .execute(&mut **tx)
                    .await
                    .map_err(storage_err)?;
            }
        }
        Command::Del { key } => {
            for stmt in [
                "DELETE FROM kv_hash WHERE key = $1",
                "DELETE FROM kv_string WHERE key = $1",
                "DELETE FROM kv_list WHERE key = $1",
                "DELETE FROM kv_sorted_set WHERE key = $1",
            ] {
                sqlx::query(stmt).bind(key).execute(&mut **tx).await.map_err(storage_err)?;
            }
        }
        Command::ZAddNx { key, member, score } => {
            sqlx::query(
                "INSERT INTO kv_sorted_set (key, member, score) VALUES ($1, $2, $3)
                 ON CONFLICT (key, member) DO NOTHING",
            )
            .bind(key)
            .bind(member)
            .bind(score)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }
        Command::ZRem { key, member } => {
            sqlx::query("DELETE FROM kv_sorted_set WHERE key = $1 AND member = $2")
                .bind(key)
                .bind(member)
                .execute(&mut **tx)
                .await
                .map_err(storage_err)?;
        }
        Command::RPush { key, value } => {
            sqlx::query(
                "INSERT INTO kv_list (key, idx, value)
                 VALUES ($1, (SELECT COALESCE(MAX(idx), 0) + 1 FROM kv_list WHERE key = $1), $2)",
            )
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(storage_err)?;
        }
        Command::Rename { from, to } => {
            for stmt in [
                "UPDATE kv_hash SET key = $2 WHERE key = $1",
                "UPDATE kv_string SET key = $2 WHERE key = $1",
                "UPDATE kv_list SET key = $2 WHERE key = $1",
                "UPDATE kv_sorted_set SET key = $2 WHERE key = $1",
            ] {
                sqlx::query(stmt)
                    .bind(from)
                    .bind(to)
                    .execute(&mut **tx)
                    .await
                    .map_err(storage_err)?;
            }
        }
    }
    Ok(())
}

/// Postgres-backed `Store`: a thin wrapper around `sqlx::PgPool`, runtime
/// `sqlx::query` (not the `query!` macro, since there is no reachable
/// database at build time here), explicit SQL per operation.
#[derive(Clone)]
pub struct SqlStore {
    pool: PgPool,
    km: KeyMinter,
}

impl SqlStore {
    pub fn new(pool: PgPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            km: KeyMinter::new(namespace),
        }
    }

    async fn apply(&self, cmd: Command) -> MeshResult<()> {
        self.commit(Transaction { commands: vec![cmd] }).await
    }

    async fn hgetall(&self, key: &str) -> MeshResult<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT field, value FROM kv_hash WHERE key = $1")
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("field"), r.get::<String, _>("value")))
            .collect())
    }

    async fn hget(&self, key: &str, field: &str) -> MeshResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_hash WHERE key = $1 AND field = $2")
            .bind(key)
            .bind(field)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn get_app(&self, app_id: &str) -> MeshResult<Option<AppRecord>> {
        let key = mint(&self.km, KeyType::App, &[app_id])?;
        let fields = self.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(AppRecord {
            id: app_id.to_string(),
            version: fields.get("version").cloned().unwrap_or_default(),
            active: fields.get("active").map(|s| s == "true").unwrap_or(false),
        }))
    }

    async fn set_app(&self, app: &AppRecord, tx: Option<&mut Transaction>) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::App, &[&app.id])?;
        let mut fields = BTreeMap::new();
        fields.insert("version".to_string(), app.version.clone());
        fields.insert("active".to_string(), app.active.to_string());
        fields.insert(format!("versions/{}", app.version), "deployed".to_string());
        let cmd = Command::HSet { key, fields };
        match tx {
            Some(tx) => {
                tx.push(cmd);
                Ok(())
            }
            None => self.apply(cmd).await,
        }
    }

    async fn activate_app_version(&self, app_id: &str, version: &str) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::App, &[app_id])?;
        let marker = self.hget(&key, &format!("versions/{version}")).await?;
        if marker.is_none() {
            return Err(MeshError::ActivationError {
                app_id: app_id.to_string(),
                version: version.to_string(),
                attempts: 0,
            });
        }
        let ts = chrono::Utc::now().to_rfc3339();
        let mut fields = BTreeMap::new();
        fields.insert("version".to_string(), version.to_string());
        fields.insert("active".to_string(), "true".to_string());
        fields.insert(format!("versions/{version}"), format!("activated:{ts}"));
        self.apply(Command::HSet { key, fields }).await
    }

    async fn reserve_scout_role(&self, kind: &str, ttl_sec: u64) -> MeshResult<bool> {
        let key = mint(&self.km, KeyType::Quorum, &["scout", kind])?;
        let row = sqlx::query(
            "INSERT INTO kv_string (key, value, expires_at) VALUES ($1, '1', now() + make_interval(secs => $2))
             ON CONFLICT (key) DO UPDATE
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
             WHERE kv_string.expires_at IS NULL OR kv_string.expires_at < now()
             RETURNING key",
        )
        .bind(&key)
        .bind(ttl_sec as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.is_some())
    }

    async fn reserve_symbol_range(&self, target: &str, size: u32, kind: &str) -> MeshResult<SymbolRange> {
        let key = mint(&self.km, KeyType::SymKeys, &[kind, target, "range"])?;
        let mut attempts = 0u32;
        loop {
            let won = sqlx::query(
                "INSERT INTO kv_hash (key, field, value) VALUES ($1, 'pending', '?:?')
                 ON CONFLICT (key, field) DO NOTHING RETURNING key",
            )
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .is_some();

            if won {
                let row = sqlx::query(
                    "INSERT INTO kv_hash (key, field, value) VALUES ($1, ':cursor', $2::text)
                     ON CONFLICT (key, field) DO UPDATE
                     SET value = (kv_hash.value::float8 + $2)::text
                     RETURNING value::float8 AS cursor",
                )
                .bind(&key)
                .bind(size as f64)
                .fetch_one(&self.pool)
                .await
                .map_err(storage_err)?;
                let hi_exclusive: f64 = row.get("cursor");
                let lo = (hi_exclusive as u32).saturating_sub(size);
                let hi = hi_exclusive as u32 - 1;
                let range_str = format!("{lo}:{hi}");
                sqlx::query("UPDATE kv_hash SET value = $1 WHERE key = $2 AND field = 'pending'")
                    .bind(&range_str)
                    .bind(&key)
                    .execute(&self.pool)
                    .await
                    .map_err(storage_err)?;
                let existing = self.get_symbols(target).await?;
                return Ok(SymbolRange { lo, hi, existing });
            }

            let marker = self.hget(&key, "pending").await?.unwrap_or_default();
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
        self.hgetall(&key).await
    }

    async fn add_symbols(&self, scope: &str, symbols: &BTreeMap<String, String>) -> MeshResult<()> {
        if symbols.is_empty() {
            return Ok(());
        }
        let key = mint(&self.km, KeyType::SymKeys, &["table", scope])?;
        self.apply(Command::HSet { key, fields: symbols.clone() }).await
    }

    async fn get_symbol_values(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::SymVals, &[app_id])?;
        self.hgetall(&key).await
    }

    async fn add_symbol_values(&self, app_id: &str, symbols: &BTreeMap<String, String>) -> MeshResult<()> {
        if symbols.is_empty() {
            return Ok(());
        }
        let key = mint(&self.km, KeyType::SymVals, &[app_id])?;
        self.apply(Command::HSet { key, fields: symbols.clone() }).await
    }

    async fn get_symbol_keys(&self, scope: &str) -> MeshResult<Vec<String>> {
        let key = mint(&self.km, KeyType::SymKeys, &["table", scope])?;
        let rows = sqlx::query("SELECT field FROM kv_hash WHERE key = $1")
            .bind(&key)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("field")).collect())
    }

    async fn get_all_symbols(&self, app_id: &str) -> MeshResult<BTreeMap<String, BTreeMap<String, String>>> {
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
            None => self.apply(cmd).await,
        }
    }

    async fn get_state(&self, job_id: &str, fields: &[String]) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        if fields.is_empty() {
            let all = self.hgetall(&key).await?;
            if !all.contains_key(":") {
                return Err(MeshError::NotFound {
                    app_id: String::new(),
                    job_id: job_id.to_string(),
                });
            }
            return Ok(all);
        }
        let rows = sqlx::query("SELECT field, value FROM kv_hash WHERE key = $1 AND field = ANY($2)")
            .bind(&key)
            .bind(fields)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        if rows.is_empty() {
            return Err(MeshError::NotFound {
                app_id: String::new(),
                job_id: job_id.to_string(),
            });
        }
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("field"), r.get::<String, _>("value")))
            .collect())
    }

    async fn get_query_state(&self, job_id: &str, fields: &[String]) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let qualified: Vec<String> = fields
            .iter()
            .map(|f| if f.starts_with('_') { f.clone() } else { format!("_{f}") })
            .collect();
        let rows = sqlx::query("SELECT field, value FROM kv_hash WHERE key = $1 AND field = ANY($2)")
            .bind(&key)
            .bind(&qualified)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        let stripped: BTreeMap<String, String> = rows
            .into_iter()
            .map(|r| (r.get::<String, _>("field"), r.get::<String, _>("value")))
            .collect();
        Ok(fields
            .iter()
            .filter_map(|f| {
                let q = if f.starts_with('_') { f.clone() } else { format!("_{f}") };
                stripped.get(&q).map(|v| (f.clone(), v.clone()))
            })
            .collect())
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
        let row = sqlx::query(
            "INSERT INTO kv_hash (key, field, value) VALUES ($1, $2, $3::text)
             ON CONFLICT (key, field) DO UPDATE SET value = (kv_hash.value::float8 + $3)::text
             RETURNING value::float8 AS v",
        )
        .bind(&key)
        .bind(&field)
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.get("v"))
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
        let row = sqlx::query(
            "INSERT INTO kv_hash (key, field, value) VALUES ($1, $2, $3::text)
             ON CONFLICT (key, field) DO UPDATE SET value = (kv_hash.value::float8 + $3)::text
             RETURNING value::float8 AS v",
        )
        .bind(&key)
        .bind(&field)
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.get("v"))
    }

    async fn set_status(&self, job_id: &str, delta: f64) -> MeshResult<f64> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let row = sqlx::query(
            "INSERT INTO kv_hash (key, field, value) VALUES ($1, ':', $2::text)
             ON CONFLICT (key, field) DO UPDATE SET value = (kv_hash.value::float8 + $2)::text
             RETURNING value::float8 AS v",
        )
        .bind(&key)
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.get("v"))
    }

    async fn set_state_nx(&self, job_id: &str, status: Option<f64>, entity: Option<&str>) -> MeshResult<bool> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let row = sqlx::query(
            "INSERT INTO kv_hash (key, field, value) VALUES ($1, ':', $2)
             ON CONFLICT (key, field) DO NOTHING RETURNING key",
        )
        .bind(&key)
        .bind(status.unwrap_or(1.0).to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        let won = row.is_some();
        if won {
            if let Some(e) = entity {
                sqlx::query(
                    "INSERT INTO kv_hash (key, field, value) VALUES ($1, 'metadata/entity', $2)
                     ON CONFLICT (key, field) DO NOTHING",
                )
                .bind(&key)
                .bind(e)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            }
        }
        Ok(won)
    }

    async fn set_schemas(&self, app_id: &str, schemas: &BTreeMap<String, String>) -> MeshResult<()> {
        if schemas.is_empty() {
            return Ok(());
        }
        let key = mint(&self.km, KeyType::Schemas, &[app_id])?;
        self.apply(Command::HSet { key, fields: schemas.clone() }).await
    }

    async fn get_schemas(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::Schemas, &[app_id])?;
        self.hgetall(&key).await
    }

    async fn set_subscriptions(&self, app_id: &str, subs: &BTreeMap<String, String>) -> MeshResult<()> {
        if subs.is_empty() {
            return Ok(());
        }
        let key = mint(&self.km, KeyType::Subscriptions, &[app_id])?;
        self.apply(Command::HSet { key, fields: subs.clone() }).await
    }

    async fn get_subscriptions(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::Subscriptions, &[app_id])?;
        self.hgetall(&key).await
    }

    async fn get_subscription(&self, app_id: &str, topic: &str) -> MeshResult<Option<String>> {
        let key = mint(&self.km, KeyType::Subscriptions, &[app_id])?;
        self.hget(&key, topic).await
    }

    async fn set_transitions(&self, app_id: &str, transitions: &BTreeMap<String, String>) -> MeshResult<()> {
        if transitions.is_empty() {
            return Ok(());
        }
        let key = mint(&self.km, KeyType::Subscriptions, &[app_id, "transitions"])?;
        self.apply(Command::HSet { key, fields: transitions.clone() }).await
    }

    async fn get_transitions(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::Subscriptions, &[app_id, "transitions"])?;
        self.hgetall(&key).await
    }

    async fn set_hook_rules(&self, app_id: &str, rules: &BTreeMap<String, String>) -> MeshResult<()> {
        if rules.is_empty() {
            return Ok(());
        }
        let key = mint(&self.km, KeyType::Hooks, &[app_id])?;
        self.apply(Command::HSet { key, fields: rules.clone() }).await
    }

    async fn get_hook_rules(&self, app_id: &str) -> MeshResult<BTreeMap<String, String>> {
        let key = mint(&self.km, KeyType::Hooks, &[app_id])?;
        self.hgetall(&key).await
    }

    async fn set_hook_signal(&self, app_id: &str, topic: &str, key: &str, job_id: &str) -> MeshResult<()> {
        let hkey = mint(&self.km, KeyType::Signals, &[app_id, topic])?;
        let mut fields = BTreeMap::new();
        fields.insert(key.to_string(), job_id.to_string());
        self.apply(Command::HSet { key: hkey, fields }).await
    }

    async fn get_hook_signal(&self, app_id: &str, topic: &str, key: &str) -> MeshResult<Option<String>> {
        let hkey = mint(&self.km, KeyType::Signals, &[app_id, topic])?;
        self.hget(&hkey, key).await
    }

    async fn delete_hook_signal(&self, app_id: &str, topic: &str, key: &str) -> MeshResult<()> {
        let hkey = mint(&self.km, KeyType::Signals, &[app_id, topic])?;
        self.apply(Command::HDel { key: hkey, fields: vec![key.to_string()] }).await
    }

    async fn add_task_queues(&self, keys: &[String]) -> MeshResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let zkey = mint(&self.km, KeyType::WorkItems, &["index"])?;
        let now = chrono::Utc::now().timestamp() as f64;
        for k in keys {
            sqlx::query(
                "INSERT INTO kv_sorted_set (key, member, score) VALUES ($1, $2, $3)
                 ON CONFLICT (key, member) DO NOTHING",
            )
            .bind(&zkey)
            .bind(k)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn get_active_task_queue(&self) -> MeshResult<Option<String>> {
        let zkey = mint(&self.km, KeyType::WorkItems, &["index"])?;
        let row = sqlx::query("SELECT member FROM kv_sorted_set WHERE key = $1 ORDER BY score ASC LIMIT 1")
            .bind(&zkey)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| r.get::<String, _>("member")))
    }

    async fn process_task_queue(&self, src: &str, dst: &str) -> MeshResult<Option<String>> {
        let mut db_tx = self.pool.begin().await.map_err(storage_err)?;
        let row = sqlx::query(
            "DELETE FROM kv_list WHERE key = $1 AND idx = (SELECT MIN(idx) FROM kv_list WHERE key = $1)
             RETURNING value",
        )
        .bind(src)
        .fetch_optional(&mut *db_tx)
        .await
        .map_err(storage_err)?;
        let Some(row) = row else {
            db_tx.commit().await.map_err(storage_err)?;
            return Ok(None);
        };
        let value: String = row.get("value");
        sqlx::query(
            "INSERT INTO kv_list (key, idx, value)
             VALUES ($1, (SELECT COALESCE(MAX(idx), 0) + 1 FROM kv_list WHERE key = $1), $2)",
        )
        .bind(dst)
        .bind(&value)
        .execute(&mut *db_tx)
        .await
        .map_err(storage_err)?;
        db_tx.commit().await.map_err(storage_err)?;
        Ok(Some(value))
    }

    async fn delete_processed_task_queue(
        &self,
        item: &str,
        key: &str,
        processed_key: &str,
        scrub: bool,
    ) -> MeshResult<()> {
        let zkey = mint(&self.km, KeyType::WorkItems, &["index"])?;
        sqlx::query("DELETE FROM kv_sorted_set WHERE key = $1 AND member = $2")
            .bind(&zkey)
            .bind(item)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if scrub {
            sqlx::query("DELETE FROM kv_list WHERE key = $1")
                .bind(processed_key)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        } else {
            sqlx::query("UPDATE kv_list SET key = $2 WHERE key = $1")
                .bind(key)
                .bind(processed_key)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
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
        let item = format!("{task_type}|{activity_id}|{g_id}|{}|{job_id}", dad.unwrap_or(""));
        let push = Command::RPush { key: list_key.clone(), value: item };
        let index = Command::ZAddNx { key: index_key, member: list_key, score: t_at as f64 };
        match tx {
            Some(tx) => {
                tx.push(push);
                tx.push(index);
                Ok(())
            }
            None => {
                self.apply(push).await?;
                self.apply(index).await
            }
        }
    }

    async fn get_next_task(&self, list_key: Option<&str>) -> MeshResult<Option<NextTask>> {
        let index_key = mint(&self.km, KeyType::TimeRange, &["index"])?;
        let key = match list_key {
            Some(k) => k.to_string(),
            None => {
                let now = chrono::Utc::now().timestamp() as f64;
                let row = sqlx::query(
                    "SELECT member FROM kv_sorted_set WHERE key = $1 AND score <= $2 ORDER BY score ASC LIMIT 1",
                )
                .bind(&index_key)
                .bind(now)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
                let Some(row) = row else { return Ok(None) };
                row.get::<String, _>("member")
            }
        };
        let mut db_tx = self.pool.begin().await.map_err(storage_err)?;
        let popped = sqlx::query(
            "DELETE FROM kv_list WHERE key = $1 AND idx = (SELECT MIN(idx) FROM kv_list WHERE key = $1)
             RETURNING value",
        )
        .bind(&key)
        .fetch_optional(&mut *db_tx)
        .await
        .map_err(storage_err)?;
        let Some(row) = popped else {
            sqlx::query("DELETE FROM kv_sorted_set WHERE key = $1 AND member = $2")
                .bind(&index_key)
                .bind(&key)
                .execute(&mut *db_tx)
                .await
                .map_err(storage_err)?;
            db_tx.commit().await.map_err(storage_err)?;
            return Ok(Some(NextTask {
                list_key: key,
                job_id: String::new(),
                g_id: String::new(),
                activity_id: String::new(),
                task_type: String::new(),
            }));
        };
        let raw: String = row.get("value");
        let remaining: i64 = sqlx::query("SELECT COUNT(*) AS n FROM kv_list WHERE key = $1")
            .bind(&key)
            .fetch_one(&mut *db_tx)
            .await
            .map_err(storage_err)?
            .get("n");
        if remaining == 0 {
            sqlx::query("DELETE FROM kv_sorted_set WHERE key = $1 AND member = $2")
                .bind(&index_key)
                .bind(&key)
                .execute(&mut *db_tx)
                .await
                .map_err(storage_err)?;
        }
        db_tx.commit().await.map_err(storage_err)?;

        let mut parts = raw.splitn(5, '|');
        let task_type = parts.next().unwrap_or_default().to_string();
        let activity_id = parts.next().unwrap_or_default().to_string();
        let g_id = parts.next().unwrap_or_default().to_string();
        let _dad = parts.next().unwrap_or_default();
        let job_id = parts.next().unwrap_or_default().to_string();
        Ok(Some(NextTask { list_key: key, job_id, g_id, activity_id, task_type }))
    }

    async fn interrupt(&self, _topic: &str, job_id: &str, options: InterruptOptions) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        let status: f64 = self
            .hget(&key, ":")
            .await?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        if status <= 0.0 && !options.suppress {
            return Err(MeshError::InterruptConflict { job_id: job_id.to_string() });
        }
        if status <= 0.0 {
            return Ok(());
        }
        self.apply(Command::HIncrByFloat { key: key.clone(), field: ":".to_string(), delta: -1_000_000_000.0 })
            .await?;
        if options.throw {
            let err = serde_json::json!({
                "code": mesh_core::error::codes::INTERRUPT,
                "message": "job interrupted",
                "stack": "",
                "job_id": job_id,
            });
            let mut fields = BTreeMap::new();
            fields.insert("metadata/err".to_string(), err.to_string());
            self.apply(Command::HSet { key, fields }).await?;
        }
        Ok(())
    }

    async fn scrub(&self, job_id: &str) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::JobState, &[job_id])?;
        self.apply(Command::Del { key }).await
    }

    async fn find_jobs(
        &self,
        pattern: &str,
        limit: u32,
        batch: u32,
        cursor: Option<String>,
    ) -> MeshResult<(Option<String>, Vec<String>)> {
        let like = glob_to_like(pattern);
        let offset: i64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let rows = sqlx::query(
            "SELECT DISTINCT key FROM kv_hash WHERE key LIKE $1 ORDER BY key LIMIT $2 OFFSET $3",
        )
        .bind(&like)
        .bind((batch.min(limit) as i64).max(1))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        let keys: Vec<String> = rows.into_iter().map(|r| r.get::<String, _>("key")).collect();
        let next_cursor = if keys.len() as u32 >= batch {
            Some((offset + keys.len() as i64).to_string())
        } else {
            None
        };
        Ok((next_cursor, keys.into_iter().take(limit as usize).collect()))
    }

    async fn set_throttle_rate(&self, topic: Option<&str>, rate_ms: i64) -> MeshResult<()> {
        let key = mint(&self.km, KeyType::ThrottleRate, &[])?;
        let field = topic.unwrap_or("*");
        let clamped = rate_ms.clamp(-1, 60_000);
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), clamped.to_string());
        self.apply(Command::HSet { key, fields }).await
    }

    async fn get_throttle_rates(&self) -> MeshResult<BTreeMap<String, i64>> {
        let key = mint(&self.km, KeyType::ThrottleRate, &[])?;
        let raw = self.hgetall(&key).await?;
        Ok(raw.into_iter().filter_map(|(k, v)| v.parse().ok().map(|n| (k, n))).collect())
    }

    async fn get_throttle_rate(&self, topic: &str) -> MeshResult<i64> {
        let key = mint(&self.km, KeyType::ThrottleRate, &[])?;
        Ok(self.hget(&key, topic).await?.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    async fn commit(&self, tx: Transaction) -> MeshResult<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let mut db_tx = self.pool.begin().await.map_err(storage_err)?;
        for cmd in &tx.commands {
            exec_command(&mut db_tx, cmd).await?;
        }
        db_tx.commit().await.map_err(storage_err)?;
        Ok(())
    }
}
