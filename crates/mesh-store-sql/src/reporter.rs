use async_trait::async_trait;
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::keyminter::{KeyMinter, KeyType};
use mesh_core::reporter::{
    bucket_timestamps, GeneralStats, IndexStats, MedianStats, Reporter, StatsQuery, StatsResult,
};
use sqlx::{PgPool, Row};
use std::time::{SystemTime, UNIX_EPOCH};

fn storage_err(e: sqlx::Error) -> MeshError {
    MeshError::StorageError(e.to_string())
}

fn mint(km: &KeyMinter, kind: KeyType, params: &[&str]) -> MeshResult<String> {
    km.mint(kind, params)
        .map_err(|e| MeshError::StorageError(e.to_string()))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Reads `JOB_STATS_{GENERAL,INDEX,MEDIAN}` buckets out of `kv_hash`, one
/// key per `(appId, key, bucket)` — same bucket-key shape as
/// `mesh-store-redis`'s `RedisReporter`, since both backends mint keys with
/// the same `KeyMinter`.
#[derive(Clone)]
pub struct SqlReporter {
    pool: PgPool,
    km: KeyMinter,
}

impl SqlReporter {
    pub fn new(pool: PgPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            km: KeyMinter::new(namespace),
        }
    }
}

#[async_trait]
impl Reporter for SqlReporter {
    async fn get_stats(&self, query: &StatsQuery) -> MeshResult<StatsResult> {
        let now = now_secs();
        let buckets = bucket_timestamps(&query.window, query.granularity, now);

        let mut general = GeneralStats::default();
        let mut index = IndexStats::default();
        let mut median_total = 0.0_f64;
        let mut median_count = 0_u64;
        let mut segments = Vec::with_capacity(buckets.len());

        for bucket in &buckets {
            let bucket_str = bucket.to_string();
            segments.push(*bucket);

            let gkey = mint(&self.km, KeyType::JobStatsGeneral, &[&query.app_id, &query.key, &bucket_str])?;
            let rows = sqlx::query("SELECT field, value FROM kv_hash WHERE key = $1")
                .bind(&gkey)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;
            for row in rows {
                let field: String = row.get("field");
                let value: String = row.get("value");
                let count: u64 = value.parse().unwrap_or(0);
                *general.counts.entry(field).or_insert(0) += count;
            }

            let ikey = mint(&self.km, KeyType::JobStatsIndex, &[&query.app_id, &query.key, &bucket_str])?;
            let rows = sqlx::query("SELECT field, value FROM kv_hash WHERE key = $1")
                .bind(&ikey)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;
            for row in rows {
                let field: String = row.get("field");
                let value: String = row.get("value");
                if let Ok(ids) = serde_json::from_str::<Vec<String>>(&value) {
                    index.job_ids.entry(field).or_default().extend(ids);
                }
            }

            let mkey = mint(&self.km, KeyType::JobStatsMedian, &[&query.app_id, &query.key, &bucket_str])?;
            let rows = sqlx::query("SELECT field, value FROM kv_hash WHERE key = $1")
                .bind(&mkey)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;
            if !rows.is_empty() {
                let mut bucket_median = 0.0;
                let mut bucket_count = 0_u64;
                for row in rows {
                    let field: String = row.get("field");
                    let value: String = row.get("value");
                    match field.as_str() {
                        "median" => bucket_median = value.parse().unwrap_or(0.0),
                        "count" => bucket_count = value.parse().unwrap_or(0),
                        _ => {}
                    }
                }
                median_total += bucket_median * bucket_count as f64;
                median_count += bucket_count;
            }
        }

        let median = if median_count > 0 {
            Some(MedianStats {
                median: median_total / median_count as f64,
                count: median_count,
            })
        } else {
            None
        };

        Ok(StatsResult {
            general,
            index,
            median,
            segments,
        })
    }
}
