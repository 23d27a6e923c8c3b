use async_trait::async_trait;
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::keyminter::{KeyMinter, KeyType};
use mesh_core::reporter::{
    bucket_timestamps, GeneralStats, IndexStats, MedianStats, Reporter, StatsQuery, StatsResult,
};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::{SystemTime, UNIX_EPOCH};

fn storage_err(e: redis::RedisError) -> MeshError {
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

/// Reads the `JOB_STATS_{GENERAL,INDEX,MEDIAN}` hashes a deployed app
/// accumulates, one hash per `(appId, key, bucket)`. Rolls
/// buckets up on read rather than maintaining precomputed coarse tiers —
/// cheap at write time, aggregated at read time.
#[derive(Clone)]
pub struct RedisReporter {
    conn: ConnectionManager,
    km: KeyMinter,
}

impl RedisReporter {
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            km: KeyMinter::new(namespace),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Reporter for RedisReporter {
    async fn get_stats(&self, query: &StatsQuery) -> MeshResult<StatsResult> {
        let mut conn = self.conn();
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
            let gcounts: Vec<(String, u64)> = conn.hgetall(&gkey).await.map_err(storage_err)?;
            for (value, count) in gcounts {
                *general.counts.entry(value).or_insert(0) += count;
            }

            let ikey = mint(&self.km, KeyType::JobStatsIndex, &[&query.app_id, &query.key, &bucket_str])?;
            let ientries: Vec<(String, String)> = conn.hgetall(&ikey).await.map_err(storage_err)?;
            for (value, ids_json) in ientries {
                if let Ok(ids) = serde_json::from_str::<Vec<String>>(&ids_json) {
                    index.job_ids.entry(value).or_default().extend(ids);
                }
            }

            let mkey = mint(&self.km, KeyType::JobStatsMedian, &[&query.app_id, &query.key, &bucket_str])?;
            let fields: Vec<(String, String)> = conn.hgetall(&mkey).await.map_err(storage_err)?;
            if !fields.is_empty() {
                let mut bucket_median = 0.0;
                let mut bucket_count = 0_u64;
                for (field, value) in fields {
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
