//! Reporter: reads the
//! `JOB_STATS_{GENERAL,INDEX,MEDIAN}` buckets a deployed app accumulates and
//! answers aggregate queries over them. Kept as its own trait — not folded
//! into `Store` — the same way `Stream`/`Sub` sit beside `Store` in
//! `mesh-core`: a distinct concern with its own backend-specific storage
//! shape (time-bucketed sorted sets), implemented by the same two backend
//! crates that implement `Store`.

use crate::error::MeshResult;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Granularity tiers correspond to the time-resolution buckets encoded in
/// stats keys. Coarser tiers roll up finer ones; a backend
/// picks the bucket width it actually stores (e.g. `Hour` in seconds since
/// epoch truncated to 3600) and rolls up on read for coarser tiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
    Infinity,
}

/// Either an explicit `[start, end]` range or a trailing `range` of buckets
/// counted back from now — the `(key, granularity, range|start|end)` query
/// shape.
#[derive(Clone, Debug)]
pub enum StatsWindow {
    Range { trailing_buckets: u32 },
    Explicit { start: i64, end: i64 },
}

#[derive(Clone, Debug)]
pub struct StatsQuery {
    pub app_id: String,
    /// The stat key (a job-schema field marked for indexing at deploy time).
    pub key: String,
    pub granularity: Granularity,
    pub window: StatsWindow,
}

/// `JOB_STATS_GENERAL`: per-bucket counts, keyed by the field's value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeneralStats {
    pub counts: BTreeMap<String, u64>,
}

/// `JOB_STATS_INDEX`: per-bucket job ids, keyed by the field's value, for
/// drilling from an aggregate count down to the contributing jobs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexStats {
    pub job_ids: BTreeMap<String, Vec<String>>,
}

/// `JOB_STATS_MEDIAN`: a running median (and count, to weight further
/// rollups) per bucket, for numeric fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MedianStats {
    pub median: f64,
    pub count: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatsResult {
    pub general: GeneralStats,
    pub index: IndexStats,
    pub median: Option<MedianStats>,
    /// The bucket timestamps (epoch seconds, bucket start) actually read,
    /// in ascending order, so a caller can tell a sparse result from an
    /// empty one.
    pub segments: Vec<i64>,
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn get_stats(&self, query: &StatsQuery) -> MeshResult<StatsResult>;
}

/// Bucket width in seconds for a granularity tier. `Infinity` has no
/// natural width — callers collapse it to the single bucket `0`.
pub fn bucket_width_secs(g: Granularity) -> i64 {
    match g {
        Granularity::Minute => 60,
        Granularity::Hour => 3_600,
        Granularity::Day => 86_400,
        Granularity::Week => 604_800,
        Granularity::Month => 2_592_000,
        Granularity::Quarter => 7_776_000,
        Granularity::Year => 31_536_000,
        Granularity::Infinity => 0,
    }
}

/// Resolves a [`StatsWindow`] into the ascending bucket-start timestamps a
/// backend should read, given the current time (epoch seconds). Shared by
/// both backend crates so bucket alignment never drifts between them.
pub fn bucket_timestamps(window: &StatsWindow, g: Granularity, now: i64) -> Vec<i64> {
    if g == Granularity::Infinity {
        return vec![0];
    }
    let width = bucket_width_secs(g);
    match window {
        StatsWindow::Range { trailing_buckets } => {
            let current = now - now.rem_euclid(width);
            let n = (*trailing_buckets).max(1) as i64;
            (0..n).map(|i| current - i * width).rev().collect()
        }
        StatsWindow::Explicit { start, end } => {
            let aligned_start = start - start.rem_euclid(width);
            let aligned_end = end - end.rem_euclid(width);
            let mut out = Vec::new();
            let mut t = aligned_start;
            while t <= aligned_end {
                out.push(t);
                t += width;
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_orders_coarsest_last() {
        assert!(Granularity::Minute < Granularity::Hour);
        assert!(Granularity::Year < Granularity::Infinity);
    }

    #[test]
    fn stats_result_default_is_empty() {
        let r = StatsResult::default();
        assert!(r.general.counts.is_empty());
        assert!(r.segments.is_empty());
        assert!(r.median.is_none());
    }

    #[test]
    fn infinity_granularity_is_one_bucket() {
        let ts = bucket_timestamps(&StatsWindow::Range { trailing_buckets: 5 }, Granularity::Infinity, 1_700_000_000);
        assert_eq!(ts, vec![0]);
    }

    #[test]
    fn trailing_buckets_are_ascending_and_aligned() {
        let ts = bucket_timestamps(&StatsWindow::Range { trailing_buckets: 3 }, Granularity::Hour, 1_700_003_700);
        assert_eq!(ts.len(), 3);
        assert!(ts.windows(2).all(|w| w[1] - w[0] == 3_600));
        assert!(ts.iter().all(|t| t % 3_600 == 0));
    }

    #[test]
    fn explicit_window_covers_full_range() {
        let ts = bucket_timestamps(
            &StatsWindow::Explicit { start: 0, end: 7_200 },
            Granularity::Hour,
            0,
        );
        assert_eq!(ts, vec![0, 3_600, 7_200]);
    }
}
